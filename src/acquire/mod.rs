//! Image Acquisition Layer
//!
//! The picker is the only operation that blocks on user interaction. A pick
//! yields an image, nothing (the user cancelled), or an acquisition error.
//! "Not supported on this device" is reported separately from I/O failures.

pub mod source;

pub use source::{ImageHandle, ImageSource};

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::AcquisitionError;

/// Acquisition collaborator
pub trait ImagePicker {
    /// Whether picking can work at all on this device
    fn is_supported(&self) -> bool;

    /// Block until the user picks an image or cancels (`Ok(None)`)
    fn pick_image(&mut self) -> Result<Option<ImageSource>, AcquisitionError>;
}

/// Picker that asks for file paths on an interactive terminal
pub struct StdinPicker<R> {
    reader: R,
    supported: bool,
}

impl StdinPicker<std::io::StdinLock<'static>> {
    /// Picker over the process stdin; unsupported unless stdin is a terminal
    pub fn new() -> Self {
        let stdin = std::io::stdin();
        let supported = stdin.is_terminal();
        Self {
            reader: stdin.lock(),
            supported,
        }
    }
}

impl<R: BufRead> StdinPicker<R> {
    /// Picker over any line source
    pub fn from_reader(reader: R, supported: bool) -> Self {
        Self { reader, supported }
    }
}

impl<R: BufRead> ImagePicker for StdinPicker<R> {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn pick_image(&mut self) -> Result<Option<ImageSource>, AcquisitionError> {
        if !self.supported {
            return Err(AcquisitionError::Unsupported);
        }

        eprint!("image path (empty line to finish): ");
        let _ = std::io::stderr().flush();

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(|source| AcquisitionError::Io {
            path: PathBuf::from("<stdin>"),
            source,
        })?;

        // EOF or empty line both mean the user backed out of the dialog
        let picked = clean_picked_path(&line);
        if read == 0 || picked.is_empty() {
            debug!("Image pick cancelled");
            return Ok(None);
        }

        load_picked(PathBuf::from(picked)).map(Some)
    }
}

/// Strip whitespace and the quotes terminals add on drag-and-drop
fn clean_picked_path(line: &str) -> &str {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed)
}

/// Read a picked file into memory
fn load_picked(path: PathBuf) -> Result<ImageSource, AcquisitionError> {
    if !path.exists() {
        return Err(AcquisitionError::NotFound { path });
    }
    let bytes = std::fs::read(&path).map_err(|source| AcquisitionError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(ImageSource::from_bytes(path, bytes))
}

/// Ordered list of images added by the user
#[derive(Debug, Default, Clone)]
pub struct ImageCollection {
    images: Vec<ImageSource>,
}

impl ImageCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one add-image action against a picker.
    ///
    /// Returns `Ok(true)` when an image was added and `Ok(false)` when the user
    /// cancelled. Errors leave earlier additions untouched.
    pub fn add_from(&mut self, picker: &mut dyn ImagePicker) -> Result<bool, AcquisitionError> {
        if !picker.is_supported() {
            return Err(AcquisitionError::Unsupported);
        }

        match picker.pick_image()? {
            Some(source) => {
                info!("Added image {:?}", source.path());
                self.images.push(source);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn push(&mut self, source: ImageSource) {
        self.images.push(source);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn as_slice(&self) -> &[ImageSource] {
        &self.images
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }
}
