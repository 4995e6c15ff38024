//! Image sources and decoded image handles

use image::{ImageReader, RgbaImage};
use std::path::{Path, PathBuf};

use crate::error::ImageError;

/// A reference to raster image bytes plus where they came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    path: PathBuf,
    /// Bytes already read into memory; when absent the path is read on decode
    bytes: Option<Vec<u8>>,
}

impl ImageSource {
    /// Source backed by a file that is read lazily at decode time
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bytes: None,
        }
    }

    /// Source backed by bytes already in memory
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes: Some(bytes),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.bytes.is_some()
    }

    /// Decode into an owned RGBA buffer
    pub fn decode(&self) -> Result<ImageHandle, ImageError> {
        let decode_err = |reason: String| ImageError::Decode {
            path: self.path.clone(),
            reason,
        };

        let image = match &self.bytes {
            Some(bytes) => image::load_from_memory(bytes).map_err(|e| decode_err(e.to_string()))?,
            None => ImageReader::open(&self.path)
                .and_then(|reader| reader.with_guessed_format())
                .map_err(|e| decode_err(e.to_string()))?
                .decode()
                .map_err(|e| decode_err(e.to_string()))?,
        };

        if image.width() == 0 || image.height() == 0 {
            return Err(decode_err("image has no pixels".to_string()));
        }

        Ok(ImageHandle::new(self.path.clone(), image.to_rgba8()))
    }
}

/// A decoded image ready for recognition
///
/// Owned by the extraction step that created it and dropped as soon as the
/// recognition attempt for that image finishes.
#[derive(Debug)]
pub struct ImageHandle {
    source_path: PathBuf,
    pixels: RgbaImage,
}

impl ImageHandle {
    pub fn new(source_path: PathBuf, pixels: RgbaImage) -> Self {
        Self {
            source_path,
            pixels,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Get image dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Raw RGBA bytes, row-major
    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    /// Replace the pixel buffer, keeping provenance
    pub fn with_pixels(self, pixels: RgbaImage) -> Self {
        Self {
            source_path: self.source_path,
            pixels,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    /// Encode a solid-colour PNG in memory
    pub fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }
}
