//! Recognition engine lifecycle
//!
//! The recognition library sits behind [`BackendLoader`] and
//! [`RecognitionBackend`]. [`RecognitionEngine`] validates the model
//! configuration, loads the backend once, and converts library failures into
//! this crate's error taxonomy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use super::models::model_file_path;
use crate::acquire::ImageHandle;
use crate::error::{BackendError, ConfigurationError, ImageError};

static INITIALIZATIONS: AtomicU64 = AtomicU64::new(0);

/// Number of engines successfully initialized by this process
pub fn engine_initializations() -> u64 {
    INITIALIZATIONS.load(Ordering::Relaxed)
}

/// Recognition engine mode
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    /// Whatever the library considers best for the loaded model
    #[default]
    Default,
    /// Legacy pattern-matching recognizer only
    TesseractOnly,
    /// Neural-net line recognizer only
    LstmOnly,
    /// Both recognizers combined
    TesseractLstmCombined,
}

/// Parameters that identify a loaded engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineSpec {
    /// Directory holding `<lang>.traineddata` files
    pub model_dir: PathBuf,
    /// Language code, `+`-joined for multi-language models (e.g. `eng+rus`)
    pub language: String,
    pub mode: EngineMode,
}

impl EngineSpec {
    pub fn new(model_dir: impl Into<PathBuf>, language: impl Into<String>, mode: EngineMode) -> Self {
        Self {
            model_dir: model_dir.into(),
            language: language.into(),
            mode,
        }
    }

    /// Individual language components of the code
    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.language.split('+')
    }

    /// Check the model directory and that every language has a model file
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_language(&self.language)?;
        validate_model_dir(&self.model_dir)?;

        for language in self.languages() {
            let path = model_file_path(&self.model_dir, language);
            if !path.is_file() {
                return Err(ConfigurationError::ModelNotFound {
                    language: language.to_string(),
                    path,
                });
            }
        }

        Ok(())
    }
}

pub(crate) fn validate_language(language: &str) -> Result<(), ConfigurationError> {
    let valid = !language.is_empty()
        && language.split('+').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });

    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidLanguage {
            language: language.to_string(),
        })
    }
}

fn validate_model_dir(path: &Path) -> Result<(), ConfigurationError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigurationError::ModelDirMissing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ConfigurationError::ModelDirUnreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !metadata.is_dir() {
        return Err(ConfigurationError::ModelDirUnreadable {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
        });
    }

    std::fs::read_dir(path).map_err(|source| ConfigurationError::ModelDirUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// A loaded recognition library instance
///
/// Implementations are not assumed to be reentrant; each instance is used by
/// one caller at a time.
pub trait RecognitionBackend: Send {
    fn recognize(&mut self, image: &ImageHandle) -> Result<String, BackendError>;
}

/// Loads recognition library instances
pub trait BackendLoader: Send + Sync {
    /// Short identifier for logging
    fn name(&self) -> &'static str;

    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn RecognitionBackend>, BackendError>;
}

/// Engine with a loaded language model
pub struct RecognitionEngine {
    spec: EngineSpec,
    backend: Box<dyn RecognitionBackend>,
    recognized: u64,
}

impl RecognitionEngine {
    /// Validate the spec and load the backend
    pub fn initialize(loader: &dyn BackendLoader, spec: EngineSpec) -> Result<Self, ConfigurationError> {
        spec.validate()?;

        let start = Instant::now();
        let backend = loader
            .load(&spec)
            .map_err(|e| ConfigurationError::EngineLoad {
                language: spec.language.clone(),
                reason: e.message,
            })?;

        INITIALIZATIONS.fetch_add(1, Ordering::Relaxed);
        info!(
            "{} engine loaded ({}, {:?}) from {:?} in {:?}",
            loader.name(),
            spec.language,
            spec.mode,
            spec.model_dir,
            start.elapsed()
        );

        Ok(Self {
            spec,
            backend,
            recognized: 0,
        })
    }

    pub fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    /// Images recognized by this instance so far
    pub fn recognized_count(&self) -> u64 {
        self.recognized
    }

    /// Recognize text in one decoded image
    pub fn recognize(&mut self, image: &ImageHandle) -> Result<String, ImageError> {
        let start = Instant::now();
        let text = self
            .backend
            .recognize(image)
            .map_err(|e| ImageError::Recognition {
                path: image.source_path().to_path_buf(),
                reason: e.message,
            })?;

        self.recognized += 1;
        debug!(
            "Recognized {:?} ({}x{}) in {:?}: {} chars",
            image.source_path(),
            image.width(),
            image.height(),
            start.elapsed(),
            text.chars().count()
        );
        Ok(text)
    }
}

impl Drop for RecognitionEngine {
    fn drop(&mut self) {
        debug!(
            "Releasing {} engine after {} images",
            self.spec.language, self.recognized
        );
    }
}

impl std::fmt::Debug for RecognitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionEngine")
            .field("spec", &self.spec)
            .field("recognized", &self.recognized)
            .finish()
    }
}
