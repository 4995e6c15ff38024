//! Error taxonomy
//!
//! Configuration errors are fatal to batch start. Acquisition errors are
//! scoped to a single add-image action. Decode and recognition errors are
//! recorded per image and never abort a batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Coarse error category attached to failed outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad model directory, language, or setting
    Configuration,
    /// Picker unsupported or failed to read the picked file
    Acquisition,
    /// Image bytes unreadable or corrupt
    Decode,
    /// Engine-internal failure during inference
    Recognition,
    /// Batch was cancelled before this image was attempted
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Acquisition => "acquisition",
            ErrorKind::Decode => "decode",
            ErrorKind::Recognition => "recognition",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while validating configuration or loading an engine
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("model directory {path:?} does not exist")]
    ModelDirMissing { path: PathBuf },

    #[error("model directory {path:?} is not readable: {source}")]
    ModelDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid language code '{language}'")]
    InvalidLanguage { language: String },

    #[error("no trained model for language '{language}' (expected {path:?})")]
    ModelNotFound { language: String, path: PathBuf },

    #[error("engine failed to load language '{language}': {reason}")]
    EngineLoad { language: String, reason: String },

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("no recognition backend available: {0}")]
    BackendUnavailable(String),
}

/// Errors from a single add-image action
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("image picking is not supported on this device")]
    Unsupported,

    #[error("picked file {path:?} does not exist")]
    NotFound { path: PathBuf },

    #[error("failed to read picked image {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-image failure, recovered inside the batch
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("cannot decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("recognition failed for {path:?}: {reason}")]
    Recognition { path: PathBuf, reason: String },
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::Decode { .. } => ErrorKind::Decode,
            ImageError::Recognition { .. } => ErrorKind::Recognition,
        }
    }

    /// Detail string without the path prefix
    pub fn detail(&self) -> &str {
        match self {
            ImageError::Decode { reason, .. } | ImageError::Recognition { reason, .. } => reason,
        }
    }
}

/// Raw failure reported by a recognition library
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
