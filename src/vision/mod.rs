//! Vision/OCR Layer
//!
//! Engine lifecycle, model files, and image preprocessing. Recognition
//! itself is delegated to a backend:
//! - Tesseract (cargo feature `tesseract`)

pub mod engine;
pub mod models;
pub mod ocr_preprocess;
#[cfg(feature = "tesseract")]
pub mod tesseract_ocr;

use std::sync::Arc;

pub use engine::{
    engine_initializations, BackendLoader, EngineMode, EngineSpec, RecognitionBackend,
    RecognitionEngine,
};
pub use models::{ModelManager, ModelStatus};
pub use ocr_preprocess::preprocess;

use crate::error::ConfigurationError;

/// Backend compiled into this build
pub fn default_loader() -> Result<Arc<dyn BackendLoader>, ConfigurationError> {
    #[cfg(feature = "tesseract")]
    {
        Ok(Arc::new(tesseract_ocr::TesseractLoader))
    }

    #[cfg(not(feature = "tesseract"))]
    {
        Err(ConfigurationError::BackendUnavailable(
            "built without the `tesseract` feature".to_string(),
        ))
    }
}
