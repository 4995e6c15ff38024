//! Tesseract backend
//!
//! Loads `<lang>.traineddata` from the engine's model directory and feeds it
//! decoded RGBA frames directly, so no re-encoding happens per image.

use tesseract::{OcrEngineMode, Tesseract};
use tracing::{debug, info, warn};

use super::engine::{BackendLoader, EngineMode, EngineSpec, RecognitionBackend};
use crate::acquire::ImageHandle;
use crate::error::BackendError;

/// Loader for the system Tesseract library
#[derive(Debug, Default, Clone, Copy)]
pub struct TesseractLoader;

impl BackendLoader for TesseractLoader {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn RecognitionBackend>, BackendError> {
        let api = open(spec)?;
        Ok(Box::new(TesseractBackend {
            api: Some(api),
            spec: spec.clone(),
        }))
    }
}

fn oem(mode: EngineMode) -> OcrEngineMode {
    match mode {
        EngineMode::Default => OcrEngineMode::Default,
        EngineMode::TesseractOnly => OcrEngineMode::TesseractOnly,
        EngineMode::LstmOnly => OcrEngineMode::LstmOnly,
        EngineMode::TesseractLstmCombined => OcrEngineMode::TesseractLstmCombined,
    }
}

fn open(spec: &EngineSpec) -> Result<Tesseract, BackendError> {
    let datapath = spec
        .model_dir
        .to_str()
        .ok_or_else(|| BackendError::new("model directory path is not valid UTF-8"))?;

    info!("Initializing Tesseract with language: {}", spec.language);
    Tesseract::new_with_oem(Some(datapath), Some(&spec.language), oem(spec.mode))
        .map_err(|e| BackendError::new(e.to_string()))
}

struct TesseractBackend {
    /// `None` after a failed call consumed the handle
    api: Option<Tesseract>,
    spec: EngineSpec,
}

impl RecognitionBackend for TesseractBackend {
    fn recognize(&mut self, image: &ImageHandle) -> Result<String, BackendError> {
        let api = match self.api.take() {
            Some(api) => api,
            None => {
                warn!("Re-opening Tesseract after a failed recognition");
                open(&self.spec)?
            }
        };

        let (width, height) = image.dimensions();
        debug!("Tesseract: processing {}x{} image", width, height);

        let mut api = api
            .set_frame(image.as_raw(), width as i32, height as i32, 4, (width * 4) as i32)
            .map_err(|e| BackendError::new(format!("failed to set image: {}", e)))?
            .recognize()
            .map_err(|e| BackendError::new(format!("recognition failed: {}", e)))?;

        let text = api
            .get_text()
            .map_err(|e| BackendError::new(format!("failed to read text: {}", e)));
        self.api = Some(api);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_mode_mapping() {
        assert!(matches!(oem(EngineMode::Default), OcrEngineMode::Default));
        assert!(matches!(oem(EngineMode::LstmOnly), OcrEngineMode::LstmOnly));
    }

    #[test]
    fn test_load_fails_without_models() {
        let dir = tempfile::tempdir().unwrap();
        let spec = EngineSpec::new(dir.path(), "eng", EngineMode::Default);
        assert!(TesseractLoader.load(&spec).is_err());
    }
}
