//! Application Configuration
//!
//! Settings stored in TOML format. Model location and language are inputs,
//! never compiled in; CLI flags override what the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigurationError;
use crate::extract::EngineStrategy;
use crate::vision::{EngineMode, EngineSpec};

/// Upper bound on worker threads accepted from configuration
pub const MAX_WORKERS: usize = 64;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Recognition engine settings
    pub recognition: RecognitionSettings,
    /// Batch execution settings
    pub batch: BatchSettings,
    /// Image preprocessing before recognition
    pub preprocessing: OcrPreprocessing,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Recognition engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    /// Directory with `<lang>.traineddata` files; defaults to the data dir
    pub model_dir: Option<PathBuf>,
    /// Language code, e.g. "rus" or "eng+rus"
    pub language: String,
    /// Engine mode
    pub mode: EngineMode,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            model_dir: None,
            language: "eng".to_string(),
            mode: EngineMode::Default,
        }
    }
}

/// Batch execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Worker threads; 0 picks the available parallelism
    pub workers: usize,
    /// How engines are shared between workers
    pub strategy: EngineStrategy,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            strategy: EngineStrategy::PerWorker,
        }
    }
}

impl BatchSettings {
    /// Worker count with 0 resolved to the machine's parallelism
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_WORKERS)
        } else {
            self.workers
        }
    }
}

/// Image preprocessing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrPreprocessing {
    /// Master switch; nothing below applies when false
    pub enabled: bool,
    /// Convert to grayscale
    pub grayscale: bool,
    /// Invert colours (light text on dark backgrounds)
    pub invert: bool,
    /// Contrast factor, 1.0 = unchanged
    pub contrast: f32,
    /// Sharpen strength, 0.0 = off
    pub sharpen: f32,
    /// Otsu black/white thresholding
    pub binarize: bool,
    /// Fixed upscale factor (1 = none)
    pub scale: u32,
    /// Images smaller than this on either side are upscaled (0 = never)
    pub min_dimension: u32,
    /// Images larger than this on the longest side are downscaled (0 = never)
    pub max_dimension: u32,
}

impl Default for OcrPreprocessing {
    fn default() -> Self {
        Self {
            enabled: false,
            grayscale: false,
            invert: false,
            contrast: 1.0,
            sharpen: 0.0,
            binarize: false,
            scale: 1,
            min_dimension: 80,
            max_dimension: 4096,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Model directory from config, else the per-user data directory
    pub fn model_dir(&self) -> Result<PathBuf> {
        match &self.recognition.model_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::storage::default_model_dir(),
        }
    }

    /// Engine parameters described by this configuration
    pub fn engine_spec(&self) -> Result<EngineSpec> {
        Ok(EngineSpec::new(
            self.model_dir()?,
            self.recognition.language.clone(),
            self.recognition.mode,
        ))
    }

    /// Range checks that do not touch the filesystem
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch.workers > MAX_WORKERS {
            return Err(ConfigurationError::InvalidSetting {
                field: "batch.workers",
                reason: format!("must be at most {}", MAX_WORKERS),
            });
        }

        let pp = &self.preprocessing;
        if !(pp.contrast > 0.0 && pp.contrast <= 10.0) {
            return Err(ConfigurationError::InvalidSetting {
                field: "preprocessing.contrast",
                reason: format!("{} is outside (0, 10]", pp.contrast),
            });
        }
        if !(0.0..=5.0).contains(&pp.sharpen) {
            return Err(ConfigurationError::InvalidSetting {
                field: "preprocessing.sharpen",
                reason: format!("{} is outside [0, 5]", pp.sharpen),
            });
        }
        if !(1..=4).contains(&pp.scale) {
            return Err(ConfigurationError::InvalidSetting {
                field: "preprocessing.scale",
                reason: format!("{} is outside [1, 4]", pp.scale),
            });
        }

        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig =
        toml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
