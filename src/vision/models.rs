//! Trained model management
//!
//! Handles locating, listing, downloading, and verifying the per-language
//! `.traineddata` files an engine loads from its model directory.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::engine::validate_language;

/// File extension of trained model files
pub const MODEL_EXTENSION: &str = "traineddata";

/// Remote repository that `ensure_language` downloads from
pub const MODEL_BASE_URL: &str = "https://github.com/tesseract-ocr/tessdata_fast/raw/main";

/// Environment variable that forbids network downloads
pub const OFFLINE_ENV: &str = "SCREENTEXT_OFFLINE";

/// Smallest file accepted as a real model (rejects error pages and truncated downloads)
const MIN_MODEL_BYTES: u64 = 1024;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Path of the trained model for one language inside `model_dir`
pub fn model_file_path(model_dir: &Path, language: &str) -> PathBuf {
    model_dir.join(format!("{}.{}", language, MODEL_EXTENSION))
}

/// Validated single-language parts of a `+`-joined code
fn language_components(language: &str) -> Result<Vec<&str>> {
    validate_language(language)?;
    Ok(language.split('+').collect())
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub language: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    /// Unix seconds
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Availability of one language's model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStatus {
    pub language: String,
    pub size_bytes: u64,
    /// Matches the checksum recorded in the manifest, `None` when unrecorded
    pub verified: Option<bool>,
}

/// Progress callback for download operations
pub type DownloadProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Model manager over one model directory
pub struct ModelManager {
    models_dir: PathBuf,
    base_url: String,
}

impl ModelManager {
    /// Manager for an existing directory
    pub fn open(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let models_dir = models_dir.into();
        if !models_dir.is_dir() {
            anyhow::bail!("Model directory {:?} does not exist", models_dir);
        }
        Ok(Self::new(models_dir))
    }

    /// Manager for a directory, creating it if needed
    pub fn create(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let models_dir = models_dir.into();
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create model directory {:?}", models_dir))?;
        Ok(Self::new(models_dir))
    }

    fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            base_url: MODEL_BASE_URL.to_string(),
        }
    }

    /// Download from a mirror of the model repository
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Download URL for one language
    pub fn model_url(&self, language: &str) -> String {
        format!("{}/{}.{}", self.base_url, language, MODEL_EXTENSION)
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, language: &str) -> PathBuf {
        model_file_path(&self.models_dir, language)
    }

    /// Check if a model is present and plausibly complete
    pub fn is_language_available(&self, language: &str) -> bool {
        std::fs::metadata(self.model_path(language))
            .map(|m| m.is_file() && m.len() >= MIN_MODEL_BYTES)
            .unwrap_or(false)
    }

    /// Languages with a model file in the directory, sorted
    pub fn available_languages(&self) -> Result<Vec<String>> {
        let mut languages = Vec::new();
        let entries = std::fs::read_dir(&self.models_dir)
            .with_context(|| format!("Failed to read model directory {:?}", self.models_dir))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MODEL_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                languages.push(stem.to_string());
            }
        }

        languages.sort();
        Ok(languages)
    }

    /// Get status of every model in the directory
    pub fn model_status(&self) -> Result<Vec<ModelStatus>> {
        let manifest = self.load_manifest().unwrap_or_default();

        self.available_languages()?
            .into_iter()
            .map(|language| -> Result<ModelStatus> {
                let path = self.model_path(&language);
                let size_bytes = std::fs::metadata(&path)?.len();
                let recorded = manifest
                    .models
                    .iter()
                    .find(|m| m.language == language)
                    .and_then(|m| m.sha256.clone());
                let verified = match recorded {
                    Some(expected) => Some(sha256_file(&path)? == expected),
                    None => None,
                };
                Ok(ModelStatus {
                    language,
                    size_bytes,
                    verified,
                })
            })
            .collect()
    }

    /// Make sure every language in a `+`-joined code has a model, fetching
    /// the missing ones. Returns one model path per language.
    pub fn ensure_language(&self, language: &str) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for component in language_components(language)? {
            if self.is_language_available(component) {
                info!("Model for '{}' already available", component);
            } else {
                self.download_language_with_progress(component, None)?;
            }
            paths.push(self.model_path(component));
        }
        Ok(paths)
    }

    /// Download one language model with optional progress callback.
    ///
    /// The body goes to a `.part` file first and only replaces an existing
    /// model once it is complete and plausibly sized.
    pub fn download_language_with_progress(
        &self,
        language: &str,
        progress: Option<DownloadProgressCallback>,
    ) -> Result<()> {
        if language_components(language)?.len() != 1 {
            anyhow::bail!("'{}' names several languages; download them one at a time", language);
        }

        let url = self.model_url(language);
        let path = self.model_path(language);

        if std::env::var(OFFLINE_ENV).is_ok() {
            anyhow::bail!(
                "{} is set: fetch {} manually and save it as {:?}",
                OFFLINE_ENV,
                url,
                path
            );
        }

        info!("Fetching '{}' model from {}", language, url);
        let part_path = self
            .models_dir
            .join(format!("{}.{}.part", language, MODEL_EXTENSION));

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let fetched = rt
            .block_on(fetch_to_file(&url, &part_path, progress.as_ref()))
            .and_then(|(size, sha256)| {
                if size < MIN_MODEL_BYTES {
                    anyhow::bail!("'{}' model is only {} bytes; refusing to install it", language, size);
                }
                Ok(sha256)
            })
            .and_then(|sha256| {
                std::fs::rename(&part_path, &path)
                    .with_context(|| format!("Failed to install {:?}", path))?;
                Ok(sha256)
            });

        let sha256 = match fetched {
            Ok(sha256) => sha256,
            Err(e) => {
                if part_path.exists() {
                    warn!("Discarding partial download {:?}", part_path);
                    std::fs::remove_file(&part_path).ok();
                }
                return Err(e);
            }
        };

        self.update_manifest_for_language(language, sha256)?;
        info!("Installed '{}' model at {:?}", language, path);
        Ok(())
    }

    /// Record a downloaded model in the manifest
    fn update_manifest_for_language(&self, language: &str, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(language))?;

        let info = ModelInfo {
            language: language.to_string(),
            filename: format!("{}.{}", language, MODEL_EXTENSION),
            size_bytes: metadata.len(),
            sha256: Some(sha256),
            downloaded_at: unix_now(),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.language == language) {
            *existing = info;
        } else {
            manifest.models.push(info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Stream `url` into `dest`, returning the byte count and SHA-256 of the body
async fn fetch_to_file(
    url: &str,
    dest: &Path,
    progress: Option<&DownloadProgressCallback>,
) -> Result<(u64, String)> {
    let mut builder = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT);
    if url.starts_with("http://127.0.0.1") || url.starts_with("http://localhost") {
        builder = builder.no_proxy();
    }
    let client = builder.build().context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("Request for {} failed", url))?;

    let expected = response.content_length();
    debug!("Expecting {:?} bytes from {}", expected, url);

    let mut out = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {:?}", dest))?;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.with_context(|| format!("Download of {} interrupted", url))?;
        out.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {:?}", dest))?;
        hasher.update(&chunk);
        received += chunk.len() as u64;

        if let Some(report) = progress {
            report(received, expected);
        }
    }
    out.flush().await.with_context(|| format!("Failed to write {:?}", dest))?;

    if let Some(expected) = expected {
        if received != expected {
            anyhow::bail!("Download of {} truncated at {} of {} bytes", url, received, expected);
        }
    }

    Ok((received, format!("{:x}", hasher.finalize())))
}

/// SHA-256 of a file as lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
