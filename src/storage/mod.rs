//! Storage Layer
//!
//! Per-user directories for configuration and trained models.

use anyhow::Result;
use std::path::PathBuf;

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "screentext", "ScreenText")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}

/// Default config file location
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

/// Default model directory. Not created here; a missing directory is a
/// configuration error the engine reports.
pub fn default_model_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("tessdata"))
}
