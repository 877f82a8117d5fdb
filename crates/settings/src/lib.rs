//! Facilitator Settings
//!
//! JSON config file management. The pipeline config type lives with the
//! pipeline; this crate only knows how to find, read and write it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use facilitator_keystore::default_config_dir_for;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read settings: {0}")]
    ReadError(String),
    #[error("Failed to write settings: {0}")]
    WriteError(String),
    #[error("Failed to parse settings: {0}")]
    ParseError(String),
    #[error("Failed to create directory: {0}")]
    CreateDirError(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// A config value together with the file it came from.
///
/// ```ignore
/// let settings: Settings<FacilitatorConfig> = Settings::load(Path::new("facilitator.json"))?;
/// ```
pub struct Settings<T> {
    pub config: T,
    path: PathBuf,
}

impl<T: Serialize + DeserializeOwned> Settings<T> {
    /// Load settings from `path`. The file must exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        debug!("Loading settings from {}", path.display());
        let content =
            fs::read_to_string(path).map_err(|e| SettingsError::ReadError(e.to_string()))?;
        let config: T =
            serde_json::from_str(&content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
        Ok(Self {
            config,
            path: path.to_path_buf(),
        })
    }

    pub fn new(config: T, path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            path: path.into(),
        }
    }

    /// Save current settings to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettingsError::CreateDirError(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(&self.config)
            .map_err(|e| SettingsError::WriteError(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| SettingsError::WriteError(e.to_string()))
    }

    /// Get the path where settings are stored.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Serialize + DeserializeOwned + Default> Settings<T> {
    /// Load settings from the default path for a service, or create defaults.
    pub fn load_or_default(service: &str, custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => default_settings_path(service),
        };

        if path.exists() {
            Self::load(&path)
        } else {
            debug!("Creating default settings at {}", path.display());
            let settings = Self::new(T::default(), path);
            settings.save()?;
            Ok(settings)
        }
    }
}

/// Get the default settings file path for a service.
pub fn default_settings_path(service: &str) -> PathBuf {
    default_config_dir_for(service).join("settings.json")
}
