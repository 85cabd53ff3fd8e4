//! Configuration types for Inkboard.
//!
//! This module provides the [`Config`] struct which stores user preferences
//! and collaboration settings. Configuration is persisted as TOML (typically
//! at `~/.config/inkboard/config.toml` on Unix systems).
//!
//! # Key Configuration Fields
//!
//! - `font`, `font_size`, `content_width`: editor appearance. These three are
//!   also mirrored into every collaborative session's shared config map, so
//!   peers in the same room see the same layout.
//! - `collab_url`: WebSocket endpoint of the collaboration relay
//! - `auto_connect`: whether newly opened documents start collaborating
//!
//! # Example
//!
//! ```ignore
//! use inkboard_core::config::Config;
//!
//! let mut config = Config::load()?;
//! config.font_size = 18.0;
//! config.save()?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

/// Default collaboration relay.
pub const DEFAULT_COLLAB_URL: &str = "wss://collab.inkboard.app";

/// `Config` is a data structure that represents the parts of Inkboard that the user can configure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Editor font family. `None` uses the built-in default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,

    /// Editor font size in pixels
    #[serde(default = "default_font_size")]
    pub font_size: f64,

    /// Maximum width of the text column in pixels
    #[serde(default = "default_content_width")]
    pub content_width: f64,

    /// WebSocket URL of the collaboration relay. The room id is appended as a path segment.
    #[serde(default = "default_collab_url")]
    pub collab_url: String,

    /// Start collaborating as soon as a document is opened
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_font_size() -> f64 {
    14.0
}

fn default_content_width() -> f64 {
    800.0
}

fn default_collab_url() -> String {
    DEFAULT_COLLAB_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            font: None,
            font_size: default_font_size(),
            content_width: default_content_width(),
            collab_url: default_collab_url(),
            auto_connect: false,
        }
    }
}

/// Config shared between the UI layer and live sessions.
///
/// Sessions seed their replica's config map from it and write mirrored
/// remote edits back into it.
pub type SharedConfig = Arc<RwLock<Config>>;

/// A set of config fields changed by a remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigUpdate {
    /// New font, if changed. `Some(None)` means the peer cleared it.
    pub font: Option<Option<String>>,
    /// New font size, if changed
    pub font_size: Option<f64>,
    /// New content width, if changed
    pub content_width: Option<f64>,
}

impl ConfigUpdate {
    /// True when no field changed.
    pub fn is_empty(&self) -> bool {
        self.font.is_none() && self.font_size.is_none() && self.content_width.is_none()
    }

    /// Write the changed fields into `config`.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(font) = &self.font {
            config.font = font.clone();
        }
        if let Some(size) = self.font_size {
            config.font_size = size;
        }
        if let Some(width) = self.content_width {
            config.content_width = width;
        }
    }
}

impl Config {
    /// Wrap this config for sharing with sessions.
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| CollabError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|e| CollabError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load config from a path, or return the default if it doesn't exist.
    pub fn load_from_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }
}

// ============================================================================
// Native-only implementation (not available in WASM)
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
impl Config {
    /// Get the config file path (~/.config/inkboard/config.toml)
    /// Only available on native platforms
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("inkboard").join("config.toml"))
    }

    /// Load config from default location, or return default if file doesn't exist
    /// Only available on native platforms
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from_or_default(&path),
            None => Ok(Config::default()),
        }
    }

    /// Save config to default location
    /// Only available on native platforms
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or(CollabError::NoConfigDir)?;
        self.save_to(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::from_toml_str("font = \"iA Writer Mono\"\n").unwrap();
        assert_eq!(config.font.as_deref(), Some("iA Writer Mono"));
        assert_eq!(config.font_size, 14.0);
        assert_eq!(config.content_width, 800.0);
        assert_eq!(config.collab_url, DEFAULT_COLLAB_URL);
        assert!(!config.auto_connect);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            font: Some("JetBrains Mono".into()),
            font_size: 16.0,
            content_width: 640.0,
            collab_url: "ws://localhost:1234".into(),
            auto_connect: true,
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_update_apply() {
        let mut config = Config {
            font: Some("Georgia".into()),
            ..Config::default()
        };
        let update = ConfigUpdate {
            font: Some(None),
            font_size: Some(20.0),
            content_width: None,
        };
        assert!(!update.is_empty());
        update.apply_to(&mut config);
        assert_eq!(config.font, None);
        assert_eq!(config.font_size, 20.0);
        assert_eq!(config.content_width, 800.0);
    }
}
