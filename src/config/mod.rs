use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::board::BoardToolConfig;
use crate::serial::{LineSettings, SessionOptions};

pub const DEFAULT_DATA_DIR: &str = ".arduinobuddy";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Private state directory handed to the board tool
    pub data_dir: PathBuf,
    pub board_tool: BoardToolConfig,
    pub line: LineSettings,
    pub session: SessionOptions,
    pub port_poll_interval_ms: u64,
    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            board_tool: BoardToolConfig::default(),
            line: LineSettings::default(),
            session: SessionOptions::default(),
            port_poll_interval_ms: 500,
            log_level: "info".to_string(),
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn port_poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms.max(10))
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.line.baud_rate, 115200);
        assert_eq!(settings.session.read_buffer_size, 64);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "line": { "baud_rate": 9600 }, "log_level": "debug" }"#).unwrap();

        let settings = AppSettings::load(&path).unwrap();
        assert_eq!(settings.line.baud_rate, 9600);
        assert_eq!(settings.line.data_bits, 8);
        assert_eq!(settings.log_filter(), log::LevelFilter::Debug);
        assert_eq!(settings.board_tool, BoardToolConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AppSettings::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = AppSettings::default();
        settings.data_dir = dir.path().join("data");
        settings.save(&path).unwrap();
        assert_eq!(AppSettings::load(&path).unwrap(), settings);
    }
}
