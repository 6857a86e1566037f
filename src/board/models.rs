use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable through which the tool receives its data directory.
pub const DATA_DIR_ENV: &str = "ARDUINO_DIRECTORIES_DATA";

/// How to invoke the external board-listing tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardToolConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for BoardToolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("arduino-cli"),
            args: vec!["board".to_string(), "listall".to_string()],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("Board tool not initialized; call init with a data directory first")]
    NotInitialized,

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    ExitStatus {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Board tool output is not valid UTF-8: {0}")]
    InvalidOutput(#[from] std::string::FromUtf8Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Board tool task failed: {0}")]
    Task(String),
}

pub type BoardResult<T> = Result<T, BoardError>;
