use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use tokio::process::Command;
use tokio::sync::RwLock;

use super::models::{BoardError, BoardResult, BoardToolConfig, DATA_DIR_ENV};

/// Anything that can produce the supported-board listing.
#[async_trait::async_trait]
pub trait BoardLister: Send + Sync {
    async fn board_list(&self, data_dir: &Path) -> BoardResult<String>;
}

/// Runs the external command-line tool and returns its stdout verbatim.
pub struct CliBoardLister {
    config: BoardToolConfig,
}

impl CliBoardLister {
    pub fn new(config: BoardToolConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl BoardLister for CliBoardLister {
    async fn board_list(&self, data_dir: &Path) -> BoardResult<String> {
        let program = self.config.program.display().to_string();
        debug!("Running {} {:?}", program, self.config.args);

        let output = Command::new(&self.config.program)
            .args(&self.config.args)
            .env(DATA_DIR_ENV, data_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BoardError::Launch {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BoardError::ExitStatus {
                program,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(String::from_utf8(output.stdout)?)
    }
}

/// Front door to the board-listing capability.
pub struct BoardInfoClient {
    lister: Arc<dyn BoardLister>,
    data_dir: RwLock<Option<PathBuf>>,
}

impl BoardInfoClient {
    pub fn new(lister: Arc<dyn BoardLister>) -> Self {
        Self {
            lister,
            data_dir: RwLock::new(None),
        }
    }

    pub fn with_tool(config: BoardToolConfig) -> Self {
        Self::new(Arc::new(CliBoardLister::new(config)))
    }

    /// Hand the tool its private state directory. Called once at startup.
    pub async fn init(&self, data_dir: impl Into<PathBuf>) -> BoardResult<()> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        info!("Board tool data directory: {}", data_dir.display());
        *self.data_dir.write().await = Some(data_dir);
        Ok(())
    }

    pub async fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.read().await.clone()
    }

    pub async fn try_list_boards(&self) -> BoardResult<String> {
        let data_dir = self.data_dir().await.ok_or(BoardError::NotInitialized)?;
        let lister = self.lister.clone();
        // Keep the caller's task free even if a lister blocks
        tokio::spawn(async move { lister.board_list(&data_dir).await })
            .await
            .map_err(|e| BoardError::Task(e.to_string()))?
    }

    /// Board listing as display text; failures become `"Error: ..."`.
    pub async fn list_boards(&self) -> String {
        match self.try_list_boards().await {
            Ok(text) => text,
            Err(e) => {
                error!("Board listing failed: {}", e);
                format!("Error: {}", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLister(&'static str);

    #[async_trait::async_trait]
    impl BoardLister for FixedLister {
        async fn board_list(&self, _data_dir: &Path) -> BoardResult<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_uninitialized_client_reports_error_text() {
        let client = BoardInfoClient::new(Arc::new(FixedLister("Arduino Uno  arduino:avr:uno\n")));
        let text = client.list_boards().await;
        assert!(text.starts_with("Error: "), "{}", text);
        assert!(text.contains("not initialized"));
    }

    #[tokio::test]
    async fn test_output_passed_through_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let client = BoardInfoClient::new(Arc::new(FixedLister("Arduino Uno  arduino:avr:uno\n")));
        client.init(dir.path().join("data")).await.unwrap();
        assert!(dir.path().join("data").is_dir());
        assert_eq!(client.list_boards().await, "Arduino Uno  arduino:avr:uno\n");
    }
}
