pub mod board;
pub mod commands;
pub mod config;
pub mod connection_log;
pub mod device;
pub mod serial;

use std::sync::Arc;

use board::BoardInfoClient;
use config::AppSettings;
use connection_log::ConnectionLog;
use device::{DeviceManager, PermissionProvider, PortAccessPermission};
use serial::{PortOpener, SerialInterface};

/// Everything the front end talks to
pub struct AppState {
    pub settings: AppSettings,
    pub manager: Arc<DeviceManager>,
    pub boards: BoardInfoClient,
}

impl AppState {
    /// Wire up the real serial ports, desktop permission checks and the board tool
    pub fn new(settings: AppSettings) -> Self {
        let boards = BoardInfoClient::with_tool(settings.board_tool.clone());
        Self::with_parts(
            settings,
            Arc::new(SerialInterface::new()),
            Arc::new(PortAccessPermission::new()),
            boards,
        )
    }

    pub fn with_parts(
        settings: AppSettings,
        opener: Arc<dyn PortOpener>,
        permissions: Arc<dyn PermissionProvider>,
        boards: BoardInfoClient,
    ) -> Self {
        let manager = Arc::new(DeviceManager::new(
            opener,
            permissions,
            settings.session,
            ConnectionLog::new(),
        ));
        Self {
            settings,
            manager,
            boards,
        }
    }

    /// Startup: hand the board tool its data directory
    pub async fn init(&self) -> board::BoardResult<()> {
        self.boards.init(self.settings.data_dir.clone()).await?;
        log::info!("ArduinoBuddy started");
        Ok(())
    }
}
