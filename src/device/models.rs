use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serial::{DriverKind, LineSettings, SerialDeviceInfo};

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    AwaitingPermission,
    Connecting,
    Connected,
    Error(String),
}

/// A device the manager has seen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub info: SerialDeviceInfo,
    pub driver: Option<DriverKind>,
    pub connection_state: ConnectionState,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn from_serial_info(info: &SerialDeviceInfo, driver: Option<DriverKind>) -> Self {
        Self {
            id: Uuid::new_v4(),
            info: info.clone(),
            driver,
            connection_state: ConnectionState::Disconnected,
            last_seen: Utc::now(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.info.port_name
    }

    pub fn is_supported(&self) -> bool {
        self.driver.is_some()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }
}

/// What the terminal screen shows about the current connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub device: Option<SerialDeviceInfo>,
    pub settings: Option<LineSettings>,
}

impl ConnectionStatus {
    pub fn idle() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device: None,
            settings: None,
        }
    }
}
