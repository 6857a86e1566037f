pub mod manager;
pub mod models;
pub mod permission;
pub mod port_monitor;

pub use manager::{ConnectOutcome, DeviceManager};
pub use models::*;
pub use permission::{
    GateAction, GateState, ManualPermission, PermissionEvent, PermissionGate, PermissionProvider,
    PortAccessPermission,
};
pub use port_monitor::{create_port_monitor, PortEvent, PortMonitor};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
