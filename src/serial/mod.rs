pub mod decoder;
pub mod interface;
pub mod mock;
pub mod session;
pub mod settings;

pub use decoder::Utf8Decoder;
pub use interface::{DriverKind, PortOpener, SerialInterface, SerialPortIO, SystemSerialPort};
pub use session::{SessionOptions, SessionState, SerialSession};
pub use settings::LineSettings;

use serde::{Deserialize, Serialize};

/// Identity of an attached USB serial device, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    /// Two descriptors refer to the same physical device when the USB identity matches.
    /// Port names alone are not enough for multi-interface devices.
    pub fn same_device(&self, other: &SerialDeviceInfo) -> bool {
        self.vid == other.vid && self.pid == other.pid && self.serial_number == other.serial_number
    }

    pub fn display_name(&self) -> String {
        match &self.product {
            Some(product) => format!("{} ({})", self.port_name, product),
            None => self.port_name.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Unsupported device: no serial driver matches {0}")]
    UnsupportedDevice(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
