//! UI-facing commands. Each maps component errors to display strings.

use uuid::Uuid;

use crate::device::{ConnectOutcome, ConnectionStatus, Device};
use crate::serial::LineSettings;
use crate::AppState;

/// Supported-board listing; tool failures arrive as `"Error: ..."` text
pub async fn list_boards(state: &AppState) -> Result<String, String> {
    Ok(state.boards.list_boards().await)
}

/// Discover attached USB serial devices
pub async fn discover_devices(state: &AppState) -> Result<Vec<Device>, String> {
    state
        .manager
        .discover_devices()
        .await
        .map_err(|e| format!("Failed to discover devices: {}", e))
}

/// Connect to a device given by id or port name, with a user-entered baud rate
pub async fn connect(state: &AppState, target: &str, baud_rate: &str) -> Result<ConnectOutcome, String> {
    let settings = line_settings(state, baud_rate)?;

    let device = match Uuid::parse_str(target) {
        Ok(id) => state.manager.get_device(&id).await,
        Err(_) => {
            discover_devices(state).await?;
            state.manager.find_by_port(target).await
        }
    };
    let device = device.ok_or_else(|| format!("Device not found: {}", target))?;

    request_connect(state, &device, settings).await
}

/// Connect to the first supported device attached
pub async fn connect_first(state: &AppState, baud_rate: &str) -> Result<ConnectOutcome, String> {
    let settings = line_settings(state, baud_rate)?;
    discover_devices(state).await?;

    let Some(device) = state.manager.first_supported_device().await else {
        state.manager.log().info("No USB devices found");
        return Err("No USB devices found".to_string());
    };

    request_connect(state, &device, settings).await
}

/// Disconnect from the currently connected device
pub async fn disconnect(state: &AppState) -> Result<(), String> {
    state
        .manager
        .disconnect()
        .await
        .map_err(|e| format!("Failed to disconnect device: {}", e))
}

/// Send a payload on the open session
pub fn send(state: &AppState, payload: &str) -> Result<(), String> {
    if state.manager.send(payload.as_bytes().to_vec()) {
        Ok(())
    } else {
        Err("No open serial session".to_string())
    }
}

pub async fn connection_status(state: &AppState) -> Result<ConnectionStatus, String> {
    Ok(state.manager.status().await)
}

/// Connection log as display text
pub fn connection_log(state: &AppState) -> Result<String, String> {
    Ok(state.manager.log().render())
}

async fn request_connect(
    state: &AppState,
    device: &Device,
    settings: LineSettings,
) -> Result<ConnectOutcome, String> {
    state
        .manager
        .request_connect(&device.id, settings)
        .await
        .map_err(|e| format!("Failed to connect to device: {}", e))
}

fn line_settings(state: &AppState, baud_rate: &str) -> Result<LineSettings, String> {
    let baud = LineSettings::parse_baud_rate(baud_rate).map_err(|e| e.to_string())?;
    Ok(state.settings.line.with_baud_rate(baud))
}
