use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use uuid::Uuid;

use super::permission::{GateAction, GateState, PermissionEvent, PermissionGate, PermissionProvider};
use super::port_monitor::PortEvent;
use super::{ConnectionState, ConnectionStatus, Device, DeviceError, Result};
use crate::connection_log::{ConnectionLog, LogKind};
use crate::serial::{
    LineSettings, PortOpener, SerialDeviceInfo, SerialInterface, SerialSession, SessionOptions, SessionState,
};

/// Result of a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Permission was already there and the session is open
    Connected,
    /// Waiting for the OS to answer; the session opens on grant
    PermissionRequested,
}

struct GateSlot {
    gate: PermissionGate,
    pending_settings: LineSettings,
}

/// Central device management system.
///
/// Owns the device registry, the permission gate and the one serial session.
/// Every lifecycle transition goes through the gate lock, so connect, grant,
/// detach and disconnect never interleave.
pub struct DeviceManager {
    devices: Arc<RwLock<HashMap<Uuid, Device>>>,
    gate: Mutex<GateSlot>,
    session: SerialSession,
    opener: Arc<dyn PortOpener>,
    permissions: Arc<dyn PermissionProvider>,
    log: ConnectionLog,
    permission_tx: mpsc::UnboundedSender<PermissionEvent>,
    permission_rx: Mutex<Option<mpsc::UnboundedReceiver<PermissionEvent>>>,
    pump_shutdown: Notify,
}

impl DeviceManager {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        permissions: Arc<dyn PermissionProvider>,
        options: SessionOptions,
        log: ConnectionLog,
    ) -> Self {
        let (permission_tx, permission_rx) = mpsc::unbounded_channel();
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            gate: Mutex::new(GateSlot {
                gate: PermissionGate::new(),
                pending_settings: LineSettings::default(),
            }),
            session: SerialSession::new(opener.clone(), options, log.clone()),
            opener,
            permissions,
            log,
            permission_tx,
            permission_rx: Mutex::new(Some(permission_rx)),
            pump_shutdown: Notify::new(),
        }
    }

    pub fn log(&self) -> &ConnectionLog {
        &self.log
    }

    pub fn session(&self) -> &SerialSession {
        &self.session
    }

    /// Sender for OS permission answers, for providers living elsewhere
    pub fn permission_notifier(&self) -> mpsc::UnboundedSender<PermissionEvent> {
        self.permission_tx.clone()
    }

    /// Enumerate attached USB serial devices and merge them into the registry
    pub async fn discover_devices(&self) -> Result<Vec<Device>> {
        let infos = tokio::task::spawn_blocking(SerialInterface::discover_devices)
            .await
            .map_err(|e| DeviceError::Task(e.to_string()))??;

        let mut discovered = Vec::with_capacity(infos.len());
        for info in infos {
            discovered.push(self.register_device(info).await);
        }
        Ok(discovered)
    }

    /// Add a device to the registry, or refresh the entry with the same port name
    pub async fn register_device(&self, info: SerialDeviceInfo) -> Device {
        let driver = self.opener.probe(&info);
        let mut devices_guard = self.devices.write().await;

        let existing_id = devices_guard
            .values()
            .find(|d| d.info.port_name == info.port_name)
            .map(|d| d.id);

        match existing_id.and_then(|id| devices_guard.get_mut(&id)) {
            Some(existing) => {
                // Keep the connection state, refresh identity
                existing.info = info;
                existing.driver = driver;
                existing.last_seen = chrono::Utc::now();
                existing.clone()
            }
            None => {
                let device = Device::from_serial_info(&info, driver);
                devices_guard.insert(device.id, device.clone());
                device
            }
        }
    }

    pub async fn get_devices(&self) -> Vec<Device> {
        let devices_guard = self.devices.read().await;
        let mut devices: Vec<Device> = devices_guard.values().cloned().collect();
        devices.sort_by(|a, b| a.info.port_name.cmp(&b.info.port_name));
        devices
    }

    pub async fn get_device(&self, device_id: &Uuid) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn find_by_port(&self, port_name: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.info.port_name == port_name)
            .cloned()
    }

    /// First registered device with a known driver, by port name
    pub async fn first_supported_device(&self) -> Option<Device> {
        self.get_devices().await.into_iter().find(|d| d.is_supported())
    }

    /// Start connecting to a device, asking for permission when needed
    pub async fn request_connect(&self, device_id: &Uuid, settings: LineSettings) -> Result<ConnectOutcome> {
        let device = self.get_device(device_id).await.ok_or(DeviceError::NotFound)?;
        let info = device.info.clone();

        let mut slot = self.gate.lock().await;
        let already_granted = self.permissions.has_permission(&info);
        slot.pending_settings = settings;

        match slot.gate.request_connect(&info, already_granted) {
            GateAction::Open(info) => {
                self.log.append(
                    LogKind::Permission,
                    format!("Permission already granted for device {}", info.port_name),
                );
                self.open_locked(&mut slot, info).await?;
                Ok(ConnectOutcome::Connected)
            }
            GateAction::RequestPermission(info) => {
                self.log.append(
                    LogKind::Permission,
                    format!("Requesting permission for device {}", info.port_name),
                );
                self.update_connection_state(&info.port_name, ConnectionState::AwaitingPermission)
                    .await;
                self.permissions.request_permission(&info, self.permission_tx.clone());
                Ok(ConnectOutcome::PermissionRequested)
            }
            GateAction::None | GateAction::Close => Ok(ConnectOutcome::PermissionRequested),
        }
    }

    /// React to the OS answering a permission request
    pub async fn handle_permission_event(&self, event: PermissionEvent) -> Result<()> {
        let mut slot = self.gate.lock().await;
        let was_pending = slot.gate.is_pending(&event.device);
        let action = slot.gate.on_permission(&event.device, event.granted);

        if !event.granted {
            self.log.append(
                LogKind::Permission,
                format!("Permission denied for device {}", event.device.port_name),
            );
            if was_pending {
                self.update_connection_state(&event.device.port_name, ConnectionState::Disconnected)
                    .await;
            }
            return Ok(());
        }

        match action {
            GateAction::Open(info) => {
                self.log.append(
                    LogKind::Permission,
                    format!("Permission granted for device {}", info.port_name),
                );
                self.open_locked(&mut slot, info).await
            }
            _ => {
                self.log.append(
                    LogKind::Permission,
                    format!(
                        "Ignoring permission grant for device {}: no connect attempt pending",
                        event.device.port_name
                    ),
                );
                Ok(())
            }
        }
    }

    /// React to ports appearing or disappearing
    pub async fn handle_port_event(&self, event: PortEvent) -> Result<()> {
        log::debug!("Port event for {}", event.port_name());
        match event {
            PortEvent::PortRemoved(port_name) => {
                {
                    let mut slot = self.gate.lock().await;
                    let gate_action = slot.gate.on_detach(&port_name);
                    // The gate may be tracking a newer request while this port is still open
                    let session_on_port = self
                        .session
                        .active()
                        .is_some_and(|active| active.device.port_name == port_name);
                    if gate_action == GateAction::Close || session_on_port {
                        self.log.append(LogKind::Lifecycle, format!("Device detached: {}", port_name));
                        self.close_session().await?;
                    }
                }
                let mut devices_guard = self.devices.write().await;
                devices_guard.retain(|_, d| d.info.port_name != port_name);
                Ok(())
            }
            PortEvent::PortAdded(port_name) => {
                if let Err(e) = self.discover_devices().await {
                    log::warn!("Rediscovery after {} appeared failed: {}", port_name, e);
                }
                Ok(())
            }
        }
    }

    /// Close the current session, if any
    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.gate.lock().await;
        slot.gate.reset();
        self.close_session().await
    }

    /// Queue `data` for sending; returns `false` if nothing is open
    pub fn send(&self, data: impl Into<Vec<u8>>) -> bool {
        self.session.write(data).is_some()
    }

    pub async fn status(&self) -> ConnectionStatus {
        let slot = self.gate.lock().await;
        let active = self.session.active();

        let state = match (self.session.state(), slot.gate.state()) {
            (SessionState::Open, _) => ConnectionState::Connected,
            (SessionState::Opening, _) | (_, GateState::Opening(_)) => ConnectionState::Connecting,
            (_, GateState::PermissionRequested(_)) => ConnectionState::AwaitingPermission,
            (SessionState::Lost(reason), _) => ConnectionState::Error(reason),
            _ => ConnectionState::Disconnected,
        };

        ConnectionStatus {
            state,
            device: active
                .as_ref()
                .map(|a| a.device.clone())
                .or_else(|| slot.gate.device().cloned()),
            settings: active.map(|a| a.settings),
        }
    }

    /// Bring the gate and registry in line after the reader lost the port
    pub async fn handle_session_lost(&self, reason: &str) {
        let mut slot = self.gate.lock().await;
        if let GateState::Open(info) = slot.gate.state().clone() {
            slot.gate.reset();
            self.update_connection_state(&info.port_name, ConnectionState::Error(reason.to_string()))
                .await;
        }
    }

    /// Ask a running event pump to finish; its task then releases the manager.
    pub fn stop_event_pump(&self) {
        self.pump_shutdown.notify_one();
    }

    /// Drive permission answers, port events and session failures until `stop_event_pump`
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut port_rx: Option<mpsc::Receiver<PortEvent>>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let mut state_rx = self.session.state_receiver();
        tokio::spawn(async move {
            let Some(mut permission_rx) = manager.permission_rx.lock().await.take() else {
                log::warn!("Event pump already running");
                return;
            };

            loop {
                tokio::select! {
                    _ = manager.pump_shutdown.notified() => break,
                    Some(event) = permission_rx.recv() => {
                        if let Err(e) = manager.handle_permission_event(event).await {
                            log::error!("Permission handling failed: {}", e);
                        }
                    }
                    Some(event) = recv_port(&mut port_rx) => {
                        if let Err(e) = manager.handle_port_event(event).await {
                            log::error!("Port event handling failed: {}", e);
                        }
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = state_rx.borrow_and_update().clone();
                        if let SessionState::Lost(reason) = state {
                            manager.handle_session_lost(&reason).await;
                        }
                    }
                }
            }
            log::debug!("Event pump stopped");
        })
    }

    async fn open_locked(&self, slot: &mut GateSlot, info: SerialDeviceInfo) -> Result<()> {
        // The session closes the old port itself; keep the registry in step
        if let Some(previous) = self.session.active() {
            self.update_connection_state(&previous.device.port_name, ConnectionState::Disconnected)
                .await;
        }
        self.update_connection_state(&info.port_name, ConnectionState::Connecting)
            .await;

        let session = self.session.clone();
        let settings = slot.pending_settings;
        let target = info.clone();
        let result = tokio::task::spawn_blocking(move || session.open(&target, settings))
            .await
            .map_err(|e| DeviceError::Task(e.to_string()))?;

        match result {
            Ok(()) => {
                slot.gate.opened();
                self.update_connection_state(&info.port_name, ConnectionState::Connected)
                    .await;
                log::info!("Successfully connected to device: {}", info.port_name);
                Ok(())
            }
            Err(e) => {
                slot.gate.reset();
                self.update_connection_state(&info.port_name, ConnectionState::Error(e.to_string()))
                    .await;
                Err(DeviceError::SerialError(e))
            }
        }
    }

    async fn close_session(&self) -> Result<()> {
        let previous = self.session.active();
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || session.close())
            .await
            .map_err(|e| DeviceError::Task(e.to_string()))?;

        if let Some(active) = previous {
            self.update_connection_state(&active.device.port_name, ConnectionState::Disconnected)
                .await;
        }
        Ok(())
    }

    async fn update_connection_state(&self, port_name: &str, state: ConnectionState) {
        let mut devices_guard = self.devices.write().await;
        if let Some(device) = devices_guard.values_mut().find(|d| d.info.port_name == port_name) {
            device.update_connection_state(state);
        }
    }
}

async fn recv_port(port_rx: &mut Option<mpsc::Receiver<PortEvent>>) -> Option<PortEvent> {
    match port_rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
