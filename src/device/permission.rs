//! Access control in front of the serial session.
//!
//! `PermissionGate` is the state machine; it decides, the manager acts.
//! `PermissionProvider` is the OS side that knows whether the current user
//! may open a device and answers requests asynchronously.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::serial::{SerialDeviceInfo, SerialInterface};

/// OS answer to a permission request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEvent {
    pub device: SerialDeviceInfo,
    pub granted: bool,
}

pub trait PermissionProvider: Send + Sync {
    fn has_permission(&self, device: &SerialDeviceInfo) -> bool;

    /// Ask for access. The decision arrives later on `notifier`.
    fn request_permission(&self, device: &SerialDeviceInfo, notifier: mpsc::UnboundedSender<PermissionEvent>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    NoDevice,
    PermissionRequested(SerialDeviceInfo),
    Opening(SerialDeviceInfo),
    Open(SerialDeviceInfo),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    None,
    RequestPermission(SerialDeviceInfo),
    Open(SerialDeviceInfo),
    Close,
}

#[derive(Debug)]
pub struct PermissionGate {
    state: GateState,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionGate {
    pub fn new() -> Self {
        Self { state: GateState::NoDevice }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn device(&self) -> Option<&SerialDeviceInfo> {
        match &self.state {
            GateState::NoDevice => None,
            GateState::PermissionRequested(d) | GateState::Opening(d) | GateState::Open(d) => Some(d),
        }
    }

    pub fn request_connect(&mut self, device: &SerialDeviceInfo, already_granted: bool) -> GateAction {
        if already_granted {
            self.state = GateState::Opening(device.clone());
            GateAction::Open(device.clone())
        } else {
            self.state = GateState::PermissionRequested(device.clone());
            GateAction::RequestPermission(device.clone())
        }
    }

    /// Grants only count for the device we asked about; anything else leaves the state alone.
    pub fn on_permission(&mut self, device: &SerialDeviceInfo, granted: bool) -> GateAction {
        let pending = matches!(&self.state, GateState::PermissionRequested(d) if d.port_name == device.port_name);
        if !pending {
            return GateAction::None;
        }
        if granted {
            self.state = GateState::Opening(device.clone());
            GateAction::Open(device.clone())
        } else {
            self.state = GateState::NoDevice;
            GateAction::None
        }
    }

    pub fn is_pending(&self, device: &SerialDeviceInfo) -> bool {
        matches!(&self.state, GateState::PermissionRequested(d) if d.port_name == device.port_name)
    }

    pub fn opened(&mut self) {
        if let GateState::Opening(device) = &self.state {
            self.state = GateState::Open(device.clone());
        }
    }

    pub fn on_detach(&mut self, port_name: &str) -> GateAction {
        let action = match &self.state {
            GateState::Opening(d) | GateState::Open(d) if d.port_name == port_name => GateAction::Close,
            GateState::PermissionRequested(d) if d.port_name == port_name => GateAction::None,
            _ => return GateAction::None,
        };
        self.state = GateState::NoDevice;
        action
    }

    pub fn reset(&mut self) {
        self.state = GateState::NoDevice;
    }
}

/// Desktop provider: a device is accessible when the current user may read
/// and write the node the opener will use. Checked with `access(2)`, so the
/// board is not reset by a trial open.
#[derive(Debug, Default)]
pub struct PortAccessPermission;

impl PortAccessPermission {
    pub fn new() -> Self {
        Self
    }

    /// Node the opener will actually open for `device`
    fn target_node(device: &SerialDeviceInfo) -> String {
        SerialInterface::first_port_of(device).unwrap_or_else(|_| device.port_name.clone())
    }

    #[cfg(unix)]
    fn can_access(path: &str) -> bool {
        let Ok(path) = std::ffi::CString::new(path) else {
            return false;
        };
        // SAFETY: `path` is NUL-terminated and outlives the call
        unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
    }

    #[cfg(not(unix))]
    fn can_access(_path: &str) -> bool {
        true
    }
}

impl PermissionProvider for PortAccessPermission {
    fn has_permission(&self, device: &SerialDeviceInfo) -> bool {
        Self::can_access(&Self::target_node(device))
    }

    fn request_permission(&self, device: &SerialDeviceInfo, notifier: mpsc::UnboundedSender<PermissionEvent>) {
        let node = Self::target_node(device);
        let granted = Self::can_access(&node);
        if !granted {
            log::warn!("No read/write access to {}; check group membership (dialout/uucp)", node);
        }
        let _ = notifier.send(PermissionEvent {
            device: device.clone(),
            granted,
        });
    }
}

/// Provider whose decisions are made by the caller, e.g. a prompt or a test.
#[derive(Debug, Default)]
pub struct ManualPermission {
    granted: Mutex<HashSet<String>>,
    requests: Mutex<Vec<SerialDeviceInfo>>,
}

impl ManualPermission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, port_name: &str) {
        self.granted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port_name.to_string());
    }

    pub fn requests(&self) -> Vec<SerialDeviceInfo> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl PermissionProvider for ManualPermission {
    fn has_permission(&self, device: &SerialDeviceInfo) -> bool {
        self.granted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&device.port_name)
    }

    fn request_permission(&self, device: &SerialDeviceInfo, _notifier: mpsc::UnboundedSender<PermissionEvent>) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(device.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::mock::arduino_uno;

    #[test]
    fn test_already_granted_goes_straight_to_opening() {
        let mut gate = PermissionGate::new();
        let uno = arduino_uno("/dev/ttyACM0");
        assert_eq!(gate.request_connect(&uno, true), GateAction::Open(uno.clone()));
        assert_eq!(gate.state(), &GateState::Opening(uno.clone()));
        gate.opened();
        assert_eq!(gate.state(), &GateState::Open(uno));
    }

    #[test]
    fn test_request_then_grant() {
        let mut gate = PermissionGate::new();
        let uno = arduino_uno("/dev/ttyACM0");
        assert_eq!(gate.request_connect(&uno, false), GateAction::RequestPermission(uno.clone()));
        assert!(gate.is_pending(&uno));
        assert_eq!(gate.on_permission(&uno, true), GateAction::Open(uno.clone()));
        assert_eq!(gate.state(), &GateState::Opening(uno));
    }

    #[test]
    fn test_request_then_deny_returns_to_no_device() {
        let mut gate = PermissionGate::new();
        let uno = arduino_uno("/dev/ttyACM0");
        gate.request_connect(&uno, false);
        assert_eq!(gate.on_permission(&uno, false), GateAction::None);
        assert_eq!(gate.state(), &GateState::NoDevice);
    }

    #[test]
    fn test_unsolicited_results_change_nothing() {
        let mut gate = PermissionGate::new();
        let uno = arduino_uno("/dev/ttyACM0");
        assert_eq!(gate.on_permission(&uno, false), GateAction::None);
        assert_eq!(gate.on_permission(&uno, true), GateAction::None);
        assert_eq!(gate.state(), &GateState::NoDevice);

        let other = arduino_uno("/dev/ttyACM1");
        gate.request_connect(&uno, false);
        assert_eq!(gate.on_permission(&other, true), GateAction::None);
        assert!(gate.is_pending(&uno));
    }

    #[test]
    fn test_detach_closes_only_matching_device() {
        let mut gate = PermissionGate::new();
        let uno = arduino_uno("/dev/ttyACM0");
        gate.request_connect(&uno, true);
        gate.opened();
        assert_eq!(gate.on_detach("/dev/ttyACM7"), GateAction::None);
        assert_eq!(gate.on_detach("/dev/ttyACM0"), GateAction::Close);
        assert_eq!(gate.state(), &GateState::NoDevice);
        assert_eq!(gate.on_detach("/dev/ttyACM0"), GateAction::None);
    }

    #[cfg(unix)]
    #[test]
    fn test_access_check_follows_the_node() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let reachable = arduino_uno(file.path().to_str().unwrap());
        let provider = PortAccessPermission::new();
        assert!(provider.has_permission(&reachable));
        assert!(!provider.has_permission(&arduino_uno("/nonexistent/ttyACM9")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.request_permission(&arduino_uno("/nonexistent/ttyACM9"), tx);
        let event = rx.try_recv().unwrap();
        assert!(!event.granted);
        assert_eq!(event.device.port_name, "/nonexistent/ttyACM9");
    }

    #[test]
    fn test_detach_while_waiting_for_permission() {
        let mut gate = PermissionGate::new();
        let uno = arduino_uno("/dev/ttyACM0");
        gate.request_connect(&uno, false);
        assert_eq!(gate.on_detach("/dev/ttyACM0"), GateAction::None);
        assert_eq!(gate.state(), &GateState::NoDevice);
    }
}
