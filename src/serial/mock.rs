//! In-memory serial transport for tests and dry runs.
//!
//! A `MockPort` is the test-side handle: inject bytes for the reader, inspect
//! what was written, or make the next read/write fail. `MockOpener` hands out
//! transports backed by the same `MockPort`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::interface::{probe_driver, DriverKind, PortOpener, SerialPortIO};
use super::{LineSettings, Result, SerialDeviceInfo, SerialError};

#[derive(Default)]
struct MockState {
    incoming: Mutex<VecDeque<u8>>,
    data_ready: Condvar,
    written: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    live_transports: AtomicUsize,
    reads: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<MockState>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MockTransport {
        self.state.live_transports.fetch_add(1, Ordering::SeqCst);
        MockTransport {
            state: self.state.clone(),
            lease: Arc::new(Lease {
                state: self.state.clone(),
            }),
        }
    }

    /// Queue bytes as if the device had sent them.
    pub fn inject(&self, data: &[u8]) {
        let mut incoming = self.state.incoming.lock().unwrap_or_else(|e| e.into_inner());
        incoming.extend(data.iter().copied());
        self.state.data_ready.notify_all();
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every subsequent read returns an I/O error, like an unplugged device.
    pub fn fail_reads(&self) {
        self.state.fail_reads.store(true, Ordering::SeqCst);
        self.state.data_ready.notify_all();
    }

    pub fn fail_writes(&self) {
        self.state.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Opened transports with at least one handle still alive.
    pub fn live_transports(&self) -> usize {
        self.state.live_transports.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }
}

// Shared by a transport and its clones; the port counts as closed once all are gone.
struct Lease {
    state: Arc<MockState>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.state.live_transports.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    state: Arc<MockState>,
    lease: Arc<Lease>,
}

impl SerialPortIO for MockTransport {
    fn read_data(&mut self, buffer: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        let broken = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mock device gone");

        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(broken());
        }

        let mut incoming = self.state.incoming.lock().unwrap_or_else(|e| e.into_inner());
        if incoming.is_empty() {
            let (guard, _) = self
                .state
                .data_ready
                .wait_timeout(incoming, timeout)
                .unwrap_or_else(|e| e.into_inner());
            incoming = guard;
        }

        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(broken());
        }

        let n = incoming.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn send_data(&mut self, data: &[u8], _timeout: Duration) -> std::io::Result<usize> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "mock write timeout"));
        }
        self.state
            .written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> std::io::Result<Box<dyn SerialPortIO>> {
        Ok(Box::new(MockTransport {
            state: self.state.clone(),
            lease: self.lease.clone(),
        }))
    }
}

/// `PortOpener` that serves `MockPort` transports.
pub struct MockOpener {
    port: MockPort,
    fail_open: AtomicBool,
    opens: AtomicUsize,
    last_settings: Mutex<Option<LineSettings>>,
}

impl MockOpener {
    pub fn new(port: MockPort) -> Self {
        Self {
            port,
            fail_open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            last_settings: Mutex::new(None),
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_settings(&self) -> Option<LineSettings> {
        *self.last_settings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PortOpener for MockOpener {
    fn probe(&self, device: &SerialDeviceInfo) -> Option<DriverKind> {
        probe_driver(device)
    }

    fn open(&self, device: &SerialDeviceInfo, settings: &LineSettings) -> Result<Box<dyn SerialPortIO>> {
        settings.validate()?;
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SerialError::ConnectionFailed(format!("{}: mock open failure", device.port_name)));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        *self.last_settings.lock().unwrap_or_else(|e| e.into_inner()) = Some(*settings);
        Ok(Box::new(self.port.transport()))
    }
}

/// A descriptor the default prober accepts (Arduino Uno R3 identity).
pub fn arduino_uno(port_name: &str) -> SerialDeviceInfo {
    SerialDeviceInfo {
        port_name: port_name.to_string(),
        vid: 0x2341,
        pid: 0x0043,
        serial_number: Some("85736323838351F0E1A1".to_string()),
        manufacturer: Some("Arduino (www.arduino.cc)".to_string()),
        product: Some("Arduino Uno".to_string()),
    }
}

/// A descriptor no driver matches.
pub fn unknown_device(port_name: &str) -> SerialDeviceInfo {
    SerialDeviceInfo {
        port_name: port_name.to_string(),
        vid: 0xFFFF,
        pid: 0x0001,
        serial_number: None,
        manufacturer: None,
        product: Some("Mystery Gadget".to_string()),
    }
}
