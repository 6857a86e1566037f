//! Lifecycle of a single open serial connection.
//!
//! One session owns at most one port. Opening closes whatever was open
//! before. A background reader thread streams received text into the
//! connection log until it is told to stop or the port fails. Each write
//! runs on its own short-lived thread. The reader and the writers hold
//! separate handles to the port, each behind its own mutex, so a write never
//! waits out a blocking read and nothing can touch a handle after close has
//! taken it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::decoder::Utf8Decoder;
use super::interface::{DriverKind, PortOpener, SerialPortIO};
use super::{LineSettings, Result, SerialDeviceInfo, SerialError};
use crate::connection_log::{ConnectionLog, LogKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
    /// The port failed while open; the session is closed.
    Lost(String),
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Lost(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub read_buffer_size: usize,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 64,
            read_timeout_ms: 100,
            write_timeout_ms: 1000,
        }
    }
}

impl SessionOptions {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub device: SerialDeviceInfo,
    pub settings: LineSettings,
    pub driver: DriverKind,
}

type PortSlot = Arc<Mutex<Option<Box<dyn SerialPortIO>>>>;

// Only open/close touch this, under its lock.
#[derive(Default)]
struct Control {
    stop: Option<Arc<AtomicBool>>,
    reader: Option<JoinHandle<()>>,
}

impl Control {
    fn stop_reader(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                log::error!("Serial reader thread panicked");
            }
        }
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[derive(Clone)]
pub struct SerialSession {
    opener: Arc<dyn PortOpener>,
    options: SessionOptions,
    log: ConnectionLog,
    control: Arc<Mutex<Control>>,
    port: PortSlot,
    writer: PortSlot,
    active: Arc<Mutex<Option<ActiveSession>>>,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl SerialSession {
    pub fn new(opener: Arc<dyn PortOpener>, options: SessionOptions, log: ConnectionLog) -> Self {
        let (state_tx, _state_rx) = watch::channel(SessionState::Closed);
        Self {
            opener,
            options,
            log,
            control: Arc::new(Mutex::new(Control::default())),
            port: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            active: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn active(&self) -> Option<ActiveSession> {
        lock(&self.active).clone()
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Open `device` with `settings` and start the reader.
    ///
    /// Any session that is already open is closed first. On failure nothing
    /// stays open and the error is also recorded in the connection log.
    pub fn open(&self, device: &SerialDeviceInfo, settings: LineSettings) -> Result<()> {
        let mut control = lock(&self.control);
        if self.state().is_open() {
            self.log.append(LogKind::Lifecycle, "Closing previous session before opening a new one");
        }
        if !self.state().is_closed() || control.reader.is_some() {
            self.close_locked(&mut control);
        }

        let Some(driver) = self.opener.probe(device) else {
            self.log.error(format!("No serial driver found for device {}", device.display_name()));
            return Err(SerialError::UnsupportedDevice(device.port_name.clone()));
        };

        self.state_tx.send_replace(SessionState::Opening);
        log::info!("Opening {} with {:?} driver at {}", device.port_name, driver, settings);

        let port = match self.opener.open(device, &settings) {
            Ok(port) => port,
            Err(e) => {
                self.log.error(format!("Error opening serial port: {}", e));
                self.state_tx.send_replace(SessionState::Closed);
                return Err(e);
            }
        };
        let writer = match port.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                self.log.error(format!("Error opening serial port: {}", e));
                self.state_tx.send_replace(SessionState::Closed);
                return Err(SerialError::IoError(e));
            }
        };
        *lock(&self.port) = Some(port);
        *lock(&self.writer) = Some(writer);

        let stop = Arc::new(AtomicBool::new(false));
        let reader = ReaderContext {
            port: self.port.clone(),
            writer: self.writer.clone(),
            stop: stop.clone(),
            state_tx: self.state_tx.clone(),
            active: self.active.clone(),
            log: self.log.clone(),
            options: self.options,
            port_name: device.port_name.clone(),
        };
        // Mark open before the reader can observe a failure
        *lock(&self.active) = Some(ActiveSession {
            device: device.clone(),
            settings,
            driver,
        });
        self.state_tx.send_replace(SessionState::Open);

        let spawned = thread::Builder::new()
            .name(format!("serial-reader-{}", device.port_name))
            .spawn(move || reader.run());

        match spawned {
            Ok(handle) => {
                control.stop = Some(stop);
                control.reader = Some(handle);
                self.log.append(
                    LogKind::Lifecycle,
                    format!("Serial port opened: {} at {}", device.display_name(), settings),
                );
                Ok(())
            }
            Err(e) => {
                self.log.error(format!("Error starting serial reader: {}", e));
                lock(&self.port).take();
                lock(&self.writer).take();
                lock(&self.active).take();
                self.state_tx.send_replace(SessionState::Closed);
                Err(SerialError::IoError(e))
            }
        }
    }

    /// Close the session. Safe to call at any time, any number of times.
    pub fn close(&self) {
        let mut control = lock(&self.control);
        self.close_locked(&mut control);
    }

    fn close_locked(&self, control: &mut Control) {
        let previous = self.state_tx.send_replace(SessionState::Closing);
        control.stop_reader();

        drop(lock(&self.port).take());
        let writer = lock(&self.writer).take();
        let active = lock(&self.active).take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.flush() {
                log::debug!("Flush on close failed: {}", e);
            }
        }

        match previous {
            // Keep the failure visible
            SessionState::Lost(reason) => {
                self.state_tx.send_replace(SessionState::Lost(reason));
            }
            _ => {
                self.state_tx.send_replace(SessionState::Closed);
            }
        }

        if let Some(active) = active {
            self.log.append(
                LogKind::Lifecycle,
                format!("Serial port closed: {}", active.device.port_name),
            );
        }
    }

    /// Send `data` on a background thread.
    ///
    /// Returns `None` without touching any handle when no session is open.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Option<JoinHandle<Result<usize>>> {
        let data = data.into();
        if !self.is_open() {
            self.log.error(format!("Cannot send {} bytes: no open serial session", data.len()));
            return None;
        }

        self.log.append(LogKind::Sent, String::from_utf8_lossy(&data).into_owned());

        let writer = self.writer.clone();
        let log = self.log.clone();
        let timeout = self.options.write_timeout();
        let spawned = thread::Builder::new()
            .name("serial-writer".to_string())
            .spawn(move || {
                let mut guard = lock(&writer);
                let Some(port) = guard.as_mut() else {
                    log.error("Write skipped: serial session closed");
                    return Err(SerialError::NotConnected);
                };
                let result = port
                    .send_data(&data, timeout)
                    .and_then(|n| port.flush().map(|_| n));
                result.map_err(|e| {
                    log.error(format!("Serial write error: {}", e));
                    SerialError::IoError(e)
                })
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.log.error(format!("Error starting serial writer: {}", e));
                None
            }
        }
    }
}

struct ReaderContext {
    port: PortSlot,
    writer: PortSlot,
    stop: Arc<AtomicBool>,
    state_tx: Arc<watch::Sender<SessionState>>,
    active: Arc<Mutex<Option<ActiveSession>>>,
    log: ConnectionLog,
    options: SessionOptions,
    port_name: String,
}

impl ReaderContext {
    fn run(self) {
        let mut buffer = vec![0u8; self.options.read_buffer_size.max(1)];
        let mut decoder = Utf8Decoder::new();
        let timeout = self.options.read_timeout();
        log::debug!("Serial reader started for {}", self.port_name);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let result = {
                let mut guard = lock(&self.port);
                match guard.as_mut() {
                    Some(port) => port.read_data(&mut buffer, timeout),
                    None => break,
                }
            };

            match result {
                Ok(0) => continue,
                Ok(n) => {
                    log::debug!("rx {} bytes: {}", n, hex::encode(&buffer[..n]));
                    let text = decoder.decode(&buffer[..n]);
                    if !text.is_empty() {
                        self.log.append(LogKind::Received, text);
                    }
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }

        log::debug!("Serial reader stopped for {}", self.port_name);
    }

    fn fail(&self, error: std::io::Error) {
        // A close in progress owns the teardown
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        drop(lock(&self.port).take());
        drop(lock(&self.writer).take());
        lock(&self.active).take();

        let reason = format!("Serial read error: {}", error);
        let lost = self.state_tx.send_if_modified(|state| {
            if state.is_open() {
                *state = SessionState::Lost(reason.clone());
                true
            } else {
                false
            }
        });
        if lost {
            self.log.error(format!("{}; session ended unexpectedly", reason));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::mock::{arduino_uno, unknown_device, MockOpener, MockPort};

    fn session_with(port: &MockPort) -> (SerialSession, ConnectionLog) {
        let log = ConnectionLog::new();
        let opener = Arc::new(MockOpener::new(port.clone()));
        let session = SerialSession::new(opener, SessionOptions::default(), log.clone());
        (session, log)
    }

    #[test]
    fn test_close_without_open_is_noop() {
        let port = MockPort::new();
        let (session, log) = session_with(&port);
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.active().is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn test_unsupported_device_is_reported() {
        let port = MockPort::new();
        let (session, log) = session_with(&port);
        let err = session.open(&unknown_device("/dev/ttyUSB9"), LineSettings::default()).unwrap_err();
        assert!(matches!(err, SerialError::UnsupportedDevice(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(log.contains("No serial driver found"));
        assert_eq!(port.live_transports(), 0);
    }

    #[test]
    fn test_open_then_close_releases_port() {
        let port = MockPort::new();
        let (session, _log) = session_with(&port);
        session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();
        assert!(session.is_open());
        assert_eq!(port.live_transports(), 1);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(port.live_transports(), 0);
    }

    #[test]
    fn test_write_on_closed_session_is_logged_noop() {
        let port = MockPort::new();
        let (session, log) = session_with(&port);
        assert!(session.write("PING").is_none());
        assert!(log.contains("no open serial session"));
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_dropping_last_handle_stops_reader() {
        let port = MockPort::new();
        let (session, _log) = session_with(&port);
        session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();
        drop(session);
        // Reader held the last reference to the port slot
        assert_eq!(port.live_transports(), 0);
    }
}
