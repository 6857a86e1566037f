use super::{MonitorError, PortEvent, PortEventDebouncer, PortMonitor};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct LinuxPortMonitor {
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<tokio::task::JoinHandle<Result<(), String>>>,
}

impl LinuxPortMonitor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);

        Self {
            tx: Some(tx),
            rx: Some(rx),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Full device path for USB serial tty nodes, e.g. "/dev/ttyACM0"
    fn extract_port_name(device: &libudev::Device) -> Option<String> {
        if let Some(path_str) = device.devnode().and_then(|p| p.to_str()) {
            if path_str.contains("/dev/ttyUSB") || path_str.contains("/dev/ttyACM") {
                return Some(path_str.to_string());
            }
        }

        let sysname = device.sysname()?.to_str()?;
        if sysname.starts_with("ttyUSB") || sysname.starts_with("ttyACM") {
            return Some(format!("/dev/{}", sysname));
        }

        None
    }

    fn watch(tx: mpsc::Sender<PortEvent>, running: Arc<AtomicBool>) -> Result<(), String> {
        let context = libudev::Context::new().map_err(|e| e.to_string())?;
        let mut monitor = libudev::Monitor::new(&context).map_err(|e| e.to_string())?;
        monitor.match_subsystem("tty").map_err(|e| e.to_string())?;
        let mut socket = monitor.listen().map_err(|e| e.to_string())?;

        let mut debouncer = PortEventDebouncer::new(100);

        while running.load(Ordering::SeqCst) {
            let Some(event) = socket.receive_event() else {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            };

            let Some(port_name) = Self::extract_port_name(event.device()) else {
                continue;
            };
            let port_event = match event.event_type() {
                libudev::EventType::Add => PortEvent::PortAdded(port_name),
                libudev::EventType::Remove => PortEvent::PortRemoved(port_name),
                _ => continue,
            };

            if debouncer.should_emit(&port_event) && tx.blocking_send(port_event).is_err() {
                break;
            }
        }

        log::info!("Linux port monitor stopping");
        Ok(())
    }
}

impl Default for LinuxPortMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortMonitor for LinuxPortMonitor {
    async fn start(&mut self) -> Result<(), MonitorError> {
        let tx = self.tx.take().ok_or("Already started")?;
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = tokio::task::spawn_blocking(move || Self::watch(tx, running));

        self.thread_handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), MonitorError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            handle.await??;
        }

        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}
