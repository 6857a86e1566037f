use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

/// Events emitted by the port monitor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortEvent {
    /// A serial port was added
    PortAdded(String),
    /// A serial port was removed
    PortRemoved(String),
}

impl PortEvent {
    pub fn port_name(&self) -> &str {
        match self {
            PortEvent::PortAdded(name) | PortEvent::PortRemoved(name) => name,
        }
    }
}

pub type MonitorError = Box<dyn std::error::Error + Send + Sync>;

/// Platform-agnostic trait for monitoring serial port changes
#[async_trait::async_trait]
pub trait PortMonitor: Send + Sync {
    /// Start monitoring for port changes
    async fn start(&mut self) -> Result<(), MonitorError>;

    /// Stop monitoring
    async fn stop(&mut self) -> Result<(), MonitorError>;

    /// Get receiver for port events
    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

/// Drops repeats of the same event for the same port inside the window.
pub struct PortEventDebouncer {
    last_seen: HashMap<PortEvent, Instant>,
    debounce_duration: Duration,
}

impl PortEventDebouncer {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            last_seen: HashMap::new(),
            debounce_duration: Duration::from_millis(debounce_ms),
        }
    }

    pub fn should_emit(&mut self, event: &PortEvent) -> bool {
        self.should_emit_at(event, Instant::now())
    }

    fn should_emit_at(&mut self, event: &PortEvent, now: Instant) -> bool {
        match self.last_seen.get(event) {
            Some(last) if now.duration_since(*last) < self.debounce_duration => {
                log::debug!("Port event debounced: {:?}", event);
                false
            }
            _ => {
                self.last_seen.insert(event.clone(), now);
                true
            }
        }
    }
}

pub fn diff_ports(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Vec<PortEvent> {
    let removed = previous
        .difference(current)
        .map(|name| PortEvent::PortRemoved(name.clone()));
    let added = current
        .difference(previous)
        .map(|name| PortEvent::PortAdded(name.clone()));
    removed.chain(added).collect()
}

type PortLister = Arc<dyn Fn() -> Option<BTreeSet<String>> + Send + Sync>;

/// Portable monitor: re-enumerates ports on an interval and reports the difference.
pub struct PollingPortMonitor {
    interval: Duration,
    lister: PortLister,
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    running: Arc<AtomicBool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(interval: Duration) -> Self {
        Self::with_lister(interval, Arc::new(system_port_names))
    }

    pub fn with_lister(interval: Duration, lister: PortLister) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            interval,
            lister,
            tx: Some(tx),
            rx: Some(rx),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }
}

fn system_port_names() -> Option<BTreeSet<String>> {
    match serialport::available_ports() {
        Ok(ports) => Some(ports.into_iter().map(|p| p.port_name).collect()),
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            None
        }
    }
}

#[async_trait::async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> Result<(), MonitorError> {
        let tx = self.tx.take().ok_or("Already started")?;
        let lister = self.lister.clone();
        let interval = self.interval;
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut known = match tokio::task::spawn_blocking({
                let lister = lister.clone();
                move || lister()
            })
            .await
            {
                Ok(Some(ports)) => ports,
                _ => BTreeSet::new(),
            };
            let mut ticker = tokio::time::interval(interval);

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let lister = lister.clone();
                let Ok(Some(current)) = tokio::task::spawn_blocking(move || lister()).await else {
                    continue;
                };
                for event in diff_ports(&known, &current) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                known = current;
            }
            log::info!("Polling port monitor stopped");
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), MonitorError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxPortMonitor;

/// Create a platform-specific port monitor
pub fn create_port_monitor(poll_interval: Duration) -> Box<dyn PortMonitor> {
    #[cfg(target_os = "linux")]
    {
        let _ = poll_interval;
        Box::new(LinuxPortMonitor::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Box::new(PollingPortMonitor::new(poll_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_reports_removed_and_added() {
        let events = diff_ports(&set(&["/dev/ttyACM0", "/dev/ttyUSB0"]), &set(&["/dev/ttyUSB0", "/dev/ttyUSB1"]));
        assert_eq!(
            events,
            vec![
                PortEvent::PortRemoved("/dev/ttyACM0".into()),
                PortEvent::PortAdded("/dev/ttyUSB1".into()),
            ]
        );
        assert!(diff_ports(&set(&["a"]), &set(&["a"])).is_empty());
    }

    #[test]
    fn test_debouncer_drops_repeats_only() {
        let mut debouncer = PortEventDebouncer::new(100);
        let start = Instant::now();
        let removed = PortEvent::PortRemoved("/dev/ttyACM0".into());
        let added = PortEvent::PortAdded("/dev/ttyACM0".into());

        assert!(debouncer.should_emit_at(&removed, start));
        assert!(!debouncer.should_emit_at(&removed, start + Duration::from_millis(10)));
        // a different event for the same port still goes through
        assert!(debouncer.should_emit_at(&added, start + Duration::from_millis(20)));
        assert!(debouncer.should_emit_at(&removed, start + Duration::from_millis(150)));
    }

    #[tokio::test]
    async fn test_polling_monitor_reports_removal() {
        let ports = Arc::new(Mutex::new(set(&["/dev/ttyACM0"])));
        let source = ports.clone();
        let lister: PortLister = Arc::new(move || Some(source.lock().unwrap().clone()));

        let mut monitor = PollingPortMonitor::with_lister(Duration::from_millis(10), lister);
        let mut rx = monitor.get_receiver().unwrap();
        monitor.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        ports.lock().unwrap().clear();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(event, Some(PortEvent::PortRemoved("/dev/ttyACM0".into())));
        monitor.stop().await.unwrap();
    }
}
