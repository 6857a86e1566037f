use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arduino_buddy_lib::connection_log::{ConnectionLog, LogKind};
use arduino_buddy_lib::serial::mock::{arduino_uno, MockOpener, MockPort};
use arduino_buddy_lib::serial::{LineSettings, SerialError, SerialSession, SessionOptions, SessionState};

fn session_with(port: &MockPort) -> (SerialSession, Arc<MockOpener>, ConnectionLog) {
    let log = ConnectionLog::new();
    let opener = Arc::new(MockOpener::new(port.clone()));
    let session = SerialSession::new(opener.clone(), SessionOptions::default(), log.clone());
    (session, opener, log)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_received_text_logged_exactly_once() {
    let port = MockPort::new();
    let (session, opener, log) = session_with(&port);

    session
        .open(&arduino_uno("/dev/ttyACM0"), LineSettings::default().with_baud_rate(9600))
        .unwrap();
    let settings = opener.last_settings().unwrap();
    assert_eq!(settings.baud_rate, 9600);
    assert_eq!(settings.to_string(), "9600 8N1");
    assert!(log.contains("Serial port opened: /dev/ttyACM0 (Arduino Uno) at 9600 8N1"));

    port.inject(b"OK\n");
    assert!(wait_until(|| log.received_text() == "OK\n"));

    // Let the reader go around a few more times
    thread::sleep(Duration::from_millis(300));
    assert_eq!(log.received_text(), "OK\n");
    assert_eq!(log.entries_of(LogKind::Received).len(), 1);

    session.close();
}

#[test]
fn test_multibyte_character_split_across_reads() {
    let port = MockPort::new();
    let (session, _opener, log) = session_with(&port);
    session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();

    port.inject(&[0xC3]);
    assert!(wait_until(|| port.read_calls() >= 2));
    port.inject(&[0xA9, b'\n']);

    assert!(wait_until(|| log.received_text() == "é\n"));
    assert!(!log.received_text().contains('\u{FFFD}'));
    session.close();
}

#[test]
fn test_reopen_keeps_a_single_port_open() {
    let port = MockPort::new();
    let (session, opener, log) = session_with(&port);
    let device = arduino_uno("/dev/ttyACM0");

    session.open(&device, LineSettings::default()).unwrap();
    session.close();
    assert_eq!(port.live_transports(), 0);

    session.open(&device, LineSettings::default()).unwrap();
    assert_eq!(port.live_transports(), 1);
    assert_eq!(opener.open_count(), 2);

    session.close();
    session.close();
    assert_eq!(port.live_transports(), 0);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        log.entries()
            .iter()
            .filter(|e| e.message.starts_with("Serial port closed"))
            .count(),
        2
    );
}

#[test]
fn test_open_while_open_closes_previous() {
    let port = MockPort::new();
    let (session, _opener, log) = session_with(&port);

    session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();
    session.open(&arduino_uno("/dev/ttyACM1"), LineSettings::default()).unwrap();

    assert!(log.contains("Closing previous session before opening a new one"));
    assert!(log.contains("Serial port closed: /dev/ttyACM0"));
    assert_eq!(port.live_transports(), 1);
    assert_eq!(session.active().unwrap().device.port_name, "/dev/ttyACM1");
    session.close();
}

#[test]
fn test_open_failure_leaves_nothing_open() {
    let port = MockPort::new();
    let (session, opener, log) = session_with(&port);
    opener.fail_open(true);

    let err = session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap_err();
    assert!(matches!(err, SerialError::ConnectionFailed(_)));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.active().is_none());
    assert_eq!(port.live_transports(), 0);
    assert!(log.contains("Error opening serial port"));
}

#[test]
fn test_write_reaches_the_port() {
    let port = MockPort::new();
    let (session, _opener, log) = session_with(&port);
    session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();

    let handle = session.write("hello\n").unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), 6);
    assert_eq!(port.written(), b"hello\n");
    assert_eq!(log.entries_of(LogKind::Sent).len(), 1);
    session.close();
}

#[test]
fn test_write_on_closed_session_does_nothing() {
    let port = MockPort::new();
    let (session, _opener, log) = session_with(&port);

    assert!(session.write("hello").is_none());
    assert!(port.written().is_empty());
    assert!(log.contains("no open serial session"));
}

#[test]
fn test_write_failure_does_not_stop_reader() {
    let port = MockPort::new();
    let (session, _opener, log) = session_with(&port);
    session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();

    port.fail_writes();
    let result = session.write("ping").unwrap().join().unwrap();
    assert!(result.is_err());
    assert!(log.contains("Serial write error"));
    assert!(session.is_open());

    port.inject(b"still here");
    assert!(wait_until(|| log.received_text() == "still here"));
    session.close();
}

#[test]
fn test_read_failure_ends_session_visibly() {
    let port = MockPort::new();
    let (session, _opener, log) = session_with(&port);
    session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();

    port.fail_reads();
    assert!(wait_until(|| matches!(session.state(), SessionState::Lost(_))));
    assert!(wait_until(|| port.live_transports() == 0));
    assert!(session.active().is_none());
    assert!(log.contains("session ended unexpectedly"));

    // The failure stays visible until the next open
    session.close();
    assert!(matches!(session.state(), SessionState::Lost(_)));
    assert!(session.write("late").is_none());
}

#[test]
fn test_close_stops_reading_promptly() {
    let port = MockPort::new();
    let (session, _opener, _log) = session_with(&port);
    session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();
    assert!(wait_until(|| port.read_calls() >= 1));

    let started = Instant::now();
    session.close();
    assert!(started.elapsed() < Duration::from_secs(1));

    let reads = port.read_calls();
    thread::sleep(Duration::from_millis(250));
    assert_eq!(port.read_calls(), reads);
}

#[test]
fn test_writes_do_not_wait_for_the_reader() {
    let port = MockPort::new();
    let (session, _opener, _log) = session_with(&port);
    session.open(&arduino_uno("/dev/ttyACM0"), LineSettings::default()).unwrap();
    assert!(wait_until(|| port.read_calls() >= 1));

    let started = Instant::now();
    let mut slowest = Duration::ZERO;
    for _ in 0..20 {
        let write_started = Instant::now();
        session.write("x").unwrap().join().unwrap().unwrap();
        slowest = slowest.max(write_started.elapsed());
    }

    // The idle reader blocks for a full read timeout on every pass
    assert!(slowest < session.options().read_timeout(), "slowest write took {:?}", slowest);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(port.written(), b"xxxxxxxxxxxxxxxxxxxx");
    assert_eq!(port.live_transports(), 1);
    session.close();
    assert_eq!(port.live_transports(), 0);
}
