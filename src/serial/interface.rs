use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};

use super::{LineSettings, Result, SerialDeviceInfo, SerialError};

/// USB-serial driver families the prober recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverKind {
    CdcAcm,
    Ftdi,
    Cp21xx,
    Ch34x,
    Prolific,
}

// Vendor IDs with a known driver. CDC-ACM vendors are board makers whose
// boards enumerate as plain ACM devices.
static KNOWN_VENDORS: Lazy<HashMap<u16, DriverKind>> = Lazy::new(|| {
    HashMap::from([
        (0x2341, DriverKind::CdcAcm), // Arduino
        (0x2A03, DriverKind::CdcAcm), // Arduino (.org)
        (0x239A, DriverKind::CdcAcm), // Adafruit
        (0x1B4F, DriverKind::CdcAcm), // SparkFun
        (0x2E8A, DriverKind::CdcAcm), // Raspberry Pi (RP2040)
        (0x16C0, DriverKind::CdcAcm), // Teensy
        (0x303A, DriverKind::CdcAcm), // Espressif native USB
        (0x0403, DriverKind::Ftdi),
        (0x10C4, DriverKind::Cp21xx),
        (0x1A86, DriverKind::Ch34x),
        (0x067B, DriverKind::Prolific),
    ])
});

/// Byte-level access to an open serial port.
///
/// Reads are bounded by `timeout`; a timeout with no data is `Ok(0)`, not an error.
pub trait SerialPortIO: Send {
    fn read_data(&mut self, buffer: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    fn send_data(&mut self, data: &[u8], timeout: Duration) -> std::io::Result<usize>;

    fn flush(&mut self) -> std::io::Result<()>;

    /// Second handle to the same port, so writes never wait on a blocking read.
    fn try_clone(&self) -> std::io::Result<Box<dyn SerialPortIO>>;
}

/// Probes devices for a driver and opens their first port.
pub trait PortOpener: Send + Sync {
    fn probe(&self, device: &SerialDeviceInfo) -> Option<DriverKind>;

    fn open(&self, device: &SerialDeviceInfo, settings: &LineSettings) -> Result<Box<dyn SerialPortIO>>;
}

/// `SerialPortIO` over a real port from the `serialport` crate.
pub struct SystemSerialPort {
    port: Box<dyn SerialPort>,
    current_timeout: Duration,
}

impl SystemSerialPort {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        let current_timeout = port.timeout();
        Self { port, current_timeout }
    }

    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        if self.current_timeout != timeout {
            self.port.set_timeout(timeout).map_err(std::io::Error::from)?;
            self.current_timeout = timeout;
        }
        Ok(())
    }
}

impl SerialPortIO for SystemSerialPort {
    fn read_data(&mut self, buffer: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.set_timeout(timeout)?;
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn send_data(&mut self, data: &[u8], timeout: Duration) -> std::io::Result<usize> {
        self.set_timeout(timeout)?;
        self.port.write_all(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }

    fn try_clone(&self) -> std::io::Result<Box<dyn SerialPortIO>> {
        let port = self.port.try_clone().map_err(std::io::Error::from)?;
        Ok(Box::new(SystemSerialPort::new(port)))
    }
}

/// System-facing side of the serial layer: enumeration, probing and opening.
#[derive(Debug, Clone, Default)]
pub struct SerialInterface;

impl SerialInterface {
    pub fn new() -> Self {
        Self
    }

    /// List every attached USB serial port, supported or not
    pub fn discover_devices() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                devices.push(SerialDeviceInfo {
                    port_name: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                    product: usb_info.product.clone(),
                });
            }
        }

        devices.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        log::debug!("Discovered {} USB serial ports", devices.len());
        Ok(devices)
    }

    /// First port belonging to the same physical device, by port name.
    pub fn first_port_of(device: &SerialDeviceInfo) -> Result<String> {
        let mut candidates: Vec<String> = Self::discover_devices()?
            .into_iter()
            .filter(|d| d.same_device(device))
            .map(|d| d.port_name)
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| SerialError::PortNotFound(device.port_name.clone()))
    }
}

pub fn probe_driver(device: &SerialDeviceInfo) -> Option<DriverKind> {
    if let Some(kind) = KNOWN_VENDORS.get(&device.vid) {
        return Some(*kind);
    }
    // Unknown vendor that still enumerated as an ACM node
    if device.port_name.contains("ttyACM") || device.port_name.contains("cu.usbmodem") {
        return Some(DriverKind::CdcAcm);
    }
    None
}

impl PortOpener for SerialInterface {
    fn probe(&self, device: &SerialDeviceInfo) -> Option<DriverKind> {
        probe_driver(device)
    }

    fn open(&self, device: &SerialDeviceInfo, settings: &LineSettings) -> Result<Box<dyn SerialPortIO>> {
        settings.validate()?;
        let port_name = Self::first_port_of(device)?;

        let port = serialport::new(&port_name, settings.baud_rate)
            .data_bits(settings.serial_data_bits()?)
            .stop_bits(settings.serial_stop_bits()?)
            .parity(settings.serial_parity())
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        log::info!("Opened {} at {}", port_name, settings);
        Ok(Box::new(SystemSerialPort::new(port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(port_name: &str, vid: u16) -> SerialDeviceInfo {
        SerialDeviceInfo {
            port_name: port_name.to_string(),
            vid,
            pid: 0x0043,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    #[test]
    fn test_probe_known_vendors() {
        assert_eq!(probe_driver(&device("/dev/ttyUSB0", 0x0403)), Some(DriverKind::Ftdi));
        assert_eq!(probe_driver(&device("/dev/ttyUSB0", 0x1A86)), Some(DriverKind::Ch34x));
        assert_eq!(probe_driver(&device("COM3", 0x2341)), Some(DriverKind::CdcAcm));
    }

    #[test]
    fn test_probe_acm_fallback_and_unsupported() {
        assert_eq!(probe_driver(&device("/dev/ttyACM2", 0xBEEF)), Some(DriverKind::CdcAcm));
        assert_eq!(probe_driver(&device("/dev/ttyUSB3", 0xBEEF)), None);
    }
}
