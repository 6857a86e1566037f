use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, StopBits};

use super::{Result, SerialError};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Line parameters applied when a port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParitySetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParitySetting {
    None,
    Odd,
    Even,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: ParitySetting::None,
        }
    }
}

impl LineSettings {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Parse a user-entered baud rate, e.g. from a text field.
    pub fn parse_baud_rate(input: &str) -> Result<u32> {
        let trimmed = input.trim();
        match trimmed.parse::<u32>() {
            Ok(0) | Err(_) => Err(SerialError::ConnectionFailed(format!(
                "Invalid baud rate: {:?}",
                trimmed
            ))),
            Ok(rate) => Ok(rate),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(SerialError::ConnectionFailed("Baud rate must be positive".to_string()));
        }
        self.serial_data_bits()?;
        self.serial_stop_bits()?;
        Ok(())
    }

    pub fn serial_data_bits(&self) -> Result<DataBits> {
        match self.data_bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(SerialError::ConnectionFailed(format!("Unsupported data bits: {}", other))),
        }
    }

    pub fn serial_stop_bits(&self) -> Result<StopBits> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(SerialError::ConnectionFailed(format!("Unsupported stop bits: {}", other))),
        }
    }

    pub fn serial_parity(&self) -> Parity {
        match self.parity {
            ParitySetting::None => Parity::None,
            ParitySetting::Odd => Parity::Odd,
            ParitySetting::Even => Parity::Even,
        }
    }
}

impl std::fmt::Display for LineSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            ParitySetting::None => 'N',
            ParitySetting::Odd => 'O',
            ParitySetting::Even => 'E',
        };
        write!(f, "{} {}{}{}", self.baud_rate, self.data_bits, parity, self.stop_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_115200_8n1() {
        let settings = LineSettings::default();
        assert_eq!(settings.to_string(), "115200 8N1");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse_baud_rate() {
        assert_eq!(LineSettings::parse_baud_rate(" 9600 ").unwrap(), 9600);
        assert!(LineSettings::parse_baud_rate("").is_err());
        assert!(LineSettings::parse_baud_rate("0").is_err());
        assert!(LineSettings::parse_baud_rate("fast").is_err());
    }

    #[test]
    fn test_rejects_bad_framing() {
        let settings = LineSettings { data_bits: 9, ..Default::default() };
        assert!(settings.validate().is_err());
        let settings = LineSettings { stop_bits: 3, ..Default::default() };
        assert!(settings.validate().is_err());
    }
}
