use crate::error::{Result, UartError};

pub const MAX_BAUD_RATE: u32 = 4_000_000;

/// Line parameters handed to the backend on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: bool,
    pub stop_bits: u8,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: false,
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigParam {
    BaudRate,
    DataBits,
    Parity,
    StopBits,
}

impl std::str::FromStr for ConfigParam {
    type Err = UartError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "baud_rate" | "baud" => Self::BaudRate,
            "data_bits" => Self::DataBits,
            "parity" => Self::Parity,
            "stop_bits" => Self::StopBits,
            _ => return Err(UartError::InvalidArgument(format!("unknown parameter `{s}`"))),
        })
    }
}

impl UartConfig {
    /// Sets one field, rejecting values no UART can be programmed with.
    pub fn set(&mut self, param: ConfigParam, value: i64) -> Result<()> {
        match param {
            ConfigParam::BaudRate => self.baud_rate = ranged(param, value, 1, MAX_BAUD_RATE as i64)? as u32,
            ConfigParam::DataBits => self.data_bits = ranged(param, value, 5, 9)? as u8,
            ConfigParam::Parity => self.parity = value != 0,
            ConfigParam::StopBits => self.stop_bits = ranged(param, value, 1, 2)? as u8,
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut scratch = Self::default();
        scratch.set(ConfigParam::BaudRate, self.baud_rate as i64)?;
        scratch.set(ConfigParam::DataBits, self.data_bits as i64)?;
        scratch.set(ConfigParam::StopBits, self.stop_bits as i64)?;
        Ok(())
    }
}

fn ranged(param: ConfigParam, value: i64, min: i64, max: i64) -> Result<i64> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(UartError::InvalidArgument(format!(
            "{param:?} must be within {min}..={max}, got {value}"
        )))
    }
}
