//!A mod for the gpio error type

use std::fmt::{Debug, Formatter};

use raceway_core::error::ConfigError;

pub struct GpioError {
    pub message: String,
}

impl Debug for GpioError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.message)
    }
}

impl From<&str> for GpioError {
    fn from(s: &str) -> Self {
        Self {
            message: s.to_string(),
        }
    }
}

impl From<String> for GpioError {
    fn from(s: String) -> Self {
        Self { message: s }
    }
}

impl From<rppal::gpio::Error> for GpioError {
    fn from(err: rppal::gpio::Error) -> Self {
        Self {
            message: format!("gpio init failed: {}", err),
        }
    }
}

impl From<GpioError> for ConfigError {
    fn from(err: GpioError) -> Self {
        ConfigError::from(err.message)
    }
}
