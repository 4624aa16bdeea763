//!A mod for the core error type

use std::fmt::{Debug, Formatter};

///Common error type for configuration and wiring problems detected before a
///race can start.
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn message(msg: &str) -> Self {
        Self {
            message: msg.to_string(),
        }
    }
}

impl Debug for ConfigError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        fmt.write_fmt(format_args!("ConfigError: {}", self.message))
    }
}

impl From<&str> for ConfigError {
    fn from(s: &str) -> Self {
        Self {
            message: s.to_string(),
        }
    }
}

impl From<String> for ConfigError {
    fn from(s: String) -> Self {
        Self { message: s }
    }
}
