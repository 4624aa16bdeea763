//!A mod for the link error type

use std::fmt::{Debug, Formatter};

///Any transport-level failure on the finish line connection. The link is
///always left Disconnected when one of these is returned; the caller must
///re-run discovery before continuing.
pub struct LinkError {
    pub message: String,
}

impl Debug for LinkError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        fmt.write_fmt(format_args!("LinkError: {}", self.message))
    }
}

impl From<&str> for LinkError {
    fn from(s: &str) -> Self {
        Self {
            message: s.to_string(),
        }
    }
}

impl From<String> for LinkError {
    fn from(s: String) -> Self {
        Self { message: s }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: format!("finish line transport error: {}", err),
        }
    }
}
