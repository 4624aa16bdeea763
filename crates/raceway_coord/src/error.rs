//!A mod for the coordinator error type

use std::fmt::{Debug, Formatter};

///Errors from the race coordinator protocol. `Aborted` is the user backing
///out of a blocked call and is not a failure; anything else is fatal to the
///current multi-track race attempt.
pub enum CoordError {
    Aborted,
    Failed(String),
}

impl CoordError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, CoordError::Aborted)
    }
}

impl Debug for CoordError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Aborted => fmt.write_str("CoordError: aborted by user"),
            Self::Failed(message) => fmt.write_fmt(format_args!("CoordError: {}", message)),
        }
    }
}

impl From<String> for CoordError {
    fn from(s: String) -> Self {
        Self::Failed(s)
    }
}

impl From<reqwest::Error> for CoordError {
    fn from(err: reqwest::Error) -> Self {
        Self::Failed(format!("coordinator request failed: {}", err))
    }
}
