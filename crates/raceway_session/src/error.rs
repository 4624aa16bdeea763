//!A mod for the session error type

use std::fmt::{Debug, Formatter};

use raceway_coord::error::CoordError;
use raceway_link::error::LinkError;

///Everything that can end a race attempt early. `Aborted` is the user
///backing out and is not a failure. A `Link` error abandons the attempt and
///forces a fresh finish line connection before the next one. A
///`Coordinator` error is fatal for the multi-track attempt; the session
///does not silently degrade to single-track.
pub enum RaceError {
    Aborted,
    Link(LinkError),
    Coordinator(CoordError),
}

impl RaceError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, RaceError::Aborted)
    }
}

impl Debug for RaceError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Aborted => fmt.write_str("RaceError: aborted by user"),
            Self::Link(err) => fmt.write_fmt(format_args!("RaceError: {:?}", err)),
            Self::Coordinator(err) => fmt.write_fmt(format_args!("RaceError: {:?}", err)),
        }
    }
}

impl From<LinkError> for RaceError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

impl From<CoordError> for RaceError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::Aborted => Self::Aborted,
            other => Self::Coordinator(other),
        }
    }
}
