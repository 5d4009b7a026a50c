//! Error types for the relay
//!
//! `Error` is the crate-wide error; module-local errors (`SegmentError`,
//! `RegistryError`) convert into it.

use std::io;

use thiserror::Error;

use crate::registry::RegistryError;
use crate::stream::SegmentError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by relay operations
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or sink I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Upstream HTTP client failure (connect, transfer, redirect)
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a non-success status
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    /// Upstream cannot serve the requested resume offset
    #[error("upstream cannot resume at byte {0}")]
    RangeNotSatisfiable(u64),

    /// Upstream origin URL could not be built
    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),

    /// Registry operation failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Segment write failed
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// The downstream listener went away
    #[error("listener disconnected")]
    SinkClosed,
}

impl Error {
    /// Whether this error means the downstream side is gone
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::SinkClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
