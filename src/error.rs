//! Library error type.
//!
//! Transport failures never show up here: they travel as
//! [`TransportEvent`](crate::infrastructure::transport::TransportEvent)s and
//! surface as connection status changes.

use crate::infrastructure::transport::TransportKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No bridge has been registered for the requested transport.
    #[error("no transport provider registered for {0:?}")]
    TransportUnavailable(TransportKind),

    /// A raw capability id that does not name any known sensor, gesture or
    /// interval. Always a bug on the producing side.
    #[error("invalid {kind} id: {value}")]
    InvalidId { kind: &'static str, value: u8 },

    #[error("no device is connected")]
    NotConnected,

    #[error("no last-connected device has been recorded")]
    NoLastDevice,

    #[error("device store I/O failed: {0}")]
    Store(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
