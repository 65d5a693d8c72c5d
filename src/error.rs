//! Error types shared across the driver.
//!
//! Local, recoverable conditions (protocol noise, frame gaps, malformed raw
//! frames) never surface here; they are absorbed where they are detected and
//! reported as [`crate::types::StreamError`] events instead.

use std::time::Duration;

use crate::types::ConnectionState;

/// Failure reported by a [`crate::transport::Transport`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link dropped while an operation was outstanding.
    #[error("link lost")]
    LinkLost,

    /// No device matched, or the addressed device is no longer known.
    #[error("device not found: {0}")]
    NotFound(String),

    /// A required service or characteristic is missing on the device.
    #[error("attribute not available: {0}")]
    MissingAttribute(String),

    /// The device or the radio stack refused the operation.
    #[error("operation rejected: {0}")]
    Rejected(String),

    /// The transport cannot express this operation at all.
    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),

    /// Anything else coming from the underlying stack.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => TransportError::NotFound("peripheral".into()),
            btleplug::Error::NotConnected => TransportError::LinkLost,
            btleplug::Error::NotSupported(_) => TransportError::Unsupported("btleplug"),
            other => TransportError::Other(anyhow::Error::new(other)),
        }
    }
}

/// Mailbox decoding error.  Only empty input is rejected; every non-empty
/// buffer decodes to some [`crate::mailbox::MailboxResponse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("invalid mailbox frame: {0}")]
    InvalidFrame(&'static str),
}

/// Errors surfaced to callers of [`crate::driver::Driver`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The request needs an established link but the session is elsewhere.
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Mailbox-level error.
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    /// A connection step did not complete within its budget.
    #[error("step {step} timed out after {after:?}")]
    StepTimeout { step: ConnectionState, after: Duration },

    /// The session was interrupted while the request was in flight.
    #[error("interrupted")]
    Interrupted,

    /// The device answered with something other than what the step expected.
    #[error("unexpected device response: {0}")]
    UnexpectedResponse(String),

    /// The device is already linked to a different host session target.
    #[error("another device is already connected: {0}")]
    AnotherDeviceConnected(String),

    /// The request worker has shut down.
    #[error("request queue closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DriverError>;
