/// Cirrus Error Types
///
/// Error taxonomy shared by the publish and receive pipelines.
///
/// Per-event failures are recorded on the event record itself and surfaced
/// through the status-change callback; they are never panicked across the
/// API boundary. Inbound decode/match failures are logged and the request
/// is dropped.

use thiserror::Error;

/// Main error type for cirrus operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Bad caller input (local, non-fatal)
    #[error("Invalid argument")]
    InvalidArgument,

    /// Allocation or buffer-creation failure
    #[error("Out of memory")]
    NoMemory,

    /// Rate limiter saturated; the event stays well-formed and retriable
    #[error("Limit for event data in flight is reached")]
    LimitExceeded,

    /// Payload exceeds the protocol payload capacity
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Encoded message exceeds the message buffer capacity
    #[error("Insufficient storage for encoded message")]
    InsufficientStorage,

    /// Operation attempted on an event that is being sent
    #[error("Event is busy")]
    Busy,

    /// Operation attempted on a non-writable, non-sending event
    #[error("Invalid event state")]
    InvalidState,

    /// Undecodable inbound message
    #[error("Malformed message")]
    MalformedMessage,

    /// Structurally invalid inbound request
    #[error("Bad request data")]
    BadData,

    /// User-initiated cancellation
    #[error("Cancelled")]
    Cancelled,

    /// Sequential read reached the end of the payload
    #[error("End of stream")]
    EndOfStream,

    /// File I/O failure during load/save
    #[error("File error: {0}")]
    Io(String),

    /// Structured encode/decode failure; terminal for the event record
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Transport layer failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Should-not-happen encode failures
    #[error("Internal error")]
    Internal,
}

/// Result type alias for cirrus operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a file I/O error from an `io::Error`
    pub fn io(err: &std::io::Error) -> Self {
        Self::Io(err.to_string())
    }

    /// Create a transport error with a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether a failed event may be corrected and republished.
    ///
    /// Recoverable errors leave the record in FAILED; everything else that
    /// touches the payload drives it to the terminal INVALID state.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::LimitExceeded
                | Self::PayloadTooLarge { .. }
                | Self::InsufficientStorage
                | Self::Io(_)
                | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Error::LimitExceeded.is_recoverable());
        assert!(Error::PayloadTooLarge { size: 1, max: 0 }.is_recoverable());
        assert!(Error::Io("gone".into()).is_recoverable());
        assert!(!Error::Encoding("bad".into()).is_recoverable());
        assert!(!Error::NoMemory.is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }
}
