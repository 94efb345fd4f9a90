//! Library error type.

use std::io;

/// Errors surfaced by the courier API.
///
/// Protocol-level problems (malformed datagrams, reserved type codes,
/// out-of-window sequences) never reach the application through this type;
/// they are logged, counted, and dropped inside the network loop.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// Operation attempted on a peer that is not in the required state
    /// (e.g. sending through a peer that is shutting down).
    #[error("invalid peer state: {0}")]
    InvalidState(&'static str),

    /// Read past the end of a bit buffer.
    #[error("read past end of buffer: wanted {wanted} bits, {available} available")]
    OutOfRange {
        /// Bits requested.
        wanted: usize,
        /// Bits remaining before the end of the buffer.
        available: usize,
    },

    /// Datagram or message body failed to decode.
    #[error("malformed data: {0}")]
    Malformed(&'static str),

    /// Sequence channel id outside the supported range.
    #[error("sequence channel {0} out of range")]
    ChannelRange(u8),

    /// The received-message queue or a send intake is full.
    #[error("queue full")]
    QueueFull,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Socket-level failure while starting or rebinding the peer.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CourierError>;
