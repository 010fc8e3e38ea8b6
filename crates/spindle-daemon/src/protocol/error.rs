//! Protocol error types.

use thiserror::Error;

/// Default maximum frame header length (64 KiB).
///
/// The header length field is a `u16`, so the wire format itself cannot
/// exceed this; the constant exists so deployments can configure a lower
/// cap.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Default maximum frame body length (8 MiB).
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced by the framing codec and message parsing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame header did not parse as a valid JSON header.
    #[error("malformed frame header: {0}")]
    BadHeader(String),

    /// The header length prefix exceeds the configured cap.
    #[error("frame header too large: {size} bytes exceeds limit {max}")]
    HeaderTooLarge {
        /// Declared header size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// The body length declared in the header exceeds the configured cap.
    #[error("frame body too large: {size} bytes exceeds limit {max}")]
    BodyTooLarge {
        /// Declared body size.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// A message type byte outside the known range.
    #[error("unsupported message type: {0}")]
    UnknownType(u8),

    /// A JSON body did not parse as the expected shape.
    #[error("malformed message body: {0}")]
    BadBody(String),

    /// Underlying stream failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
