//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Frame header carried an unknown frame type byte.
    #[error("invalid frame type: 0x{value:02X}")]
    InvalidFrameType {
        /// The offending type byte.
        value: u8,
    },

    /// XOR of the header bytes was non-zero.
    #[error("frame header parity mismatch")]
    ParityMismatch,

    /// Declared payload length exceeds the protocol cap.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Declared payload size in bytes.
        size: u64,
        /// Maximum allowed payload size in bytes.
        max: u32,
    },

    /// A payload field extends past the end of the payload.
    #[error("truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },

    /// Bytes were left over after the last expected field.
    #[error("{count} trailing bytes after payload")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// A length-prefixed string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Initial reply carried a status byte outside the defined set.
    #[error("unknown initial status byte: 0x{value:02X}")]
    UnknownStatus {
        /// The offending status byte.
        value: u8,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
