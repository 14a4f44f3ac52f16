//! Codec error types

use thiserror::Error;

use super::MessageType;

/// Errors surfaced by readers, writers, sources, sinks, and the allocator.
#[derive(Error, Debug)]
pub enum Error {
    /// The source reached end of input before the required bytes
    #[error("unexpected end of input ({needed} more bytes required)")]
    EndOfInput {
        /// Bytes still required when the channel ran dry
        needed: usize,
    },

    /// A typed read does not match the next value on the wire
    #[error("type mismatch: expected {expected}, found format byte {format:#04x}")]
    TypeMismatch {
        /// Type the caller asked for
        expected: MessageType,
        /// Format byte actually present
        format: u8,
    },

    /// Well-formed format byte but semantically invalid payload
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// An integer on the wire does not fit the requested width
    #[error("integer {value} does not fit the requested width")]
    IntegerOverflow {
        /// The decoded wire value
        value: i128,
    },

    /// Malformed UTF-8 during string decode
    #[error("invalid UTF-8 at byte offset {offset}")]
    InvalidUtf8 {
        /// Offset of the first invalid byte within the string payload
        offset: usize,
    },

    /// A request exceeded the internal buffer capacity
    #[error("buffer too small: need {needed} bytes, capacity {capacity}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Buffer capacity available
        capacity: usize,
    },

    /// An acquire exceeded the allocator's per-buffer capacity cap
    #[error("requested buffer capacity {requested} exceeds maximum {max}")]
    CapacityExceeded {
        /// Capacity requested
        requested: usize,
        /// Configured maximum
        max: usize,
    },

    /// Acquire after the allocator was closed
    #[error("buffer allocator is closed")]
    AllocatorClosed,

    /// A channel performed a zero-byte transfer on a non-empty request
    #[error("non-blocking channel detected (zero-byte transfer)")]
    NonBlockingChannel,

    /// Underlying channel failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
