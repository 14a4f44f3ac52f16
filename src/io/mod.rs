//! Buffered endpoints and buffer allocation
//!
//! A [`MessageSource`] and [`MessageSink`] wrap a blocking channel with an
//! internal buffer leased from a [`BufferAllocator`]. The codec layer calls
//! their ensure-remaining preconditions before every primitive operation.

mod allocator;
mod sink;
mod source;

pub use allocator::{AllocatorOptions, AllocatorStats, Buffer, BufferAllocator, TextBuffer};
pub use sink::MessageSink;
pub use source::MessageSource;

/// Default internal buffer capacity for sources and sinks.
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Smallest usable buffer: a format byte plus an 8-byte payload.
pub const MIN_BUFFER_CAPACITY: usize = 9;
