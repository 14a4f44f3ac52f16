//! mpack - streaming MessagePack codec over blocking byte channels
//!
//! This library converts typed values to and from the MessagePack wire
//! format through buffered, reusable endpoints. It targets application code
//! that needs high-throughput, low-allocation serialization of structured
//! messages over in-memory buffers, files, and sockets.
//!
//! # Quick Start
//!
//! ```rust
//! use mpack::{BufferAllocator, MessageReader, MessageSink, MessageSource, MessageWriter};
//!
//! let allocator = BufferAllocator::unpooled();
//!
//! let sink = MessageSink::new(Vec::new(), &allocator)?;
//! let mut writer = MessageWriter::new(sink);
//! writer.write_str("Hello")?;
//! writer.write_i64(42)?;
//! writer.flush()?;
//! let wire = writer.into_sink().into_channel();
//!
//! let source = MessageSource::new(wire.as_slice(), &allocator)?;
//! let mut reader = MessageReader::new(source);
//! assert_eq!(reader.read_string()?, "Hello");
//! assert_eq!(reader.read_i64()?, 42);
//! # Ok::<(), mpack::Error>(())
//! ```
//!
//! # Features
//!
//! - **Smallest legal encoding** - integers, strings, containers, and
//!   timestamps always take the narrowest wire form
//! - **Pooled buffers** - sources, sinks, and scratch encoders lease their
//!   buffers from a capped [`BufferAllocator`]
//! - **Large-payload bypass** - big strings and binaries move through
//!   vectored writes and direct reads instead of double buffering
//! - **Identifier interning** - short repeated strings decode to one shared
//!   allocation per reader

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod codec;
pub mod io;

pub use codec::{
    format, Error, ExtensionHeader, MessageReader, MessageType, MessageWriter, ReaderOptions,
    Result, Timestamp, WriterOptions, TIMESTAMP_EXTENSION_TYPE,
};
pub use io::{
    AllocatorOptions, AllocatorStats, BufferAllocator, MessageSink, MessageSource,
    DEFAULT_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY,
};
