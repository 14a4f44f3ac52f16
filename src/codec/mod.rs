//! MessagePack wire-format codec
//!
//! This module holds the format-byte grammar, the typed reader and writer,
//! and the timestamp extension. The buffered endpoints they run over live
//! in [`crate::io`].

mod error;
pub mod format;
mod reader;
mod strings;
mod timestamp;
mod types;
mod writer;

pub use error::{Error, Result};
pub use reader::{ExtensionHeader, MessageReader, ReaderOptions};
pub use timestamp::{Timestamp, TIMESTAMP_EXTENSION_TYPE};
pub use types::MessageType;
pub use writer::{MessageWriter, WriterOptions};
