//! MessagePack decoding
//!
//! A [`MessageReader`] peeks one format byte ahead, decides the shape of
//! the next value, and decodes its payload through the source. Each call
//! advances the stream; after any error other than
//! [`Error::EndOfInput`] the position is undefined and the reader should
//! be closed.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;

use super::error::{Error, Result};
use super::format;
use super::strings::{decode_utf8_into, IdentifierCache};
use super::timestamp::{Timestamp, TIMESTAMP_EXTENSION_TYPE};
use super::types::MessageType;
use crate::io::MessageSource;

/// Extension header: application type id plus payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionHeader {
    /// Type id; negative ids are reserved for the format itself.
    pub ext_type: i8,
    /// Payload length in bytes.
    pub length: u32,
}

/// Configuration for a [`MessageReader`].
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Bounded entry count of the identifier cache.
    pub identifier_cache_capacity: usize,
    /// Longest string, in bytes, eligible for interning.
    pub max_identifier_length: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            identifier_cache_capacity: 1024,
            max_identifier_length: 64,
        }
    }
}

/// Streaming MessagePack decoder over a buffered source.
pub struct MessageReader<R> {
    source: MessageSource<R>,
    identifiers: IdentifierCache,
    max_identifier_length: usize,
}

impl<R: Read> MessageReader<R> {
    /// Create a reader with default options.
    #[must_use]
    pub fn new(source: MessageSource<R>) -> Self {
        Self::with_options(source, ReaderOptions::default())
    }

    /// Create a reader with explicit options.
    #[must_use]
    pub fn with_options(source: MessageSource<R>, options: ReaderOptions) -> Self {
        Self {
            source,
            identifiers: IdentifierCache::new(options.identifier_cache_capacity),
            max_identifier_length: options.max_identifier_length,
        }
    }

    /// The upcoming format byte, without consuming it.
    pub fn next_format(&mut self) -> Result<u8> {
        self.source.peek_u8()
    }

    /// The type of the upcoming value, without consuming it.
    pub fn next_type(&mut self) -> Result<MessageType> {
        let byte = self.source.peek_u8()?;
        MessageType::from_format(byte).ok_or_else(reserved_format)
    }

    /// Consume a nil value.
    pub fn read_nil(&mut self) -> Result<()> {
        match self.source.read_u8()? {
            format::NIL => Ok(()),
            byte => Err(mismatch(MessageType::Nil, byte)),
        }
    }

    /// Consume a boolean.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.source.read_u8()? {
            format::TRUE => Ok(true),
            format::FALSE => Ok(false),
            byte => Err(mismatch(MessageType::Boolean, byte)),
        }
    }

    /// Consume an integer widened to i64.
    ///
    /// Fails with [`Error::IntegerOverflow`] for u64 values above
    /// `i64::MAX`; those round-trip through [`Self::read_u64`].
    pub fn read_i64(&mut self) -> Result<i64> {
        let byte = self.source.read_u8()?;
        match byte {
            b if format::is_pos_fix_int(b) => Ok(i64::from(b)),
            b if format::is_neg_fix_int(b) => Ok(i64::from(b as i8)),
            format::UINT8 => Ok(i64::from(self.source.read_u8()?)),
            format::UINT16 => Ok(i64::from(self.source.read_u16()?)),
            format::UINT32 => Ok(i64::from(self.source.read_u32()?)),
            format::UINT64 => {
                let value = self.source.read_u64()?;
                i64::try_from(value).map_err(|_| Error::IntegerOverflow {
                    value: i128::from(value),
                })
            }
            format::INT8 => Ok(i64::from(self.source.read_i8()?)),
            format::INT16 => Ok(i64::from(self.source.read_i16()?)),
            format::INT32 => Ok(i64::from(self.source.read_i32()?)),
            format::INT64 => self.source.read_i64(),
            _ => Err(mismatch(MessageType::Integer, byte)),
        }
    }

    /// Consume an integer that must fit i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        narrow(self.read_i64()?)
    }

    /// Consume an integer that must fit i16.
    pub fn read_i16(&mut self) -> Result<i16> {
        narrow(self.read_i64()?)
    }

    /// Consume an integer that must fit i8.
    pub fn read_i8(&mut self) -> Result<i8> {
        narrow(self.read_i64()?)
    }

    /// Consume an integer as an unsigned 64-bit value, losslessly.
    ///
    /// Negative wire values fail with [`Error::IntegerOverflow`].
    pub fn read_u64(&mut self) -> Result<u64> {
        let byte = self.source.read_u8()?;
        match byte {
            b if format::is_pos_fix_int(b) => Ok(u64::from(b)),
            b if format::is_neg_fix_int(b) => Err(Error::IntegerOverflow {
                value: i128::from(b as i8),
            }),
            format::UINT8 => Ok(u64::from(self.source.read_u8()?)),
            format::UINT16 => Ok(u64::from(self.source.read_u16()?)),
            format::UINT32 => Ok(u64::from(self.source.read_u32()?)),
            format::UINT64 => self.source.read_u64(),
            format::INT8 => unsign(i64::from(self.source.read_i8()?)),
            format::INT16 => unsign(i64::from(self.source.read_i16()?)),
            format::INT32 => unsign(i64::from(self.source.read_i32()?)),
            format::INT64 => unsign(self.source.read_i64()?),
            _ => Err(mismatch(MessageType::Integer, byte)),
        }
    }

    /// Consume an integer that must fit u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        narrow_unsigned(self.read_u64()?)
    }

    /// Consume an integer that must fit u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        narrow_unsigned(self.read_u64()?)
    }

    /// Consume an integer that must fit u8.
    pub fn read_u8(&mut self) -> Result<u8> {
        narrow_unsigned(self.read_u64()?)
    }

    /// Consume a single-precision float. Integer and double values are not
    /// promoted.
    pub fn read_f32(&mut self) -> Result<f32> {
        match self.source.read_u8()? {
            format::FLOAT32 => self.source.read_f32(),
            byte => Err(mismatch(MessageType::Float, byte)),
        }
    }

    /// Consume a float as f64. Single precision widens losslessly; integer
    /// values are not promoted.
    pub fn read_f64(&mut self) -> Result<f64> {
        match self.source.read_u8()? {
            format::FLOAT64 => self.source.read_f64(),
            format::FLOAT32 => Ok(f64::from(self.source.read_f32()?)),
            byte => Err(mismatch(MessageType::Float, byte)),
        }
    }

    /// Consume a string header; the caller then consumes the payload.
    pub fn read_string_header(&mut self) -> Result<usize> {
        let byte = self.source.read_u8()?;
        match byte {
            b if format::is_fix_str(b) => Ok(format::fix_str_length(b)),
            format::STR8 => Ok(usize::from(self.source.read_u8()?)),
            format::STR16 => Ok(usize::from(self.source.read_u16()?)),
            format::STR32 => Ok(self.source.read_u32()? as usize),
            _ => Err(mismatch(MessageType::String, byte)),
        }
    }

    /// Consume a binary header; the caller then consumes the payload.
    pub fn read_binary_header(&mut self) -> Result<usize> {
        let byte = self.source.read_u8()?;
        match byte {
            format::BIN8 => Ok(usize::from(self.source.read_u8()?)),
            format::BIN16 => Ok(usize::from(self.source.read_u16()?)),
            format::BIN32 => Ok(self.source.read_u32()? as usize),
            _ => Err(mismatch(MessageType::Binary, byte)),
        }
    }

    /// Consume an array header; returns the element count.
    pub fn read_array_header(&mut self) -> Result<usize> {
        let byte = self.source.read_u8()?;
        match byte {
            b if format::is_fix_array(b) => Ok(format::fix_array_length(b)),
            format::ARRAY16 => Ok(usize::from(self.source.read_u16()?)),
            format::ARRAY32 => Ok(self.source.read_u32()? as usize),
            _ => Err(mismatch(MessageType::Array, byte)),
        }
    }

    /// Consume a map header; returns the entry count.
    pub fn read_map_header(&mut self) -> Result<usize> {
        let byte = self.source.read_u8()?;
        match byte {
            b if format::is_fix_map(b) => Ok(format::fix_map_length(b)),
            format::MAP16 => Ok(usize::from(self.source.read_u16()?)),
            format::MAP32 => Ok(self.source.read_u32()? as usize),
            _ => Err(mismatch(MessageType::Map, byte)),
        }
    }

    /// Consume an extension header; the caller then consumes the payload.
    pub fn read_extension_header(&mut self) -> Result<ExtensionHeader> {
        let byte = self.source.read_u8()?;
        let length = match byte {
            format::FIXEXT1 => 1,
            format::FIXEXT2 => 2,
            format::FIXEXT4 => 4,
            format::FIXEXT8 => 8,
            format::FIXEXT16 => 16,
            format::EXT8 => u32::from(self.source.read_u8()?),
            format::EXT16 => u32::from(self.source.read_u16()?),
            format::EXT32 => self.source.read_u32()?,
            _ => return Err(mismatch(MessageType::Extension, byte)),
        };
        let ext_type = self.source.read_i8()?;
        Ok(ExtensionHeader { ext_type, length })
    }

    /// Consume a string value.
    pub fn read_string(&mut self) -> Result<String> {
        let length = self.read_string_header()?;
        let mut out = String::with_capacity(length);
        decode_utf8_into(&mut self.source, length, &mut out)?;
        Ok(out)
    }

    /// Consume a string value and intern it.
    ///
    /// Strings no longer than the configured identifier length share one
    /// decoded allocation per reader; longer strings decode normally.
    pub fn read_identifier(&mut self) -> Result<Arc<str>> {
        let length = self.read_string_header()?;
        if length > self.max_identifier_length {
            let mut out = String::with_capacity(length);
            decode_utf8_into(&mut self.source, length, &mut out)?;
            return Ok(Arc::from(out));
        }
        let allocator = self.source.allocator().clone();
        let mut scratch = allocator.acquire_text(length)?;
        decode_utf8_into(&mut self.source, length, scratch.as_mut_string())?;
        Ok(self.identifiers.intern(scratch.as_str()))
    }

    /// Fill `dst` exactly with payload bytes.
    pub fn read_payload(&mut self, dst: &mut [u8]) -> Result<()> {
        self.source.read_exact_into(dst)
    }

    /// Consume a binary value, header and payload.
    pub fn read_binary(&mut self) -> Result<Bytes> {
        let length = self.read_binary_header()?;
        let mut data = vec![0u8; length];
        self.source.read_exact_into(&mut data)?;
        Ok(Bytes::from(data))
    }

    /// Consume an extension value, header and payload.
    pub fn read_extension(&mut self) -> Result<(i8, Bytes)> {
        let header = self.read_extension_header()?;
        let mut data = vec![0u8; header.length as usize];
        self.source.read_exact_into(&mut data)?;
        Ok((header.ext_type, Bytes::from(data)))
    }

    /// Consume a timestamp extension (type −1).
    pub fn read_timestamp(&mut self) -> Result<Timestamp> {
        let header = self.read_extension_header()?;
        if header.ext_type != TIMESTAMP_EXTENSION_TYPE {
            return Err(Error::InvalidValue(format!(
                "extension type {} is not a timestamp",
                header.ext_type
            )));
        }
        match header.length {
            4 => Timestamp::new(i64::from(self.source.read_u32()?), 0),
            8 => Timestamp::unpack64(self.source.read_u64()?),
            12 => {
                let nanos = self.source.read_u32()?;
                let seconds = self.source.read_i64()?;
                Timestamp::new(seconds, nanos)
            }
            other => Err(Error::InvalidValue(format!(
                "timestamp payload length {other}"
            ))),
        }
    }

    /// Skip one whole value, including nested containers.
    pub fn skip_value(&mut self) -> Result<()> {
        self.skip_values(1)
    }

    /// Skip `count` whole values.
    ///
    /// Never allocates: nested arrays grow the pending count by their
    /// length, maps by twice theirs, and payload-bearing values skip their
    /// byte length through the source.
    pub fn skip_values(&mut self, count: usize) -> Result<()> {
        let mut pending = count as u64;
        while pending > 0 {
            pending -= 1;
            let byte = self.source.read_u8()?;
            match byte {
                b if format::is_fix_int(b) => {}
                b if format::is_fix_str(b) => {
                    self.source.skip(format::fix_str_length(b) as u64)?;
                }
                b if format::is_fix_array(b) => {
                    pending += format::fix_array_length(b) as u64;
                }
                b if format::is_fix_map(b) => {
                    pending += 2 * format::fix_map_length(b) as u64;
                }
                format::NIL | format::TRUE | format::FALSE => {}
                format::UINT8 | format::INT8 => self.source.skip(1)?,
                format::UINT16 | format::INT16 => self.source.skip(2)?,
                format::UINT32 | format::INT32 | format::FLOAT32 => self.source.skip(4)?,
                format::UINT64 | format::INT64 | format::FLOAT64 => self.source.skip(8)?,
                format::STR8 | format::BIN8 => {
                    let length = u64::from(self.source.read_u8()?);
                    self.source.skip(length)?;
                }
                format::STR16 | format::BIN16 => {
                    let length = u64::from(self.source.read_u16()?);
                    self.source.skip(length)?;
                }
                format::STR32 | format::BIN32 => {
                    let length = u64::from(self.source.read_u32()?);
                    self.source.skip(length)?;
                }
                format::ARRAY16 => pending += u64::from(self.source.read_u16()?),
                format::ARRAY32 => pending += u64::from(self.source.read_u32()?),
                format::MAP16 => pending += 2 * u64::from(self.source.read_u16()?),
                format::MAP32 => pending += 2 * u64::from(self.source.read_u32()?),
                format::FIXEXT1 => self.source.skip(2)?,
                format::FIXEXT2 => self.source.skip(3)?,
                format::FIXEXT4 => self.source.skip(5)?,
                format::FIXEXT8 => self.source.skip(9)?,
                format::FIXEXT16 => self.source.skip(17)?,
                format::EXT8 => {
                    let length = u64::from(self.source.read_u8()?);
                    self.source.skip(length + 1)?;
                }
                format::EXT16 => {
                    let length = u64::from(self.source.read_u16()?);
                    self.source.skip(length + 1)?;
                }
                format::EXT32 => {
                    let length = u64::from(self.source.read_u32()?);
                    self.source.skip(length + 1)?;
                }
                _ => return Err(reserved_format()),
            }
        }
        Ok(())
    }

    /// Close the reader and its source.
    pub fn close(self) -> Result<()> {
        self.source.close()
    }
}

fn mismatch(expected: MessageType, byte: u8) -> Error {
    Error::TypeMismatch {
        expected,
        format: byte,
    }
}

fn reserved_format() -> Error {
    Error::InvalidValue("reserved format byte 0xc1".to_owned())
}

fn narrow<T: TryFrom<i64>>(value: i64) -> Result<T> {
    T::try_from(value).map_err(|_| Error::IntegerOverflow {
        value: i128::from(value),
    })
}

fn narrow_unsigned<T: TryFrom<u64>>(value: u64) -> Result<T> {
    T::try_from(value).map_err(|_| Error::IntegerOverflow {
        value: i128::from(value),
    })
}

fn unsign(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::IntegerOverflow {
        value: i128::from(value),
    })
}
