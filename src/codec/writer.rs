//! MessagePack encoding
//!
//! A [`MessageWriter`] emits every value in its smallest legal wire form:
//! fixint before sized integers, the narrowest sized header otherwise. The
//! one exception is the character-sequence string path, where the header
//! class is reserved from an upper bound before encoding and backfilled
//! with the actual length in the reserved width.

use std::io::{Read, Write};

use super::error::{Error, Result};
use super::format;
use super::timestamp::{Timestamp, TIMESTAMP_EXTENSION_TYPE};
use crate::io::MessageSink;

/// Upper bound of UTF-8 bytes a single `char` can occupy.
fn default_string_size_estimator(char_count: usize) -> usize {
    char_count.saturating_mul(4)
}

/// Configuration for a [`MessageWriter`].
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Maps a character count to an upper bound of encoded UTF-8 bytes;
    /// picks the reserved header class for [`MessageWriter::write_chars`].
    pub string_size_estimator: fn(usize) -> usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            string_size_estimator: default_string_size_estimator,
        }
    }
}

/// Streaming MessagePack encoder over a buffered sink.
pub struct MessageWriter<W> {
    sink: MessageSink<W>,
    string_size_estimator: fn(usize) -> usize,
}

impl<W: Write> MessageWriter<W> {
    /// Create a writer with default options.
    #[must_use]
    pub fn new(sink: MessageSink<W>) -> Self {
        Self::with_options(sink, WriterOptions::default())
    }

    /// Create a writer with explicit options.
    #[must_use]
    pub fn with_options(sink: MessageSink<W>, options: WriterOptions) -> Self {
        Self {
            sink,
            string_size_estimator: options.string_size_estimator,
        }
    }

    /// Write nil.
    pub fn write_nil(&mut self) -> Result<()> {
        self.sink.write_u8(format::NIL)
    }

    /// Write a boolean.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.sink
            .write_u8(if value { format::TRUE } else { format::FALSE })
    }

    /// Write a signed integer in its smallest legal form.
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        match value {
            0..=127 | -32..=-1 => self.sink.write_u8(value as u8),
            128..=255 => self.sink.write_format_u8(format::UINT8, value as u8),
            -128..=-33 => self.sink.write_format_u8(format::INT8, value as u8),
            256..=65_535 => self.sink.write_format_u16(format::UINT16, value as u16),
            -32_768..=-129 => self.sink.write_format_u16(format::INT16, value as u16),
            65_536..=4_294_967_295 => self.sink.write_format_u32(format::UINT32, value as u32),
            -2_147_483_648..=-32_769 => self.sink.write_format_u32(format::INT32, value as u32),
            _ => self.sink.write_format_u64(format::INT64, value as u64),
        }
    }

    /// Write a signed integer.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_i64(i64::from(value))
    }

    /// Write a signed integer.
    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_i64(i64::from(value))
    }

    /// Write a signed integer.
    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_i64(i64::from(value))
    }

    /// Write an unsigned integer in its smallest legal form.
    ///
    /// Values above `i64::MAX` still encode losslessly as uint64.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        match value {
            0..=127 => self.sink.write_u8(value as u8),
            128..=255 => self.sink.write_format_u8(format::UINT8, value as u8),
            256..=65_535 => self.sink.write_format_u16(format::UINT16, value as u16),
            65_536..=4_294_967_295 => self.sink.write_format_u32(format::UINT32, value as u32),
            _ => self.sink.write_format_u64(format::UINT64, value),
        }
    }

    /// Write an unsigned integer.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_u64(u64::from(value))
    }

    /// Write an unsigned integer.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_u64(u64::from(value))
    }

    /// Write an unsigned integer.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_u64(u64::from(value))
    }

    /// Write a single-precision float.
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.sink.write_format_f32(format::FLOAT32, value)
    }

    /// Write a double-precision float.
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.sink.write_format_f64(format::FLOAT64, value)
    }

    /// Write a string value. The byte length is exact, so the header class
    /// is always the smallest fit.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_string_header(value.len())?;
        self.sink.write_payload(value.as_bytes())
    }

    /// Write a string from a character sequence of known count.
    ///
    /// The header class is reserved from the size estimator's upper bound
    /// before any character is encoded and is backfilled with the actual
    /// byte length afterwards, in the reserved width. When the bound does
    /// not fit the sink buffer, encoding goes to an allocator scratch
    /// buffer that is gather-written behind the buffered bytes.
    pub fn write_chars<I>(&mut self, chars: I) -> Result<()>
    where
        I: IntoIterator<Item = char>,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = chars.into_iter();
        let char_count = iter.len();
        if char_count == 0 {
            return self.write_string_header(0);
        }
        let bound = (self.string_size_estimator)(char_count);
        let header_len = string_header_length(bound);
        let reserved = header_len + bound;
        let mut utf8 = [0u8; 4];

        if reserved <= self.sink.capacity() {
            self.sink.ensure_remaining(reserved)?;
            let at = self.sink.reserve(header_len);
            let mut byte_len = 0usize;
            for ch in iter {
                let encoded = ch.encode_utf8(&mut utf8).as_bytes();
                if byte_len + encoded.len() > bound {
                    return Err(estimate_exceeded(bound));
                }
                self.sink.push(encoded);
                byte_len += encoded.len();
            }
            let mut header = [0u8; 5];
            encode_string_header(&mut header[..header_len], byte_len);
            self.sink.patch(at, &header[..header_len]);
            return Ok(());
        }

        let allocator = self.sink.allocator().clone();
        let mut scratch = allocator.acquire_bytes(reserved)?;
        let mut offset = header_len;
        for ch in iter {
            let encoded = ch.encode_utf8(&mut utf8).as_bytes();
            if offset + encoded.len() > reserved {
                return Err(estimate_exceeded(bound));
            }
            scratch.as_mut_slice()[offset..offset + encoded.len()].copy_from_slice(encoded);
            offset += encoded.len();
        }
        encode_string_header(&mut scratch.as_mut_slice()[..header_len], offset - header_len);
        self.sink.write_gather(&scratch.as_slice()[..offset])
    }

    /// Write a binary value, header and payload.
    pub fn write_binary(&mut self, payload: &[u8]) -> Result<()> {
        self.write_binary_header(payload.len())?;
        self.sink.write_payload(payload)
    }

    /// Write an extension value, header and payload.
    pub fn write_extension(&mut self, ext_type: i8, payload: &[u8]) -> Result<()> {
        self.write_extension_header(ext_type, payload.len() as u32)?;
        self.sink.write_payload(payload)
    }

    /// Write a timestamp in its smallest lossless layout.
    pub fn write_timestamp(&mut self, timestamp: Timestamp) -> Result<()> {
        let ext_type = TIMESTAMP_EXTENSION_TYPE as u8;
        match timestamp.wire_length() {
            4 => {
                self.sink.write_format_u8(format::FIXEXT4, ext_type)?;
                self.sink.write_u32(timestamp.seconds() as u32)
            }
            8 => {
                self.sink.write_format_u8(format::FIXEXT8, ext_type)?;
                self.sink.write_u64(timestamp.pack64())
            }
            _ => {
                self.sink.write_format_u8(format::EXT8, 12)?;
                self.sink.write_u8(ext_type)?;
                self.sink.write_u32(timestamp.nanos())?;
                self.sink.write_u64(timestamp.seconds() as u64)
            }
        }
    }

    /// Write a string header for a payload of `byte_len` bytes.
    pub fn write_string_header(&mut self, byte_len: usize) -> Result<()> {
        if byte_len < 32 {
            self.sink
                .write_u8(format::FIXSTR_PREFIX | byte_len as u8)
        } else if byte_len < 256 {
            self.sink.write_format_u8(format::STR8, byte_len as u8)
        } else if byte_len < 65_536 {
            self.sink.write_format_u16(format::STR16, byte_len as u16)
        } else {
            self.sink.write_format_u32(format::STR32, byte_len as u32)
        }
    }

    /// Write a binary header for a payload of `byte_len` bytes.
    pub fn write_binary_header(&mut self, byte_len: usize) -> Result<()> {
        if byte_len < 256 {
            self.sink.write_format_u8(format::BIN8, byte_len as u8)
        } else if byte_len < 65_536 {
            self.sink.write_format_u16(format::BIN16, byte_len as u16)
        } else {
            self.sink.write_format_u32(format::BIN32, byte_len as u32)
        }
    }

    /// Write an array header for `count` elements.
    pub fn write_array_header(&mut self, count: usize) -> Result<()> {
        if count <= 15 {
            self.sink.write_u8(format::FIXARRAY_PREFIX | count as u8)
        } else if count < 65_536 {
            self.sink.write_format_u16(format::ARRAY16, count as u16)
        } else {
            self.sink.write_format_u32(format::ARRAY32, count as u32)
        }
    }

    /// Write a map header for `count` key-value pairs.
    pub fn write_map_header(&mut self, count: usize) -> Result<()> {
        if count <= 15 {
            self.sink.write_u8(format::FIXMAP_PREFIX | count as u8)
        } else if count < 65_536 {
            self.sink.write_format_u16(format::MAP16, count as u16)
        } else {
            self.sink.write_format_u32(format::MAP32, count as u32)
        }
    }

    /// Write an extension header; the caller then writes `byte_len`
    /// payload bytes.
    pub fn write_extension_header(&mut self, ext_type: i8, byte_len: u32) -> Result<()> {
        match byte_len {
            1 => self.sink.write_format_u8(format::FIXEXT1, ext_type as u8),
            2 => self.sink.write_format_u8(format::FIXEXT2, ext_type as u8),
            4 => self.sink.write_format_u8(format::FIXEXT4, ext_type as u8),
            8 => self.sink.write_format_u8(format::FIXEXT8, ext_type as u8),
            16 => self.sink.write_format_u8(format::FIXEXT16, ext_type as u8),
            len if len < 256 => {
                self.sink.write_format_u8(format::EXT8, len as u8)?;
                self.sink.write_u8(ext_type as u8)
            }
            len if len < 65_536 => {
                self.sink.write_format_u16(format::EXT16, len as u16)?;
                self.sink.write_u8(ext_type as u8)
            }
            len => {
                self.sink.write_format_u32(format::EXT32, len)?;
                self.sink.write_u8(ext_type as u8)
            }
        }
    }

    /// Write raw payload bytes.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.sink.write_payload(payload)
    }

    /// Stream up to `max_bytes` from `channel` into the sink. Returns the
    /// bytes moved; stops early at EOF.
    pub fn write_from<R: Read>(&mut self, channel: &mut R, max_bytes: u64) -> Result<u64> {
        self.sink.transfer_from(channel, max_bytes)
    }

    /// Flush buffered bytes and the underlying channel.
    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }

    /// Flush and close the writer and its sink.
    pub fn close(self) -> Result<()> {
        self.sink.close()
    }

    /// Consume the writer and return its sink.
    pub fn into_sink(self) -> MessageSink<W> {
        self.sink
    }
}

/// Header width reserved for an estimated byte length.
fn string_header_length(bound: usize) -> usize {
    if bound < 32 {
        1
    } else if bound < 256 {
        2
    } else if bound < 65_536 {
        3
    } else {
        5
    }
}

/// Fill a header slot whose width selects the class.
fn encode_string_header(slot: &mut [u8], byte_len: usize) {
    match slot.len() {
        1 => slot[0] = format::FIXSTR_PREFIX | byte_len as u8,
        2 => {
            slot[0] = format::STR8;
            slot[1] = byte_len as u8;
        }
        3 => {
            slot[0] = format::STR16;
            slot[1..3].copy_from_slice(&(byte_len as u16).to_be_bytes());
        }
        _ => {
            slot[0] = format::STR32;
            slot[1..5].copy_from_slice(&(byte_len as u32).to_be_bytes());
        }
    }
}

fn estimate_exceeded(bound: usize) -> Error {
    Error::InvalidValue(format!(
        "encoded string exceeds the estimated bound of {bound} bytes"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BufferAllocator, MessageSink};

    fn write_with<F>(encode: F) -> Vec<u8>
    where
        F: FnOnce(&mut MessageWriter<Vec<u8>>),
    {
        let allocator = BufferAllocator::unpooled();
        let sink = MessageSink::new(Vec::new(), &allocator).unwrap();
        let mut writer = MessageWriter::new(sink);
        encode(&mut writer);
        writer.flush().unwrap();
        writer.into_sink().into_channel()
    }

    #[test]
    fn test_integer_smallest_encoding_boundaries() {
        let cases: &[(i64, &[u8])] = &[
            (0, &[0x00]),
            (127, &[0x7f]),
            (-1, &[0xff]),
            (-32, &[0xe0]),
            (128, &[0xcc, 0x80]),
            (255, &[0xcc, 0xff]),
            (-33, &[0xd0, 0xdf]),
            (-128, &[0xd0, 0x80]),
            (256, &[0xcd, 0x01, 0x00]),
            (65_535, &[0xcd, 0xff, 0xff]),
            (-129, &[0xd1, 0xff, 0x7f]),
            (-32_768, &[0xd1, 0x80, 0x00]),
            (65_536, &[0xce, 0x00, 0x01, 0x00, 0x00]),
            (-32_769, &[0xd2, 0xff, 0xff, 0x7f, 0xff]),
            (
                4_294_967_296,
                &[0xd3, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
            ),
        ];
        for (value, expected) in cases {
            let bytes = write_with(|w| w.write_i64(*value).unwrap());
            assert_eq!(&bytes, expected, "encoding of {value}");
        }
    }

    #[test]
    fn test_u64_beyond_i64_uses_uint64() {
        let bytes = write_with(|w| w.write_u64(u64::MAX).unwrap());
        let mut expected = vec![0xcf];
        expected.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_string_header_classes() {
        let bytes = write_with(|w| w.write_str("Hello").unwrap());
        assert_eq!(bytes, b"\xa5Hello");

        let forty = "a".repeat(40);
        let bytes = write_with(|w| w.write_str(&forty).unwrap());
        assert_eq!(bytes[0], 0xd9);
        assert_eq!(bytes[1], 40);
        assert_eq!(bytes.len(), 42);

        let long = "b".repeat(300);
        let bytes = write_with(|w| w.write_str(&long).unwrap());
        assert_eq!(&bytes[..3], &[0xda, 0x01, 0x2c]);
    }

    #[test]
    fn test_chars_header_reserved_never_narrowed() {
        // 10 chars bound to 40 bytes reserve a str8 header; the backfill
        // keeps that width even though the actual length fits fixstr.
        let chars: Vec<char> = "a".repeat(10).chars().collect();
        let bytes = write_with(|w| w.write_chars(chars.iter().copied()).unwrap());
        assert_eq!(&bytes[..2], &[0xd9, 0x0a]);
        assert_eq!(bytes.len(), 12);
        assert!(bytes[2..].iter().all(|&b| b == 0x61));
    }

    #[test]
    fn test_chars_overflow_goes_through_scratch() {
        // Bound far beyond the sink buffer forces the scratch path.
        let allocator = BufferAllocator::unpooled();
        let sink = MessageSink::with_capacity(Vec::new(), &allocator, 64).unwrap();
        let mut writer = MessageWriter::new(sink);
        let chars: Vec<char> = "x".repeat(500).chars().collect();
        writer.write_chars(chars.iter().copied()).unwrap();
        writer.flush().unwrap();
        let bytes = writer.into_sink().into_channel();
        assert_eq!(&bytes[..3], &[0xda, 0x01, 0xf4]);
        assert_eq!(bytes.len(), 503);
    }

    #[test]
    fn test_container_headers() {
        let bytes = write_with(|w| w.write_array_header(3).unwrap());
        assert_eq!(bytes, [0x93]);
        let bytes = write_with(|w| w.write_array_header(16).unwrap());
        assert_eq!(bytes, [0xdc, 0x00, 0x10]);
        let bytes = write_with(|w| w.write_map_header(1).unwrap());
        assert_eq!(bytes, [0x81]);
        let bytes = write_with(|w| w.write_map_header(70_000).unwrap());
        assert_eq!(bytes, [0xdf, 0x00, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn test_extension_headers() {
        let bytes = write_with(|w| w.write_extension(42, &[1, 2, 3, 4]).unwrap());
        assert_eq!(bytes, [0xd6, 42, 1, 2, 3, 4]);
        let bytes = write_with(|w| w.write_extension(-5, &[9; 3]).unwrap());
        assert_eq!(bytes, [0xc7, 3, 0xfb, 9, 9, 9]);
    }

    #[test]
    fn test_timestamp_layout_selection() {
        let bytes = write_with(|w| w.write_timestamp(Timestamp::EPOCH).unwrap());
        assert_eq!(bytes, [0xd6, 0xff, 0, 0, 0, 0]);

        let ts = Timestamp::new(1, 500_000_000).unwrap();
        let bytes = write_with(|w| w.write_timestamp(ts).unwrap());
        assert_eq!(bytes[0], 0xd7);
        assert_eq!(bytes[1], 0xff);
        assert_eq!(
            u64::from_be_bytes(bytes[2..10].try_into().unwrap()),
            (500_000_000u64 << 34) | 1
        );

        let ts = Timestamp::new(-1, 0).unwrap();
        let bytes = write_with(|w| w.write_timestamp(ts).unwrap());
        assert_eq!(&bytes[..2], &[0xc7, 12]);
        assert_eq!(bytes[2], 0xff);
    }
}
