//! Buffered message sink over a blocking channel.

use std::io::{ErrorKind, IoSlice, Read, Write};

use tracing::{debug, trace};

use super::allocator::{Buffer, BufferAllocator};
use super::{DEFAULT_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY};
use crate::codec::{Error, Result};

/// Blocking byte output with an internal write buffer.
///
/// The region past the write position is reserved for the codec.
/// [`MessageSink::ensure_remaining`] is the precondition call every encode
/// operation issues before appending.
pub struct MessageSink<W> {
    channel: W,
    allocator: BufferAllocator,
    buffer: Buffer,
    len: usize,
}

impl<W: Write> MessageSink<W> {
    /// Create a sink with the default buffer capacity (8 KiB).
    pub fn new(channel: W, allocator: &BufferAllocator) -> Result<Self> {
        Self::with_capacity(channel, allocator, DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a sink with an explicit buffer capacity.
    ///
    /// Fails with [`Error::BufferTooSmall`] below the 9-byte minimum
    /// (format byte plus an 8-byte payload).
    pub fn with_capacity(channel: W, allocator: &BufferAllocator, capacity: usize) -> Result<Self> {
        if capacity < MIN_BUFFER_CAPACITY {
            return Err(Error::BufferTooSmall {
                needed: MIN_BUFFER_CAPACITY,
                capacity,
            });
        }
        let buffer = allocator.acquire_bytes(capacity)?;
        Ok(Self {
            channel,
            allocator: allocator.clone(),
            buffer,
            len: 0,
        })
    }

    /// Capacity of the internal buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Writable space left in the buffer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Bytes currently buffered and not yet flushed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.len
    }

    /// The allocator this sink acquires scratch buffers from.
    #[must_use]
    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// Guarantee at least `count` writable bytes in the buffer, flushing
    /// buffered bytes when necessary.
    ///
    /// Fails with [`Error::BufferTooSmall`] when `count` exceeds the buffer
    /// capacity; that is a caller bug, not a recoverable condition.
    pub fn ensure_remaining(&mut self, count: usize) -> Result<()> {
        if count <= self.remaining() {
            return Ok(());
        }
        if count > self.capacity() {
            return Err(Error::BufferTooSmall {
                needed: count,
                capacity: self.capacity(),
            });
        }
        self.flush_buffer()
    }

    /// Append without an ensure check. Callers ensure space first.
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.remaining());
        let end = self.len + bytes.len();
        self.buffer.as_mut_slice()[self.len..end].copy_from_slice(bytes);
        self.len = end;
    }

    /// Reserve `count` buffered bytes for later patching; returns their
    /// offset. Callers ensure space first and must patch before the next
    /// flush.
    pub(crate) fn reserve(&mut self, count: usize) -> usize {
        debug_assert!(count <= self.remaining());
        let at = self.len;
        self.len += count;
        at
    }

    /// Overwrite previously reserved bytes.
    pub(crate) fn patch(&mut self, at: usize, bytes: &[u8]) {
        debug_assert!(at + bytes.len() <= self.len);
        self.buffer.as_mut_slice()[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Write one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.ensure_remaining(1)?;
        self.push(&[value]);
        Ok(())
    }

    /// Write a big-endian u16.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.ensure_remaining(2)?;
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a big-endian u32.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.ensure_remaining(4)?;
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a big-endian u64.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.ensure_remaining(8)?;
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a big-endian IEEE-754 single.
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.ensure_remaining(4)?;
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a big-endian IEEE-754 double.
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.ensure_remaining(8)?;
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a format byte followed by one payload byte.
    pub fn write_format_u8(&mut self, format: u8, value: u8) -> Result<()> {
        self.ensure_remaining(2)?;
        self.push(&[format, value]);
        Ok(())
    }

    /// Write a format byte followed by a big-endian u16.
    pub fn write_format_u16(&mut self, format: u8, value: u16) -> Result<()> {
        self.ensure_remaining(3)?;
        self.push(&[format]);
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a format byte followed by a big-endian u32.
    pub fn write_format_u32(&mut self, format: u8, value: u32) -> Result<()> {
        self.ensure_remaining(5)?;
        self.push(&[format]);
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a format byte followed by a big-endian u64.
    pub fn write_format_u64(&mut self, format: u8, value: u64) -> Result<()> {
        self.ensure_remaining(9)?;
        self.push(&[format]);
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a format byte followed by a big-endian IEEE-754 single.
    pub fn write_format_f32(&mut self, format: u8, value: f32) -> Result<()> {
        self.ensure_remaining(5)?;
        self.push(&[format]);
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a format byte followed by a big-endian IEEE-754 double.
    pub fn write_format_f64(&mut self, format: u8, value: f64) -> Result<()> {
        self.ensure_remaining(9)?;
        self.push(&[format]);
        self.push(&value.to_be_bytes());
        Ok(())
    }

    /// Write a raw payload. Buffered when it fits; larger payloads are
    /// gathered with the buffered bytes into one vectored channel write.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() <= self.remaining() {
            self.push(bytes);
            return Ok(());
        }
        self.write_gather(bytes)
    }

    /// Flush the internal buffer and `extra` in a single vectored write
    /// cycle, leaving the buffer empty.
    pub(crate) fn write_gather(&mut self, extra: &[u8]) -> Result<()> {
        write_vectored_all(
            &mut self.channel,
            &self.buffer.as_slice()[..self.len],
            extra,
        )?;
        self.len = 0;
        Ok(())
    }

    /// Stream up to `max_bytes` from `channel` through the internal buffer,
    /// flushing each time it fills. Stops early at EOF.
    ///
    /// Returns the number of bytes moved.
    pub fn transfer_from<R: Read>(&mut self, channel: &mut R, max_bytes: u64) -> Result<u64> {
        debug!(max_bytes, "transferring bytes from channel");
        let mut moved = 0u64;
        while moved < max_bytes {
            if self.remaining() == 0 {
                self.flush_buffer()?;
            }
            let want = usize::try_from(max_bytes - moved)
                .unwrap_or(usize::MAX)
                .min(self.remaining());
            let read = {
                let free = &mut self.buffer.as_mut_slice()[self.len..self.len + want];
                read_channel(channel, free)?
            };
            if read == 0 {
                break;
            }
            self.len += read;
            moved += read as u64;
        }
        Ok(moved)
    }

    /// Flush the internal buffer through the channel.
    pub fn flush_buffer(&mut self) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        write_channel_all(&mut self.channel, &self.buffer.as_slice()[..self.len])?;
        trace!(bytes = self.len, "flushed write buffer");
        self.len = 0;
        Ok(())
    }

    /// Flush the internal buffer, then the channel itself.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.channel.flush().map_err(Error::Io)
    }

    /// Flush and close the sink. The internal buffer returns to its
    /// allocator even when the flush fails.
    pub fn close(mut self) -> Result<()> {
        debug!("closing message sink");
        self.flush()
    }

    /// Consume the sink and return the channel, discarding any bytes still
    /// buffered. Flush first to keep them.
    pub fn into_channel(self) -> W {
        self.channel
    }
}

/// Write an entire slice, retrying interrupts. Zero-byte writes and
/// `WouldBlock` signal a channel that is not in blocking mode.
fn write_channel_all<W: Write>(channel: &mut W, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(0) => return Err(Error::NonBlockingChannel),
            Ok(written) => data = &data[written..],
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(Error::NonBlockingChannel)
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}

/// Write two slices completely, preferring a single vectored write per
/// cycle while the first still has bytes in flight.
fn write_vectored_all<W: Write>(channel: &mut W, first: &[u8], second: &[u8]) -> Result<()> {
    let total = first.len() + second.len();
    let mut written = 0usize;
    while written < total {
        let result = if written < first.len() {
            let slices = [IoSlice::new(&first[written..]), IoSlice::new(second)];
            channel.write_vectored(&slices)
        } else {
            channel.write(&second[written - first.len()..])
        };
        match result {
            Ok(0) => return Err(Error::NonBlockingChannel),
            Ok(count) => written += count,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(Error::NonBlockingChannel)
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(())
}

/// Read once from the channel, retrying interrupts.
fn read_channel<R: Read>(channel: &mut R, dst: &mut [u8]) -> Result<usize> {
    loop {
        match channel.read(dst) {
            Ok(read) => return Ok(read),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(Error::NonBlockingChannel)
            }
            Err(err) => return Err(Error::Io(err)),
        }
    }
}
