//! Buffered message source over a blocking channel.

use std::io::{ErrorKind, Read, Write};

use tracing::{debug, trace};

use super::allocator::{Buffer, BufferAllocator};
use super::sink::MessageSink;
use super::{DEFAULT_BUFFER_CAPACITY, MIN_BUFFER_CAPACITY};
use crate::codec::{Error, Result};

/// Blocking byte input with an internal read buffer.
///
/// The region between the read position and the fill limit holds bytes not
/// yet consumed by the codec. [`MessageSource::ensure_remaining`] is the
/// precondition call every decode operation issues before touching the
/// buffer.
pub struct MessageSource<R> {
    channel: R,
    allocator: BufferAllocator,
    buffer: Buffer,
    pos: usize,
    limit: usize,
}

impl<R: Read> MessageSource<R> {
    /// Create a source with the default buffer capacity (8 KiB).
    pub fn new(channel: R, allocator: &BufferAllocator) -> Result<Self> {
        Self::with_capacity(channel, allocator, DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a source with an explicit buffer capacity.
    ///
    /// Fails with [`Error::BufferTooSmall`] below the 9-byte minimum
    /// (format byte plus an 8-byte payload).
    pub fn with_capacity(channel: R, allocator: &BufferAllocator, capacity: usize) -> Result<Self> {
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
            pos: 0,
            limit: 0,
        })
    }

    /// Capacity of the internal buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Unconsumed bytes currently buffered.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// The allocator this source acquires scratch buffers from.
    #[must_use]
    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// The readable region of the internal buffer.
    pub(crate) fn readable(&self) -> &[u8] {
        &self.buffer.as_slice()[self.pos..self.limit]
    }

    /// Mark `count` readable bytes as consumed.
    pub(crate) fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.remaining());
        self.pos += count;
    }

    /// Guarantee at least `count` readable bytes in the buffer.
    ///
    /// Compacts unread bytes to the front, then refills from the channel.
    /// Fails with [`Error::BufferTooSmall`] when `count` exceeds the buffer
    /// capacity and [`Error::EndOfInput`] when the channel ends first.
    pub fn ensure_remaining(&mut self, count: usize) -> Result<()> {
        if self.remaining() >= count {
            return Ok(());
        }
        if count > self.capacity() {
            return Err(Error::BufferTooSmall {
                needed: count,
                capacity: self.capacity(),
            });
        }
        if self.pos > 0 {
            self.buffer.as_mut_slice().copy_within(self.pos..self.limit, 0);
            self.limit -= self.pos;
            self.pos = 0;
        }
        while self.remaining() < count {
            let read = {
                let free = &mut self.buffer.as_mut_slice()[self.limit..];
                read_channel(&mut self.channel, free)?
            };
            if read == 0 {
                return Err(Error::EndOfInput {
                    needed: count - self.remaining(),
                });
            }
            self.limit += read;
            trace!(bytes = read, "refilled read buffer");
        }
        Ok(())
    }

    /// The next byte without consuming it.
    pub fn peek_u8(&mut self) -> Result<u8> {
        self.ensure_remaining(1)?;
        Ok(self.buffer.as_slice()[self.pos])
    }

    /// Consume one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Consume one byte as a signed value.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Consume a big-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// Consume a big-endian i16.
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    /// Consume a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Consume a big-endian i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    /// Consume a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Consume a big-endian i64.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    /// Consume a big-endian IEEE-754 single.
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.read_array()?))
    }

    /// Consume a big-endian IEEE-754 double.
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure_remaining(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer.as_slice()[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Fill `dst` exactly, draining the buffer first and reading the tail
    /// straight from the channel so large payloads bypass the buffer.
    pub fn read_exact_into(&mut self, dst: &mut [u8]) -> Result<()> {
        let buffered = self.remaining().min(dst.len());
        dst[..buffered].copy_from_slice(&self.readable()[..buffered]);
        self.pos += buffered;
        let mut filled = buffered;
        while filled < dst.len() {
            let read = read_channel(&mut self.channel, &mut dst[filled..])?;
            if read == 0 {
                return Err(Error::EndOfInput {
                    needed: dst.len() - filled,
                });
            }
            filled += read;
        }
        Ok(())
    }

    /// Discard exactly `count` bytes.
    pub fn skip(&mut self, count: u64) -> Result<()> {
        let mut left = count;
        loop {
            let take = (self.remaining() as u64).min(left) as usize;
            self.pos += take;
            left -= take as u64;
            if left == 0 {
                return Ok(());
            }
            let chunk = left.min(self.capacity() as u64) as usize;
            self.ensure_remaining(chunk)?;
        }
    }

    /// Move exactly `count` bytes into `sink`: the buffered region first,
    /// then channel-to-sink without another pass through this buffer.
    ///
    /// Fails with [`Error::EndOfInput`] when the channel runs short.
    pub fn transfer_to<W: Write>(&mut self, sink: &mut MessageSink<W>, count: u64) -> Result<()> {
        debug!(count, "transferring bytes to sink");
        let buffered = (self.remaining() as u64).min(count) as usize;
        if buffered > 0 {
            sink.write_payload(&self.buffer.as_slice()[self.pos..self.pos + buffered])?;
            self.pos += buffered;
        }
        let left = count - buffered as u64;
        if left > 0 {
            let moved = sink.transfer_from(&mut self.channel, left)?;
            if moved < left {
                return Err(Error::EndOfInput {
                    needed: usize::try_from(left - moved).unwrap_or(usize::MAX),
                });
            }
        }
        Ok(())
    }

    /// Close the source. The internal buffer returns to its allocator.
    pub fn close(self) -> Result<()> {
        debug!("closing message source");
        Ok(())
    }
}

/// Read once from the channel, retrying interrupts. A `WouldBlock` result
/// means the channel is not in blocking mode, which this crate does not
/// support.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn source_over(data: &[u8], capacity: usize) -> MessageSource<&[u8]> {
        let allocator = BufferAllocator::unpooled();
        MessageSource::with_capacity(data, &allocator, capacity).unwrap()
    }

    #[test]
    fn test_minimum_capacity_enforced() {
        let allocator = BufferAllocator::unpooled();
        let result = MessageSource::with_capacity(&[][..], &allocator, 8);
        assert!(matches!(
            result,
            Err(Error::BufferTooSmall {
                needed: 9,
                capacity: 8
            })
        ));
    }

    #[test]
    fn test_primitive_reads_are_big_endian() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01];
        let mut source = source_over(&data, 16);
        assert_eq!(source.read_u16().unwrap(), 0x1234);
        assert_eq!(source.read_u32().unwrap(), 0x5678_9abc);
        assert_eq!(source.read_u8().unwrap(), 0xde);
        assert_eq!(source.read_i16().unwrap(), -0x0f_ff); // 0xf001
    }

    #[test]
    fn test_refill_compacts_across_buffer_boundary() {
        // Misaligned reads through a 16-byte buffer force compaction with
        // unread bytes still in flight.
        let data: Vec<u8> = (0..36).collect();
        let mut source = source_over(&data, 9);
        assert_eq!(source.read_u32().unwrap(), 0x0001_0203);
        for chunk in 0..4 {
            let value = source.read_u64().unwrap();
            let expected = u64::from_be_bytes(std::array::from_fn(|i| (4 + chunk * 8 + i) as u8));
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut source = source_over(&[0x2a, 0x2b], 16);
        assert_eq!(source.peek_u8().unwrap(), 0x2a);
        assert_eq!(source.peek_u8().unwrap(), 0x2a);
        assert_eq!(source.read_u8().unwrap(), 0x2a);
        assert_eq!(source.peek_u8().unwrap(), 0x2b);
    }

    #[test]
    fn test_eof_reports_missing_bytes() {
        let mut source = source_over(&[0x01, 0x02], 16);
        assert!(matches!(
            source.read_u64(),
            Err(Error::EndOfInput { needed: 6 })
        ));
    }

    #[test]
    fn test_ensure_beyond_capacity_is_fatal() {
        let mut source = source_over(&[0u8; 64], 16);
        assert!(matches!(
            source.ensure_remaining(17),
            Err(Error::BufferTooSmall {
                needed: 17,
                capacity: 16
            })
        ));
    }

    #[test]
    fn test_read_exact_into_spans_buffer_and_channel() {
        let data: Vec<u8> = (0..100).collect();
        let mut source = source_over(&data, 16);
        source.ensure_remaining(10).unwrap();
        let mut dst = vec![0u8; 100];
        source.read_exact_into(&mut dst).unwrap();
        assert_eq!(dst, data);
    }

    #[test]
    fn test_skip_crosses_refills() {
        let data: Vec<u8> = (0..100).collect();
        let mut source = source_over(&data, 16);
        source.skip(97).unwrap();
        assert_eq!(source.read_u8().unwrap(), 97);
        assert!(matches!(source.skip(10), Err(Error::EndOfInput { .. })));
    }
}
