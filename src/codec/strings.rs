//! UTF-8 string decoding and identifier interning
//!
//! String payloads may exceed the source buffer, so decoding walks the
//! readable region in chunks and carries sequences split across refills.
//! Identifiers are short, frequently repeated strings; a bounded per-reader
//! cache interns their decoded form.

use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3Builder;

use super::error::{Error, Result};
use crate::io::MessageSource;

/// Longest UTF-8 sequence; a refill must deliver at least this many bytes
/// to guarantee progress past a split sequence.
const MAX_SEQUENCE_LENGTH: usize = 4;

/// Decode exactly `byte_len` UTF-8 bytes from `source`, appending to `out`.
///
/// Malformed input fails with [`Error::InvalidUtf8`] carrying the exact
/// byte offset within the string payload. A sequence truncated by the end
/// of the payload is malformed at the offset where it starts.
pub(crate) fn decode_utf8_into<R: Read>(
    source: &mut MessageSource<R>,
    byte_len: usize,
    out: &mut String,
) -> Result<()> {
    let mut consumed = 0usize;
    while consumed < byte_len {
        let left = byte_len - consumed;
        let min_needed = left.min(MAX_SEQUENCE_LENGTH).min(source.capacity());
        if source.remaining() < min_needed {
            source.ensure_remaining(min_needed)?;
        }
        let avail = source.remaining().min(left);
        let chunk = &source.readable()[..avail];
        match std::str::from_utf8(chunk) {
            Ok(text) => {
                out.push_str(text);
                source.consume(avail);
                consumed += avail;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                if err.error_len().is_some() || avail == left {
                    return Err(Error::InvalidUtf8 {
                        offset: consumed + valid,
                    });
                }
                if valid == 0 {
                    // The whole chunk is one incomplete sequence; refill
                    // until the rest of it arrives.
                    source.ensure_remaining((avail + 1).min(left).min(source.capacity()))?;
                    continue;
                }
                // from_utf8 guarantees chunk[..valid] is valid; the error
                // arm is unreachable but keeps this path free of unsafe.
                match std::str::from_utf8(&chunk[..valid]) {
                    Ok(text) => out.push_str(text),
                    Err(_) => {
                        return Err(Error::InvalidUtf8 { offset: consumed });
                    }
                }
                source.consume(valid);
                consumed += valid;
            }
        }
    }
    Ok(())
}

/// Bounded cache interning decoded identifier strings.
///
/// Eviction is oldest-first; boundedness is the only contract. Hashing uses
/// xxh3, which is fast on the short byte keys identifiers produce.
pub(crate) struct IdentifierCache {
    entries: HashSet<Arc<str>, Xxh3Builder>,
    order: VecDeque<Arc<str>>,
    max_entries: usize,
}

impl IdentifierCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: HashSet::with_hasher(Xxh3Builder::new()),
            order: VecDeque::new(),
            max_entries,
        }
    }

    /// Return the interned form of `text`, inserting it on first sight.
    ///
    /// A zero-capacity cache degrades to plain allocation.
    pub(crate) fn intern(&mut self, text: &str) -> Arc<str> {
        if self.max_entries == 0 {
            return Arc::from(text);
        }
        if let Some(found) = self.entries.get(text) {
            return Arc::clone(found);
        }
        if self.entries.len() >= self.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&*oldest);
            }
        }
        let interned: Arc<str> = Arc::from(text);
        self.entries.insert(Arc::clone(&interned));
        self.order.push_back(Arc::clone(&interned));
        interned
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BufferAllocator;

    fn decode(data: &[u8], capacity: usize) -> Result<String> {
        let allocator = BufferAllocator::unpooled();
        let mut source = MessageSource::with_capacity(data, &allocator, capacity).unwrap();
        let mut out = String::new();
        decode_utf8_into(&mut source, data.len(), &mut out).map(|()| out)
    }

    #[test]
    fn test_ascii_decodes_across_refills() {
        let text = "a".repeat(100);
        assert_eq!(decode(text.as_bytes(), 9).unwrap(), text);
    }

    #[test]
    fn test_multibyte_sequence_split_across_refills() {
        // Three-byte sequences through a 16-byte buffer land on every
        // possible split offset.
        let text = "\u{20ac}".repeat(40);
        assert_eq!(decode(text.as_bytes(), 9).unwrap(), text);
        let text = "héllo wörld \u{1f980} end".repeat(5);
        assert_eq!(decode(text.as_bytes(), 9).unwrap(), text);
    }

    #[test]
    fn test_invalid_byte_reports_offset() {
        let mut data = b"abcd".to_vec();
        data.push(0xff);
        data.extend_from_slice(b"ef");
        assert!(matches!(
            decode(&data, 64),
            Err(Error::InvalidUtf8 { offset: 4 })
        ));
    }

    #[test]
    fn test_truncated_sequence_reports_offset() {
        // A four-byte sequence cut short by the payload end.
        let mut data = b"ab".to_vec();
        data.extend_from_slice(&[0xf0, 0x9f]);
        assert!(matches!(
            decode(&data, 64),
            Err(Error::InvalidUtf8 { offset: 2 })
        ));
    }

    #[test]
    fn test_intern_returns_shared_string() {
        let mut cache = IdentifierCache::new(16);
        let first = cache.intern("name");
        let second = cache.intern("name");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_is_bounded() {
        let mut cache = IdentifierCache::new(4);
        for i in 0..20 {
            cache.intern(&format!("id{i}"));
        }
        assert_eq!(cache.len(), 4);
        // Recently inserted entries survive.
        let kept = cache.intern("id19");
        let again = cache.intern("id19");
        assert!(Arc::ptr_eq(&kept, &again));
    }
}
