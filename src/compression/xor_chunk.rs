//! Sparse-addressed XOR-compressed int64 column
//!
//! An [`XorChunk`] stores a sparse sequence of `i64` values addressed by a
//! 16-bit logical index. Value payloads use Gorilla-style XOR compression
//! over the value's two's-complement bit pattern; consecutive samples of a
//! profile node usually differ in only a few low bits, so most entries
//! collapse to a handful of bits:
//!
//! ```text
//! Value 1: 42_000_131  (as bits: 0x0000...0283)
//! Value 2: 42_000_179  (as bits: 0x0000...02B3)
//! XOR:                           0x0000...0030  <- few meaningful bits
//! ```
//!
//! In front of each value payload the entry records the logical index it was
//! appended at, delta-encoded against the previous written index. Iteration
//! walks logical indices `0..=last_written` and yields 0 wherever the chunk
//! holds no entry, which is what lets a column created at sample index `i`
//! report zeros for all earlier samples without back-filling.
//!
//! # Encoding
//!
//! Entry 0: 16-bit raw index, 64-bit raw value.
//!
//! Entry k>0, index part (`d` = index − previous index):
//! - `0`: d = 1 (consecutive appends, the common case)
//! - `10` + 7 bits: d in [2, 129]
//! - `11` + 16 bits: raw d
//!
//! Entry k>0, value part (`xor` = previous bits ^ current bits):
//! - `0`: value unchanged (xor == 0)
//! - `10` + meaningful bits: leading/trailing zero window unchanged
//! - `11` + 5-bit leading count + 6-bit length (64 encoded as 0) + bits
//!
//! # References
//!
//! - Paper: "Gorilla: A Fast, Scalable, In-Memory Time Series Database"
//! - URL: <http://www.vldb.org/pvldb/vol8/p1816-teller.pdf>

use super::bit_stream::{BitBuf, BitReader};
use crate::error::ChunkError;

/// Sentinel for "no XOR window established yet"; real leading-zero counts
/// never exceed 64.
const NO_WINDOW: u32 = 0xFF;

/// Encoder state captured before an entry is written, so that an append at
/// the same logical index can rewind and re-encode.
#[derive(Debug, Clone, Copy)]
struct SavedState {
    bit_len: usize,
    num_entries: u16,
    last_index: u16,
    prev_value: u64,
    leading: u32,
    trailing: u32,
}

/// Compressed, sparsely indexed column of int64 values
#[derive(Debug, Clone)]
pub struct XorChunk {
    stream: BitBuf,
    num_entries: u16,
    last_index: u16,
    prev_value: u64,
    leading: u32,
    trailing: u32,
    saved: Option<SavedState>,
}

impl Default for XorChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl XorChunk {
    /// Create an empty chunk
    pub fn new() -> Self {
        Self {
            stream: BitBuf::new(),
            num_entries: 0,
            last_index: 0,
            prev_value: 0,
            leading: NO_WINDOW,
            trailing: 0,
            saved: None,
        }
    }

    /// Number of entries written to the chunk
    pub fn num_entries(&self) -> u16 {
        self.num_entries
    }

    /// Whether the chunk holds no entries
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// The highest logical index written so far; meaningless while empty
    pub fn last_index(&self) -> u16 {
        self.last_index
    }

    /// Size of the encoded stream in bytes
    pub fn byte_len(&self) -> usize {
        self.stream.byte_len()
    }

    /// Open an appender for this chunk
    ///
    /// # Errors
    ///
    /// `ChunkError::Encoding` is part of the contract for callers; the
    /// current encoder cannot fail to open.
    pub fn appender(&mut self) -> Result<XorAppender<'_>, ChunkError> {
        Ok(XorAppender { chunk: self })
    }

    /// Open an iterator over the chunk
    ///
    /// The iterator captures the current entry count and stream length;
    /// entries appended afterwards are invisible to it.
    pub fn iter(&self) -> XorChunkIterator<'_> {
        XorChunkIterator {
            reader: BitReader::new(self.stream.bytes(), self.stream.bit_len()),
            entries_total: self.num_entries,
            entries_read: 0,
            last_index: self.last_index,
            started: false,
            pos: 0,
            pending: None,
            cur: 0,
            prev_value: 0,
            last_decoded_index: 0,
            leading: 0,
            trailing: 0,
        }
    }

    fn save(&mut self) {
        self.saved = Some(SavedState {
            bit_len: self.stream.bit_len(),
            num_entries: self.num_entries,
            last_index: self.last_index,
            prev_value: self.prev_value,
            leading: self.leading,
            trailing: self.trailing,
        });
    }

    fn restore(&mut self) {
        // Only called with a saved state present: overwrites require at
        // least one prior entry, and every entry write saves first.
        let s = self.saved.take().unwrap_or(SavedState {
            bit_len: 0,
            num_entries: 0,
            last_index: 0,
            prev_value: 0,
            leading: NO_WINDOW,
            trailing: 0,
        });
        self.stream.truncate(s.bit_len);
        self.num_entries = s.num_entries;
        self.last_index = s.last_index;
        self.prev_value = s.prev_value;
        self.leading = s.leading;
        self.trailing = s.trailing;
    }

    fn write_entry(&mut self, index: u16, value: i64) {
        self.save();

        let bits = value as u64;
        if self.num_entries == 0 {
            self.stream.write_bits(index as u64, 16);
            self.stream.write_bits(bits, 64);
        } else {
            let delta = index - self.last_index;
            match delta {
                1 => self.stream.write_bit(false),
                2..=129 => {
                    self.stream.write_bits(0b10, 2);
                    self.stream.write_bits((delta - 2) as u64, 7);
                }
                _ => {
                    self.stream.write_bits(0b11, 2);
                    self.stream.write_bits(delta as u64, 16);
                }
            }
            self.write_value(bits);
        }

        self.prev_value = bits;
        self.last_index = index;
        self.num_entries += 1;
    }

    fn write_value(&mut self, bits: u64) {
        let xor = self.prev_value ^ bits;

        if xor == 0 {
            self.stream.write_bit(false);
            return;
        }
        self.stream.write_bit(true);

        let leading = xor.leading_zeros().min(31);
        let trailing = xor.trailing_zeros();

        if self.leading != NO_WINDOW && leading >= self.leading && trailing >= self.trailing {
            // The changed bits fit the established window.
            self.stream.write_bit(false);
            let meaningful = 64 - self.leading - self.trailing;
            self.stream.write_bits(xor >> self.trailing, meaningful as u8);
        } else {
            self.stream.write_bit(true);
            self.stream.write_bits(leading as u64, 5);
            let meaningful = 64 - leading - trailing;
            // meaningful is in 1..=64; 64 does not fit into 6 bits and is
            // encoded as 0. A zero-length payload cannot occur since xor != 0.
            self.stream.write_bits((meaningful & 0x3F) as u64, 6);
            self.stream.write_bits(xor >> trailing, meaningful as u8);
            self.leading = leading;
            self.trailing = trailing;
        }
    }
}

/// Appender writing values into an [`XorChunk`] at ascending logical indices
pub struct XorAppender<'a> {
    chunk: &'a mut XorChunk,
}

impl XorAppender<'_> {
    /// Append `value` at logical `index`
    ///
    /// `index` must be greater than or equal to the last written index. An
    /// equal index overwrites the last entry by rewinding the stream to the
    /// state before it was written.
    ///
    /// # Errors
    ///
    /// `ChunkError::OutOfOrder` when `index` is strictly smaller than the
    /// last written index.
    pub fn append_at(&mut self, index: u16, value: i64) -> Result<(), ChunkError> {
        let c = &mut *self.chunk;
        if c.num_entries > 0 {
            if index < c.last_index {
                return Err(ChunkError::OutOfOrder {
                    index,
                    last: c.last_index,
                });
            }
            if index == c.last_index {
                c.restore();
            }
        }
        c.write_entry(index, value);
        Ok(())
    }
}

/// Lock-step iterator over the logical indices of an [`XorChunk`]
///
/// Advances one logical index per `next()` call from 0 through the last
/// written index inclusive, yielding 0 for indices without an entry. `at()`
/// before the first `next()` returns 0.
#[derive(Debug, Clone)]
pub struct XorChunkIterator<'a> {
    reader: BitReader<'a>,
    entries_total: u16,
    entries_read: u16,
    last_index: u16,
    started: bool,
    pos: u16,
    pending: Option<(u16, i64)>,
    cur: i64,
    prev_value: u64,
    last_decoded_index: u16,
    leading: u32,
    trailing: u32,
}

impl XorChunkIterator<'_> {
    /// Advance to the next logical index; `false` once past the last
    /// written index (or immediately for an empty chunk)
    pub fn next(&mut self) -> bool {
        if self.entries_total == 0 {
            self.cur = 0;
            return false;
        }
        if !self.started {
            self.started = true;
            self.pos = 0;
        } else {
            if self.pos >= self.last_index {
                self.cur = 0;
                return false;
            }
            self.pos += 1;
        }

        if self.pending.is_none() && self.entries_read < self.entries_total {
            self.pending = self.decode_entry();
        }

        match self.pending {
            Some((index, value)) if index == self.pos => {
                self.cur = value;
                self.pending = None;
            }
            _ => self.cur = 0,
        }
        true
    }

    /// The value at the current logical index
    pub fn at(&self) -> i64 {
        self.cur
    }

    fn decode_entry(&mut self) -> Option<(u16, i64)> {
        let (index, bits) = if self.entries_read == 0 {
            let index = self.reader.read_bits(16)? as u16;
            let bits = self.reader.read_bits(64)?;
            (index, bits)
        } else {
            let delta = if !self.reader.read_bit()? {
                1
            } else if !self.reader.read_bit()? {
                self.reader.read_bits(7)? as u16 + 2
            } else {
                self.reader.read_bits(16)? as u16
            };
            let bits = self.decode_value()?;
            (self.last_decoded_index + delta, bits)
        };
        self.prev_value = bits;
        self.entries_read += 1;
        self.last_decoded_index = index;
        Some((index, bits as i64))
    }

    fn decode_value(&mut self) -> Option<u64> {
        if !self.reader.read_bit()? {
            // Value unchanged.
            return Some(self.prev_value);
        }
        let xor = if !self.reader.read_bit()? {
            let meaningful = 64 - self.leading - self.trailing;
            self.reader.read_bits(meaningful as u8)? << self.trailing
        } else {
            let leading = self.reader.read_bits(5)? as u32;
            let mut meaningful = self.reader.read_bits(6)? as u32;
            if meaningful == 0 {
                meaningful = 64;
            }
            let trailing = 64 - leading - meaningful;
            self.leading = leading;
            self.trailing = trailing;
            self.reader.read_bits(meaningful as u8)? << trailing
        };
        Some(self.prev_value ^ xor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunk: &XorChunk) -> Vec<i64> {
        let mut out = Vec::new();
        let mut it = chunk.iter();
        while it.next() {
            out.push(it.at());
        }
        out
    }

    #[test]
    fn test_empty_chunk_iterates_nothing() {
        let chunk = XorChunk::new();
        let mut it = chunk.iter();
        assert_eq!(it.at(), 0);
        assert!(!it.next());
        assert_eq!(it.at(), 0);
    }

    #[test]
    fn test_dense_round_trip() {
        let values = [5i64, 5, 7, -3, 0, 1_000_000, i64::MIN, i64::MAX, 42];
        let mut chunk = XorChunk::new();
        let mut app = chunk.appender().unwrap();
        for (i, v) in values.iter().enumerate() {
            app.append_at(i as u16, *v).unwrap();
        }
        assert_eq!(collect(&chunk), values);
    }

    #[test]
    fn test_sparse_gaps_yield_zero() {
        let mut chunk = XorChunk::new();
        let mut app = chunk.appender().unwrap();
        app.append_at(1, 10).unwrap();
        app.append_at(4, 20).unwrap();
        app.append_at(5, 30).unwrap();

        // Index 0 precedes the first entry; 2 and 3 fall into a gap.
        assert_eq!(collect(&chunk), vec![0, 10, 0, 0, 20, 30]);
    }

    #[test]
    fn test_first_entry_at_high_index() {
        let mut chunk = XorChunk::new();
        chunk.appender().unwrap().append_at(1000, 7).unwrap();

        let got = collect(&chunk);
        assert_eq!(got.len(), 1001);
        assert!(got[..1000].iter().all(|v| *v == 0));
        assert_eq!(got[1000], 7);
    }

    #[test]
    fn test_large_index_delta() {
        let mut chunk = XorChunk::new();
        let mut app = chunk.appender().unwrap();
        app.append_at(0, 1).unwrap();
        app.append_at(60_000, 2).unwrap();

        let got = collect(&chunk);
        assert_eq!(got.len(), 60_001);
        assert_eq!(got[0], 1);
        assert_eq!(got[60_000], 2);
        assert_eq!(got[1..60_000].iter().sum::<i64>(), 0);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut chunk = XorChunk::new();
        let mut app = chunk.appender().unwrap();
        app.append_at(5, 1).unwrap();
        let err = app.append_at(4, 2).unwrap_err();
        assert!(matches!(err, ChunkError::OutOfOrder { index: 4, last: 5 }));

        // The chunk is unchanged by the rejected append.
        assert_eq!(collect(&chunk), vec![0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_equal_index_overwrites_last() {
        let mut chunk = XorChunk::new();
        let mut app = chunk.appender().unwrap();
        app.append_at(0, 1).unwrap();
        app.append_at(2, 5).unwrap();
        app.append_at(2, 9).unwrap();
        assert_eq!(chunk.num_entries(), 2);
        assert_eq!(collect(&chunk), vec![1, 0, 9]);
    }

    #[test]
    fn test_overwrite_sole_entry() {
        let mut chunk = XorChunk::new();
        let mut app = chunk.appender().unwrap();
        app.append_at(3, 5).unwrap();
        app.append_at(3, -5).unwrap();
        app.append_at(3, 11).unwrap();
        assert_eq!(chunk.num_entries(), 1);
        assert_eq!(collect(&chunk), vec![0, 0, 0, 11]);
    }

    #[test]
    fn test_appends_after_iterator_creation_are_invisible() {
        let mut chunk = XorChunk::new();
        chunk.appender().unwrap().append_at(0, 1).unwrap();

        let mut it = chunk.iter();
        let later = {
            let mut c2 = chunk.clone();
            c2.appender().unwrap().append_at(1, 2).unwrap();
            c2
        };
        // The original iterator still sees a single entry.
        assert!(it.next());
        assert_eq!(it.at(), 1);
        assert!(!it.next());

        assert_eq!(collect(&later), vec![1, 2]);
    }

    #[test]
    fn test_compresses_similar_values() {
        let mut chunk = XorChunk::new();
        let mut app = chunk.appender().unwrap();
        for i in 0..1000u16 {
            app.append_at(i, 1_000_000 + (i % 4) as i64).unwrap();
        }
        // 1000 raw values would be 8000 bytes plus framing.
        assert!(chunk.byte_len() < 5000, "got {} bytes", chunk.byte_len());
    }

    #[test]
    fn fuzzy_random_sparse_round_trip() {
        use rand::Rng;

        let mut rng = rand::rng();
        for _ in 0..200 {
            let mut chunk = XorChunk::new();
            let mut model = std::collections::BTreeMap::new();
            let mut index: u16 = rng.random_range(0..4);
            {
                let mut app = chunk.appender().unwrap();
                for _ in 0..rng.random_range(1..64) {
                    let value: i64 = if rng.random_bool(0.5) {
                        rng.random_range(-100..100)
                    } else {
                        rng.random()
                    };
                    app.append_at(index, value).unwrap();
                    model.insert(index, value);
                    if index > u16::MAX - 40 {
                        break;
                    }
                    // Zero step exercises the overwrite path.
                    index += rng.random_range(0..40);
                }
            }

            let last = *model.keys().next_back().unwrap();
            let expected: Vec<i64> = (0..=last)
                .map(|i| model.get(&i).copied().unwrap_or(0))
                .collect();
            assert_eq!(collect(&chunk), expected);
        }
    }
}
