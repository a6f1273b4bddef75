//! Sparse-addressed delta-compressed int64 column
//!
//! A [`DeltaChunk`] stores the series-level metadata columns (timestamps,
//! durations, periods). These move by near-constant steps, so each entry
//! stores the difference to the previous value, bucket-encoded with a
//! variable-length prefix:
//!
//! ```text
//! Timestamps:  1000, 1010, 1020, 1030
//! Deltas:            10,   10,   10    <- a handful of bits each
//! ```
//!
//! Entries share the index framing of the XOR chunk: a 16-bit raw index for
//! the first entry, then the index delta to the previous written entry.
//! Iteration is sparse-aware and yields 0 for unwritten indices, though in
//! practice the series appends these columns at every sample index.
//!
//! # Value encoding
//!
//! - `0`: delta = 0
//! - `10` + 7 bits: delta in [-63, 64)
//! - `110` + 9 bits: delta in [-255, 256)
//! - `1110` + 12 bits: delta in [-2047, 2048)
//! - `11110` + 32 bits: delta fits an i32
//! - `11111` + 64 bits: raw delta

use super::bit_stream::{BitBuf, BitReader};
use crate::error::ChunkError;

#[derive(Debug, Clone, Copy)]
struct SavedState {
    bit_len: usize,
    num_entries: u16,
    last_index: u16,
    prev_value: i64,
}

/// Delta-compressed, sparsely indexed column of int64 values
#[derive(Debug, Clone, Default)]
pub struct DeltaChunk {
    stream: BitBuf,
    num_entries: u16,
    last_index: u16,
    prev_value: i64,
    saved: Option<SavedState>,
}

impl DeltaChunk {
    /// Create an empty chunk
    pub fn new() -> Self {
        Self::default()
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
    pub fn appender(&mut self) -> Result<DeltaAppender<'_>, ChunkError> {
        Ok(DeltaAppender { chunk: self })
    }

    /// Open an iterator capturing the current entry count and stream length
    pub fn iter(&self) -> DeltaChunkIterator<'_> {
        DeltaChunkIterator {
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
        }
    }

    fn save(&mut self) {
        self.saved = Some(SavedState {
            bit_len: self.stream.bit_len(),
            num_entries: self.num_entries,
            last_index: self.last_index,
            prev_value: self.prev_value,
        });
    }

    fn restore(&mut self) {
        let s = self.saved.take().unwrap_or(SavedState {
            bit_len: 0,
            num_entries: 0,
            last_index: 0,
            prev_value: 0,
        });
        self.stream.truncate(s.bit_len);
        self.num_entries = s.num_entries;
        self.last_index = s.last_index;
        self.prev_value = s.prev_value;
    }

    fn write_entry(&mut self, index: u16, value: i64) {
        self.save();

        if self.num_entries == 0 {
            self.stream.write_bits(index as u64, 16);
            self.stream.write_bits(value as u64, 64);
        } else {
            let index_delta = index - self.last_index;
            match index_delta {
                1 => self.stream.write_bit(false),
                2..=129 => {
                    self.stream.write_bits(0b10, 2);
                    self.stream.write_bits((index_delta - 2) as u64, 7);
                }
                _ => {
                    self.stream.write_bits(0b11, 2);
                    self.stream.write_bits(index_delta as u64, 16);
                }
            }

            let delta = value.wrapping_sub(self.prev_value);
            if delta == 0 {
                self.stream.write_bit(false);
            } else if (-63..64).contains(&delta) {
                self.stream.write_bits(0b10, 2);
                self.stream.write_bits((delta + 63) as u64 & 0x7F, 7);
            } else if (-255..256).contains(&delta) {
                self.stream.write_bits(0b110, 3);
                self.stream.write_bits((delta + 255) as u64 & 0x1FF, 9);
            } else if (-2047..2048).contains(&delta) {
                self.stream.write_bits(0b1110, 4);
                self.stream.write_bits((delta + 2047) as u64 & 0xFFF, 12);
            } else if i32::try_from(delta).is_ok() {
                self.stream.write_bits(0b11110, 5);
                self.stream.write_bits(delta as u32 as u64, 32);
            } else {
                self.stream.write_bits(0b11111, 5);
                self.stream.write_bits(delta as u64, 64);
            }
        }

        self.prev_value = value;
        self.last_index = index;
        self.num_entries += 1;
    }
}

/// Appender writing values into a [`DeltaChunk`] at ascending logical indices
pub struct DeltaAppender<'a> {
    chunk: &'a mut DeltaChunk,
}

impl DeltaAppender<'_> {
    /// Append `value` at logical `index`
    ///
    /// Same contract as the XOR appender: an equal index overwrites the last
    /// entry, a smaller one fails.
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

/// Lock-step iterator over the logical indices of a [`DeltaChunk`]
#[derive(Debug, Clone)]
pub struct DeltaChunkIterator<'a> {
    reader: BitReader<'a>,
    entries_total: u16,
    entries_read: u16,
    last_index: u16,
    started: bool,
    pos: u16,
    pending: Option<(u16, i64)>,
    cur: i64,
    prev_value: i64,
    last_decoded_index: u16,
}

impl DeltaChunkIterator<'_> {
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
        let (index, value) = if self.entries_read == 0 {
            let index = self.reader.read_bits(16)? as u16;
            let value = self.reader.read_bits(64)? as i64;
            (index, value)
        } else {
            let index_delta = if !self.reader.read_bit()? {
                1
            } else if !self.reader.read_bit()? {
                self.reader.read_bits(7)? as u16 + 2
            } else {
                self.reader.read_bits(16)? as u16
            };

            let delta = if !self.reader.read_bit()? {
                0
            } else if !self.reader.read_bit()? {
                self.reader.read_bits(7)? as i64 - 63
            } else if !self.reader.read_bit()? {
                self.reader.read_bits(9)? as i64 - 255
            } else if !self.reader.read_bit()? {
                self.reader.read_bits(12)? as i64 - 2047
            } else if !self.reader.read_bit()? {
                self.reader.read_bits(32)? as u32 as i32 as i64
            } else {
                self.reader.read_bits(64)? as i64
            };

            (
                self.last_decoded_index + index_delta,
                self.prev_value.wrapping_add(delta),
            )
        };
        self.prev_value = value;
        self.entries_read += 1;
        self.last_decoded_index = index;
        Some((index, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunk: &DeltaChunk) -> Vec<i64> {
        let mut out = Vec::new();
        let mut it = chunk.iter();
        while it.next() {
            out.push(it.at());
        }
        out
    }

    #[test]
    fn test_dense_round_trip() {
        let values = [
            1_700_000_000_000i64,
            1_700_000_010_000,
            1_700_000_020_000,
            1_700_000_020_001,
            1_699_999_999_999, // negative delta
            0,
            i64::MIN,
            i64::MAX,
        ];
        let mut chunk = DeltaChunk::new();
        let mut app = chunk.appender().unwrap();
        for (i, v) in values.iter().enumerate() {
            app.append_at(i as u16, *v).unwrap();
        }
        assert_eq!(collect(&chunk), values);
    }

    #[test]
    fn test_regular_intervals_compress_well() {
        let mut chunk = DeltaChunk::new();
        let mut app = chunk.appender().unwrap();
        for i in 0..1000u16 {
            app.append_at(i, 1_700_000_000_000 + i as i64 * 10).unwrap();
        }
        // A constant 10 ms step fits the 7-bit bucket: ~10 bits per entry
        // against 80 for the raw encoding.
        assert!(chunk.byte_len() < 1500, "got {} bytes", chunk.byte_len());
    }

    #[test]
    fn test_zero_delta_single_bit_path() {
        let mut chunk = DeltaChunk::new();
        let mut app = chunk.appender().unwrap();
        for i in 0..100u16 {
            app.append_at(i, 19_000_000).unwrap();
        }
        assert_eq!(collect(&chunk), vec![19_000_000; 100]);
        assert!(chunk.byte_len() < 50);
    }

    #[test]
    fn test_sparse_and_overwrite() {
        let mut chunk = DeltaChunk::new();
        let mut app = chunk.appender().unwrap();
        app.append_at(2, 100).unwrap();
        app.append_at(4, 200).unwrap();
        app.append_at(4, 250).unwrap();
        drop(app);
        assert_eq!(collect(&chunk), vec![0, 0, 100, 0, 250]);

        let mut app = chunk.appender().unwrap();
        let err = app.append_at(3, 1).unwrap_err();
        assert!(matches!(err, ChunkError::OutOfOrder { index: 3, last: 4 }));
    }

    #[test]
    fn fuzzy_random_round_trip() {
        use rand::Rng;

        let mut rng = rand::rng();
        for _ in 0..200 {
            let mut chunk = DeltaChunk::new();
            let mut expected = Vec::new();
            let count = rng.random_range(1..128);
            let mut app = chunk.appender().unwrap();
            for i in 0..count {
                let value: i64 = if rng.random_bool(0.7) {
                    rng.random_range(-5000..5000)
                } else {
                    rng.random()
                };
                app.append_at(i, value).unwrap();
                expected.push(value);
            }
            assert_eq!(collect(&chunk), expected);
        }
    }
}
