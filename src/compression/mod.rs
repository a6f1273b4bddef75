//! Chunk codecs for the per-node and per-series value columns
//!
//! Two chunk kinds share the same sparse 16-bit index addressing and the
//! same appender/iterator contract:
//!
//! - [`xor_chunk::XorChunk`] — Gorilla-style XOR compression, used for every
//!   flat and cumulative value column in the series tree
//! - [`delta_chunk::DeltaChunk`] — delta bucket compression, used for the
//!   timestamp, duration and period columns
//!
//! Appenders only move forward: an index below the last written one is an
//! error, an equal index overwrites the last entry, and gaps are legal.
//! Iterators advance one logical index at a time and yield 0 for indices
//! without an entry, which is what makes a column created late in a series's
//! life read as zero for all earlier samples.

pub mod bit_stream;
pub mod delta_chunk;
pub mod xor_chunk;

pub use delta_chunk::{DeltaAppender, DeltaChunk, DeltaChunkIterator};
pub use xor_chunk::{XorAppender, XorChunk, XorChunkIterator};
