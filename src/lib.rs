//! profiledb - In-memory columnar storage for continuous-profiling series
//!
//! This library provides the storage core of a continuous-profiling system:
//! - Normalization of pprof-shaped profiles into a dense per-series
//!   identifier space, folding ASLR-shifted captures
//! - A merged series tree accumulating values column-wise, one compressed
//!   chunk per tree node and value dimension
//! - Gorilla-style XOR and delta chunk codecs with sparse 16-bit index
//!   addressing
//! - Lock-step iteration reconstructing a full profile tree per appended
//!   sample
//!
//! The core is an in-process, single-series-at-a-time append-and-scan
//! engine. Coordination across series, persistence and the upload path
//! belong to higher layers.
//!
//! # Example
//!
//! ```rust
//! use profiledb::{Profile, ProfileSeries};
//!
//! # fn example(profile: Profile) -> profiledb::Result<()> {
//! let mut series = ProfileSeries::new();
//! series.append(&profile)?;
//!
//! let mut it = series.iter();
//! while it.next() {
//!     let instant = it.at();
//!     let meta = instant.profile_meta();
//!     let root = instant.profile_tree();
//!     println!("{}: total {}", meta.timestamp, root.cumulative_value());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compression;
pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod symbolizer;
pub mod types;

// Re-export main types
pub use error::{ChunkError, Error, Result};
pub use storage::{InstantNode, InstantProfile, ProfileSeries, SeriesIterator};
pub use types::{InstantProfileMeta, Profile, Sample, ValueType};

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_sanity() {
        assert_eq!(2 + 2, 4);
    }
}
