//! Error types for the storage engine

use thiserror::Error;

/// Main error type for the storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// A profile's timestamp is not strictly greater than the series's
    /// current maximum. The profile was rejected before any series state
    /// was mutated.
    #[error("out of order sample")]
    OutOfOrderSample,

    /// A profile's period type or first sample type does not match the
    /// types the series was initialized with on its first append.
    #[error("incompatible profile: expected {expected}, got {actual}")]
    IncompatibleProfile {
        /// The value type the series was initialized with
        expected: String,
        /// The value type carried by the rejected profile
        actual: String,
    },

    /// The series has reached the maximum number of samples addressable
    /// by its 16-bit sample index.
    #[error("series capacity exceeded: {limit} samples", limit = u16::MAX)]
    CapacityExceeded,

    /// Chunk codec error
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
}

/// Chunk codec errors
#[derive(Error, Debug)]
pub enum ChunkError {
    /// An append supplied a logical index strictly smaller than the last
    /// written one. Equal indices overwrite; smaller indices are rejected.
    #[error("out of order append: index {index} < last written index {last}")]
    OutOfOrder {
        /// The rejected logical index
        index: u16,
        /// The last index written to the chunk
        last: u16,
    },

    /// The chunk could not open an appender. Kept for contract completeness;
    /// no current encoder state makes this reachable.
    #[error("failed to open appender: {0}")]
    Encoding(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
