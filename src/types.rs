//! Core data types used throughout the profiling storage engine
//!
//! This module defines the fundamental data structures shared across the
//! system:
//!
//! # Key Types
//!
//! - **`Profile`**: A fully parsed stack-profile record, as handed over by an
//!   upstream pprof decoder. This is the unit of ingestion.
//! - **`Mapping`** / **`Function`** / **`Location`** / **`Line`**: The profile
//!   entities. Inside a `Profile` they carry the decoder's identifier
//!   namespace; after normalization they carry dense per-series identifiers.
//! - **`Sample`**: A single stack trace with labels and measured values.
//! - **`ValueType`**: A `(type, unit)` pair naming a numeric dimension, e.g.
//!   `("cpu", "nanoseconds")`.
//! - **`InstantProfileMeta`**: The per-timestamp metadata reconstructed
//!   during iteration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A numeric dimension identified by a type and a unit
///
/// # Example
///
/// ```rust
/// use profiledb::types::ValueType;
///
/// let vt = ValueType::new("cpu", "nanoseconds");
/// assert_eq!(vt.to_string(), "cpu/nanoseconds");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType {
    /// What is being measured, e.g. `cpu` or `alloc_objects`
    pub type_: String,
    /// The unit of the measurement, e.g. `nanoseconds` or `count`
    pub unit: String,
}

impl ValueType {
    /// Create a new value type from string-likes
    pub fn new(type_: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            unit: unit.into(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_, self.unit)
    }
}

/// A contiguous executable memory region (program text or shared library)
///
/// `id` is `0` inside an ingested [`Profile`] if the decoder did not assign
/// one; after normalization ids are dense `1..=N` in insertion order within
/// the series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Identifier within its namespace (source profile or series)
    pub id: u64,
    /// First address of the mapped segment
    pub start: u64,
    /// Address one past the last address of the segment
    pub limit: u64,
    /// File offset the segment was mapped from
    pub offset: u64,
    /// Path of the mapped object file
    pub file: String,
    /// Opaque hash identifying the executable image
    pub build_id: String,
    /// Whether the object file supports function names
    pub has_functions: bool,
    /// Whether the object file supports file names
    pub has_filenames: bool,
    /// Whether the object file supports line numbers
    pub has_line_numbers: bool,
    /// Whether the object file supports inlined functions
    pub has_inline_frames: bool,
}

impl Mapping {
    /// Whether this mapping can never be symbolized: neither a build id nor
    /// a file name is available to associate debug info with.
    pub fn is_fake(&self) -> bool {
        self.build_id.is_empty() && self.file.is_empty()
    }
}

/// A source-level function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// Identifier within its namespace (source profile or series)
    pub id: u64,
    /// Demangled name
    pub name: String,
    /// Name as it appears in the symbol table
    pub system_name: String,
    /// Source file defining the function
    pub filename: String,
    /// Line of the function's definition
    pub start_line: i64,
}

/// A source line attributed to a location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// Function the line belongs to; references the profile's or series's
    /// function namespace
    pub function_id: u64,
    /// Line number
    pub line: i64,
}

/// An address within a mapping, optionally with resolved source lines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Identifier within its namespace (source profile or series)
    pub id: u64,
    /// Mapping the address falls into; `0` means no mapping
    pub mapping_id: u64,
    /// Instruction address
    pub address: u64,
    /// Resolved source lines, innermost inlined call first. Empty until
    /// symbolization runs.
    pub lines: Vec<Line>,
    /// Whether multiple symbols were folded into this location
    pub is_folded: bool,
}

/// A single measured stack trace
///
/// `location_ids` is ordered leaf first, exactly as produced by the profiler.
/// Only `values[0]` is read by the storage core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    /// Stack of location ids, leaf first
    pub location_ids: Vec<u64>,
    /// String labels attached to the sample
    pub labels: HashMap<String, Vec<String>>,
    /// Numeric labels attached to the sample
    pub num_labels: HashMap<String, Vec<i64>>,
    /// Units for the numeric labels, keyed like `num_labels`
    pub num_units: HashMap<String, Vec<String>>,
    /// Measured values, one per sample type
    pub values: Vec<i64>,
}

impl Sample {
    /// Whether every value channel is zero. Zero samples carry no
    /// information and are dropped during normalization.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0)
    }
}

/// A fully parsed stack-profile record following the standard pprof shape
///
/// Entity cross-references (`Sample::location_ids`, `Location::mapping_id`,
/// `Line::function_id`) point into the profile's own `locations`, `mappings`
/// and `functions` tables via their `id` fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    /// One value type per sample value channel; only the first is stored
    pub sample_types: Vec<ValueType>,
    /// The period type of the profiler configuration
    pub period_type: ValueType,
    /// The measured stack traces
    pub samples: Vec<Sample>,
    /// Executable mappings; the first entry represents the main binary
    pub mappings: Vec<Mapping>,
    /// Referenced locations
    pub locations: Vec<Location>,
    /// Referenced functions
    pub functions: Vec<Function>,
    /// Capture time in nanoseconds since the Unix epoch
    pub time_nanos: i64,
    /// Capture duration in nanoseconds
    pub duration_nanos: i64,
    /// The profiler period at capture time
    pub period: i64,
}

/// Per-timestamp profile metadata exposed during series iteration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstantProfileMeta {
    /// Period type the series was initialized with
    pub period_type: ValueType,
    /// Sample type the series was initialized with
    pub sample_type: ValueType,
    /// Capture timestamp in milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Capture duration in nanoseconds
    pub duration: i64,
    /// Profiler period
    pub period: i64,
}
