//! The storage core: normalization, tree accumulation, series entry points
//!
//! Data flow on ingest: a [`types::Profile`](crate::types::Profile) arrives →
//! the [`normalizer`] interns its entities → a temporary [`profile_tree`] is
//! built from the normalized samples → the profile tree is merged into the
//! [`series_tree`] at the current sample index, and the metadata columns get
//! one entry each → the index advances.
//!
//! Data flow on read: [`series::ProfileSeries::iter`] snapshots the series
//! tree into an iterator tree and advances all chunk iterators in lock-step,
//! one appended sample per step.

pub mod normalizer;
pub mod profile_tree;
pub mod series;
pub mod series_tree;

pub use normalizer::Normalizer;
pub use profile_tree::{ProfileTree, ProfileTreeNode, ProfileValue};
pub use series::{InstantNode, InstantProfile, InstantValue, ProfileSeries, SeriesIterator};
pub use series_tree::{NodeId, SeriesTree, SeriesTreeNode, ValueColumn};
