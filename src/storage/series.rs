//! A single profiling series: append profiles, iterate instants
//!
//! [`ProfileSeries`] is the public surface of the storage core. Appending a
//! profile normalizes it into the series namespace, folds it into a fresh
//! [`ProfileTree`], merges that tree into the long-lived series tree at the
//! current sample index, writes the timestamp/duration/period columns, and
//! advances the index. Iteration snapshots the series tree into a parallel
//! iterator tree and replays one reconstructed profile per appended sample.
//!
//! A series has no internal synchronization and is single-threaded by
//! design; `append` takes `&mut self` while iterators borrow `&self`, so the
//! borrow checker enforces the serialization a higher layer would otherwise
//! have to provide. Multiple iterators may coexist freely; each owns
//! independent chunk iterator state.

use crate::compression::{DeltaChunk, DeltaChunkIterator, XorChunkIterator};
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::normalizer::Normalizer;
use crate::storage::profile_tree::ProfileTree;
use crate::storage::series_tree::{NodeId, SeriesTree};
use crate::types::{InstantProfileMeta, Profile, ValueType};
use std::collections::HashMap;
use tracing::debug;

/// In-memory, append-only storage for one logical profiling series
#[derive(Debug)]
pub struct ProfileSeries {
    period_type: Option<ValueType>,
    sample_type: Option<ValueType>,

    normalizer: Normalizer,

    min_time: i64,
    max_time: i64,
    timestamps: DeltaChunk,
    durations: DeltaChunk,
    periods: DeltaChunk,

    tree: SeriesTree,
    next_index: u16,
}

impl Default for ProfileSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileSeries {
    /// Create an empty series
    pub fn new() -> Self {
        Self {
            period_type: None,
            sample_type: None,
            normalizer: Normalizer::new(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            timestamps: DeltaChunk::new(),
            durations: DeltaChunk::new(),
            periods: DeltaChunk::new(),
            tree: SeriesTree::new(),
            next_index: 0,
        }
    }

    /// Number of samples appended so far
    pub fn num_samples(&self) -> u16 {
        self.next_index
    }

    /// Earliest appended timestamp in milliseconds; `None` while empty
    pub fn min_time(&self) -> Option<i64> {
        (self.next_index > 0).then_some(self.min_time)
    }

    /// Latest appended timestamp in milliseconds; `None` while empty
    pub fn max_time(&self) -> Option<i64> {
        (self.next_index > 0).then_some(self.max_time)
    }

    /// The series's intern tables
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Mutable access to the intern tables, for symbolization
    pub fn normalizer_mut(&mut self) -> &mut Normalizer {
        &mut self.normalizer
    }

    /// The merged series tree
    pub fn tree(&self) -> &SeriesTree {
        &self.tree
    }

    /// Append one profile to the series
    ///
    /// Validation runs before any mutation: a rejected profile leaves the
    /// series exactly as it was.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExceeded`] once the 16-bit sample index is
    ///   exhausted
    /// - [`Error::IncompatibleProfile`] when the period type or first sample
    ///   type differs from the series's
    /// - [`Error::OutOfOrderSample`] when the profile's millisecond
    ///   timestamp is not strictly greater than the series's maximum
    /// - [`Error::Chunk`] when a chunk append fails mid-merge; the series
    ///   tree may be partially updated and the series must be considered
    ///   closed
    pub fn append(&mut self, profile: &Profile) -> Result<()> {
        if self.next_index == u16::MAX {
            metrics::record_append("capacity_exceeded");
            return Err(Error::CapacityExceeded);
        }

        self.check_compatibility(profile)?;

        // Millisecond resolution, not nanos.
        let timestamp = profile.time_nanos / 1_000_000;
        if timestamp <= self.max_time {
            metrics::record_append("out_of_order");
            return Err(Error::OutOfOrderSample);
        }

        if self.period_type.is_none() {
            self.period_type = Some(profile.period_type.clone());
            self.sample_type = Some(profile.sample_types.first().cloned().unwrap_or_default());
        }

        let index = self.next_index;
        let samples = self.normalizer.normalize(profile);
        metrics::record_samples_normalized(samples.len());

        let mut profile_tree = ProfileTree::new();
        for sample in &samples {
            profile_tree.insert(sample);
        }

        self.tree.insert(index, &profile_tree)?;

        self.timestamps.appender()?.append_at(index, timestamp)?;
        self.durations
            .appender()?
            .append_at(index, profile.duration_nanos)?;
        self.periods.appender()?.append_at(index, profile.period)?;

        self.min_time = self.min_time.min(timestamp);
        self.max_time = timestamp;
        self.next_index += 1;

        metrics::record_append("ok");
        debug!(
            index,
            timestamp,
            samples = samples.len(),
            tree_nodes = self.tree.len(),
            "appended profile"
        );
        Ok(())
    }

    fn check_compatibility(&self, profile: &Profile) -> Result<()> {
        let (Some(period_type), Some(sample_type)) = (&self.period_type, &self.sample_type) else {
            return Ok(());
        };
        if *period_type != profile.period_type {
            return Err(Error::IncompatibleProfile {
                expected: period_type.to_string(),
                actual: profile.period_type.to_string(),
            });
        }
        let actual = profile.sample_types.first().cloned().unwrap_or_default();
        if *sample_type != actual {
            return Err(Error::IncompatibleProfile {
                expected: sample_type.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Open a lock-step iterator over the appended samples
    ///
    /// The iterator snapshots the series tree: every flat and cumulative
    /// column gets a fresh chunk iterator positioned before index 0, as do
    /// the three metadata columns. Call [`SeriesIterator::next`] before
    /// reading the first sample.
    pub fn iter(&self) -> SeriesIterator<'_> {
        let nodes = self
            .tree
            .nodes()
            .iter()
            .map(|node| IterNode {
                location_id: node.location_id(),
                flat: node.flat_columns().iter().map(IterColumn::new).collect(),
                cumulative: node
                    .cumulative_columns()
                    .iter()
                    .map(IterColumn::new)
                    .collect(),
                children: node.children().to_vec(),
            })
            .collect();

        metrics::record_iterator_opened();
        SeriesIterator {
            nodes,
            timestamps: self.timestamps.iter(),
            durations: self.durations.iter(),
            periods: self.periods.iter(),
            period_type: self.period_type.clone().unwrap_or_default(),
            sample_type: self.sample_type.clone().unwrap_or_default(),
            remaining: self.next_index,
        }
    }
}

struct IterColumn<'a> {
    iter: XorChunkIterator<'a>,
    labels: &'a HashMap<String, Vec<String>>,
    num_labels: &'a HashMap<String, Vec<i64>>,
    num_units: &'a HashMap<String, Vec<String>>,
}

impl<'a> IterColumn<'a> {
    fn new(column: &'a crate::storage::series_tree::ValueColumn) -> Self {
        Self {
            iter: column.chunk.iter(),
            labels: &column.labels,
            num_labels: &column.num_labels,
            num_units: &column.num_units,
        }
    }
}

struct IterNode<'a> {
    location_id: u64,
    flat: Vec<IterColumn<'a>>,
    cumulative: Vec<IterColumn<'a>>,
    children: Vec<NodeId>,
}

/// Iterator replaying a series one appended sample at a time
///
/// All chunk iterators advance in lock-step: one `next` call moves every
/// node column and the three metadata columns forward by exactly one sample
/// index.
pub struct SeriesIterator<'a> {
    nodes: Vec<IterNode<'a>>,
    timestamps: DeltaChunkIterator<'a>,
    durations: DeltaChunkIterator<'a>,
    periods: DeltaChunkIterator<'a>,
    period_type: ValueType,
    sample_type: ValueType,
    remaining: u16,
}

impl SeriesIterator<'_> {
    /// Advance to the next sample; `false` once all appended samples have
    /// been replayed
    pub fn next(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        if !self.timestamps.next() || !self.durations.next() || !self.periods.next() {
            return false;
        }

        for node in &mut self.nodes {
            for column in &mut node.flat {
                column.iter.next();
            }
            for column in &mut node.cumulative {
                column.iter.next();
            }
        }

        self.remaining -= 1;
        true
    }

    /// The reconstructed profile at the current sample
    pub fn at(&self) -> InstantProfile<'_> {
        InstantProfile { it: self }
    }
}

/// A reconstructed per-timestamp profile view
pub struct InstantProfile<'v> {
    it: &'v SeriesIterator<'v>,
}

impl<'v> InstantProfile<'v> {
    /// Metadata of the sample the iterator currently points at
    pub fn profile_meta(&self) -> InstantProfileMeta {
        InstantProfileMeta {
            period_type: self.it.period_type.clone(),
            sample_type: self.it.sample_type.clone(),
            timestamp: self.it.timestamps.at(),
            duration: self.it.durations.at(),
            period: self.it.periods.at(),
        }
    }

    /// Root of the reconstructed profile tree
    pub fn profile_tree(&self) -> InstantNode<'v> {
        InstantNode { it: self.it, id: 0 }
    }
}

/// A value slot of an [`InstantNode`], with the labels riding on the column
pub struct InstantValue<'v> {
    /// The column's value at the current sample index
    pub value: i64,
    /// String labels
    pub labels: &'v HashMap<String, Vec<String>>,
    /// Numeric labels
    pub num_labels: &'v HashMap<String, Vec<i64>>,
    /// Units for the numeric labels
    pub num_units: &'v HashMap<String, Vec<String>>,
}

/// A node of the reconstructed per-timestamp profile tree
#[derive(Clone, Copy)]
pub struct InstantNode<'v> {
    it: &'v SeriesIterator<'v>,
    id: NodeId,
}

impl<'v> InstantNode<'v> {
    fn node(&self) -> &'v IterNode<'v> {
        &self.it.nodes[self.id as usize]
    }

    /// The location this node represents; 0 for the root
    pub fn location_id(&self) -> u64 {
        self.node().location_id
    }

    /// Sum of the flat columns at the current sample index
    pub fn flat_value(&self) -> i64 {
        self.node().flat.iter().map(|c| c.iter.at()).sum()
    }

    /// Sum of the cumulative columns at the current sample index
    pub fn cumulative_value(&self) -> i64 {
        self.node().cumulative.iter().map(|c| c.iter.at()).sum()
    }

    /// Flat value slots with their labels
    pub fn flat_values(&self) -> Vec<InstantValue<'v>> {
        self.node()
            .flat
            .iter()
            .map(|c| InstantValue {
                value: c.iter.at(),
                labels: c.labels,
                num_labels: c.num_labels,
                num_units: c.num_units,
            })
            .collect()
    }

    /// Cumulative value slots with their labels
    pub fn cumulative_values(&self) -> Vec<InstantValue<'v>> {
        self.node()
            .cumulative
            .iter()
            .map(|c| InstantValue {
                value: c.iter.at(),
                labels: c.labels,
                num_labels: c.num_labels,
                num_units: c.num_units,
            })
            .collect()
    }

    /// Child nodes, ordered by ascending location id
    pub fn children(&self) -> impl Iterator<Item = InstantNode<'v>> + '_ {
        let it = self.it;
        self.node()
            .children
            .iter()
            .map(move |id| InstantNode { it, id: *id })
    }

    /// Look up a direct child by location id
    pub fn child(&self, location_id: u64) -> Option<InstantNode<'v>> {
        self.children().find(|c| c.location_id() == location_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, Mapping, Sample};

    fn test_profile(time_nanos: i64, stacks: &[(&[u64], i64)]) -> Profile {
        Profile {
            sample_types: vec![ValueType::new("cpu", "nanoseconds")],
            period_type: ValueType::new("cpu", "nanoseconds"),
            mappings: vec![Mapping {
                id: 1,
                start: 0x1000,
                limit: 0x5000,
                build_id: "bid".to_string(),
                ..Default::default()
            }],
            locations: (1..=16)
                .map(|id| Location {
                    id,
                    mapping_id: 1,
                    address: 0x1000 + id * 0x10,
                    ..Default::default()
                })
                .collect(),
            samples: stacks
                .iter()
                .map(|(stack, value)| Sample {
                    location_ids: stack.to_vec(),
                    values: vec![*value],
                    ..Default::default()
                })
                .collect(),
            time_nanos,
            duration_nanos: 10_000_000_000,
            period: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_append_and_iterate_single_profile() {
        let mut series = ProfileSeries::new();
        series
            .append(&test_profile(1_000_000, &[(&[2, 1], 5)]))
            .unwrap();
        assert_eq!(series.num_samples(), 1);
        assert_eq!(series.min_time(), Some(1));
        assert_eq!(series.max_time(), Some(1));

        let mut it = series.iter();
        assert!(it.next());
        let profile = it.at();

        let meta = profile.profile_meta();
        assert_eq!(meta.timestamp, 1);
        assert_eq!(meta.duration, 10_000_000_000);
        assert_eq!(meta.period, 100);
        assert_eq!(meta.sample_type, ValueType::new("cpu", "nanoseconds"));

        let root = profile.profile_tree();
        assert_eq!(root.cumulative_value(), 5);
        let leaf = root.child(1).unwrap().child(2).unwrap();
        assert_eq!(leaf.flat_value(), 5);

        assert!(!it.next());
    }

    #[test]
    fn test_out_of_order_append_leaves_series_unchanged() {
        let mut series = ProfileSeries::new();
        series
            .append(&test_profile(2_000_000, &[(&[2, 1], 5)]))
            .unwrap();

        let err = series
            .append(&test_profile(2_000_000, &[(&[3, 1], 1)]))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrderSample));

        assert_eq!(series.num_samples(), 1);
        // The rejected profile's stack never reached the tree.
        assert_eq!(series.tree().len(), 3);
    }

    #[test]
    fn test_incompatible_profile_rejected_before_mutation() {
        let mut series = ProfileSeries::new();
        series
            .append(&test_profile(1_000_000, &[(&[2, 1], 5)]))
            .unwrap();

        let mut wrong = test_profile(2_000_000, &[(&[2, 1], 5)]);
        wrong.period_type = ValueType::new("wall", "seconds");
        let err = series.append(&wrong).unwrap_err();
        assert!(matches!(err, Error::IncompatibleProfile { .. }));
        assert_eq!(series.num_samples(), 1);
    }

    #[test]
    fn test_multiple_iterators_are_independent() {
        let mut series = ProfileSeries::new();
        series
            .append(&test_profile(1_000_000, &[(&[2, 1], 4)]))
            .unwrap();
        series
            .append(&test_profile(2_000_000, &[(&[2, 1], 6)]))
            .unwrap();

        let mut a = series.iter();
        let mut b = series.iter();
        assert!(a.next());
        assert!(a.next());
        assert!(b.next());

        assert_eq!(a.at().profile_meta().timestamp, 2);
        assert_eq!(b.at().profile_meta().timestamp, 1);
    }

    #[test]
    fn test_empty_series_iterates_nothing() {
        let series = ProfileSeries::new();
        let mut it = series.iter();
        assert!(!it.next());
    }
}
