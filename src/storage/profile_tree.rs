//! Per-profile tree of locations with flat and cumulative values
//!
//! A [`ProfileTree`] is built fresh for every ingested profile from its
//! normalized samples. Samples arrive with their location stack ordered leaf
//! first; insertion walks the stack from the deepest caller down to the leaf,
//! producing a caller-rooted tree in which a node's cumulative value is
//! exactly the sum of the flat values in its subtree. The series tree merge
//! relies on that invariant holding per profile so that it holds per sample
//! index across the whole series.

use crate::types::Sample;
use std::collections::HashMap;

/// A value slot on a profile tree node
///
/// Slot 0 is the only one the storage core accumulates into; the label maps
/// ride along for the per-sample label dimensions.
#[derive(Debug, Clone, Default)]
pub struct ProfileValue {
    /// Accumulated sample value
    pub value: i64,
    /// String labels
    pub labels: HashMap<String, Vec<String>>,
    /// Numeric labels
    pub num_labels: HashMap<String, Vec<i64>>,
    /// Units for the numeric labels
    pub num_units: HashMap<String, Vec<String>>,
}

/// A node of a per-profile tree; children are strictly ascending by
/// `location_id`
#[derive(Debug, Clone, Default)]
pub struct ProfileTreeNode {
    location_id: u64,
    flat: Vec<ProfileValue>,
    cumulative: Vec<ProfileValue>,
    /// Child nodes, sorted by ascending location id without duplicates
    pub children: Vec<ProfileTreeNode>,
}

impl ProfileTreeNode {
    fn new(location_id: u64) -> Self {
        Self {
            location_id,
            ..Self::default()
        }
    }

    /// The location this node represents; 0 for the root
    pub fn location_id(&self) -> u64 {
        self.location_id
    }

    /// Flat value slots; empty unless a sample's leaf is this node
    pub fn flat_values(&self) -> &[ProfileValue] {
        &self.flat
    }

    /// Cumulative value slots
    pub fn cumulative_values(&self) -> &[ProfileValue] {
        &self.cumulative
    }

    /// Sum over all cumulative slots
    pub fn cumulative_value(&self) -> i64 {
        self.cumulative.iter().map(|v| v.value).sum()
    }

    fn add_cumulative(&mut self, value: i64) {
        if self.cumulative.is_empty() {
            self.cumulative.push(ProfileValue::default());
        }
        self.cumulative[0].value += value;
    }

    fn add_flat(&mut self, value: i64) {
        if self.flat.is_empty() {
            self.flat.push(ProfileValue::default());
        }
        self.flat[0].value += value;
    }
}

/// Per-profile, radix-merged tree of locations
///
/// The root always exists and carries `location_id` 0; an empty tree is a
/// root with no children and no values.
#[derive(Debug, Clone, Default)]
pub struct ProfileTree {
    root: ProfileTreeNode,
}

impl ProfileTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// The root node
    pub fn root(&self) -> &ProfileTreeNode {
        &self.root
    }

    /// Insert a normalized sample
    ///
    /// Walks the sample's locations from the deepest caller to the leaf,
    /// finding or creating one child per frame with a binary search that
    /// keeps children sorted. The sample's first value is added to the
    /// cumulative slot of every visited node and to the flat slot of the
    /// leaf.
    pub fn insert(&mut self, sample: &Sample) {
        let value = sample.values.first().copied().unwrap_or(0);

        let mut cur = &mut self.root;
        for &location_id in sample.location_ids.iter().rev() {
            cur.add_cumulative(value);

            let idx = match cur
                .children
                .binary_search_by_key(&location_id, |c| c.location_id)
            {
                Ok(idx) => idx,
                Err(idx) => {
                    cur.children.insert(idx, ProfileTreeNode::new(location_id));
                    idx
                }
            };
            cur = &mut cur.children[idx];
        }

        cur.add_cumulative(value);
        cur.add_flat(value);
    }
}
