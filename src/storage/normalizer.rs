//! Interning of profile entities into the series namespace
//!
//! Every series owns a [`Normalizer`] holding long-lived intern tables for
//! mappings, functions and locations. Each ingested profile carries its own
//! decoder-assigned identifier namespace; normalization rewrites samples to
//! reference series-wide entities with dense ids assigned in insertion order
//! starting at 1, folding duplicates along the way.
//!
//! Entities are stored in arenas of owned records and cross-reference each
//! other by id, never by pointer, so the tables stay acyclic and cheap to
//! hand out.
//!
//! Deduplication is keyed structurally rather than by reported addresses:
//! mapping keys round the segment size up to the next 4 KiB boundary and
//! prefer the build id over the file name, and location keys subtract the
//! mapping start from the address. Two captures of the same binary loaded at
//! different base addresses (address-space layout randomization) therefore
//! intern to the same entities, with a per-profile offset applied to every
//! location address to bring it into the canonical coordinate system.

use crate::types::{Function, Line, Location, Mapping, Profile, Sample};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Page granularity used to absorb minor discrepancies in reported segment
/// extents.
const MAP_SIZE_ROUNDING: u64 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MappingKey {
    size: u64,
    offset: u64,
    build_id_or_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FunctionKey {
    start_line: i64,
    name: String,
    system_name: String,
    filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LocationKey {
    address: u64,
    mapping_id: u64,
    lines: String,
    is_folded: bool,
}

/// Canonical string identity of a stack plus its label sets
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StacktraceKey {
    locations: String,
    labels: String,
    num_labels: String,
}

/// An interned mapping together with the address adjustment for the current
/// profile: `interned.start - source.start`.
#[derive(Debug, Clone, Copy, Default)]
struct MapInfo {
    id: u64,
    offset: i64,
}

/// Long-lived intern tables of a series
#[derive(Debug, Default)]
pub struct Normalizer {
    mappings: Vec<Mapping>,
    functions: Vec<Function>,
    locations: Vec<Location>,
    mapping_keys: HashMap<MappingKey, u64>,
    function_keys: HashMap<FunctionKey, u64>,
    location_keys: HashMap<LocationKey, u64>,
}

impl Normalizer {
    /// Create empty intern tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Interned mappings; ids are dense `1..=N` in insertion order
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Interned functions; ids are dense `1..=N` in insertion order
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Interned locations; ids are dense `1..=N` in insertion order
    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// Mutable access to the interned locations, for the symbolizer to fill
    /// in resolved lines
    pub fn locations_mut(&mut self) -> &mut [Location] {
        &mut self.locations
    }

    /// Split borrow for symbolization: the mapping table read-only alongside
    /// the locations to mutate
    pub fn symbolization_targets(&mut self) -> (&[Mapping], &mut [Location]) {
        (&self.mappings, &mut self.locations)
    }

    /// Look up an interned mapping by its dense id
    pub fn mapping(&self, id: u64) -> Option<&Mapping> {
        if id == 0 {
            return None;
        }
        self.mappings.get(id as usize - 1)
    }

    /// Normalize one profile into samples referencing the series namespace
    ///
    /// Zero-valued samples are dropped. Samples sharing a stacktrace key
    /// within the profile are folded into one, accumulating their values.
    /// The result is sorted by stacktrace key so downstream tree merging is
    /// deterministic.
    pub fn normalize(&mut self, profile: &Profile) -> Vec<Sample> {
        let mut run = Run {
            src_mappings: profile.mappings.iter().map(|m| (m.id, m)).collect(),
            src_locations: profile.locations.iter().map(|l| (l.id, l)).collect(),
            src_functions: profile.functions.iter().map(|f| (f.id, f)).collect(),
            mappings_by_id: HashMap::with_capacity(profile.mappings.len()),
            functions_by_id: HashMap::with_capacity(profile.functions.len()),
            locations_by_id: HashMap::with_capacity(profile.locations.len()),
        };

        // The mapping list has the property that the first mapping
        // represents the main binary. Intern it eagerly on the series's
        // first profile so the main binary keeps mapping id 1 instead of
        // whichever mapping a sample happens to reference first.
        if self.mappings.is_empty() {
            if let Some(first) = profile.mappings.first() {
                self.map_mapping(&mut run, first.id);
            }
        }

        let mut keyed: Vec<(StacktraceKey, Sample)> = Vec::with_capacity(profile.samples.len());
        let mut by_key: HashMap<StacktraceKey, usize> = HashMap::with_capacity(profile.samples.len());

        for src in &profile.samples {
            if src.is_zero() {
                continue;
            }
            let value = src.values.first().copied().unwrap_or(0);

            let location_ids: Vec<u64> = src
                .location_ids
                .iter()
                .filter_map(|id| self.map_location(&mut run, *id))
                .collect();

            let mut num_units = HashMap::with_capacity(src.num_labels.len());
            for key in src.num_labels.keys() {
                if let Some(units) = src.num_units.get(key) {
                    num_units.insert(key.clone(), units.clone());
                }
            }

            let sample = Sample {
                location_ids,
                labels: src.labels.clone(),
                num_labels: src.num_labels.clone(),
                num_units,
                values: vec![value],
            };

            // The key must be computed on the remapped locations to account
            // for the remapped mappings.
            let key = stacktrace_key(&sample);
            match by_key.get(&key) {
                Some(&idx) => keyed[idx].1.values[0] += value,
                None => {
                    by_key.insert(key.clone(), keyed.len());
                    keyed.push((key, sample));
                }
            }
        }

        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, s)| s).collect()
    }

    fn map_location(&mut self, run: &mut Run<'_>, src_id: u64) -> Option<u64> {
        if let Some(id) = run.locations_by_id.get(&src_id) {
            return Some(*id);
        }
        let src = *run.src_locations.get(&src_id)?;

        let mi = self.map_mapping(run, src.mapping_id);
        let address = src.address.wrapping_add(mi.offset as u64);
        let lines: Vec<Line> = src
            .lines
            .iter()
            .map(|l| Line {
                function_id: self.map_function(run, l.function_id),
                line: l.line,
            })
            .collect();

        let key = LocationKey {
            // Normalize to a mapping-relative address to neutralize
            // address-space layout randomization.
            address: match self.mapping(mi.id) {
                Some(m) => address.wrapping_sub(m.start),
                None => address,
            },
            mapping_id: mi.id,
            lines: lines_digest(&lines),
            is_folded: src.is_folded,
        };

        if let Some(&id) = self.location_keys.get(&key) {
            run.locations_by_id.insert(src_id, id);
            return Some(id);
        }

        let id = self.locations.len() as u64 + 1;
        self.locations.push(Location {
            id,
            mapping_id: mi.id,
            address,
            lines,
            is_folded: src.is_folded,
        });
        self.location_keys.insert(key, id);
        run.locations_by_id.insert(src_id, id);
        Some(id)
    }

    fn map_mapping(&mut self, run: &mut Run<'_>, src_id: u64) -> MapInfo {
        if src_id == 0 {
            return MapInfo::default();
        }
        if let Some(mi) = run.mappings_by_id.get(&src_id) {
            return *mi;
        }
        let src = match run.src_mappings.get(&src_id) {
            Some(m) => *m,
            None => return MapInfo::default(),
        };

        let key = mapping_key(src);
        if let Some(&id) = self.mapping_keys.get(&key) {
            let interned = &self.mappings[id as usize - 1];
            let mi = MapInfo {
                id,
                offset: interned.start as i64 - src.start as i64,
            };
            run.mappings_by_id.insert(src_id, mi);
            return mi;
        }

        let id = self.mappings.len() as u64 + 1;
        self.mappings.push(Mapping {
            id,
            ..src.clone()
        });
        self.mapping_keys.insert(key, id);
        let mi = MapInfo { id, offset: 0 };
        run.mappings_by_id.insert(src_id, mi);
        mi
    }

    fn map_function(&mut self, run: &mut Run<'_>, src_id: u64) -> u64 {
        if src_id == 0 {
            return 0;
        }
        if let Some(id) = run.functions_by_id.get(&src_id) {
            return *id;
        }
        let src = match run.src_functions.get(&src_id) {
            Some(f) => *f,
            None => return 0,
        };

        let key = FunctionKey {
            start_line: src.start_line,
            name: src.name.clone(),
            system_name: src.system_name.clone(),
            filename: src.filename.clone(),
        };
        if let Some(&id) = self.function_keys.get(&key) {
            run.functions_by_id.insert(src_id, id);
            return id;
        }

        let id = self.functions.len() as u64 + 1;
        self.functions.push(Function {
            id,
            ..src.clone()
        });
        self.function_keys.insert(key, id);
        run.functions_by_id.insert(src_id, id);
        id
    }
}

/// Per-profile scratch tables; source ids are only meaningful within one
/// normalization run.
struct Run<'a> {
    src_mappings: HashMap<u64, &'a Mapping>,
    src_locations: HashMap<u64, &'a Location>,
    src_functions: HashMap<u64, &'a Function>,
    mappings_by_id: HashMap<u64, MapInfo>,
    functions_by_id: HashMap<u64, u64>,
    locations_by_id: HashMap<u64, u64>,
}

fn mapping_key(m: &Mapping) -> MappingKey {
    // Round the segment size up to the next 4 KiB boundary so captures that
    // disagree slightly about the extent still fold together.
    let size = m.limit.wrapping_sub(m.start);
    let size = size + MAP_SIZE_ROUNDING - 1;
    let size = size - (size % MAP_SIZE_ROUNDING);

    // A mapping with neither build id nor file name is a fake mapping; the
    // empty discriminator collapses all of them into one entry.
    let build_id_or_file = if !m.build_id.is_empty() {
        m.build_id.clone()
    } else if !m.file.is_empty() {
        m.file.clone()
    } else {
        String::new()
    };

    MappingKey {
        size,
        offset: m.offset,
        build_id_or_file,
    }
}

fn lines_digest(lines: &[Line]) -> String {
    let mut parts = Vec::with_capacity(lines.len() * 2);
    for line in lines {
        if line.function_id != 0 {
            parts.push(format!("{:x}", line.function_id));
        } else {
            parts.push(String::new());
        }
        parts.push(format!("{:x}", line.line));
    }
    parts.join("|")
}

pub(crate) fn stacktrace_key(sample: &Sample) -> StacktraceKey {
    let locations = sample
        .location_ids
        .iter()
        .map(|id| format!("{id:x}"))
        .collect::<Vec<_>>()
        .join("|");

    let mut labels: Vec<String> = sample
        .labels
        .iter()
        .map(|(k, v)| format!("{k:?}{v:?}"))
        .collect();
    labels.sort();

    let mut num_labels: Vec<String> = sample
        .num_labels
        .iter()
        .map(|(k, v)| {
            let mut entry = format!("{k:?}");
            for value in v {
                let _ = write!(entry, "{value:x}");
            }
            if let Some(units) = sample.num_units.get(k) {
                let _ = write!(entry, "{units:?}");
            }
            entry
        })
        .collect();
    num_labels.sort();

    StacktraceKey {
        locations,
        labels: labels.concat(),
        num_labels: num_labels.concat(),
    }
}
