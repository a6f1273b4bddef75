//! Symbolization of interned locations against a debug-info store
//!
//! The storage core records locations as raw addresses within mappings; a
//! side loop owned by the embedding process resolves them to source lines
//! whenever debug info for the mapping's build id is available. This module
//! holds the contract with that store and the bookkeeping around it:
//! batching per build id, skipping what cannot or need not be symbolized,
//! and permanently retiring `(build id, address)` pairs that repeatedly
//! come back empty.
//!
//! Missing debug info is normal operation, not an error: uploads race
//! against profile ingestion, and many images never get their debug info
//! uploaded at all. Only real store failures surface, aggregated so one bad
//! build id does not mask the others.

use crate::config::SymbolizerConfig;
use crate::metrics;
use crate::types::{Line, Location, Mapping};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by a debug-info store
#[derive(Error, Debug)]
pub enum DebugInfoError {
    /// No debug info has been uploaded for the build id. Non-fatal; the
    /// symbolizer skips the batch and retries on a later run.
    #[error("debug info not found for build id {0}")]
    NotFound(String),

    /// The store failed; the request may be retried
    #[error("debug info store failure: {0}")]
    Store(String),
}

/// The debug-info store the symbolizer consumes
///
/// Implementations typically sit in front of object storage keyed by build
/// id. `upload`/`exists` serve the upload path; `symbolize` resolves source
/// lines for a batch of addresses within one mapping's image.
#[async_trait]
pub trait DebugInfoStore: Send + Sync {
    /// Whether debug info for `build_id` has been uploaded
    async fn exists(&self, build_id: &str) -> Result<bool, DebugInfoError>;

    /// Store a debug-info object for `build_id`
    async fn upload(&self, build_id: &str, data: Bytes) -> Result<(), DebugInfoError>;

    /// Resolve source lines for mapping-internal addresses
    ///
    /// The result maps each address to its lines; addresses the store could
    /// not resolve may be absent or map to an empty list.
    async fn symbolize(
        &self,
        mapping: &Mapping,
        addresses: &[u64],
    ) -> Result<HashMap<u64, Vec<Line>>, DebugInfoError>;
}

/// Error aggregating all fatal store failures of one symbolization run
#[derive(Error, Debug)]
pub enum SymbolizerError {
    /// One or more build ids failed with a real store error
    #[error("symbolization failed for {} build id(s): {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<DebugInfoError>),
}

fn join_errors(errors: &[DebugInfoError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resolves unsymbolized locations against a [`DebugInfoStore`]
pub struct Symbolizer<S> {
    store: S,
    attempt_threshold: u32,
    attempts: HashMap<String, HashMap<u64, u32>>,
    failed: HashMap<String, HashSet<u64>>,
}

impl<S: DebugInfoStore> Symbolizer<S> {
    /// Create a symbolizer over a store
    pub fn new(store: S, config: SymbolizerConfig) -> Self {
        Self {
            store,
            attempt_threshold: config.attempt_threshold,
            attempts: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether a `(build id, address)` pair has been retired after
    /// exhausting its attempts
    pub fn has_failed(&self, build_id: &str, address: u64) -> bool {
        self.failed
            .get(build_id)
            .is_some_and(|addrs| addrs.contains(&address))
    }

    /// Symbolize every eligible location in place
    ///
    /// Locations are batched per build id. Skipped without an attempt:
    /// locations without a mapping, with a fake or build-id-less mapping,
    /// locations that already carry lines, and pairs previously retired into
    /// the failed set. A location resolved to an empty line list costs one
    /// attempt; at `attempt_threshold` attempts the pair is retired.
    /// Only `lines` is ever written.
    ///
    /// # Errors
    ///
    /// [`SymbolizerError::Aggregate`] collecting every fatal store error of
    /// the run. `NotFound` is logged at debug level and never part of it.
    pub async fn symbolize(
        &mut self,
        mappings: &[Mapping],
        locations: &mut [Location],
    ) -> Result<(), SymbolizerError> {
        // Aggregate locations per build id so each image is one request.
        let mut batches: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, location) in locations.iter().enumerate() {
            let Some(mapping) = lookup_mapping(mappings, location.mapping_id) else {
                debug!(location = location.id, "location has no mapping, skipping");
                continue;
            };
            if mapping.build_id.is_empty() {
                debug!(location = location.id, "mapping has no build id, skipping");
                continue;
            }
            if !location.lines.is_empty() {
                continue;
            }
            if self.has_failed(&mapping.build_id, location.address) {
                debug!(
                    location = location.id,
                    build_id = %mapping.build_id,
                    "symbolization previously failed, skipping"
                );
                continue;
            }
            batches.entry(mapping.build_id.clone()).or_default().push(idx);
        }

        let mut errors = Vec::new();
        for (build_id, indices) in batches {
            let mapping = locations
                .get(indices[0])
                .and_then(|l| lookup_mapping(mappings, l.mapping_id))
                .cloned();
            let Some(mapping) = mapping else {
                continue;
            };

            let addresses: Vec<u64> = indices.iter().map(|i| locations[*i].address).collect();
            debug!(build_id = %build_id, locations = indices.len(), "symbolization request started");

            let resolved = match self.store.symbolize(&mapping, &addresses).await {
                Ok(resolved) => resolved,
                Err(DebugInfoError::NotFound(_)) => {
                    // Happens all the time; the upload may simply not have
                    // arrived yet.
                    debug!(build_id = %build_id, "debug info not found in store");
                    metrics::record_symbolization("not_found");
                    continue;
                }
                Err(e) => {
                    metrics::record_symbolization("error");
                    errors.push(e);
                    continue;
                }
            };
            metrics::record_symbolization("ok");

            for idx in indices {
                let location = &mut locations[idx];
                match resolved.get(&location.address) {
                    Some(lines) if !lines.is_empty() => {
                        location.lines = lines.clone();
                    }
                    _ => self.record_empty_result(&build_id, location.address),
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SymbolizerError::Aggregate(errors))
        }
    }

    fn record_empty_result(&mut self, build_id: &str, address: u64) {
        let attempts = self
            .attempts
            .entry(build_id.to_string())
            .or_default()
            .entry(address)
            .or_insert(0);
        *attempts += 1;

        if *attempts >= self.attempt_threshold {
            self.failed
                .entry(build_id.to_string())
                .or_default()
                .insert(address);
            if let Some(per_build) = self.attempts.get_mut(build_id) {
                per_build.remove(&address);
            }
            metrics::record_symbolization("retired");
        }
    }
}

fn lookup_mapping(mappings: &[Mapping], id: u64) -> Option<&Mapping> {
    if id == 0 {
        return None;
    }
    mappings.get(id as usize - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Store backed by in-memory tables, counting symbolize calls per
    /// build id.
    #[derive(Default)]
    struct FakeStore {
        lines: HashMap<String, HashMap<u64, Vec<Line>>>,
        failing: HashSet<String>,
        calls: AtomicUsize,
        uploads: Mutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl DebugInfoStore for FakeStore {
        async fn exists(&self, build_id: &str) -> Result<bool, DebugInfoError> {
            Ok(self.lines.contains_key(build_id)
                || self.uploads.lock().unwrap().contains_key(build_id))
        }

        async fn upload(&self, build_id: &str, data: Bytes) -> Result<(), DebugInfoError> {
            self.uploads
                .lock()
                .unwrap()
                .insert(build_id.to_string(), data);
            Ok(())
        }

        async fn symbolize(
            &self,
            mapping: &Mapping,
            addresses: &[u64],
        ) -> Result<HashMap<u64, Vec<Line>>, DebugInfoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&mapping.build_id) {
                return Err(DebugInfoError::Store("backend down".to_string()));
            }
            let Some(known) = self.lines.get(&mapping.build_id) else {
                return Err(DebugInfoError::NotFound(mapping.build_id.clone()));
            };
            Ok(addresses
                .iter()
                .map(|a| (*a, known.get(a).cloned().unwrap_or_default()))
                .collect())
        }
    }

    fn mapping(id: u64, build_id: &str) -> Mapping {
        Mapping {
            id,
            start: 0x1000,
            limit: 0x2000,
            build_id: build_id.to_string(),
            ..Default::default()
        }
    }

    fn location(id: u64, mapping_id: u64, address: u64) -> Location {
        Location {
            id,
            mapping_id,
            address,
            ..Default::default()
        }
    }

    fn line(function_id: u64, line: i64) -> Line {
        Line { function_id, line }
    }

    #[tokio::test]
    async fn test_resolves_lines_in_place() {
        let mut store = FakeStore::default();
        store.lines.insert(
            "bid".to_string(),
            HashMap::from([(0x1100, vec![line(1, 42)])]),
        );

        let mappings = vec![mapping(1, "bid")];
        let mut locations = vec![location(1, 1, 0x1100), location(2, 1, 0x1200)];

        let mut sym = Symbolizer::new(store, SymbolizerConfig::default());
        sym.symbolize(&mappings, &mut locations).await.unwrap();

        assert_eq!(locations[0].lines, vec![line(1, 42)]);
        // Everything but lines is untouched.
        assert_eq!(locations[0].address, 0x1100);
        assert_eq!(locations[0].mapping_id, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_non_fatal() {
        let mappings = vec![mapping(1, "missing")];
        let mut locations = vec![location(1, 1, 0x1100)];

        let mut sym = Symbolizer::new(FakeStore::default(), SymbolizerConfig::default());
        sym.symbolize(&mappings, &mut locations).await.unwrap();
        assert!(locations[0].lines.is_empty());
    }

    #[tokio::test]
    async fn test_store_errors_aggregate() {
        let mut store = FakeStore::default();
        store.failing.insert("bad-1".to_string());
        store.failing.insert("bad-2".to_string());
        store
            .lines
            .insert("good".to_string(), HashMap::from([(0x1100, vec![line(1, 1)])]));

        let mappings = vec![mapping(1, "bad-1"), mapping(2, "bad-2"), mapping(3, "good")];
        let mut locations = vec![
            location(1, 1, 0x1100),
            location(2, 2, 0x1100),
            location(3, 3, 0x1100),
        ];

        let mut sym = Symbolizer::new(store, SymbolizerConfig::default());
        let err = sym.symbolize(&mappings, &mut locations).await.unwrap_err();
        let SymbolizerError::Aggregate(errors) = err;
        assert_eq!(errors.len(), 2);

        // The healthy build id still went through.
        assert_eq!(locations[2].lines, vec![line(1, 1)]);
    }

    #[tokio::test]
    async fn test_skips_unsymbolizable_and_already_symbolized() {
        let mut store = FakeStore::default();
        store
            .lines
            .insert("bid".to_string(), HashMap::from([(0x1100, vec![line(1, 1)])]));

        let mappings = vec![mapping(1, "bid"), mapping(2, "")];
        let mut already = location(1, 1, 0x1100);
        already.lines = vec![line(9, 9)];
        let mut locations = vec![
            already,             // already symbolized
            location(2, 2, 0x1100), // mapping without build id
            location(3, 0, 0x1100), // no mapping at all
        ];

        let mut sym = Symbolizer::new(store, SymbolizerConfig::default());
        sym.symbolize(&mappings, &mut locations).await.unwrap();

        // Nothing was eligible, so the store was never asked.
        assert_eq!(sym.store().calls.load(Ordering::SeqCst), 0);
        assert_eq!(locations[0].lines, vec![line(9, 9)]);
    }

    #[tokio::test]
    async fn test_empty_results_retire_after_threshold() {
        let mut store = FakeStore::default();
        // Debug info exists but resolves nothing for this address.
        store.lines.insert("bid".to_string(), HashMap::new());

        let mappings = vec![mapping(1, "bid")];
        let mut locations = vec![location(1, 1, 0x1100)];

        let config = SymbolizerConfig {
            attempt_threshold: 2,
        };
        let mut sym = Symbolizer::new(store, config);

        sym.symbolize(&mappings, &mut locations).await.unwrap();
        assert!(!sym.has_failed("bid", 0x1100));

        sym.symbolize(&mappings, &mut locations).await.unwrap();
        assert!(sym.has_failed("bid", 0x1100));
        assert_eq!(sym.store().calls.load(Ordering::SeqCst), 2);

        // Retired pairs never reach the store again.
        sym.symbolize(&mappings, &mut locations).await.unwrap();
        assert_eq!(sym.store().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_symbolizes_series_intern_tables() {
        use crate::storage::Normalizer;
        use crate::types::{Profile, Sample};

        let mut normalizer = Normalizer::new();
        normalizer.normalize(&Profile {
            mappings: vec![Mapping {
                id: 1,
                start: 0x1000,
                limit: 0x2000,
                build_id: "bid".to_string(),
                ..Default::default()
            }],
            locations: vec![location(1, 1, 0x1100)],
            samples: vec![Sample {
                location_ids: vec![1],
                values: vec![1],
                ..Default::default()
            }],
            ..Default::default()
        });

        let mut store = FakeStore::default();
        store.lines.insert(
            "bid".to_string(),
            HashMap::from([(0x1100, vec![line(1, 7)])]),
        );
        let mut sym = Symbolizer::new(store, SymbolizerConfig::default());

        let (mappings, locations) = normalizer.symbolization_targets();
        sym.symbolize(mappings, locations).await.unwrap();

        assert_eq!(normalizer.locations()[0].lines, vec![line(1, 7)]);
    }

    #[tokio::test]
    async fn test_upload_and_exists_round_trip() {
        let store = FakeStore::default();
        assert!(!store.exists("bid").await.unwrap());
        store
            .upload("bid", Bytes::from_static(b"debug info"))
            .await
            .unwrap();
        assert!(store.exists("bid").await.unwrap());
    }
}
