//! Prometheus metrics for the storage engine
//!
//! Collectors register against the default registry; `gather` renders them
//! in the text exposition format for whatever endpoint the embedding process
//! exposes.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    /// Total profile appends by outcome
    pub static ref APPENDS_TOTAL: CounterVec = register_counter_vec!(
        "profiledb_appends_total",
        "Total profile append operations",
        &["status"]
    )
    .unwrap();

    /// Total normalized samples emitted toward tree construction
    pub static ref SAMPLES_NORMALIZED_TOTAL: Counter = register_counter!(
        "profiledb_samples_normalized_total",
        "Total samples emitted by the normalizer"
    )
    .unwrap();

    /// Total series iterators opened
    pub static ref ITERATORS_TOTAL: Counter = register_counter!(
        "profiledb_iterators_total",
        "Total series iterators opened"
    )
    .unwrap();

    /// Total symbolization requests by outcome
    pub static ref SYMBOLIZATIONS_TOTAL: CounterVec = register_counter_vec!(
        "profiledb_symbolizations_total",
        "Total symbolization requests",
        &["status"]
    )
    .unwrap();

    /// Samples emitted per normalized profile
    pub static ref SAMPLES_PER_PROFILE: Histogram = register_histogram!(
        "profiledb_samples_per_profile",
        "Normalized samples per appended profile",
        vec![1.0, 10.0, 100.0, 1000.0, 10000.0]
    )
    .unwrap();
}

/// Record the outcome of a profile append
pub fn record_append(status: &str) {
    APPENDS_TOTAL.with_label_values(&[status]).inc();
}

/// Record the sample count a normalization run produced
pub fn record_samples_normalized(count: usize) {
    SAMPLES_NORMALIZED_TOTAL.inc_by(count as f64);
    SAMPLES_PER_PROFILE.observe(count as f64);
}

/// Record that a series iterator was opened
pub fn record_iterator_opened() {
    ITERATORS_TOTAL.inc();
}

/// Record the outcome of a per-build-id symbolization request
pub fn record_symbolization(status: &str) {
    SYMBOLIZATIONS_TOTAL.with_label_values(&[status]).inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        record_append("ok");
        record_samples_normalized(3);
        record_iterator_opened();
        record_symbolization("not_found");

        let text = gather();
        assert!(text.contains("profiledb_appends_total"));
        assert!(text.contains("profiledb_samples_normalized_total"));
    }
}
