//! The 16-bit sample index bounds a series at 65 535 samples; the append
//! that would exhaust the index must fail with `CapacityExceeded`.

use profiledb::types::{Location, Mapping, Sample};
use profiledb::{Error, Profile, ProfileSeries, ValueType};

fn tiny_profile(time_nanos: i64) -> Profile {
    Profile {
        sample_types: vec![ValueType::new("cpu", "nanoseconds")],
        period_type: ValueType::new("cpu", "nanoseconds"),
        mappings: vec![Mapping {
            id: 1,
            start: 0x1000,
            limit: 0x2000,
            build_id: "bid".to_string(),
            ..Default::default()
        }],
        locations: vec![Location {
            id: 1,
            mapping_id: 1,
            address: 0x1100,
            ..Default::default()
        }],
        samples: vec![Sample {
            location_ids: vec![1],
            values: vec![1],
            ..Default::default()
        }],
        time_nanos,
        duration_nanos: 1,
        period: 1,
        ..Default::default()
    }
}

#[test]
fn append_fails_once_index_space_is_exhausted() {
    let mut series = ProfileSeries::new();

    let max = u16::MAX as i64; // 65_535 successful appends
    for k in 1..=max {
        series.append(&tiny_profile(k * 1_000_000)).unwrap();
    }
    assert_eq!(series.num_samples(), u16::MAX);

    let err = series.append(&tiny_profile((max + 1) * 1_000_000)).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded));
    assert_eq!(series.num_samples(), u16::MAX);

    // Every appended sample is still replayable.
    let mut it = series.iter();
    let mut count = 0u32;
    let mut last_timestamp = 0;
    while it.next() {
        count += 1;
        last_timestamp = it.at().profile_meta().timestamp;
    }
    assert_eq!(count, u16::MAX as u32);
    assert_eq!(last_timestamp, max);
}
