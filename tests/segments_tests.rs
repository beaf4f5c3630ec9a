use proptest::prelude::*;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use seriesdb::segments::SEGMENTS_DIR;
use seriesdb::{
    DataPoint, DataPointSerde, DbConfig, DbError, DbEvent, DbEventListener,
    PeriodicSegmentFinder, SegmentedTimeSeriesDb, StringKeySerde, TimeRange, TimeSeriesDb,
    Timestamp,
};

const PERIOD: u64 = 100;

#[derive(Debug, Default)]
struct RecordingListener {
    events: Mutex<Vec<DbEvent>>,
}

impl DbEventListener for RecordingListener {
    fn on_event(&self, event: DbEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn config(dir: &Path) -> DbConfig {
    DbConfig {
        flush_size: 4,
        shift_index_units: vec![1, 3],
        ..DbConfig::with_base_dir(dir)
    }
}

fn segmented(dir: &Path) -> SegmentedTimeSeriesDb<String, DataPoint> {
    SegmentedTimeSeriesDb::open(
        config(dir),
        StringKeySerde,
        DataPointSerde,
        PeriodicSegmentFinder::new(0, PERIOD).unwrap(),
    )
    .unwrap()
}

fn reference(dir: &Path, values: &[DataPoint]) -> TimeSeriesDb<String, DataPoint> {
    let db = TimeSeriesDb::open(config(dir), StringKeySerde, DataPointSerde).unwrap();
    db.update(&"ref".to_string(), &values.to_vec()).unwrap();
    db
}

fn collect(it: impl Iterator<Item = Result<DataPoint, DbError>>) -> Vec<DataPoint> {
    it.collect::<Result<Vec<_>, _>>().unwrap()
}

fn assert_equivalent(
    seg: &SegmentedTimeSeriesDb<String, DataPoint>,
    key: &String,
    reference: &TimeSeriesDb<String, DataPoint>,
    probes: &[Timestamp],
) {
    let rkey = "ref".to_string();
    assert_eq!(seg.len(key).unwrap(), reference.len(&rkey).unwrap());
    for &t in probes {
        assert_eq!(
            seg.get_latest_value(key, t).unwrap(),
            reference.get_latest_value(&rkey, t).unwrap(),
            "latest at {}",
            t
        );
        for n in [0u32, 1, 2, 3, 7, 25] {
            assert_eq!(
                seg.get_previous_value(key, t, n).unwrap(),
                reference.get_previous_value(&rkey, t, n).unwrap(),
                "previous({}, {})",
                t,
                n
            );
            assert_eq!(
                seg.get_next_value(key, t, n).unwrap(),
                reference.get_next_value(&rkey, t, n).unwrap(),
                "next({}, {})",
                t,
                n
            );
        }
    }
    for (from, to) in [(None, None), (Some(50), Some(250)), (Some(99), Some(100)), (Some(180), None)] {
        assert_eq!(
            collect(seg.range_values(key, from, to).unwrap()),
            collect(reference.range_values(&rkey, from, to).unwrap()),
            "range {:?}..{:?}",
            from,
            to
        );
        assert_eq!(
            collect(seg.range_reverse_values(key, from, to).unwrap()),
            collect(reference.range_reverse_values(&rkey, from, to).unwrap()),
            "reverse range {:?}..{:?}",
            from,
            to
        );
    }
}

#[test]
fn boundary_reads_match_unsegmented_store() {
    let seg_dir = tempdir().unwrap();
    let ref_dir = tempdir().unwrap();
    let key = "EUR/USD".to_string();
    let times = [5u64, 40, 99, 99, 100, 100, 150, 199, 230, 260, 261, 299, 300, 345];
    let values: Vec<DataPoint> = times
        .iter()
        .enumerate()
        .map(|(i, &t)| DataPoint::new(t, i as f64))
        .collect();

    let seg = segmented(seg_dir.path());
    assert_eq!(seg.append_all(&key, values.clone()).unwrap(), values.len() as u64);
    let closed: Vec<TimeRange> = seg
        .closed_segments(&key)
        .unwrap()
        .into_iter()
        .map(|c| c.segment)
        .collect();
    assert_eq!(
        closed,
        vec![
            TimeRange::new(0, 100),
            TimeRange::new(100, 200),
            TimeRange::new(200, 300)
        ]
    );
    assert_eq!(seg.live_len(&key).unwrap(), 2);

    let reference = reference(ref_dir.path(), &values);
    let probes: Vec<Timestamp> = (0..=360).step_by(3).chain([99, 100, 199, 200, 300, 345, 500]).collect();
    assert_equivalent(&seg, &key, &reference, &probes);

    // a range spanning every boundary is one monotonic sequence
    let all = collect(seg.range_values(&key, None, None).unwrap());
    assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(all, values);
}

#[test]
fn out_of_order_append_is_rejected() {
    let dir = tempdir().unwrap();
    let seg = segmented(dir.path());
    let key = "k".to_string();
    seg.append(&key, DataPoint::new(120, 1.0)).unwrap();
    seg.append(&key, DataPoint::new(210, 2.0)).unwrap();

    let err = seg.append(&key, DataPoint::new(150, 3.0)).unwrap_err();
    assert!(
        matches!(err, DbError::OutOfOrder { last: 210, got: 150, .. }),
        "got {:?}",
        err
    );
    assert_eq!(seg.len(&key).unwrap(), 2);
}

#[test]
fn expired_live_segment_closes_and_reopens_for_late_values() {
    let dir = tempdir().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let seg = SegmentedTimeSeriesDb::open(
        DbConfig {
            event_listener: listener.clone(),
            ..config(dir.path())
        },
        StringKeySerde,
        DataPointSerde,
        PeriodicSegmentFinder::new(0, PERIOD).unwrap(),
    )
    .unwrap();
    let key = "late".to_string();
    seg.append_all(&key, [10u64, 20, 30].map(|t| DataPoint::new(t, t as f64)))
        .unwrap();

    assert!(!seg.close_expired_segments(&key, 99).unwrap());
    assert!(seg.close_expired_segments(&key, 100).unwrap());
    assert_eq!(seg.live_len(&key).unwrap(), 0);
    assert_eq!(seg.closed_segments(&key).unwrap().len(), 1);
    assert_eq!(seg.get_latest_value(&key, 25).unwrap().unwrap().timestamp, 20);

    // a late value for the closed segment reopens it
    seg.append(&key, DataPoint::new(40, 40.0)).unwrap();
    assert!(seg.closed_segments(&key).unwrap().is_empty());
    assert_eq!(seg.live_len(&key).unwrap(), 4);
    let all: Vec<Timestamp> = collect(seg.range_values(&key, None, None).unwrap())
        .iter()
        .map(|p| p.timestamp)
        .collect();
    assert_eq!(all, vec![10, 20, 30, 40]);

    let events = listener.events.lock().unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, DbEvent::SegmentClosed { values: 3, .. }))
            .count(),
        1
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, DbEvent::SegmentReopened { segment, .. } if *segment == TimeRange::new(0, 100))));
}

#[test]
fn closed_segments_survive_restart_and_registry_loss() {
    let dir = tempdir().unwrap();
    let key = "durable".to_string();
    let values: Vec<DataPoint> = (0..30u64).map(|i| DataPoint::new(i * 10 + 1, i as f64)).collect();
    {
        let seg = segmented(dir.path());
        seg.append_all(&key, values.clone()).unwrap();
        assert_eq!(seg.closed_segments(&key).unwrap().len(), 2);
    }

    // live values are memory-only; closed segments come back from disk
    let seg = segmented(dir.path());
    assert_eq!(seg.closed_segments(&key).unwrap().len(), 2);
    assert_eq!(seg.len(&key).unwrap(), 20);
    assert_eq!(collect(seg.range_values(&key, None, None).unwrap()), values[..20].to_vec());
    drop(seg);

    let registry_dir = dir.path().join(SEGMENTS_DIR);
    for entry in std::fs::read_dir(&registry_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "tbl") {
            std::fs::remove_file(path).unwrap();
        }
    }
    let seg = segmented(dir.path());
    let recovered = seg.closed_segments(&key).unwrap();
    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[0].value_count, 10);
    assert_eq!(recovered[1].first_end_time, 101);
    assert_eq!(seg.get_previous_value(&key, 191, 12).unwrap().unwrap().timestamp, 71);
}

#[test]
fn delete_all_removes_closed_and_live_values() {
    let dir = tempdir().unwrap();
    let seg = segmented(dir.path());
    let key = "wipe".to_string();
    seg.append_all(&key, (0..25u64).map(|i| DataPoint::new(i * 10, i as f64)))
        .unwrap();
    assert_eq!(seg.len(&key).unwrap(), 25);

    seg.delete_all(&key).unwrap();
    seg.delete_all(&key).unwrap();
    assert_eq!(seg.len(&key).unwrap(), 0);
    assert!(seg.closed_segments(&key).unwrap().is_empty());
    assert!(seg.get_latest_value(&key, 100).unwrap().is_none());
    assert!(seg.historical().list_series().unwrap().is_empty());

    seg.append(&key, DataPoint::new(5, 1.0)).unwrap();
    assert_eq!(seg.len(&key).unwrap(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 16,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_segmented_matches_reference(gaps in prop::collection::vec(0u64..40, 1..80)) {
        let mut t = 1u64;
        let values: Vec<DataPoint> = gaps
            .into_iter()
            .enumerate()
            .map(|(i, gap)| {
                t += gap;
                DataPoint::new(t, i as f64)
            })
            .collect();
        let seg_dir = tempdir().unwrap();
        let ref_dir = tempdir().unwrap();
        let key = "p".to_string();
        let seg = segmented(seg_dir.path());
        seg.append_all(&key, values.clone()).unwrap();
        let reference = reference(ref_dir.path(), &values);
        let last = values[values.len() - 1].timestamp;
        let probes: Vec<Timestamp> = (1..=last + 5).step_by(7).collect();
        assert_equivalent(&seg, &key, &reference, &probes);
    }
}
