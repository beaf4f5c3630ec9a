use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use seriesdb::updater::SkipReason;
use seriesdb::{
    DataPoint, DataPointSerde, DbConfig, DbError, FnSource, StringKeySerde, TimeSeriesDb,
    Timestamp, UpdateContext, UpdateOutcome, UpdatePolicy, UpdateStatus,
};

fn open_db(dir: &Path, lock_timeout: Duration) -> TimeSeriesDb<String, DataPoint> {
    let config = DbConfig {
        flush_size: 4,
        lock_timeout,
        running_wait: Duration::from_millis(20),
        ..DbConfig::with_base_dir(dir)
    };
    TimeSeriesDb::open(config, StringKeySerde, DataPointSerde).unwrap()
}

fn values(n: u64) -> Vec<DataPoint> {
    (1..=n).map(|t| DataPoint::new(t * 10, t as f64)).collect()
}

#[test]
fn open_cursor_makes_delete_time_out() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_millis(50));
    let key = "held".to_string();
    db.update(&key, &values(10)).unwrap();

    let mut cursor = db.range_values(&key, None, None).unwrap();
    assert!(!cursor.is_open());
    assert_eq!(cursor.next().unwrap().unwrap().timestamp, 10);
    assert!(cursor.is_open());

    let err = db.delete_all(&key).unwrap_err();
    assert!(matches!(err, DbError::LockTimeout { .. }), "got {:?}", err);
    assert!(err.is_retryable());
    assert_eq!(db.len(&key).unwrap(), 10);

    // point reads on the same thread still go through while the cursor is open
    assert_eq!(db.get_latest_value(&key, 35).unwrap().unwrap().timestamp, 30);

    cursor.close();
    assert!(!cursor.is_open());
    assert!(cursor.next().is_none());
    db.delete_all(&key).unwrap();
    assert_eq!(db.len(&key).unwrap(), 0);
}

#[test]
fn dropping_cursor_releases_lock() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_millis(50));
    let key = "dropped".to_string();
    db.update(&key, &values(10)).unwrap();

    {
        let mut cursor = db.range_reverse_values(&key, None, None).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().timestamp, 100);
    }
    db.delete_all(&key).unwrap();
}

#[test]
fn exhausted_cursor_releases_lock() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_millis(50));
    let key = "drained".to_string();
    db.update(&key, &values(6)).unwrap();

    let mut cursor = db.range_values(&key, Some(20), Some(40)).unwrap();
    let got: Vec<Timestamp> = cursor.by_ref().map(|r| r.unwrap().timestamp).collect();
    assert_eq!(got, vec![20, 30, 40]);
    assert!(!cursor.is_open());
    db.delete_all(&key).unwrap();
}

#[test]
fn unstarted_cursor_does_not_block_writers() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_millis(50));
    let key = "pending".to_string();
    db.update(&key, &values(6)).unwrap();

    let cursor = db.range_values(&key, None, None).unwrap();
    db.delete_all(&key).unwrap();
    assert_eq!(cursor.count(), 0);
}

#[test]
fn update_is_skipped_while_a_cursor_reads() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_millis(30));
    let key = "contended".to_string();
    db.update(&key, &values(5)).unwrap();

    let mut cursor = db.range_values(&key, None, None).unwrap();
    cursor.next().unwrap().unwrap();
    let outcome = db.update(&key, &values(9)).unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Skipped {
            reason: SkipReason::LockContended
        }
    );
    drop(cursor);

    // the one-value tail chunk is rewritten together with the four new values
    let outcome = db.update(&key, &values(9)).unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Completed {
            appended: 4,
            chunks: 2
        }
    );
}

#[test]
fn delete_waits_for_cursor_within_timeout() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_secs(5));
    let key = "waiter".to_string();
    db.update(&key, &values(8)).unwrap();

    let mut cursor = db.range_values(&key, None, None).unwrap();
    cursor.next().unwrap().unwrap();

    thread::scope(|s| {
        let deleter = s.spawn(|| db.delete_all(&key));
        thread::sleep(Duration::from_millis(50));
        // recursive point reads are not blocked by the queued writer
        assert_eq!(db.get_previous_value(&key, 80, 2).unwrap().unwrap().timestamp, 60);
        cursor.close();
        deleter.join().unwrap().unwrap();
    });
    assert_eq!(db.len(&key).unwrap(), 0);
}

#[test]
fn skip_if_running_policy_skips_concurrent_update() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_secs(5));
    let key = "busy".to_string();

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let slow = FnSource(move |from: Timestamp| {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        Ok::<_, DbError>((1..=6u64).map(move |t| Ok(DataPoint::new(from + t, t as f64))))
    });

    let (db_ref, key_ref) = (&db, &key);
    thread::scope(|s| {
        // the source owns a receiver, so it moves into the runner thread
        let runner = s.spawn(move || db_ref.update(key_ref, &slow));
        started_rx.recv().unwrap();
        assert_eq!(db.update_status(&key), UpdateStatus::Running);

        let ctx = UpdateContext::from_config(db.config()).with_policy(UpdatePolicy::SkipIfRunning);
        let outcome = db.update_with(&key, &values(3), &ctx).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Skipped {
                reason: SkipReason::AlreadyRunning
            }
        );

        release_tx.send(()).unwrap();
        let outcome = runner.join().unwrap().unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Completed {
                appended: 6,
                chunks: 2
            }
        );
    });
    assert_eq!(db.update_status(&key), UpdateStatus::Completed);
    assert_eq!(db.len(&key).unwrap(), 6);
}

#[test]
fn parallel_readers_see_complete_series() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path(), Duration::from_secs(5));
    let key = "shared".to_string();
    let data = values(200);
    db.update(&key, &data).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..10 {
                    let read: Vec<DataPoint> = db
                        .range_values(&key, None, None)
                        .unwrap()
                        .collect::<Result<_, _>>()
                        .unwrap();
                    assert_eq!(read, data);
                    assert_eq!(db.get_latest_value(&key, 1_005).unwrap().unwrap().timestamp, 1_000);
                }
            });
        }
    });
    let stats = db.cache_stats();
    assert!(stats.hits > 0);
    assert_eq!(stats.pinned, 0);
}
