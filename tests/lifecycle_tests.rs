//! Lifecycle task: read-only cutoffs, stale deletion, ordering, and the background worker.

use chunkdb::chunk::ChunkState;
use chunkdb::lifecycle::{DEFAULT_METRICS_DELAY_SECS, LifecycleReport};
use chunkdb::storage::ReadOnlyStoreConfig;
use chunkdb::telemetry::{StoreEvent, StoreEventListener};
use chunkdb::{
    ChunkLifecycleTask, ChunkManager, ChunkManagerConfig, LifecycleConfig, LifecycleWorker, Query,
    QueryAggregation,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const START: i64 = 1488499200; // Fri, 03 Mar 2017 00:00:00 UTC
const TWO_HOURS: i64 = 2 * 3600;

fn put(manager: &ChunkManager, ts: i64, tags: &str) {
    manager
        .add_metric(&format!("put testMetric {} 10 {}", ts, tags))
        .expect("add_metric");
}

fn read_only_count(manager: &ChunkManager) -> usize {
    manager
        .chunks()
        .iter()
        .filter(|c| c.state().unwrap() == ChunkState::ReadOnly)
        .count()
}

fn setup(metrics_delay: i64, stale_delay: i64) -> (Arc<ChunkManager>, ChunkLifecycleTask) {
    let manager = Arc::new(
        ChunkManager::new(ChunkManagerConfig {
            dataset: "test".to_string(),
            ..ChunkManagerConfig::default()
        })
        .unwrap(),
    );
    let config = LifecycleConfig {
        metrics_delay_secs: metrics_delay,
        stale_data_delay_secs: stale_delay,
        ..LifecycleConfig::default()
    };
    let task = ChunkLifecycleTask::new(Arc::clone(&manager), &config).unwrap();
    (manager, task)
}

#[test]
fn chunks_turn_read_only_exactly_at_their_end() {
    let (manager, task) = setup(DEFAULT_METRICS_DELAY_SECS, 21600);
    assert_eq!(task.detect_chunks_past_cutoff(START).unwrap(), 0);

    put(&manager, START + 1, "host=h1 dc=dc1");
    assert_eq!(task.detect_chunks_past_cutoff(START + TWO_HOURS - 1).unwrap(), 0);
    assert_eq!(task.detect_chunks_past_cutoff(START + TWO_HOURS).unwrap(), 1);
    // Already read-only chunks are not counted again.
    assert_eq!(task.detect_chunks_past_cutoff(START + TWO_HOURS + 1).unwrap(), 0);

    put(&manager, START + TWO_HOURS + 1, "host=h1 dc=dc1");
    assert_eq!(manager.chunk_count(), 2);
    assert_eq!(read_only_count(&manager), 1);
    assert_eq!(task.detect_chunks_past_cutoff(START + 2 * TWO_HOURS - 1).unwrap(), 0);
    assert_eq!(task.detect_chunks_past_cutoff(START + 2 * TWO_HOURS).unwrap(), 1);
    assert_eq!(read_only_count(&manager), 2);
}

#[test]
fn read_only_detection_waits_for_metrics_delay() {
    let metrics_delay = 5 * 60;
    let (manager, task) = setup(metrics_delay, 21600);
    put(&manager, START + 1, "host=h1 dc=dc1");

    assert_eq!(task.detect_read_only_chunks(START + TWO_HOURS).unwrap(), 0);
    assert_eq!(
        task.detect_read_only_chunks(START + TWO_HOURS + metrics_delay - 1).unwrap(),
        0
    );
    assert_eq!(
        task.detect_read_only_chunks(START + TWO_HOURS + metrics_delay).unwrap(),
        1
    );
    assert_eq!(read_only_count(&manager), 1);
}

#[test]
fn late_points_are_distinguished_from_bad_input() {
    let (manager, task) = setup(900, 21600);
    put(&manager, START + 1, "host=h1");
    task.detect_chunks_past_cutoff(START + TWO_HOURS).unwrap();

    let late = manager
        .add_metric(&format!("put testMetric {} 1 host=h1", START + 2))
        .unwrap_err();
    assert!(late.is_read_only_insertion());
    assert!(!late.is_invalid_argument());

    let bad = manager.add_metric("put testMetric notatime 1 host=h1").unwrap_err();
    assert!(bad.is_invalid_argument());

    // Data written before the conversion is still served.
    let series = manager
        .query(
            &Query::parse("testMetric host=h1").unwrap(),
            START,
            START + TWO_HOURS,
            QueryAggregation::None,
        )
        .unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].points.len(), 1);
}

#[test]
fn stale_chunks_are_deleted_at_cutoff() {
    let (manager, task) = setup(900, 21600);
    put(&manager, START + 1, "host=h1");
    put(&manager, START + TWO_HOURS + 1, "host=h1");
    put(&manager, START + 2 * TWO_HOURS + 1, "host=h1");

    assert_eq!(task.delete_stale_chunks(START + TWO_HOURS - 1).unwrap(), 0);
    assert_eq!(task.delete_stale_chunks(START + TWO_HOURS).unwrap(), 1);
    assert_eq!(manager.chunk_count(), 2);
    assert!(manager.get_existing(START).is_none());

    assert_eq!(task.delete_stale_data(START + 3 * TWO_HOURS + 21600).unwrap(), 2);
    assert_eq!(manager.chunk_count(), 0);
}

#[test]
fn three_window_scenario_converts_before_deleting() {
    let (manager, task) = setup(900, 21600);
    for window in 0..3 {
        put(&manager, window * TWO_HOURS + 60, "host=h1");
    }
    assert_eq!(manager.chunk_count(), 3);

    // First window [0, 7200) turns read-only once 7200 + 900 has passed.
    assert_eq!(task.detect_read_only_chunks(8099).unwrap(), 0);
    assert_eq!(task.detect_read_only_chunks(8100).unwrap(), 1);
    assert_eq!(
        manager.get_existing(0).unwrap().state().unwrap(),
        ChunkState::ReadOnly
    );

    // At 22500 nothing is stale yet; the remaining two windows turn read-only.
    let report = task.run_at(22500).unwrap();
    assert_eq!(report, LifecycleReport { deleted: 0, read_only: 2 });
    assert_eq!(read_only_count(&manager), 3);

    // The first window goes at 7200 + 21600.
    let report = task.run_at(28800).unwrap();
    assert_eq!(report, LifecycleReport { deleted: 1, read_only: 0 });
    assert!(manager.get_existing(0).is_none());
    assert_eq!(manager.chunk_count(), 2);
}

#[test]
fn spilled_read_only_chunks_remove_their_files_on_delete() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(
        ChunkManager::new(ChunkManagerConfig {
            dataset: "spill".to_string(),
            read_only: ReadOnlyStoreConfig {
                spill_dir: Some(dir.path().to_path_buf()),
                ..ReadOnlyStoreConfig::default()
            },
            ..ChunkManagerConfig::default()
        })
        .unwrap(),
    );
    let task = ChunkLifecycleTask::new(Arc::clone(&manager), &LifecycleConfig::default()).unwrap();
    put(&manager, START + 1, "host=h1");
    put(&manager, START + 2, "host=h2");

    assert_eq!(task.detect_chunks_past_cutoff(START + TWO_HOURS).unwrap(), 1);
    let spill_file = dir.path().join(format!("spill_{}.series", START));
    assert!(spill_file.exists());

    let series = manager
        .query(
            &Query::parse("testMetric").unwrap(),
            START,
            START + 10,
            QueryAggregation::None,
        )
        .unwrap();
    assert_eq!(series.len(), 2);

    assert_eq!(task.delete_stale_chunks(START + TWO_HOURS).unwrap(), 1);
    assert!(!spill_file.exists());
}

#[test]
fn conversion_racing_with_ingest_and_queries_loses_no_accepted_point() {
    let (manager, task) = setup(900, 21600);
    let accepted = Arc::new(AtomicUsize::new(0));
    let writing = Arc::new(AtomicBool::new(true));

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let manager = Arc::clone(&manager);
            let accepted = Arc::clone(&accepted);
            thread::spawn(move || {
                for i in 0..500i64 {
                    let line = format!("put race {} {} worker={}", START + i * 10, i, w);
                    match manager.add_metric(&line) {
                        Ok(()) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => assert!(e.is_read_only_insertion(), "{}: {}", line, e),
                    }
                }
            })
        })
        .collect();

    let reader = {
        let manager = Arc::clone(&manager);
        let writing = Arc::clone(&writing);
        thread::spawn(move || {
            let query = Query::parse("race").unwrap();
            while writing.load(Ordering::SeqCst) {
                let series = manager
                    .query(&query, START, START + TWO_HOURS, QueryAggregation::None)
                    .unwrap();
                // Every visible point is whole: its value is its step number.
                for s in &series {
                    for p in &s.points {
                        assert_eq!(p.value, ((p.timestamp - START) / 10) as f64, "{}", s.metric);
                    }
                }
            }
        })
    };

    while accepted.load(Ordering::SeqCst) < 200 {
        thread::yield_now();
    }
    assert_eq!(task.detect_chunks_past_cutoff(START + TWO_HOURS).unwrap(), 1);

    for w in writers {
        w.join().unwrap();
    }
    writing.store(false, Ordering::SeqCst);
    reader.join().unwrap();

    let served: usize = manager
        .query(
            &Query::parse("race").unwrap(),
            START,
            START + TWO_HOURS,
            QueryAggregation::None,
        )
        .unwrap()
        .iter()
        .map(|s| s.points.len())
        .sum();
    assert_eq!(read_only_count(&manager), 1);
    assert_eq!(served, accepted.load(Ordering::SeqCst));
    assert!(served >= 200);
}

#[derive(Debug, Default)]
struct Collect(Mutex<Vec<StoreEvent>>);

impl StoreEventListener for Collect {
    fn on_event(&self, event: StoreEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[test]
fn worker_reports_runs_and_lifecycle_events() {
    let (manager, task) = setup(900, 21600);
    // A point old enough to be stale at any current wall-clock time.
    put(&manager, START + 1, "host=h1");

    let events = Arc::new(Collect::default());
    let worker = LifecycleWorker::spawn(task, Duration::from_secs(3600), events.clone()).unwrap();
    let report = worker.run_now().unwrap();
    assert_eq!(report, LifecycleReport { deleted: 1, read_only: 0 });
    assert_eq!(manager.chunk_count(), 0);
    drop(worker);

    let events = events.0.lock().unwrap();
    assert_eq!(events.first(), Some(&StoreEvent::LifecycleThreadStarted));
    assert!(events
        .iter()
        .any(|e| matches!(e, StoreEvent::LifecycleRunCompleted { deleted: 1, read_only: 0, .. })));
    assert_eq!(events.last(), Some(&StoreEvent::LifecycleThreadStopping));
}
