//! FileMetricWriter: line accounting, late data, and file errors.

use chunkdb::lifecycle::LifecycleConfig;
use chunkdb::telemetry::{StoreEvent, StoreEventListener};
use chunkdb::{ChunkLifecycleTask, ChunkManager, ChunkManagerConfig, DbError, FileMetricWriter};
use std::io::Write;
use std::sync::{Arc, Mutex};

const START: i64 = 1488499200;

#[derive(Debug, Default)]
struct Collect(Mutex<Vec<StoreEvent>>);

impl StoreEventListener for Collect {
    fn on_event(&self, event: StoreEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn manager() -> Arc<ChunkManager> {
    Arc::new(ChunkManager::new(ChunkManagerConfig::default()).unwrap())
}

fn write_lines(lines: &[String]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file.flush().unwrap();
    file
}

#[test]
fn counts_ingested_and_invalid_lines_and_skips_blanks() {
    let file = write_lines(&[
        format!("put cpu {} 1.5 host=a", START),
        String::new(),
        "   ".to_string(),
        format!("put cpu {} 2.5 host=a", START + 10),
        "put cpu notatime 1 host=a".to_string(),
        "garbage".to_string(),
        format!("put mem {} 7 host=b", START + 20),
    ]);
    let manager = manager();
    let events = Arc::new(Collect::default());
    let writer = FileMetricWriter::new(file.path(), Arc::clone(&manager))
        .with_event_listener(events.clone());

    let report = writer.ingest().unwrap();
    assert_eq!(report.ingested, 3);
    assert_eq!(report.invalid, 2);
    assert_eq!(report.late, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.lines(), 5);
    assert_eq!(manager.stats().points, 3);
    assert_eq!(manager.stats().metrics, 2);

    let events = events.0.lock().unwrap();
    let rejected: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StoreEvent::IngestRejected { line, .. } => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(rejected, ["put cpu notatime 1 host=a", "garbage"]);
}

#[test]
fn points_for_read_only_chunks_count_as_late() {
    let manager = manager();
    manager.add_metric(&format!("put cpu {} 1 host=a", START)).unwrap();
    let task = ChunkLifecycleTask::new(Arc::clone(&manager), &LifecycleConfig::default()).unwrap();
    assert_eq!(task.detect_chunks_past_cutoff(START + 7200).unwrap(), 1);

    let file = write_lines(&[
        format!("put cpu {} 2 host=a", START + 5),
        format!("put cpu {} 3 host=a", START + 7200),
    ]);
    let events = Arc::new(Collect::default());
    let report = FileMetricWriter::new(file.path(), Arc::clone(&manager))
        .with_event_listener(events.clone())
        .ingest()
        .unwrap();
    assert_eq!(report.late, 1);
    assert_eq!(report.ingested, 1);
    assert!(events
        .0
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, StoreEvent::LateData { .. })));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.txt");
    let events = Arc::new(Collect::default());
    let err = FileMetricWriter::new(&path, manager())
        .with_event_listener(events.clone())
        .ingest()
        .unwrap_err();
    assert!(matches!(err, DbError::Io(_)));
    assert!(matches!(
        events.0.lock().unwrap().as_slice(),
        [StoreEvent::IngestFileFailed { .. }]
    ));
}
