//! Line-oriented ingest from a local file.

use crate::core::ChunkManager;
use crate::error::DbError;
use crate::telemetry::{db_metrics, noop_event_listener, StoreEvent, StoreEventListener};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Line counts from one [`FileMetricWriter::ingest`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub ingested: usize,
    /// Malformed lines, dropped.
    pub invalid: usize,
    /// Points for chunks that were already read-only, dropped.
    pub late: usize,
    /// Lines that failed for any other reason.
    pub failed: usize,
}

impl IngestReport {
    pub fn lines(&self) -> usize {
        self.ingested + self.invalid + self.late + self.failed
    }
}

/// Reads `put` lines from a file once and feeds them to a [`ChunkManager`].
#[derive(Debug)]
pub struct FileMetricWriter {
    path: PathBuf,
    manager: Arc<ChunkManager>,
    events: Arc<dyn StoreEventListener>,
}

impl FileMetricWriter {
    pub fn new(path: impl AsRef<Path>, manager: Arc<ChunkManager>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            manager,
            events: noop_event_listener(),
        }
    }

    pub fn with_event_listener(mut self, events: Arc<dyn StoreEventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manager(&self) -> &Arc<ChunkManager> {
        &self.manager
    }

    /// Ingests every non-blank line.
    ///
    /// Bad lines are counted and reported, never fatal. Only failing to open or read the file
    /// is an error.
    pub fn ingest(&self) -> Result<IngestReport, DbError> {
        let file = File::open(&self.path).map_err(|e| {
            self.events.on_event(StoreEvent::IngestFileFailed {
                path: self.path.display().to_string(),
                error: e.to_string(),
            });
            DbError::Io(e)
        })?;

        let mut report = IngestReport::default();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match self.manager.add_metric(&line) {
                Ok(()) => report.ingested += 1,
                Err(e @ DbError::InvalidArgument(_)) => {
                    report.invalid += 1;
                    db_metrics::record_ingest_rejected();
                    self.events.on_event(StoreEvent::IngestRejected {
                        line,
                        error: e.to_string(),
                    });
                }
                Err(e @ DbError::ReadOnlyInsertion { .. }) => {
                    report.late += 1;
                    db_metrics::record_late_point();
                    self.events.on_event(StoreEvent::LateData {
                        line,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    self.events.on_event(StoreEvent::IngestRejected {
                        line,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}
