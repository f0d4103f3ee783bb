//! Chunk lifecycle: aged chunks turn read-only, stale chunks are deleted.
//!
//! [`ChunkLifecycleTask`] does one pass at a given instant. [`LifecycleWorker`] runs it on a
//! background thread at a fixed interval.

use crate::core::ChunkManager;
use crate::error::DbError;
use crate::telemetry::{db_metrics, StoreEvent, StoreEventListener};
use crate::types::Timestamp;

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_METRICS_DELAY_SECS: i64 = 15 * 60;
pub const DEFAULT_STALE_DATA_DELAY_SECS: i64 = 6 * 60 * 60;
pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(60);

/// Timing of the lifecycle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Grace period after a chunk's end before it turns read-only.
    pub metrics_delay_secs: i64,
    /// Age past a chunk's end at which it is deleted.
    pub stale_data_delay_secs: i64,
    /// How often the background worker runs the task.
    pub run_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            metrics_delay_secs: DEFAULT_METRICS_DELAY_SECS,
            stale_data_delay_secs: DEFAULT_STALE_DATA_DELAY_SECS,
            run_interval: DEFAULT_RUN_INTERVAL,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), DbError> {
        if self.metrics_delay_secs < 0 {
            return Err(DbError::ConfigError(format!(
                "metrics delay must not be negative, got {}",
                self.metrics_delay_secs
            )));
        }
        if self.stale_data_delay_secs < self.metrics_delay_secs {
            return Err(DbError::ConfigError(format!(
                "stale data delay ({}s) must not be shorter than metrics delay ({}s)",
                self.stale_data_delay_secs, self.metrics_delay_secs
            )));
        }
        if self.run_interval.is_zero() {
            return Err(DbError::ConfigError(
                "lifecycle run interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one lifecycle pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub deleted: usize,
    pub read_only: usize,
}

/// One lifecycle pass over a manager's chunks.
#[derive(Debug, Clone)]
pub struct ChunkLifecycleTask {
    manager: Arc<ChunkManager>,
    metrics_delay_secs: i64,
    stale_data_delay_secs: i64,
}

impl ChunkLifecycleTask {
    pub fn new(manager: Arc<ChunkManager>, config: &LifecycleConfig) -> Result<Self, DbError> {
        config.validate()?;
        Ok(Self {
            manager,
            metrics_delay_secs: config.metrics_delay_secs,
            stale_data_delay_secs: config.stale_data_delay_secs,
        })
    }

    pub fn manager(&self) -> &Arc<ChunkManager> {
        &self.manager
    }

    /// Runs the pass at the current wall-clock time.
    pub fn run(&self) -> Result<LifecycleReport, DbError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| DbError::Internal(format!("system clock before unix epoch: {}", e)))?
            .as_secs() as Timestamp;
        self.run_at(now)
    }

    /// Runs the pass as if the time were `now`: stale chunks are deleted first, so no work is
    /// spent converting chunks that are about to go.
    pub fn run_at(&self, now: Timestamp) -> Result<LifecycleReport, DbError> {
        let deleted = self.delete_stale_data(now)?;
        let read_only = self.detect_read_only_chunks(now)?;
        Ok(LifecycleReport { deleted, read_only })
    }

    pub fn detect_read_only_chunks(&self, now: Timestamp) -> Result<usize, DbError> {
        self.detect_chunks_past_cutoff(now - self.metrics_delay_secs)
    }

    /// Converts mutable chunks with `end <= cutoff`. A cutoff `<= 0` is rejected.
    pub fn detect_chunks_past_cutoff(&self, cutoff: Timestamp) -> Result<usize, DbError> {
        if cutoff <= 0 {
            return Err(DbError::InvalidArgument(format!(
                "read-only cutoff must be positive, got {}",
                cutoff
            )));
        }
        self.manager.to_read_only_chunks(cutoff)
    }

    pub fn delete_stale_data(&self, now: Timestamp) -> Result<usize, DbError> {
        self.delete_stale_chunks(now - self.stale_data_delay_secs)
    }

    /// Deletes chunks with `end <= cutoff`. A cutoff `<= 0` is rejected.
    pub fn delete_stale_chunks(&self, cutoff: Timestamp) -> Result<usize, DbError> {
        if cutoff <= 0 {
            return Err(DbError::InvalidArgument(format!(
                "stale data cutoff must be positive, got {}",
                cutoff
            )));
        }
        self.manager.remove_stale_chunks(cutoff)
    }
}

/// Commands sent to the lifecycle thread.
enum LifecycleCommand {
    RunNow {
        ack: mpsc::Sender<Result<LifecycleReport, DbError>>,
    },
    Shutdown,
}

/// Background thread running a [`ChunkLifecycleTask`] every interval until dropped.
#[derive(Debug)]
pub struct LifecycleWorker {
    cmd_tx: mpsc::Sender<LifecycleCommand>,
    handle: Option<JoinHandle<()>>,
    events: Arc<dyn StoreEventListener>,
}

impl LifecycleWorker {
    pub fn spawn(
        task: ChunkLifecycleTask,
        interval: Duration,
        events: Arc<dyn StoreEventListener>,
    ) -> Result<Self, DbError> {
        if interval.is_zero() {
            return Err(DbError::ConfigError(
                "lifecycle run interval must be positive".to_string(),
            ));
        }
        let (cmd_tx, cmd_rx) = mpsc::channel::<LifecycleCommand>();
        let thread_events = Arc::clone(&events);

        let handle = thread::Builder::new()
            .name("chunkdb-lifecycle".to_string())
            .spawn(move || {
                thread_events.on_event(StoreEvent::LifecycleThreadStarted);
                loop {
                    match cmd_rx.recv_timeout(interval) {
                        Ok(LifecycleCommand::RunNow { ack }) => {
                            let _ = ack.send(run_once(&task, &*thread_events));
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let _ = run_once(&task, &*thread_events);
                        }
                        Ok(LifecycleCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                            break;
                        }
                    }
                }
                thread_events.on_event(StoreEvent::LifecycleThreadStopping);
            })
            .map_err(|e| DbError::BackgroundTaskError(format!("failed to spawn lifecycle thread: {}", e)))?;

        Ok(Self {
            cmd_tx,
            handle: Some(handle),
            events,
        })
    }

    /// Runs a pass now on the worker thread and waits for its report.
    pub fn run_now(&self) -> Result<LifecycleReport, DbError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.cmd_tx
            .send(LifecycleCommand::RunNow { ack: ack_tx })
            .map_err(|_| DbError::BackgroundTaskError("lifecycle thread is not running".to_string()))?;
        ack_rx
            .recv()
            .map_err(|_| DbError::BackgroundTaskError("lifecycle thread exited".to_string()))?
    }

    /// Stops the thread and waits for it to exit.
    pub fn shutdown(mut self) -> Result<(), DbError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), DbError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.cmd_tx.send(LifecycleCommand::Shutdown);
        handle.join().map_err(|_| {
            self.events.on_event(StoreEvent::LifecycleThreadPanicked);
            DbError::BackgroundTaskError("lifecycle thread panicked".to_string())
        })
    }
}

impl Drop for LifecycleWorker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_once(
    task: &ChunkLifecycleTask,
    events: &dyn StoreEventListener,
) -> Result<LifecycleReport, DbError> {
    let started = Instant::now();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as Timestamp;
    match task.run_at(now) {
        Ok(report) => {
            db_metrics::record_lifecycle_run(started.elapsed(), report.deleted, report.read_only);
            events.on_event(StoreEvent::LifecycleRunCompleted {
                now,
                deleted: report.deleted,
                read_only: report.read_only,
            });
            Ok(report)
        }
        Err(e) => {
            events.on_event(StoreEvent::LifecycleRunFailed {
                now,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChunkManagerConfig;

    fn task(metrics_delay: i64, stale_delay: i64) -> ChunkLifecycleTask {
        let manager = Arc::new(ChunkManager::new(ChunkManagerConfig::default()).unwrap());
        let config = LifecycleConfig {
            metrics_delay_secs: metrics_delay,
            stale_data_delay_secs: stale_delay,
            ..LifecycleConfig::default()
        };
        ChunkLifecycleTask::new(manager, &config).unwrap()
    }

    #[test]
    fn config_defaults_and_validation() {
        let config = LifecycleConfig::default();
        assert_eq!(config.metrics_delay_secs, 900);
        assert_eq!(config.stale_data_delay_secs, 21600);
        assert!(config.validate().is_ok());

        let inverted = LifecycleConfig {
            metrics_delay_secs: 600,
            stale_data_delay_secs: 300,
            ..config
        };
        assert!(matches!(inverted.validate(), Err(DbError::ConfigError(_))));

        let zero_interval = LifecycleConfig {
            run_interval: Duration::ZERO,
            ..config
        };
        assert!(matches!(zero_interval.validate(), Err(DbError::ConfigError(_))));
    }

    #[test]
    fn non_positive_cutoffs_are_rejected() {
        let t = task(900, 21600);
        assert!(t.detect_chunks_past_cutoff(0).unwrap_err().is_invalid_argument());
        assert!(t.delete_stale_chunks(-5).unwrap_err().is_invalid_argument());
        assert!(t.detect_read_only_chunks(900).unwrap_err().is_invalid_argument());
        assert!(t.delete_stale_data(100).unwrap_err().is_invalid_argument());
        assert!(t.run_at(1000).is_err());
    }

    #[test]
    fn run_at_deletes_before_converting() {
        let t = task(900, 21600);
        t.manager().add_metric("put cpu 100 1 host=a").unwrap();
        t.manager().add_metric("put cpu 21700 1 host=a").unwrap();

        // The first chunk is both stale and convertible; it is only deleted.
        let report = t.run_at(7200 + 21600).unwrap();
        assert_eq!(report, LifecycleReport { deleted: 1, read_only: 0 });
        assert_eq!(t.manager().chunk_count(), 1);
    }

    #[test]
    fn worker_runs_on_demand_and_stops_on_shutdown() {
        let t = task(900, 21600);
        let worker = LifecycleWorker::spawn(
            t,
            Duration::from_secs(3600),
            crate::telemetry::noop_event_listener(),
        )
        .unwrap();
        assert_eq!(worker.run_now().unwrap(), LifecycleReport::default());
        worker.shutdown().unwrap();
    }
}
