use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;
use std::time::Duration;

use crate::types::{SeriesId, Timestamp};

/// Structured, in-process event hook for observability.
///
/// The library never prints. Conditions worth a log line (lost creation races, late data,
/// series that fail to decode) are reported here, and the caller decides where they go.
/// [`TracingEventListener`] forwards them to `tracing`.
pub trait StoreEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: StoreEvent);
}

/// Structured events emitted by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ChunkCreated { dataset: String, start_time_secs: Timestamp },
    /// Another thread installed the chunk for this bucket first; its chunk is used.
    ChunkCreationRace { bucket: Timestamp },
    ChunkReadOnly { dataset: String, series: usize, bytes: u64 },
    ChunkReadOnlyFailed { dataset: String, error: String },
    ChunkDeleted { dataset: String },
    ChunkCloseFailed { dataset: String, error: String },

    /// One series could not be decoded during a query; the rest of the result is returned.
    SeriesDecodeFailed { dataset: String, series: SeriesId, error: String },

    IngestRejected { line: String, error: String },
    LateData { line: String, error: String },
    IngestFileFailed { path: String, error: String },

    LifecycleRunCompleted { now: Timestamp, deleted: usize, read_only: usize },
    LifecycleRunFailed { now: Timestamp, error: String },
    LifecycleThreadStarted,
    LifecycleThreadStopping,
    LifecycleThreadPanicked,
}

#[derive(Debug)]
pub struct NoopEventListener;

impl StoreEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: StoreEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn StoreEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` at a level matching its severity.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl StoreEventListener for TracingEventListener {
    fn on_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::ChunkCreated {
                dataset,
                start_time_secs,
            } => tracing::debug!(%dataset, start_time_secs, "chunk created"),
            StoreEvent::ChunkCreationRace { bucket } => {
                tracing::warn!(bucket, "lost chunk creation race, using existing chunk")
            }
            StoreEvent::ChunkReadOnly {
                dataset,
                series,
                bytes,
            } => tracing::info!(%dataset, series, bytes, "chunk converted to read-only"),
            StoreEvent::ChunkReadOnlyFailed { dataset, error } => {
                tracing::error!(%dataset, %error, "read-only conversion failed")
            }
            StoreEvent::ChunkDeleted { dataset } => tracing::info!(%dataset, "stale chunk deleted"),
            StoreEvent::ChunkCloseFailed { dataset, error } => {
                tracing::error!(%dataset, %error, "closing chunk failed")
            }
            StoreEvent::SeriesDecodeFailed {
                dataset,
                series,
                error,
            } => tracing::error!(%dataset, series, %error, "series decode failed"),
            StoreEvent::IngestRejected { line, error } => {
                tracing::warn!(%line, %error, "invalid ingest line dropped")
            }
            StoreEvent::LateData { line, error } => {
                tracing::debug!(%line, %error, "late point dropped")
            }
            StoreEvent::IngestFileFailed { path, error } => {
                tracing::error!(%path, %error, "ingest file failed")
            }
            StoreEvent::LifecycleRunCompleted {
                now,
                deleted,
                read_only,
            } => tracing::info!(now, deleted, read_only, "chunk lifecycle run completed"),
            StoreEvent::LifecycleRunFailed { now, error } => {
                tracing::error!(now, %error, "chunk lifecycle run failed")
            }
            StoreEvent::LifecycleThreadStarted => tracing::debug!("lifecycle thread started"),
            StoreEvent::LifecycleThreadStopping => tracing::debug!("lifecycle thread stopping"),
            StoreEvent::LifecycleThreadPanicked => tracing::error!("lifecycle thread panicked"),
        }
    }
}

/// Metrics instrumentation through the `metrics` facade, plus optional in-process scraping.
///
/// Emitting is a no-op until a recorder is installed.
pub mod db_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const INGEST_POINTS: &str = "chunkdb_ingest_points";
    pub const INGEST_REJECTED_LINES: &str = "chunkdb_ingest_rejected_lines";
    pub const LATE_POINTS: &str = "chunkdb_late_points";
    pub const QUERY_DURATION_SECONDS: &str = "chunkdb_query_duration_seconds";
    pub const QUERY_SERIES: &str = "chunkdb_query_series";
    pub const LIFECYCLE_DURATION_SECONDS: &str = "chunkdb_lifecycle_duration_seconds";
    pub const CHUNKS_READ_ONLY: &str = "chunkdb_chunks_read_only";
    pub const CHUNKS_DELETED: &str = "chunkdb_chunks_deleted";
    pub const LIVE_CHUNKS: &str = "chunkdb_live_chunks";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("chunkdb-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_ingest_points(points: u64) {
        if points > 0 {
            ::metrics::counter!(INGEST_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_ingest_rejected() {
        ::metrics::counter!(INGEST_REJECTED_LINES).increment(1);
    }

    #[inline]
    pub fn record_late_point() {
        ::metrics::counter!(LATE_POINTS).increment(1);
    }

    #[inline]
    pub fn record_query(duration: Duration, series: usize) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
        ::metrics::histogram!(QUERY_SERIES).record(series as f64);
    }

    #[inline]
    pub fn record_lifecycle_run(duration: Duration, deleted: usize, read_only: usize) {
        ::metrics::histogram!(LIFECYCLE_DURATION_SECONDS).record(duration.as_secs_f64());
        if deleted > 0 {
            ::metrics::counter!(CHUNKS_DELETED).increment(deleted as u64);
        }
        if read_only > 0 {
            ::metrics::counter!(CHUNKS_READ_ONLY).increment(read_only as u64);
        }
    }

    #[inline]
    pub fn set_live_chunks(chunks: usize) {
        ::metrics::gauge!(LIVE_CHUNKS).set(chunks as f64);
    }

    /// Registers descriptions for every metric above.
    pub fn describe_all() {
        describe_counter!(
            INGEST_POINTS,
            Unit::Count,
            "Total number of points stored via ChunkManager::add_metric."
        );
        describe_counter!(
            INGEST_REJECTED_LINES,
            Unit::Count,
            "Ingest lines dropped as malformed."
        );
        describe_counter!(
            LATE_POINTS,
            Unit::Count,
            "Points dropped because their chunk was already read-only."
        );
        describe_counter!(
            CHUNKS_READ_ONLY,
            Unit::Count,
            "Chunks converted to the read-only representation."
        );
        describe_counter!(CHUNKS_DELETED, Unit::Count, "Stale chunks closed and removed.");

        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of ChunkManager::query."
        );
        describe_histogram!(
            QUERY_SERIES,
            Unit::Count,
            "Number of series returned per query."
        );
        describe_histogram!(
            LIFECYCLE_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of one chunk lifecycle run."
        );

        describe_gauge!(LIVE_CHUNKS, Unit::Count, "Chunks currently held by the manager.");
    }
}
