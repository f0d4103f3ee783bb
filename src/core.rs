//! Chunk manager: routes points to fixed-duration chunks and merges query results across them.

use crate::chunk::{Chunk, ChunkInfo, ChunkState};
use crate::error::DbError;
use crate::index::TagStore;
use crate::metric::PutRecord;
use crate::query::{Query, QueryAggregation};
use crate::storage::ReadOnlyStoreConfig;
use crate::telemetry::{db_metrics, noop_event_listener, StoreEvent, StoreEventListener};
use crate::types::{dedup, Point, TimeSeries, Timestamp, MAX_UNIX_TIMESTAMP};

use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Default chunk width: two hours.
pub const DEFAULT_CHUNK_DURATION_SECS: i64 = 2 * 60 * 60;

/// Configuration options for the [`ChunkManager`].
#[derive(Debug, Clone)]
pub struct ChunkManagerConfig {
    /// Prefix of every chunk's dataset name (`<dataset>_<start>`).
    pub dataset: String,
    /// Width of each chunk's time window, in seconds.
    pub chunk_duration_secs: i64,
    /// Representation chunks take once they turn read-only.
    pub read_only: ReadOnlyStoreConfig,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn StoreEventListener>,
}

impl Default for ChunkManagerConfig {
    fn default() -> Self {
        ChunkManagerConfig {
            dataset: "metrics".to_string(),
            chunk_duration_secs: DEFAULT_CHUNK_DURATION_SECS,
            read_only: ReadOnlyStoreConfig::default(),
            event_listener: noop_event_listener(),
        }
    }
}

impl ChunkManagerConfig {
    pub fn validate(&self) -> Result<(), DbError> {
        if self.dataset.trim().is_empty() || self.dataset.chars().any(char::is_whitespace) {
            return Err(DbError::ConfigError(format!(
                "dataset prefix must be non-empty without whitespace, got {:?}",
                self.dataset
            )));
        }
        if self.chunk_duration_secs <= 0 {
            return Err(DbError::ConfigError(format!(
                "chunk duration must be positive, got {}",
                self.chunk_duration_secs
            )));
        }
        if let Some(dir) = &self.read_only.spill_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(DbError::ConfigError(format!(
                    "spill path {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

/// Size of a [`ChunkManager`] at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub mutable_chunks: usize,
    pub read_only_chunks: usize,
    /// Metrics known to the shared tag store.
    pub metrics: usize,
    /// Per-chunk series summed over chunks.
    pub series: usize,
    pub points: usize,
    pub bytes: u64,
}

/// Owns the chunks of one dataset and the tag store they share.
///
/// Chunk creation, conversion and removal are serialized by one manager-wide lock; lookups
/// and queries go straight to the concurrent map.
#[derive(Debug)]
pub struct ChunkManager {
    chunk_map: DashMap<Timestamp, Arc<Chunk>>,
    chunk_map_sync: Mutex<()>,
    tag_store: Arc<TagStore>,
    config: ChunkManagerConfig,
}

impl ChunkManager {
    /// Creates an empty manager. Fails with [`DbError::ConfigError`] on invalid configuration.
    pub fn new(config: ChunkManagerConfig) -> Result<Self, DbError> {
        config.validate()?;
        if let Some(dir) = &config.read_only.spill_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            chunk_map: DashMap::new(),
            chunk_map_sync: Mutex::new(()),
            tag_store: Arc::new(TagStore::new()),
            config,
        })
    }

    pub fn config(&self) -> &ChunkManagerConfig {
        &self.config
    }

    pub fn tag_store(&self) -> &Arc<TagStore> {
        &self.tag_store
    }

    /// Start of the chunk window containing `timestamp`.
    pub fn bucket_start(&self, timestamp: Timestamp) -> Timestamp {
        timestamp - timestamp.rem_euclid(self.config.chunk_duration_secs)
    }

    /// Chunk covering `timestamp`, created on first use.
    pub fn get_chunk(&self, timestamp: Timestamp) -> Result<Arc<Chunk>, DbError> {
        let bucket = self.bucket_start(timestamp);
        if let Some(chunk) = self.chunk_map.get(&bucket) {
            return Ok(Arc::clone(chunk.value()));
        }

        let _guard = self.chunk_map_sync.lock()?;
        let candidate = Arc::new(self.make_chunk(bucket));
        let mut installed = false;
        let chunk = Arc::clone(
            self.chunk_map
                .entry(bucket)
                .or_insert_with(|| {
                    installed = true;
                    Arc::clone(&candidate)
                })
                .value(),
        );
        if installed {
            self.config.event_listener.on_event(StoreEvent::ChunkCreated {
                dataset: chunk.info().dataset.clone(),
                start_time_secs: bucket,
            });
            db_metrics::set_live_chunks(self.chunk_map.len());
        } else {
            self.config
                .event_listener
                .on_event(StoreEvent::ChunkCreationRace { bucket });
        }
        Ok(chunk)
    }

    fn make_chunk(&self, start: Timestamp) -> Chunk {
        let info = ChunkInfo::new(
            format!("{}_{}", self.config.dataset, start),
            start,
            start + self.config.chunk_duration_secs,
        );
        Chunk::new(
            info,
            Arc::clone(&self.tag_store),
            Arc::clone(&self.config.event_listener),
        )
    }

    /// Chunk covering `timestamp`, if one exists. Never creates.
    pub fn get_existing(&self, timestamp: Timestamp) -> Option<Arc<Chunk>> {
        self.chunk_map
            .get(&self.bucket_start(timestamp))
            .map(|c| Arc::clone(c.value()))
    }

    /// Parses one `put <metric> <ts> <value> [k=v ...]` line and stores the point.
    ///
    /// Malformed lines fail with [`DbError::InvalidArgument`]; points for a chunk that no
    /// longer accepts writes fail with [`DbError::ReadOnlyInsertion`].
    pub fn add_metric(&self, line: &str) -> Result<(), DbError> {
        let record = PutRecord::parse(line)?;
        if !(0..=MAX_UNIX_TIMESTAMP).contains(&record.timestamp) {
            return Err(DbError::InvalidArgument(format!(
                "timestamp {} outside [0, {}]",
                record.timestamp, MAX_UNIX_TIMESTAMP
            )));
        }
        let chunk = self.get_chunk(record.timestamp)?;
        chunk.add_point(&record.metric, record.timestamp, record.value)?;
        db_metrics::record_ingest_points(1);
        Ok(())
    }

    /// Every chunk, ordered by window start.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let mut chunks: Vec<Arc<Chunk>> =
            self.chunk_map.iter().map(|e| Arc::clone(e.value())).collect();
        chunks.sort_by_key(|c| c.info().start_time_secs);
        chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_map.len()
    }

    /// Series matching `query` in every chunk overlapping `[start, end]`.
    ///
    /// Chunks are returned whole: points outside the range but inside a selected chunk are
    /// included.
    pub fn query(
        &self,
        query: &Query,
        start: Timestamp,
        end: Timestamp,
        aggregation: QueryAggregation,
    ) -> Result<Vec<TimeSeries>, DbError> {
        let started = Instant::now();
        let chunks: Vec<Arc<Chunk>> = self
            .chunks()
            .into_iter()
            .filter(|c| c.contains_data_in_time_range(start, end))
            .collect();

        let per_chunk = chunks
            .par_iter()
            .map(|c| c.query(query))
            .collect::<Result<Vec<_>, DbError>>()?;

        // Group by full name, keeping first-seen order of metrics and chunk order of points.
        let mut order: Vec<String> = Vec::new();
        let mut by_metric: HashMap<String, Vec<Point>> = HashMap::new();
        for series in per_chunk.into_iter().flatten() {
            match by_metric.get_mut(&series.metric) {
                Some(points) => points.extend(series.points),
                None => {
                    order.push(series.metric.clone());
                    by_metric.insert(series.metric, series.points);
                }
            }
        }

        let result = match aggregation {
            QueryAggregation::None => order
                .into_iter()
                .filter_map(|metric| {
                    let points = by_metric.remove(&metric)?;
                    Some(TimeSeries::new(metric, dedup(points)))
                })
                .collect(),
            QueryAggregation::Zimsum => {
                let mut sums: BTreeMap<Timestamp, f64> = BTreeMap::new();
                for p in by_metric.into_values().flatten() {
                    *sums.entry(p.timestamp).or_insert(0.0) += p.value;
                }
                let points = sums.into_iter().map(|(ts, v)| Point::new(ts, v)).collect();
                vec![TimeSeries::new(format!("{} {}", aggregation, query), points)]
            }
        };

        db_metrics::record_query(started.elapsed(), result.len());
        Ok(result)
    }

    /// Converts every mutable chunk whose window ended at or before `cutoff` to read-only.
    ///
    /// A chunk that fails to convert is reported and left mutable. Returns the number converted.
    pub fn to_read_only_chunks(&self, cutoff: Timestamp) -> Result<usize, DbError> {
        let _guard = self.chunk_map_sync.lock()?;
        let mut converted = 0;
        for chunk in self.chunks() {
            if chunk.info().end_time_secs > cutoff || chunk.is_read_only() {
                continue;
            }
            match chunk.to_read_only(&self.config.read_only) {
                Ok(true) => converted += 1,
                Ok(false) => {}
                Err(e) => self.config.event_listener.on_event(StoreEvent::ChunkReadOnlyFailed {
                    dataset: chunk.info().dataset.clone(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(converted)
    }

    /// Closes and removes every chunk whose window ended at or before `cutoff`.
    pub fn remove_stale_chunks(&self, cutoff: Timestamp) -> Result<usize, DbError> {
        let _guard = self.chunk_map_sync.lock()?;
        let stale: Vec<Timestamp> = self
            .chunk_map
            .iter()
            .filter(|e| e.value().info().end_time_secs <= cutoff)
            .map(|e| *e.key())
            .collect();

        let mut removed = 0;
        for bucket in stale {
            let Some((_, chunk)) = self.chunk_map.remove(&bucket) else {
                continue;
            };
            let dataset = chunk.info().dataset.clone();
            if let Err(e) = chunk.close() {
                self.config.event_listener.on_event(StoreEvent::ChunkCloseFailed {
                    dataset: dataset.clone(),
                    error: e.to_string(),
                });
            }
            self.config
                .event_listener
                .on_event(StoreEvent::ChunkDeleted { dataset });
            removed += 1;
        }
        db_metrics::set_live_chunks(self.chunk_map.len());
        Ok(removed)
    }

    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            metrics: self.tag_store.len(),
            ..ManagerStats::default()
        };
        for chunk in self.chunks() {
            match chunk.state() {
                Ok(ChunkState::Mutable) => stats.mutable_chunks += 1,
                Ok(ChunkState::ReadOnly) => stats.read_only_chunks += 1,
                _ => continue,
            }
            let s = chunk.stats();
            stats.series += s.series;
            stats.points += s.points;
            stats.bytes += s.bytes;
        }
        stats
    }
}
