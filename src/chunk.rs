//! A fixed time window of data: the shared tag store plus this window's point store.

use crate::error::DbError;
use crate::index::TagStore;
use crate::metric::Metric;
use crate::query::Query;
use crate::storage::{MetricStore, MetricStoreStats, ReadOnlyStoreConfig, VarBitMetricStore};
use crate::telemetry::{StoreEvent, StoreEventListener};
use crate::types::{TimeSeries, Timestamp, Value};

use std::fmt;
use std::sync::{Arc, RwLock};

/// Identity and time window of a chunk. The window is `[start_time_secs, end_time_secs)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkInfo {
    pub dataset: String,
    pub start_time_secs: Timestamp,
    pub end_time_secs: Timestamp,
}

impl ChunkInfo {
    pub fn new(dataset: impl Into<String>, start_time_secs: Timestamp, end_time_secs: Timestamp) -> Self {
        Self {
            dataset: dataset.into(),
            start_time_secs,
            end_time_secs,
        }
    }

    /// True when the window and `[start, end]` overlap.
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        let (s, e) = (self.start_time_secs, self.end_time_secs);
        (s <= start && e >= start) || (s <= end && e >= end) || (s >= start && e <= end)
    }
}

impl fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, {})",
            self.dataset, self.start_time_secs, self.end_time_secs
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Mutable,
    ReadOnly,
    Evicted,
}

/// One time window. `None` in the store slot means the chunk was evicted.
///
/// Writers hold `write_gate` shared for each point; read-only conversion holds it exclusively
/// while it copies the store, so readers only wait for the final swap. The gate is always
/// taken before the store lock.
#[derive(Debug)]
pub struct Chunk {
    info: ChunkInfo,
    tag_store: Arc<TagStore>,
    write_gate: RwLock<()>,
    store: RwLock<Option<Box<dyn MetricStore>>>,
    events: Arc<dyn StoreEventListener>,
}

impl Chunk {
    /// A new, empty, mutable chunk.
    pub fn new(info: ChunkInfo, tag_store: Arc<TagStore>, events: Arc<dyn StoreEventListener>) -> Self {
        Self::with_store(info, tag_store, Box::new(VarBitMetricStore::new()), events)
    }

    pub fn with_store(
        info: ChunkInfo,
        tag_store: Arc<TagStore>,
        store: Box<dyn MetricStore>,
        events: Arc<dyn StoreEventListener>,
    ) -> Self {
        Self {
            info,
            tag_store,
            write_gate: RwLock::new(()),
            store: RwLock::new(Some(store)),
            events,
        }
    }

    pub fn info(&self) -> &ChunkInfo {
        &self.info
    }

    pub fn state(&self) -> Result<ChunkState, DbError> {
        Ok(match self.store.read()?.as_ref() {
            None => ChunkState::Evicted,
            Some(s) if s.is_read_only() => ChunkState::ReadOnly,
            Some(_) => ChunkState::Mutable,
        })
    }

    /// True once the chunk stopped accepting writes (read-only or evicted).
    pub fn is_read_only(&self) -> bool {
        !matches!(self.state(), Ok(ChunkState::Mutable))
    }

    pub fn contains_data_in_time_range(&self, start: Timestamp, end: Timestamp) -> bool {
        self.info.overlaps(start, end)
    }

    /// Stores one point, assigning the metric an id if needed.
    ///
    /// Fails with [`DbError::ReadOnlyInsertion`] once the chunk is read-only or evicted.
    pub fn add_point(&self, metric: &Metric, timestamp: Timestamp, value: Value) -> Result<(), DbError> {
        let _gate = self.write_gate.read()?;
        let guard = self.store.read()?;
        let store = match guard.as_ref() {
            Some(s) if !s.is_read_only() => s,
            _ => {
                return Err(DbError::ReadOnlyInsertion {
                    dataset: self.info.dataset.clone(),
                })
            }
        };
        let id = self.tag_store.get_or_create(metric)?;
        store.add_point(id, timestamp, value)
    }

    /// Every series in this chunk matching `query`.
    ///
    /// A series that fails to decode is reported and skipped.
    pub fn query(&self, query: &Query) -> Result<Vec<TimeSeries>, DbError> {
        let guard = self.store.read()?;
        let Some(store) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for id in self.tag_store.lookup(query) {
            match store.get_series(id) {
                Ok(Some(points)) => out.push(TimeSeries::new(self.tag_store.get_metric_name(id), points)),
                Ok(None) => {}
                Err(e @ (DbError::Parse(_) | DbError::Corruption { .. })) => {
                    self.events.on_event(StoreEvent::SeriesDecodeFailed {
                        dataset: self.info.dataset.clone(),
                        series: id,
                        error: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Swaps the mutable store for a read-only copy, then closes the old one.
    ///
    /// Returns `false` if the chunk was not mutable. Writers are blocked for the duration;
    /// queries keep reading the mutable store until the swap. A failure to close the old store
    /// is reported as [`StoreEvent::ChunkCloseFailed`] and does not undo the conversion.
    pub fn to_read_only(&self, config: &ReadOnlyStoreConfig) -> Result<bool, DbError> {
        let _gate = self.write_gate.write()?;
        let read_only = {
            let guard = self.store.read()?;
            match guard.as_ref() {
                Some(store) => match store.to_read_only(&self.info.dataset, config)? {
                    Some(read_only) => read_only,
                    None => return Ok(false),
                },
                None => return Ok(false),
            }
        };
        let stats = read_only.stats();

        let mut guard = self.store.write()?;
        if guard.is_none() {
            // Closed while the copy was built.
            let mut read_only = read_only;
            read_only.close()?;
            return Ok(false);
        }
        if let Some(mut old) = guard.replace(Box::new(read_only)) {
            if let Err(e) = old.close() {
                self.events.on_event(StoreEvent::ChunkCloseFailed {
                    dataset: self.info.dataset.clone(),
                    error: e.to_string(),
                });
            }
        }
        drop(guard);
        self.events.on_event(StoreEvent::ChunkReadOnly {
            dataset: self.info.dataset.clone(),
            series: stats.series,
            bytes: stats.bytes,
        });
        Ok(true)
    }

    /// Releases the store. Later writes fail as read-only, later queries are empty.
    pub fn close(&self) -> Result<(), DbError> {
        let mut guard = self.store.write()?;
        if let Some(mut store) = guard.take() {
            store.close()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> MetricStoreStats {
        match self.store.read() {
            Ok(guard) => guard.as_ref().map(|s| s.stats()).unwrap_or_default(),
            Err(_) => MetricStoreStats::default(),
        }
    }
}
