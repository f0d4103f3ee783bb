//! Per-chunk point stores: a mutable store of live compressed series, and a read-only store
//! that keeps each series' serialized bytes in a [`ByteMap`].

use crate::encoding::{compress_payload, decompress_payload, BlockCompression, VarBitTimeSeries};
use crate::error::DbError;
use crate::types::{Point, SeriesId, Timestamp, Value};

use crc32fast::Hasher as Crc32;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Size of a metric store at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricStoreStats {
    pub series: usize,
    pub points: usize,
    /// Bytes held for series data (encoded bits for mutable stores, stored bytes otherwise).
    pub bytes: u64,
}

/// Point storage keyed by series id.
pub trait MetricStore: fmt::Debug + Send + Sync {
    fn add_point(&self, id: SeriesId, timestamp: Timestamp, value: Value) -> Result<(), DbError>;

    /// Points of one series, or `None` when this store holds nothing for `id`.
    fn get_series(&self, id: SeriesId) -> Result<Option<Vec<Point>>, DbError>;

    fn series_ids(&self) -> Result<Vec<SeriesId>, DbError>;

    fn is_read_only(&self) -> bool;

    /// Builds the read-only form of this store, or `None` if it already is read-only.
    fn to_read_only(
        &self,
        dataset: &str,
        config: &ReadOnlyStoreConfig,
    ) -> Result<Option<ReadOnlyMetricStore>, DbError>;

    fn stats(&self) -> MetricStoreStats;

    /// Releases the store's memory (and any backing file). The store is unusable afterwards.
    fn close(&mut self) -> Result<(), DbError>;
}

/// Mutable store: one [`VarBitTimeSeries`] per id, each behind its own mutex.
#[derive(Debug, Default)]
pub struct VarBitMetricStore {
    series: RwLock<HashMap<SeriesId, Arc<Mutex<VarBitTimeSeries>>>>,
    closed: AtomicBool,
}

impl VarBitMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, id: SeriesId) -> Result<Option<Arc<Mutex<VarBitTimeSeries>>>, DbError> {
        Ok(self.series.read()?.get(&id).cloned())
    }
}

impl MetricStore for VarBitMetricStore {
    fn add_point(&self, id: SeriesId, timestamp: Timestamp, value: Value) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed("metric store".to_string()));
        }
        let series = match self.series(id)? {
            Some(s) => s,
            None => Arc::clone(self.series.write()?.entry(id).or_default()),
        };
        let mut guard = series.lock()?;
        guard.append(timestamp, value)
    }

    fn get_series(&self, id: SeriesId) -> Result<Option<Vec<Point>>, DbError> {
        let Some(series) = self.series(id)? else {
            return Ok(None);
        };
        // Snapshot under the lock, decode outside it.
        let reader = {
            let guard = series.lock()?;
            if guard.is_empty() {
                return Ok(None);
            }
            guard.read()
        };
        reader.points().map(Some)
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>, DbError> {
        let mut ids: Vec<SeriesId> = self.series.read()?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn is_read_only(&self) -> bool {
        false
    }

    /// Serializes every non-empty series into a new read-only store.
    fn to_read_only(
        &self,
        dataset: &str,
        config: &ReadOnlyStoreConfig,
    ) -> Result<Option<ReadOnlyMetricStore>, DbError> {
        let mut map: Box<dyn ByteMap> = match &config.spill_dir {
            Some(dir) => Box::new(FileByteMap::create(
                dir.join(format!("{}.series", dataset)),
            )?),
            None => Box::new(InMemoryByteMap::new()),
        };

        let mut entries: Vec<(SeriesId, Arc<Mutex<VarBitTimeSeries>>)> = self
            .series
            .read()?
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);

        let mut points = 0;
        for (id, series) in entries {
            let series = series.lock()?;
            if series.is_empty() {
                continue;
            }
            points += series.len();
            let stored = compress_payload(config.compression, &series.serialize()?)?;
            map.put(id, &stored)?;
        }

        Ok(Some(ReadOnlyMetricStore {
            map,
            compression: config.compression,
            points,
        }))
    }

    fn stats(&self) -> MetricStoreStats {
        let mut stats = MetricStoreStats::default();
        if let Ok(map) = self.series.read() {
            for series in map.values() {
                if let Ok(s) = series.lock() {
                    stats.series += 1;
                    stats.points += s.len();
                    stats.bytes += ((s.timestamp_bits() + s.value_bits()) / 8) as u64;
                }
            }
        }
        stats
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.closed.store(true, Ordering::Release);
        self.series.write()?.clear();
        Ok(())
    }
}

/// Options for the representation a chunk takes once it turns read-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOnlyStoreConfig {
    /// When set, series bytes are written to a file per chunk in this directory
    /// instead of being kept in process memory.
    pub spill_dir: Option<PathBuf>,
    pub compression: BlockCompression,
}

/// Immutable store of serialized series.
#[derive(Debug)]
pub struct ReadOnlyMetricStore {
    map: Box<dyn ByteMap>,
    compression: BlockCompression,
    points: usize,
}

impl MetricStore for ReadOnlyMetricStore {
    fn add_point(&self, id: SeriesId, _timestamp: Timestamp, _value: Value) -> Result<(), DbError> {
        Err(DbError::UnsupportedOperation(format!(
            "cannot add a point for series {} to a read-only store",
            id
        )))
    }

    fn get_series(&self, id: SeriesId) -> Result<Option<Vec<Point>>, DbError> {
        let Some(stored) = self.map.get(id)? else {
            return Ok(None);
        };
        let bytes = decompress_payload(self.compression, &stored)?;
        VarBitTimeSeries::deserialize(&bytes)?.points().map(Some)
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>, DbError> {
        Ok(self.map.ids())
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn to_read_only(
        &self,
        _dataset: &str,
        _config: &ReadOnlyStoreConfig,
    ) -> Result<Option<ReadOnlyMetricStore>, DbError> {
        Ok(None)
    }

    fn stats(&self) -> MetricStoreStats {
        MetricStoreStats {
            series: self.map.len(),
            points: self.points,
            bytes: self.map.byte_size(),
        }
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.map.close()
    }
}

/// Map from series id to an opaque byte value.
pub trait ByteMap: fmt::Debug + Send + Sync {
    fn get(&self, id: SeriesId) -> Result<Option<Vec<u8>>, DbError>;

    fn put(&mut self, id: SeriesId, bytes: &[u8]) -> Result<(), DbError>;

    /// Stored ids, ascending.
    fn ids(&self) -> Vec<SeriesId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of all stored values.
    fn byte_size(&self) -> u64;

    fn close(&mut self) -> Result<(), DbError>;
}

/// [`ByteMap`] in process memory.
#[derive(Debug, Default)]
pub struct InMemoryByteMap {
    entries: HashMap<SeriesId, Box<[u8]>>,
    bytes: u64,
}

impl InMemoryByteMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteMap for InMemoryByteMap {
    fn get(&self, id: SeriesId) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.entries.get(&id).map(|b| b.to_vec()))
    }

    fn put(&mut self, id: SeriesId, bytes: &[u8]) -> Result<(), DbError> {
        if let Some(old) = self.entries.insert(id, bytes.into()) {
            self.bytes -= old.len() as u64;
        }
        self.bytes += bytes.len() as u64;
        Ok(())
    }

    fn ids(&self) -> Vec<SeriesId> {
        let mut ids: Vec<SeriesId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn byte_size(&self) -> u64 {
        self.bytes
    }

    fn close(&mut self) -> Result<(), DbError> {
        self.entries = HashMap::new();
        self.bytes = 0;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct FileRecord {
    offset: u64,
    len: u32,
    crc: u32,
}

/// [`ByteMap`] spilling values to an append-only file, with the offset index kept in memory.
///
/// Each value's CRC32 is checked on read. The file is deleted on close (or drop); it does not
/// outlive the process.
#[derive(Debug)]
pub struct FileByteMap {
    path: PathBuf,
    file: Mutex<File>,
    records: HashMap<SeriesId, FileRecord>,
    end: u64,
    closed: bool,
}

impl FileByteMap {
    /// Creates (or truncates) the backing file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            records: HashMap::new(),
            end: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Closed(format!("byte map {}", self.path.display())));
        }
        Ok(())
    }
}

impl ByteMap for FileByteMap {
    fn get(&self, id: SeriesId) -> Result<Option<Vec<u8>>, DbError> {
        self.ensure_open()?;
        let Some(rec) = self.records.get(&id).copied() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; rec.len as usize];
        {
            let mut file = self.file.lock()?;
            file.seek(SeekFrom::Start(rec.offset))?;
            file.read_exact(&mut buf)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let actual = hasher.finalize();
        if actual != rec.crc {
            return Err(DbError::Corruption {
                details: format!(
                    "CRC mismatch in {} (expected {:08x}, got {:08x})",
                    self.path.display(),
                    rec.crc,
                    actual
                ),
                series: Some(id),
            });
        }
        Ok(Some(buf))
    }

    fn put(&mut self, id: SeriesId, bytes: &[u8]) -> Result<(), DbError> {
        self.ensure_open()?;
        let len = u32::try_from(bytes.len()).map_err(|_| {
            DbError::InvalidArgument(format!("value of {} bytes is too large", bytes.len()))
        })?;
        let mut hasher = Crc32::new();
        hasher.update(bytes);
        let crc = hasher.finalize();
        {
            let mut file = self.file.lock()?;
            file.seek(SeekFrom::Start(self.end))?;
            file.write_all(bytes)?;
        }
        // A rewritten id leaves its old bytes behind as garbage.
        self.records.insert(
            id,
            FileRecord {
                offset: self.end,
                len,
                crc,
            },
        );
        self.end += len as u64;
        Ok(())
    }

    fn ids(&self) -> Vec<SeriesId> {
        let mut ids: Vec<SeriesId> = self.records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn byte_size(&self) -> u64 {
        self.records.values().map(|r| r.len as u64).sum()
    }

    fn close(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.records.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::Io(e)),
        }
    }
}

impl Drop for FileByteMap {
    fn drop(&mut self) {
        if !self.closed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
