//! Per-series compression: delta-of-delta timestamps and XOR floats over two [`BitStream`]s,
//! plus optional LZ4/Zstd compression of serialized payloads.

use crate::bitstream::{read_i32, BitStream, BitStreamIterator};
use crate::error::DbError;
use crate::types::{Point, Timestamp, Value, BLOCK_HEADER_SECS, MAX_UNIX_TIMESTAMP};

use serde::{Deserialize, Serialize};

/// Words preallocated per stream for a new series.
const SERIES_CAPACITY_WORDS: usize = 1;

/// `(prefix width, prefix, payload width, bias)` for the bounded delta-of-delta codes.
/// A dod fits a bucket when `-bias <= dod <= bias + 1`.
const DOD_BUCKETS: [(u32, u64, u32, i64); 3] = [
    (2, 0b10, 7, 63),
    (3, 0b110, 9, 255),
    (4, 0b1110, 12, 2047),
];

const LARGE_DOD_PREFIX: u64 = 0b1111;
const LARGE_DOD_BIAS: i64 = i32::MAX as i64;

/// Sentinel zero counts meaning "no previous value window".
const NO_WINDOW: u32 = 64;

/// Compressed `(timestamp, value)` series.
///
/// Appends must be serialized by the owner (the store keeps each series behind a mutex);
/// [`VarBitTimeSeries::read`] takes a snapshot, so readers never see a partial append.
#[derive(Debug, Clone)]
pub struct VarBitTimeSeries {
    timestamps: BitStream,
    values: BitStream,
    count: usize,
    prev_timestamp: Timestamp,
    prev_delta: i64,
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

impl Default for VarBitTimeSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl VarBitTimeSeries {
    pub fn new() -> Self {
        Self {
            timestamps: BitStream::with_capacity(SERIES_CAPACITY_WORDS),
            values: BitStream::with_capacity(SERIES_CAPACITY_WORDS),
            count: 0,
            prev_timestamp: 0,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: NO_WINDOW,
            prev_trailing_zeros: NO_WINDOW,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Appends one point. On error the series is left unchanged.
    pub fn append(&mut self, timestamp: Timestamp, value: Value) -> Result<(), DbError> {
        if !(0..=MAX_UNIX_TIMESTAMP).contains(&timestamp) {
            return Err(DbError::InvalidArgument(format!(
                "timestamp {} outside 0..={}",
                timestamp, MAX_UNIX_TIMESTAMP
            )));
        }

        if self.count == 0 {
            let header = timestamp - timestamp % BLOCK_HEADER_SECS;
            let first_delta = timestamp - header;
            self.timestamps.write(32, header as u64)?;
            self.timestamps.write(14, first_delta as u64)?;
            self.prev_delta = first_delta;

            let bits = value.to_bits();
            self.values.write(64, bits)?;
            self.prev_value_bits = bits;
            self.prev_leading_zeros = NO_WINDOW;
            self.prev_trailing_zeros = NO_WINDOW;
        } else {
            let delta = timestamp - self.prev_timestamp;
            write_dod(&mut self.timestamps, delta - self.prev_delta)?;
            self.prev_delta = delta;
            self.write_value(value)?;
        }

        self.prev_timestamp = timestamp;
        self.count += 1;
        Ok(())
    }

    fn write_value(&mut self, value: Value) -> Result<(), DbError> {
        let bits = value.to_bits();
        let xor = bits ^ self.prev_value_bits;
        if xor == 0 {
            self.values.write(1, 0)?;
        } else {
            // Zero counts saturate at 31/63 rather than 64/64; the bit layout depends on it.
            let lz = xor.leading_zeros().min(31);
            let tz = xor.trailing_zeros().min(63);
            if lz >= self.prev_leading_zeros && tz >= self.prev_trailing_zeros {
                let meaningful = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
                self.values.write(2, 0b10)?;
                self.values
                    .write(meaningful, xor >> self.prev_trailing_zeros)?;
            } else {
                let meaningful = 64 - lz - tz;
                self.values.write(2, 0b11)?;
                self.values.write(5, lz as u64)?;
                self.values.write(6, tz as u64)?;
                self.values.write(meaningful, xor >> tz)?;
                self.prev_leading_zeros = lz;
                self.prev_trailing_zeros = tz;
            }
        }
        self.prev_value_bits = bits;
        Ok(())
    }

    /// Returns a one-shot iterator over the points appended so far.
    pub fn read(&self) -> VarBitTimeSeriesIterator {
        VarBitTimeSeriesIterator::new(self.count, self.timestamps.read(), self.values.read())
    }

    pub fn timestamp_bits(&self) -> usize {
        self.timestamps.bit_length()
    }

    pub fn value_bits(&self) -> usize {
        self.values.bit_length()
    }

    pub fn serialized_byte_size(&self) -> usize {
        4 + self.timestamps.serialized_byte_size() + self.values.serialized_byte_size()
    }

    /// `[count: i32][timestamps stream][values stream]`, big-endian.
    pub fn serialize(&self) -> Result<Vec<u8>, DbError> {
        let count = i32::try_from(self.count)
            .map_err(|_| DbError::Internal(format!("series too long to serialize: {}", self.count)))?;
        let mut out = Vec::with_capacity(self.serialized_byte_size());
        out.extend_from_slice(&count.to_be_bytes());
        self.timestamps.serialize(&mut out)?;
        self.values.serialize(&mut out)?;
        Ok(out)
    }

    /// Decodes bytes written by [`VarBitTimeSeries::serialize`] into a reader.
    pub fn deserialize(bytes: &[u8]) -> Result<VarBitTimeSeriesIterator, DbError> {
        let mut buf = bytes;
        let count = read_i32(&mut buf)?;
        if count < 0 {
            return Err(DbError::Parse(format!("negative point count {}", count)));
        }
        let timestamps = BitStream::deserialize(&mut buf)?;
        let values = BitStream::deserialize(&mut buf)?;
        if !buf.is_empty() {
            return Err(DbError::Parse(format!(
                "{} trailing bytes after serialized series",
                buf.len()
            )));
        }
        Ok(VarBitTimeSeriesIterator::new(
            count as usize,
            timestamps.read(),
            values.read(),
        ))
    }
}

fn write_dod(stream: &mut BitStream, dod: i64) -> Result<(), DbError> {
    if dod == 0 {
        return stream.write(1, 0);
    }
    for &(prefix_bits, prefix, width, bias) in DOD_BUCKETS.iter() {
        if (-bias..=bias + 1).contains(&dod) {
            stream.write(prefix_bits, prefix)?;
            return stream.write(width, (dod + bias) as u64);
        }
    }
    let biased = dod + LARGE_DOD_BIAS;
    if !(0..=u32::MAX as i64).contains(&biased) {
        return Err(DbError::InvalidArgument(format!(
            "delta of delta {} does not fit the 32-bit encoding",
            dod
        )));
    }
    stream.write(4, LARGE_DOD_PREFIX)?;
    stream.write(32, biased as u64)
}

fn read_dod(it: &mut BitStreamIterator) -> Result<i64, DbError> {
    if it.try_read(1, 0)? {
        return Ok(0);
    }
    for &(prefix_bits, prefix, width, bias) in DOD_BUCKETS.iter() {
        if it.try_read(prefix_bits, prefix)? {
            return Ok(it.read(width)? as i64 - bias);
        }
    }
    it.read(4)?;
    Ok(it.read(32)? as i64 - LARGE_DOD_BIAS)
}

/// Lazy decoder over a snapshot of a [`VarBitTimeSeries`].
///
/// Yields exactly `count` points, or stops after the first decode error.
#[derive(Debug, Clone)]
pub struct VarBitTimeSeriesIterator {
    count: usize,
    decoded: usize,
    timestamps: BitStreamIterator,
    values: BitStreamIterator,
    prev_timestamp: Timestamp,
    prev_delta: i64,
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
    failed: bool,
}

impl VarBitTimeSeriesIterator {
    fn new(count: usize, timestamps: BitStreamIterator, values: BitStreamIterator) -> Self {
        Self {
            count,
            decoded: 0,
            timestamps,
            values,
            prev_timestamp: 0,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: 0,
            prev_trailing_zeros: 0,
            failed: false,
        }
    }

    /// Decodes every remaining point.
    pub fn points(self) -> Result<Vec<Point>, DbError> {
        self.collect()
    }

    fn read_timestamp(&mut self) -> Result<Timestamp, DbError> {
        if self.decoded == 0 {
            let header = self.timestamps.read(32)? as i64;
            let first_delta = self.timestamps.read(14)? as i64;
            self.prev_delta = first_delta;
            self.prev_timestamp = header + first_delta;
        } else {
            let dod = read_dod(&mut self.timestamps)?;
            let delta = self.prev_delta.checked_add(dod);
            let timestamp = delta.and_then(|d| self.prev_timestamp.checked_add(d));
            match (delta, timestamp) {
                (Some(d), Some(ts)) => {
                    self.prev_delta = d;
                    self.prev_timestamp = ts;
                }
                _ => {
                    return Err(DbError::Parse(format!(
                        "timestamp overflow at point {}",
                        self.decoded
                    )))
                }
            }
        }
        if !(0..=MAX_UNIX_TIMESTAMP).contains(&self.prev_timestamp) {
            return Err(DbError::Parse(format!(
                "decoded timestamp {} out of range at point {}",
                self.prev_timestamp, self.decoded
            )));
        }
        Ok(self.prev_timestamp)
    }

    fn read_value(&mut self) -> Result<Value, DbError> {
        if self.decoded == 0 {
            self.prev_value_bits = self.values.read(64)?;
            return Ok(f64::from_bits(self.prev_value_bits));
        }
        if self.values.try_read(1, 0)? {
            return Ok(f64::from_bits(self.prev_value_bits));
        }
        if self.values.read(2)? == 0b11 {
            self.prev_leading_zeros = self.values.read(5)? as u32;
            self.prev_trailing_zeros = self.values.read(6)? as u32;
        }
        let meaningful = 64i64 - self.prev_leading_zeros as i64 - self.prev_trailing_zeros as i64;
        if !(0..=64).contains(&meaningful) {
            return Err(DbError::Parse(format!(
                "invalid meaningful bit count {} at point {}",
                meaningful, self.decoded
            )));
        }
        let xor = self.values.read(meaningful as u32)? << self.prev_trailing_zeros;
        self.prev_value_bits ^= xor;
        Ok(f64::from_bits(self.prev_value_bits))
    }
}

impl Iterator for VarBitTimeSeriesIterator {
    type Item = Result<Point, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.decoded >= self.count {
            return None;
        }
        let point = self
            .read_timestamp()
            .and_then(|ts| Ok(Point::new(ts, self.read_value()?)));
        match point {
            Ok(p) => {
                self.decoded += 1;
                Some(Ok(p))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let left = self.count - self.decoded;
        (0, Some(left))
    }
}

/// Compression applied to serialized series held by read-only stores.
/// Serde: internally tagged table, `type` plus `level` for zstd (e.g. `type = "zstd", level = 3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlockCompression {
    #[default]
    None,
    Lz4,
    Zstd { level: i32 },
}

pub(crate) fn compress_payload(
    compression: BlockCompression,
    payload: &[u8],
) -> Result<Vec<u8>, DbError> {
    match compression {
        BlockCompression::None => Ok(payload.to_vec()),
        BlockCompression::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
        BlockCompression::Zstd { level } => zstd::bulk::compress(payload, level)
            .map_err(|e| DbError::Internal(format!("Zstd compress failed: {}", e))),
    }
}

pub(crate) fn decompress_payload(
    compression: BlockCompression,
    stored: &[u8],
) -> Result<Vec<u8>, DbError> {
    match compression {
        BlockCompression::None => Ok(stored.to_vec()),
        BlockCompression::Lz4 => lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| DbError::Parse(format!("LZ4 decompress failed: {}", e))),
        BlockCompression::Zstd { .. } => zstd::stream::decode_all(std::io::Cursor::new(stored))
            .map_err(|e| DbError::Parse(format!("Zstd decompress failed: {}", e))),
    }
}
