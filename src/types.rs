/// Timestamp type (seconds since the unix epoch).
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// Integer surrogate key a [`crate::index::TagStore`] assigns to one metric.
pub type SeriesId = u32;

/// Largest timestamp the series codec accepts (the 32-bit unix time limit).
pub const MAX_UNIX_TIMESTAMP: Timestamp = i32::MAX as Timestamp;

/// Width of the block a series header timestamp is aligned to.
pub const BLOCK_HEADER_SECS: Timestamp = 2 * 60 * 60;

/// A single `(timestamp, value)` sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Point {
    pub fn new(timestamp: Timestamp, value: Value) -> Self {
        Self { timestamp, value }
    }

    /// Bit-exact comparison, so NaN payloads compare equal to themselves.
    pub fn bit_eq(&self, other: &Point) -> bool {
        self.timestamp == other.timestamp && self.value.to_bits() == other.value.to_bits()
    }
}

/// A metric's full name together with its points, produced only as a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub metric: String,
    pub points: Vec<Point>,
}

impl TimeSeries {
    pub fn new(metric: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            metric: metric.into(),
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Sorts points by timestamp and collapses equal timestamps.
///
/// The sort is stable, and within a run of equal timestamps the last point wins,
/// so a later duplicate overrides an earlier one.
pub fn dedup(mut points: Vec<Point>) -> Vec<Point> {
    points.sort_by_key(|p| p.timestamp);
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for p in points {
        match out.last_mut() {
            Some(last) if last.timestamp == p.timestamp => *last = p,
            _ => out.push(p),
        }
    }
    out
}
