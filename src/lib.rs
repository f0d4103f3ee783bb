#![doc = include_str!("../README.md")]
// Declare modules
pub mod bitstream;
pub mod chunk;
pub mod core;
pub mod encoding;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod metric;
pub mod query;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod writer;

/// Configuration options for the chunk manager.
pub use crate::core::ChunkManagerConfig;
/// Main entry point: routes points to time-windowed chunks and answers range queries.
pub use crate::core::ChunkManager;
/// Error type for every store operation.
pub use crate::error::DbError;
/// Periodic read-only conversion and deletion of aged chunks.
pub use crate::lifecycle::{ChunkLifecycleTask, LifecycleConfig, LifecycleWorker};
/// A metric name with its sorted tag set.
pub use crate::metric::{Metric, Tag};
/// Query model and aggregation modes.
pub use crate::query::{Query, QueryAggregation, TagMatcher};
/// Structured event hook for observability.
pub use crate::telemetry::{StoreEvent, StoreEventListener};
/// A single `(timestamp, value)` sample.
pub use crate::types::Point;
/// A metric's full name and its points, as returned by queries.
pub use crate::types::TimeSeries;
/// Type alias for a timestamp (seconds since the unix epoch).
pub use crate::types::Timestamp;
/// Type alias for a value in a time series (f64).
pub use crate::types::Value;
/// File-based ingest adapter.
pub use crate::writer::FileMetricWriter;
