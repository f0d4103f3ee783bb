use thiserror::Error;

/// Error type for every fallible operation in the store.
#[derive(Error, Debug)]
pub enum DbError {
    /// Malformed input: bad ingest line, tag, query, cutoff or bit width.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The point routed to a chunk that no longer accepts writes.
    ///
    /// This is the expected late-data condition, distinct from [`DbError::InvalidArgument`].
    #[error("Cannot insert into read-only chunk {dataset}")]
    ReadOnlyInsertion { dataset: String },

    /// Decoding a bit stream or serialized series failed.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Store is closed: {0}")]
    Closed(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        series: Option<u32>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// True for errors caused by the caller's input rather than the store.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, DbError::InvalidArgument(_))
    }

    /// True when a write arrived after its chunk stopped accepting data.
    pub fn is_read_only_insertion(&self) -> bool {
        matches!(self, DbError::ReadOnlyInsertion { .. })
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
