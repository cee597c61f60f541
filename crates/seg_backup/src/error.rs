//! Error kinds surfaced by the ledger, the streamer and the restore scheduler.

use std::path::PathBuf;

use crate::extent::TableId;

/// Errors raised while loading or appending to an extent ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger {0} does not exist")]
    NotFound(PathBuf),

    /// An append did not start at the current cursor.
    #[error("table {table_id}: extent starts at byte {start} but ledger cursor is {cursor}")]
    OrderingViolation {
        table_id: TableId,
        start: u64,
        cursor: u64,
    },

    #[error("table {table_id}: extent end {end} precedes start {start}")]
    InvertedExtent {
        table_id: TableId,
        start: u64,
        end: u64,
    },

    #[error("table {0} already has an extent in the ledger")]
    DuplicateTable(TableId),

    #[error("ledger {path} corrupt at offset {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while serving extents out of a segment data stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The source ended before the requested byte count was reached.
    #[error("short read: expected {expected} bytes, source ended after {actual}")]
    ShortRead { expected: u64, actual: u64 },

    /// The reader went away. `consumed` counts the bytes taken from the source
    /// during the failed call so the caller can keep its position exact.
    #[error("broken pipe after consuming {consumed} source bytes")]
    BrokenPipe { consumed: u64 },

    #[error("extent for table {table_id} starts at {start}, already past it at {position}")]
    ExtentBehindPosition {
        table_id: TableId,
        start: u64,
        position: u64,
    },

    #[error("table {0} has no extent in the ledger")]
    MissingExtent(TableId),

    #[error("no reader attached to {path} within {waited_ms}ms")]
    ReaderTimeout { path: PathBuf, waited_ms: u64 },

    #[error("block copy program {program} failed: {detail}")]
    Subprocess { program: String, detail: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the restore scheduler and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("worker {worker}: connection failure: {reason}")]
    ConnectionFailure { worker: usize, reason: String },

    #[error("error loading data into table {table}: {reason}")]
    Import { table: String, reason: String },

    #[error("segment agents: {0}")]
    Agent(String),

    #[error("pre-flight check failed: {0}")]
    Preflight(String),

    #[error("worker {worker} stopped unexpectedly: {reason}")]
    Worker { worker: usize, reason: String },

    #[error("restore cancelled")]
    Cancelled,
}
