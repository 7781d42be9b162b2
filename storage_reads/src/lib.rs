//! Translates per-series storage cursors into column-oriented tables.
//!
//! This crate is the read path between a time-series storage engine and a
//! pull-based query engine. A [`Reader`] opens cursors against a
//! [`CursorSource`] under a time bound and predicate, and returns an iterator
//! of [`Table`]s. Each table lazily materializes one series (or one group of
//! series) as Arrow [`RecordBatch`](arrow::record_batch::RecordBatch) chunks:
//! a `_time` column, a typed `_value` column, and one constant-valued column
//! per tag.
//!
//! Tables own their cursors exclusively and release them exactly once, either
//! when the cursor is exhausted or when the consumer abandons the table early.
//! Buffered column data is accounted against a shared [`Allocator`] so a read
//! can never grow past its memory budget.

use snafu::Snafu;

pub mod allocator;
pub mod cursor;
pub mod group;
pub mod id;
pub mod reader;
pub mod table;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

pub use allocator::{Allocator, Reservation};
pub use cursor::{Cursor, CursorSource, SeriesCursor};
pub use group::{GroupMode, GroupTable, GroupTables};
pub use id::{BucketId, OrgId};
pub use reader::{FilterTables, ReadFilterSpec, ReadGroupSpec, Reader, DEFAULT_CHUNK_SIZE};
pub use table::{SeriesTable, Table};
pub use types::{
    Predicate, SeriesKey, Tag, TimestampRange, Value, ValueType, TIME_COLUMN_NAME,
    VALUE_COLUMN_NAME,
};

/// An opaque error produced by a collaborator (cursor implementation or table
/// consumer) and carried through this crate verbatim.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid time bounds: start {start} is after stop {stop}"))]
    InvalidBounds { start: i64, stop: i64 },

    #[snafu(display("organization {org_id} / bucket {bucket_id} not found"))]
    BucketNotFound {
        org_id: id::OrgId,
        bucket_id: id::BucketId,
    },

    #[snafu(display("group mode {mode:?} requires at least one group key"))]
    MissingGroupKeys { mode: group::GroupMode },

    #[snafu(display("invalid group key {key:?}: {reason}"))]
    InvalidGroupKey { key: String, reason: &'static str },

    #[snafu(display(
        "cannot group series {series} of field type {conflicting} with field type {existing}"
    ))]
    FieldTypeConflict {
        existing: types::ValueType,
        conflicting: types::ValueType,
        series: String,
    },

    #[snafu(display(
        "memory limit exceeded: requested {requested} bytes with {allocated} of {limit} in use"
    ))]
    MemoryExhausted {
        requested: usize,
        allocated: usize,
        limit: usize,
    },

    #[snafu(display("building column chunk: {source}"))]
    Arrow { source: arrow::error::ArrowError },

    #[snafu(display("storage cursor failure: {source}"))]
    Cursor { source: BoxedError },

    #[snafu(display("table consumer failed: {source}"))]
    Consumer { source: BoxedError },
}

/// Coarse classification of [`Error`]s, mirroring the status codes the read
/// path surfaces over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed; retrying without changes cannot succeed.
    InvalidArgument,
    /// The allocator could not grant the requested memory; the caller may
    /// retry with smaller chunking or after backpressure.
    ResourceExhausted,
    /// A collaborator failed mid-read; partial results already yielded remain
    /// valid.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidBounds { .. }
            | Self::BucketNotFound { .. }
            | Self::MissingGroupKeys { .. }
            | Self::InvalidGroupKey { .. }
            | Self::FieldTypeConflict { .. } => ErrorKind::InvalidArgument,
            Self::MemoryExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Arrow { .. } | Self::Cursor { .. } | Self::Consumer { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
