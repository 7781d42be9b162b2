//! The interface this crate consumes from a storage engine.

use std::fmt::Debug;

use crate::id::{BucketId, OrgId};
use crate::types::{Predicate, SeriesKey, TimestampRange, Value, ValueType};
use crate::{BoxedError, Result};

/// A stateful iterator over one series' `(timestamp, value)` pairs.
///
/// Contract relied upon, not re-verified: timestamps are strictly ascending,
/// every value matches [`value_type`](Self::value_type), and `close` is
/// idempotent. A cursor is exclusively owned by the table that wraps it until
/// closed.
pub trait Cursor: Debug + Send {
    /// The field type of every value this cursor produces.
    fn value_type(&self) -> ValueType;

    /// The next `(timestamp, value)` pair, or `None` once exhausted.
    ///
    /// This is the only blocking point of the read path; it may wait on
    /// storage I/O.
    fn next(&mut self) -> Result<Option<(i64, Value)>, BoxedError>;

    /// Release the underlying storage resources.
    fn close(&mut self);
}

/// One opened cursor together with the key of the series it reads.
#[derive(Debug)]
pub struct SeriesCursor {
    pub key: SeriesKey,
    pub cursor: Box<dyn Cursor>,
}

/// Opens per-series cursors for a bounded, predicated read.
///
/// Implementations must enumerate series in a deterministic order for
/// identical inputs against identical storage state (typically series-key
/// lexical order) and must be safe for concurrent use by independent readers.
pub trait CursorSource: Debug + Send + Sync {
    /// Open one cursor per series matching `predicate` within `bounds`.
    ///
    /// An unresolvable organization/bucket pair fails with
    /// [`Error::BucketNotFound`](crate::Error::BucketNotFound). Opening reads
    /// no data: cursors are pulled lazily by the tables that wrap them.
    fn open_series_cursors(
        &self,
        org_id: OrgId,
        bucket_id: BucketId,
        bounds: TimestampRange,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<SeriesCursor>>;
}
