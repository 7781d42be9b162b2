//! Read entry points: `read_filter` and `read_group`.

use std::collections::VecDeque;
use std::sync::Arc;

use snafu::ensure;
use tracing::debug;

use crate::allocator::{Allocator, Reservation};
use crate::cursor::{CursorSource, SeriesCursor};
use crate::group::{plan_groups, GroupMode, GroupTables};
use crate::id::{BucketId, OrgId};
use crate::table::{SeriesTable, Table};
use crate::types::{Predicate, TimestampRange};
use crate::{InvalidBoundsSnafu, InvalidGroupKeySnafu, MissingGroupKeysSnafu, Result};

/// Default number of rows per produced chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000;

/// Minimum working grant reserved per read and held until its iterator is
/// dropped; a read that cannot get even this much fails up front instead of
/// on its first pull.
const MIN_WORKING_BYTES: usize = 1024;

/// What to read: which bucket, over which time window, for which series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFilterSpec {
    pub org_id: OrgId,
    pub bucket_id: BucketId,
    pub bounds: TimestampRange,
    pub predicate: Option<Predicate>,
}

/// A filter spec extended with a grouping policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroupSpec {
    pub filter: ReadFilterSpec,
    pub group_mode: GroupMode,
    /// Ordered list of tag names to group on (`By`) or to exclude (`Except`).
    pub group_keys: Vec<String>,
}

/// The read-translation entry point: turns a cursor source into table
/// iterators.
#[derive(Debug)]
pub struct Reader<S> {
    store: Arc<S>,
    chunk_size: usize,
}

impl<S: CursorSource> Reader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the row count per produced chunk (clamped to at least one).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Open one table per series matching `spec`, in the cursor source's
    /// deterministic order. Lazy: no cursor is pulled until the consumer
    /// pulls rows from a yielded table.
    pub fn read_filter(
        &self,
        spec: ReadFilterSpec,
        alloc: Arc<Allocator>,
    ) -> Result<FilterTables> {
        validate_bounds(spec.bounds)?;
        let working = alloc.reserve(MIN_WORKING_BYTES)?;
        let cursors = self.store.open_series_cursors(
            spec.org_id,
            spec.bucket_id,
            spec.bounds,
            spec.predicate.as_ref(),
        )?;
        debug!(
            org_id = %spec.org_id,
            bucket_id = %spec.bucket_id,
            series = cursors.len(),
            "opened read_filter cursors"
        );
        Ok(FilterTables {
            cursors: cursors.into(),
            alloc,
            chunk_size: self.chunk_size,
            _working: working,
        })
    }

    /// Open one grouped table per distinct group key tuple among the series
    /// matching `spec`, in ascending tuple order. Grouping is planned (and
    /// field-type conflicts rejected) here; row data stays lazy.
    pub fn read_group(&self, spec: ReadGroupSpec, alloc: Arc<Allocator>) -> Result<GroupTables> {
        validate_bounds(spec.filter.bounds)?;
        validate_group_keys(spec.group_mode, &spec.group_keys)?;
        let working = alloc.reserve(MIN_WORKING_BYTES)?;
        let cursors = self.store.open_series_cursors(
            spec.filter.org_id,
            spec.filter.bucket_id,
            spec.filter.bounds,
            spec.filter.predicate.as_ref(),
        )?;
        let series = cursors.len();
        let groups = plan_groups(cursors, spec.group_mode, &spec.group_keys)?;
        debug!(
            org_id = %spec.filter.org_id,
            bucket_id = %spec.filter.bucket_id,
            series,
            groups = groups.len(),
            mode = ?spec.group_mode,
            "planned read_group"
        );
        Ok(GroupTables::new(groups, alloc, self.chunk_size, working))
    }
}

fn validate_bounds(bounds: TimestampRange) -> Result<()> {
    ensure!(
        bounds.start <= bounds.end,
        InvalidBoundsSnafu {
            start: bounds.start,
            stop: bounds.end,
        }
    );
    Ok(())
}

fn validate_group_keys(mode: GroupMode, keys: &[String]) -> Result<()> {
    if mode == GroupMode::By {
        ensure!(!keys.is_empty(), MissingGroupKeysSnafu { mode });
    }
    if mode != GroupMode::None {
        for (idx, key) in keys.iter().enumerate() {
            ensure!(
                !key.is_empty(),
                InvalidGroupKeySnafu {
                    key,
                    reason: "empty tag name",
                }
            );
            ensure!(
                !keys[..idx].contains(key),
                InvalidGroupKeySnafu {
                    key,
                    reason: "duplicate tag name",
                }
            );
        }
    }
    Ok(())
}

/// The per-series table sequence returned by [`Reader::read_filter`].
/// Dropping it closes every cursor not yet yielded.
#[derive(Debug)]
pub struct FilterTables {
    cursors: VecDeque<SeriesCursor>,
    alloc: Arc<Allocator>,
    chunk_size: usize,
    _working: Reservation,
}

impl Iterator for FilterTables {
    type Item = Box<dyn Table>;

    /// Advance to the next table. The protocol is strictly sequential: the
    /// previous table must be done (or dropped) first.
    fn next(&mut self) -> Option<Self::Item> {
        self.cursors.pop_front().map(|series| {
            Box::new(SeriesTable::new(
                series,
                Arc::clone(&self.alloc),
                self.chunk_size,
            )) as Box<dyn Table>
        })
    }
}

impl Drop for FilterTables {
    fn drop(&mut self) {
        for series in &mut self.cursors {
            series.cursor.close();
        }
    }
}
