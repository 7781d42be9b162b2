//! The table protocol: lazy, chunked materialization of one row stream.
//!
//! A [`Table`] produces its rows as Arrow record batches, pulled on demand
//! from the cursor(s) it owns. Production is single-pass and strictly
//! sequential; suspension happens only at the cursor-pull boundary. The
//! `Created -> Active -> Done` lifecycle ends exactly once, closing the
//! cursors and returning every accounted byte to the allocator, whether the
//! consumer drained the table, abandoned it or hit an error.

use std::fmt::Debug;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use snafu::ResultExt;

use crate::allocator::Allocator;
use crate::cursor::{Cursor, SeriesCursor};
use crate::types::{SeriesKey, Tag, Value, ValueType, TIME_COLUMN_NAME, VALUE_COLUMN_NAME};
use crate::{ArrowSnafu, BoxedError, ConsumerSnafu, CursorSnafu, Error, Result};

/// The unit of data handed to the consuming query engine: one series (or one
/// group of series) over a bounded time window.
///
/// The protocol is strictly sequential per table; a table must never be
/// pulled from two threads at once.
pub trait Table: Debug {
    /// The constant-valued tag columns of this table, sorted by tag key. For
    /// a grouped table these are the group key tags.
    fn key(&self) -> &[Tag];

    /// Schema of every chunk this table produces: `_time`, `_value`, then one
    /// Utf8 column per tag in [`key`](Self::key) order.
    fn schema(&self) -> SchemaRef;

    /// The field type of the `_value` column, fixed for the table's lifetime.
    fn value_type(&self) -> ValueType;

    /// Produce the table's rows as a finite, single-pass sequence of record
    /// batches. A table with no rows in bound produces exactly one empty
    /// batch so the consumer still observes the schema.
    ///
    /// On return — success, consumer error or storage failure alike — the
    /// table is done and its resources are released. Calling again after
    /// completion is a no-op.
    fn do_chunks(&mut self, f: &mut dyn FnMut(RecordBatch) -> Result<(), BoxedError>)
        -> Result<()>;

    /// Has this table been fully released (cursor closed, allocation
    /// returned)? Terminal and idempotent.
    fn done(&self) -> bool;

    /// Release the table's cursors and allocation without draining it.
    /// Idempotent; also invoked on drop.
    fn close(&mut self);
}

/// Ordered, typed column data for one chunk under construction.
#[derive(Debug)]
pub(crate) enum ColumnData {
    I64(Vec<i64>),
    U64(Vec<u64>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    String(Vec<String>),
}

impl ColumnData {
    pub(crate) fn with_capacity(value_type: ValueType, capacity: usize) -> Self {
        match value_type {
            ValueType::I64 => Self::I64(Vec::with_capacity(capacity)),
            ValueType::U64 => Self::U64(Vec::with_capacity(capacity)),
            ValueType::F64 => Self::F64(Vec::with_capacity(capacity)),
            ValueType::Bool => Self::Bool(Vec::with_capacity(capacity)),
            ValueType::String => Self::String(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn push(&mut self, value: Value) -> Result<()> {
        match (self, value) {
            (Self::I64(v), Value::I64(x)) => v.push(x),
            (Self::U64(v), Value::U64(x)) => v.push(x),
            (Self::F64(v), Value::F64(x)) => v.push(x),
            (Self::Bool(v), Value::Bool(x)) => v.push(x),
            (Self::String(v), Value::String(x)) => v.push(x),
            (column, value) => {
                // the cursor broke its fixed-type contract
                return Err(Error::Cursor {
                    source: format!(
                        "cursor produced {} value in a {} column",
                        value.value_type(),
                        type_of(column)
                    )
                    .into(),
                });
            }
        }
        Ok(())
    }

    fn into_array(self) -> ArrayRef {
        match self {
            Self::I64(v) => Arc::new(Int64Array::from(v)),
            Self::U64(v) => Arc::new(UInt64Array::from(v)),
            Self::F64(v) => Arc::new(Float64Array::from(v)),
            Self::Bool(v) => Arc::new(BooleanArray::from(v)),
            Self::String(v) => Arc::new(StringArray::from(v)),
        }
    }
}

fn type_of(column: &ColumnData) -> ValueType {
    match column {
        ColumnData::I64(_) => ValueType::I64,
        ColumnData::U64(_) => ValueType::U64,
        ColumnData::F64(_) => ValueType::F64,
        ColumnData::Bool(_) => ValueType::Bool,
        ColumnData::String(_) => ValueType::String,
    }
}

/// Schema shared by every chunk of one table: `_time`, `_value`, then the
/// tag columns in `tags` order.
pub(crate) fn make_schema(value_type: ValueType, tags: &[Tag]) -> SchemaRef {
    let mut fields = Vec::with_capacity(2 + tags.len());
    fields.push(Field::new(TIME_COLUMN_NAME, DataType::Int64, false));
    fields.push(Field::new(VALUE_COLUMN_NAME, value_type.arrow_type(), false));
    for tag in tags {
        fields.push(Field::new(tag.key.as_str(), DataType::Utf8, false));
    }
    Arc::new(Schema::new(fields))
}

/// Nominal bytes one row occupies while buffered, for allocator accounting.
pub(crate) fn row_width(value_type: ValueType, tags: &[Tag]) -> usize {
    let tag_bytes: usize = tags.iter().map(|tag| tag.value.len()).sum();
    8 + value_type.estimated_width() + tag_bytes
}

fn build_chunk(
    schema: &SchemaRef,
    times: Vec<i64>,
    values: ColumnData,
    tags: &[Tag],
) -> Result<RecordBatch> {
    let rows = times.len();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(2 + tags.len());
    columns.push(Arc::new(Int64Array::from(times)));
    columns.push(values.into_array());
    for tag in tags {
        columns.push(Arc::new(StringArray::from(vec![tag.value.as_str(); rows])));
    }
    RecordBatch::try_new(Arc::clone(schema), columns).context(ArrowSnafu)
}

/// A finite, single-pass sequence of `(timestamp, value)` rows feeding one
/// table. Implemented by the single-cursor stream below and by the merging
/// stream in [`crate::group`].
pub(crate) trait RowStream: Debug + Send {
    fn next_row(&mut self) -> Result<Option<(i64, Value)>>;
    fn close(&mut self);
}

/// Adapts one storage cursor into a [`RowStream`].
#[derive(Debug)]
pub(crate) struct CursorStream {
    cursor: Box<dyn Cursor>,
}

impl CursorStream {
    pub(crate) fn new(cursor: Box<dyn Cursor>) -> Self {
        Self { cursor }
    }
}

impl RowStream for CursorStream {
    fn next_row(&mut self) -> Result<Option<(i64, Value)>> {
        self.cursor.next().context(CursorSnafu)
    }

    fn close(&mut self) {
        self.cursor.close();
    }
}

/// Shared implementation of the table protocol over any [`RowStream`].
#[derive(Debug)]
pub(crate) struct TableCore<S: RowStream> {
    tags: Vec<Tag>,
    schema: SchemaRef,
    value_type: ValueType,
    row_width: usize,
    chunk_size: usize,
    alloc: Arc<Allocator>,
    stream: S,
    done: bool,
}

impl<S: RowStream> TableCore<S> {
    pub(crate) fn new(
        tags: Vec<Tag>,
        value_type: ValueType,
        stream: S,
        alloc: Arc<Allocator>,
        chunk_size: usize,
    ) -> Self {
        let schema = make_schema(value_type, &tags);
        let row_width = row_width(value_type, &tags);
        Self {
            tags,
            schema,
            value_type,
            row_width,
            chunk_size,
            alloc,
            stream,
            done: false,
        }
    }

    pub(crate) fn key(&self) -> &[Tag] {
        &self.tags
    }

    pub(crate) fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub(crate) fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub(crate) fn done(&self) -> bool {
        self.done
    }

    pub(crate) fn close(&mut self) {
        if !self.done {
            self.stream.close();
            self.done = true;
        }
    }

    pub(crate) fn do_chunks(
        &mut self,
        f: &mut dyn FnMut(RecordBatch) -> Result<(), BoxedError>,
    ) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let mut produced = false;
        loop {
            // fail-closed: an over-budget request releases the table instead
            // of leaving a half-filled chunk
            let mut reservation = match self.alloc.reserve(self.chunk_size * self.row_width) {
                Ok(r) => r,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };

            let mut times = Vec::with_capacity(self.chunk_size);
            let mut values = ColumnData::with_capacity(self.value_type, self.chunk_size);
            let mut exhausted = false;
            while times.len() < self.chunk_size {
                match self.stream.next_row() {
                    Ok(Some((t, value))) => {
                        if let Err(e) = values.push(value) {
                            self.close();
                            return Err(e);
                        }
                        times.push(t);
                    }
                    Ok(None) => {
                        exhausted = true;
                        break;
                    }
                    Err(e) => {
                        self.close();
                        return Err(e);
                    }
                }
            }

            let rows = times.len();
            if rows == 0 && produced {
                // the previous chunk ended exactly at the cursor's end
                self.close();
                return Ok(());
            }
            reservation.shrink_to(rows * self.row_width);

            let batch = match build_chunk(&self.schema, times, values, &self.tags) {
                Ok(batch) => batch,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };
            produced = true;

            let consumed = f(batch).context(ConsumerSnafu);
            // chunk consumption releases its bytes synchronously
            drop(reservation);
            if let Err(e) = consumed {
                self.close();
                return Err(e);
            }
            if exhausted {
                self.close();
                return Ok(());
            }
        }
    }
}

impl<S: RowStream> Drop for TableCore<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A table materializing exactly one series from its cursor, with the full
/// tag set of the series as constant columns.
#[derive(Debug)]
pub struct SeriesTable {
    series_key: SeriesKey,
    core: TableCore<CursorStream>,
}

impl SeriesTable {
    pub(crate) fn new(series: SeriesCursor, alloc: Arc<Allocator>, chunk_size: usize) -> Self {
        let value_type = series.cursor.value_type();
        let tags = series.key.tags.clone();
        Self {
            series_key: series.key,
            core: TableCore::new(
                tags,
                value_type,
                CursorStream::new(series.cursor),
                alloc,
                chunk_size,
            ),
        }
    }

    /// The key of the series this table reads.
    pub fn series_key(&self) -> &SeriesKey {
        &self.series_key
    }
}

impl Table for SeriesTable {
    fn key(&self) -> &[Tag] {
        self.core.key()
    }

    fn schema(&self) -> SchemaRef {
        self.core.schema()
    }

    fn value_type(&self) -> ValueType {
        self.core.value_type()
    }

    fn do_chunks(
        &mut self,
        f: &mut dyn FnMut(RecordBatch) -> Result<(), BoxedError>,
    ) -> Result<()> {
        self.core.do_chunks(f)
    }

    fn done(&self) -> bool {
        self.core.done()
    }

    fn close(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::VecCursor;

    fn series(points: Vec<(i64, Value)>) -> SeriesCursor {
        SeriesCursor {
            key: SeriesKey::new("cpu", "value").with_tag("host", "server01"),
            cursor: Box::new(VecCursor::new(ValueType::I64, points)),
        }
    }

    fn collect_chunks(table: &mut SeriesTable) -> Vec<RecordBatch> {
        let mut chunks = vec![];
        table
            .do_chunks(&mut |batch| {
                chunks.push(batch);
                Ok(())
            })
            .unwrap();
        chunks
    }

    #[test]
    fn single_chunk() {
        let alloc = Arc::new(Allocator::unbounded());
        let mut table =
            SeriesTable::new(series(vec![(0, Value::I64(1)), (30, Value::I64(2))]), alloc, 10);

        assert!(!table.done());
        let chunks = collect_chunks(&mut table);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].num_rows(), 2);
        assert_eq!(chunks[0].num_columns(), 3);
        assert!(table.done());

        // single-pass: a second call yields nothing and stays done
        let again = collect_chunks(&mut table);
        assert!(again.is_empty());
        assert!(table.done());
    }

    #[test]
    fn chunking_splits_rows() {
        let alloc = Arc::new(Allocator::unbounded());
        let points: Vec<_> = (0..7).map(|t| (t, Value::I64(t))).collect();
        let mut table = SeriesTable::new(series(points), alloc, 3);

        let chunks = collect_chunks(&mut table);
        let rows: Vec<_> = chunks.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(rows, vec![3, 3, 1]);
    }

    #[test]
    fn empty_cursor_emits_one_empty_chunk() {
        let alloc = Arc::new(Allocator::unbounded());
        let mut table = SeriesTable::new(series(vec![]), alloc, 10);

        let chunks = collect_chunks(&mut table);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].num_rows(), 0);
        assert_eq!(chunks[0].schema(), table.schema());
        assert!(table.done());
    }

    #[test]
    fn exact_multiple_of_chunk_size_has_no_trailing_empty_chunk() {
        let alloc = Arc::new(Allocator::unbounded());
        let points: Vec<_> = (0..6).map(|t| (t, Value::I64(t))).collect();
        let mut table = SeriesTable::new(series(points), alloc, 3);

        let chunks = collect_chunks(&mut table);
        let rows: Vec<_> = chunks.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(rows, vec![3, 3]);
    }

    #[test]
    fn allocation_released_after_each_chunk() {
        let alloc = Arc::new(Allocator::unbounded());
        let points: Vec<_> = (0..10).map(|t| (t, Value::I64(t))).collect();
        let mut table = SeriesTable::new(series(points), Arc::clone(&alloc), 4);

        table
            .do_chunks(&mut |_| {
                assert!(alloc.allocated() > 0);
                Ok(())
            })
            .unwrap();
        assert_eq!(alloc.allocated(), 0);
        assert!(alloc.max_allocated() > 0);
    }

    #[test]
    fn over_budget_pull_fails_closed() {
        let alloc = Arc::new(Allocator::with_limit(8));
        let points: Vec<_> = (0..10).map(|t| (t, Value::I64(t))).collect();
        let mut table = SeriesTable::new(series(points), Arc::clone(&alloc), 4);

        let err = table.do_chunks(&mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::MemoryExhausted { .. }));
        assert!(table.done());
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn consumer_error_closes_table() {
        let alloc = Arc::new(Allocator::unbounded());
        let points: Vec<_> = (0..10).map(|t| (t, Value::I64(t))).collect();
        let mut table = SeriesTable::new(series(points), Arc::clone(&alloc), 4);

        let err = table
            .do_chunks(&mut |_| Err("stop".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Consumer { .. }));
        assert!(table.done());
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn cursor_error_propagates_after_release() {
        let alloc = Arc::new(Allocator::unbounded());
        let points: Vec<_> = (0..5).map(|t| (t, Value::I64(t))).collect();
        let cursor = VecCursor::new(ValueType::I64, points).fail_after(3);
        let series = SeriesCursor {
            key: SeriesKey::new("cpu", "value"),
            cursor: Box::new(cursor),
        };
        let mut table = SeriesTable::new(series, Arc::clone(&alloc), 10);

        let err = table.do_chunks(&mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Cursor { .. }));
        assert!(table.done());
        assert_eq!(alloc.allocated(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let alloc = Arc::new(Allocator::unbounded());
        let mut table = SeriesTable::new(series(vec![(0, Value::I64(1))]), alloc, 10);

        table.close();
        assert!(table.done());
        table.close();
        assert!(table.done());

        // a closed table produces nothing
        let mut called = false;
        table
            .do_chunks(&mut |_| {
                called = true;
                Ok(())
            })
            .unwrap();
        assert!(!called);
    }
}
