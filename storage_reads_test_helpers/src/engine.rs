//! An in-memory storage engine implementing the cursor-source interface.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use influxdb_line_protocol::{parse_lines, FieldValue};
use parking_lot::RwLock;
use storage_reads::{
    BoxedError, BucketId, Cursor, CursorSource, Error as ReadError, OrgId, Predicate, SeriesCursor,
    SeriesKey, TimestampRange, Value, ValueType,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not open")]
    NotOpen,

    #[error("bucket {bucket_id} in organization {org_id} does not exist")]
    UnknownBucket {
        org_id: OrgId,
        bucket_id: BucketId,
    },

    #[error("field type conflict writing {series}: stored {existing}, incoming {incoming}")]
    FieldTypeConflict {
        series: String,
        existing: ValueType,
        incoming: ValueType,
    },

    #[error("invalid line protocol: {0}")]
    LineProtocol(#[from] influxdb_line_protocol::Error),
}

#[derive(Debug)]
struct SeriesData {
    value_type: ValueType,
    points: BTreeMap<i64, Value>,
}

#[derive(Debug, Default)]
struct EngineState {
    open: bool,
    // BTreeMap keyed by series key gives the lexical, deterministic
    // enumeration order the cursor-source contract requires
    buckets: HashMap<(OrgId, BucketId), BTreeMap<SeriesKey, SeriesData>>,
}

/// A small in-memory storage engine for tests: line-protocol ingestion on the
/// write side, the cursor-source interface on the read side, and an
/// open-cursor counter for leak assertions.
#[derive(Debug, Default)]
pub struct MemEngine {
    state: RwLock<EngineState>,
    open_cursors: Arc<AtomicUsize>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.state.write().open = true;
    }

    /// Stop serving reads and writes. Retained data survives a reopen.
    pub fn close(&self) {
        self.state.write().open = false;
    }

    pub fn create_bucket(&self, org_id: OrgId, bucket_id: BucketId) {
        self.state
            .write()
            .buckets
            .entry((org_id, bucket_id))
            .or_default();
    }

    /// Number of cursors handed out and not yet closed.
    pub fn open_cursor_count(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Parse and store line-protocol points. Each field of a line is its own
    /// series; a line without a timestamp stores at t=0.
    pub fn write_lp(
        &self,
        org_id: OrgId,
        bucket_id: BucketId,
        lp: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write();
        if !state.open {
            return Err(EngineError::NotOpen);
        }
        let bucket = state
            .buckets
            .get_mut(&(org_id, bucket_id))
            .ok_or(EngineError::UnknownBucket { org_id, bucket_id })?;

        for line in parse_lines(lp) {
            let line = line?;
            let timestamp = line.timestamp.unwrap_or(0);
            let measurement = line.series.measurement.to_string();
            let tags: Vec<(String, String)> = line
                .series
                .tag_set
                .as_ref()
                .map(|tag_set| {
                    tag_set
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default();

            for (field, field_value) in &line.field_set {
                let value = match field_value {
                    FieldValue::I64(v) => Value::I64(*v),
                    FieldValue::U64(v) => Value::U64(*v),
                    FieldValue::F64(v) => Value::F64(*v),
                    FieldValue::Boolean(v) => Value::Bool(*v),
                    FieldValue::String(v) => Value::String(v.to_string()),
                };
                let value_type = value.value_type();

                let mut key = SeriesKey::new(measurement.clone(), field.to_string());
                for (k, v) in &tags {
                    key = key.with_tag(k.clone(), v.clone());
                }
                let series_name = key.to_string();

                let series = bucket.entry(key).or_insert_with(|| SeriesData {
                    value_type,
                    points: BTreeMap::new(),
                });
                if series.value_type != value_type {
                    return Err(EngineError::FieldTypeConflict {
                        series: series_name,
                        existing: series.value_type,
                        incoming: value_type,
                    });
                }
                series.points.insert(timestamp, value);
            }
        }
        Ok(())
    }
}

fn eval_predicate(key: &SeriesKey, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::TagEqual { key: tag, value } => key.tag_value(tag) == Some(value.as_str()),
        Predicate::TagNotEqual { key: tag, value } => key.tag_value(tag) != Some(value.as_str()),
        Predicate::And(a, b) => eval_predicate(key, a) && eval_predicate(key, b),
        Predicate::Or(a, b) => eval_predicate(key, a) || eval_predicate(key, b),
    }
}

impl CursorSource for MemEngine {
    fn open_series_cursors(
        &self,
        org_id: OrgId,
        bucket_id: BucketId,
        bounds: TimestampRange,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<SeriesCursor>, ReadError> {
        let state = self.state.read();
        if !state.open {
            return Err(ReadError::Cursor {
                source: "storage engine is not open".into(),
            });
        }
        let bucket = state
            .buckets
            .get(&(org_id, bucket_id))
            .ok_or(ReadError::BucketNotFound { org_id, bucket_id })?;

        if bounds.is_empty() {
            return Ok(vec![]);
        }

        let mut cursors: Vec<SeriesCursor> = vec![];
        for (key, series) in bucket {
            if let Some(predicate) = predicate {
                if !eval_predicate(key, predicate) {
                    continue;
                }
            }
            let points: Vec<(i64, Value)> = series
                .points
                .range(bounds.start..bounds.end)
                .map(|(t, v)| (*t, v.clone()))
                .collect();
            if points.is_empty() {
                continue;
            }
            self.open_cursors.fetch_add(1, Ordering::SeqCst);
            cursors.push(SeriesCursor {
                key: key.clone(),
                cursor: Box::new(MemCursor {
                    value_type: series.value_type,
                    points: points.into_iter(),
                    open_cursors: Arc::clone(&self.open_cursors),
                    closed: false,
                }),
            });
        }
        Ok(cursors)
    }
}

#[derive(Debug)]
struct MemCursor {
    value_type: ValueType,
    points: std::vec::IntoIter<(i64, Value)>,
    open_cursors: Arc<AtomicUsize>,
    closed: bool,
}

impl Cursor for MemCursor {
    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn next(&mut self) -> Result<Option<(i64, Value)>, BoxedError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.points.next())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemCursor {
    fn drop(&mut self) {
        self.close();
    }
}
