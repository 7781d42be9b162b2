//! Core data model: time bounds, typed values, series keys and predicates.

use std::fmt::{self, Display};

use arrow::datatypes::DataType;

/// Name of the timestamp column every table produces. Raw nanoseconds since
/// the epoch, as stored by the engine.
pub const TIME_COLUMN_NAME: &str = "_time";

/// Name of the field value column every table produces.
pub const VALUE_COLUMN_NAME: &str = "_value";

/// A continuous, half-open range of nanosecond timestamps: `[start, end)`.
///
/// Timestamp bounds are so common and critical to the performance of
/// timeseries reads that they are handled separately from the general
/// [`Predicate`].
#[derive(Clone, PartialEq, Eq, Copy, Debug)]
pub struct TimestampRange {
    /// Inclusive lower bound.
    pub start: i64,
    /// Exclusive upper bound.
    pub end: i64,
}

impl TimestampRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// The closed set of field value types a cursor can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I64,
    U64,
    F64,
    Bool,
    String,
}

impl ValueType {
    /// The Arrow type of a `_value` column holding this value type.
    pub fn arrow_type(&self) -> DataType {
        match self {
            Self::I64 => DataType::Int64,
            Self::U64 => DataType::UInt64,
            Self::F64 => DataType::Float64,
            Self::Bool => DataType::Boolean,
            Self::String => DataType::Utf8,
        }
    }

    /// Nominal per-row width in bytes, used for allocator accounting before
    /// the actual data is copied in.
    pub(crate) fn estimated_width(&self) -> usize {
        match self {
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Bool => 1,
            Self::String => 16,
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I64 => "integer",
            Self::U64 => "unsigned",
            Self::F64 => "float",
            Self::Bool => "boolean",
            Self::String => "string",
        };
        f.write_str(s)
    }
}

/// One typed field value paired with a timestamp by a cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::I64(_) => ValueType::I64,
            Self::U64(_) => ValueType::U64,
            Self::F64(_) => ValueType::F64,
            Self::Bool(_) => ValueType::Bool,
            Self::String(_) => ValueType::String,
        }
    }
}

/// A single `key=value` tag pair. Ordering is lexical by key, then value,
/// matching the byte ordering the storage layer guarantees for series keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Uniquely identifies one series: measurement, sorted tag set and field
/// name. The derived ordering is the deterministic enumeration order cursor
/// sources must honor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub measurement: String,
    /// Sorted by tag key; constructors maintain the invariant.
    pub tags: Vec<Tag>,
    pub field: String,
}

impl SeriesKey {
    pub fn new(measurement: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            field: field.into(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(key, value));
        self.tags.sort();
        self
    }

    /// Value of the named tag, if this series carries it.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }
}

impl Display for SeriesKey {
    /// Line-protocol-like rendering, e.g. `cpu,host=server01,region=useast2 value`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.measurement)?;
        for tag in &self.tags {
            write!(f, ",{}={}", tag.key, tag.value)?;
        }
        write!(f, " {}", self.field)
    }
}

/// A boolean expression over tag values. The read layer never evaluates it;
/// it is passed through to the cursor source verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    TagEqual { key: String, value: String },
    TagNotEqual { key: String, value: String },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn tag_equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::TagEqual {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn tag_not_equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::TagNotEqual {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }
}
