//! In-crate test doubles for the cursor interface.

use std::collections::VecDeque;

use crate::cursor::Cursor;
use crate::types::{Value, ValueType};
use crate::BoxedError;

/// A cursor over a fixed vector of rows, optionally failing after a number of
/// pulls.
#[derive(Debug)]
pub(crate) struct VecCursor {
    value_type: ValueType,
    rows: VecDeque<(i64, Value)>,
    fail_after: Option<usize>,
    pulls: usize,
    closed: bool,
}

impl VecCursor {
    pub(crate) fn new(value_type: ValueType, rows: Vec<(i64, Value)>) -> Self {
        Self {
            value_type,
            rows: rows.into(),
            fail_after: None,
            pulls: 0,
            closed: false,
        }
    }

    /// Make the cursor fail with an I/O-style error on pull number
    /// `pulls + 1`.
    pub(crate) fn fail_after(mut self, pulls: usize) -> Self {
        self.fail_after = Some(pulls);
        self
    }
}

impl Cursor for VecCursor {
    fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn next(&mut self) -> Result<Option<(i64, Value)>, BoxedError> {
        if self.closed {
            return Ok(None);
        }
        if let Some(limit) = self.fail_after {
            if self.pulls >= limit {
                return Err("simulated storage failure".into());
            }
        }
        self.pulls += 1;
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
