//! Grouped iteration: clustering series into grouped tables and merging
//! member cursors by time.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use snafu::ResultExt;

use crate::allocator::{Allocator, Reservation};
use crate::cursor::{Cursor, SeriesCursor};
use crate::table::{RowStream, Table, TableCore};
use crate::types::{Tag, Value, ValueType};
use crate::{BoxedError, CursorSnafu, Error, Result};

/// Policy for clustering series into grouped tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    /// Every series is its own group, keyed by its full tag set.
    None,
    /// Series sharing the values of every listed key form one group.
    By,
    /// Series are grouped on all tags except the listed ones.
    Except,
}

/// One planned group: its canonical key tuple, the shared field type, and the
/// member cursors in source-enumeration order.
#[derive(Debug)]
pub(crate) struct GroupEntry {
    pub(crate) key: Vec<Tag>,
    pub(crate) value_type: ValueType,
    pub(crate) members: Vec<SeriesCursor>,
}

/// Partition `cursors` into groups per `mode`.
///
/// Groups come out in ascending order of their key tuple (tags sorted by key
/// name, compared lexically). A field-type conflict within one group fails
/// the whole plan; every cursor is closed before the error returns.
pub(crate) fn plan_groups(
    cursors: Vec<SeriesCursor>,
    mode: GroupMode,
    group_keys: &[String],
) -> Result<Vec<GroupEntry>> {
    match mode {
        GroupMode::None => Ok(cursors
            .into_iter()
            .map(|series| GroupEntry {
                key: series.key.tags.clone(),
                value_type: series.cursor.value_type(),
                members: vec![series],
            })
            .collect()),
        GroupMode::By => group_by_keys(cursors, group_keys.to_vec()),
        GroupMode::Except => {
            let excluded: BTreeSet<&str> = group_keys.iter().map(String::as_str).collect();
            let keep: BTreeSet<String> = cursors
                .iter()
                .flat_map(|series| series.key.tags.iter().map(|tag| tag.key.clone()))
                .filter(|key| !excluded.contains(key.as_str()))
                .collect();
            group_by_keys(cursors, keep.into_iter().collect())
        }
    }
}

fn group_by_keys(cursors: Vec<SeriesCursor>, mut keys: Vec<String>) -> Result<Vec<GroupEntry>> {
    // canonical key tuple: sorted by tag name, as the storage layer sorts
    // series keys
    keys.sort();
    keys.dedup();

    let mut groups: BTreeMap<Vec<Tag>, (ValueType, Vec<SeriesCursor>)> = BTreeMap::new();
    let mut failure: Option<Error> = None;
    for mut series in cursors {
        if failure.is_some() {
            series.cursor.close();
            continue;
        }
        // a group key no series carries is an absent (empty) tag value, not
        // an error
        let key: Vec<Tag> = keys
            .iter()
            .map(|k| Tag::new(k.clone(), series.key.tag_value(k).unwrap_or("")))
            .collect();
        let value_type = series.cursor.value_type();
        match groups.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert((value_type, vec![series]));
            }
            Entry::Occupied(mut slot) => {
                let (existing, members) = slot.get_mut();
                if *existing == value_type {
                    members.push(series);
                } else {
                    failure = Some(Error::FieldTypeConflict {
                        existing: *existing,
                        conflicting: value_type,
                        series: series.key.to_string(),
                    });
                    series.cursor.close();
                }
            }
        }
    }

    if let Some(error) = failure {
        for (_, (_, members)) in groups {
            for mut member in members {
                member.cursor.close();
            }
        }
        return Err(error);
    }

    Ok(groups
        .into_iter()
        .map(|(key, (value_type, members))| GroupEntry {
            key,
            value_type,
            members,
        })
        .collect())
}

/// Merges the member cursors of one group by ascending timestamp. Equal
/// timestamps across members resolve stably to the member with the lowest
/// source-enumeration position.
#[derive(Debug)]
pub(crate) struct MergeStream {
    members: Vec<MergeMember>,
}

#[derive(Debug)]
struct MergeMember {
    cursor: Box<dyn Cursor>,
    head: Option<(i64, Value)>,
    exhausted: bool,
}

impl MergeMember {
    fn fill(&mut self) -> Result<()> {
        if self.head.is_none() && !self.exhausted {
            match self.cursor.next().context(CursorSnafu)? {
                Some(row) => self.head = Some(row),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }
}

impl MergeStream {
    pub(crate) fn new(members: Vec<SeriesCursor>) -> Self {
        Self {
            members: members
                .into_iter()
                .map(|series| MergeMember {
                    cursor: series.cursor,
                    head: None,
                    exhausted: false,
                })
                .collect(),
        }
    }
}

impl RowStream for MergeStream {
    fn next_row(&mut self) -> Result<Option<(i64, Value)>> {
        let mut best: Option<(usize, i64)> = None;
        for idx in 0..self.members.len() {
            self.members[idx].fill()?;
            if let Some((t, _)) = self.members[idx].head.as_ref() {
                let t = *t;
                match best {
                    // strict `<` keeps equal timestamps on the earliest member
                    Some((_, best_t)) if t >= best_t => {}
                    _ => best = Some((idx, t)),
                }
            }
        }
        match best {
            Some((idx, _)) => Ok(self.members[idx].head.take()),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        // all members release together; no partial close is observable, and
        // buffered lookahead rows are discarded
        for member in &mut self.members {
            member.head = None;
            member.exhausted = true;
            member.cursor.close();
        }
    }
}

/// A table materializing one group of series, merged by time, with the group
/// key tags as constant columns.
#[derive(Debug)]
pub struct GroupTable {
    core: TableCore<MergeStream>,
}

impl GroupTable {
    pub(crate) fn new(entry: GroupEntry, alloc: Arc<Allocator>, chunk_size: usize) -> Self {
        Self {
            core: TableCore::new(
                entry.key,
                entry.value_type,
                MergeStream::new(entry.members),
                alloc,
                chunk_size,
            ),
        }
    }
}

impl Table for GroupTable {
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

/// The grouped table sequence returned by
/// [`Reader::read_group`](crate::Reader::read_group). Dropping it closes every
/// cursor of every group not yet yielded.
#[derive(Debug)]
pub struct GroupTables {
    groups: VecDeque<GroupEntry>,
    alloc: Arc<Allocator>,
    chunk_size: usize,
    _working: Reservation,
}

impl GroupTables {
    pub(crate) fn new(
        groups: Vec<GroupEntry>,
        alloc: Arc<Allocator>,
        chunk_size: usize,
        working: Reservation,
    ) -> Self {
        Self {
            groups: groups.into(),
            alloc,
            chunk_size,
            _working: working,
        }
    }
}

impl Iterator for GroupTables {
    type Item = Box<dyn Table>;

    /// Advance to the next grouped table. The protocol is strictly
    /// sequential: the previous table must be done (or dropped) first.
    fn next(&mut self) -> Option<Self::Item> {
        self.groups.pop_front().map(|entry| {
            Box::new(GroupTable::new(
                entry,
                Arc::clone(&self.alloc),
                self.chunk_size,
            )) as Box<dyn Table>
        })
    }
}

impl Drop for GroupTables {
    fn drop(&mut self) {
        for entry in &mut self.groups {
            for member in &mut entry.members {
                member.cursor.close();
            }
        }
    }
}
