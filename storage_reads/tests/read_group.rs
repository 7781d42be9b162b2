//! End-to-end tests of `read_group` against the in-memory storage engine.

use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use storage_reads::{
    Allocator, Error, ErrorKind, GroupMode, ReadFilterSpec, ReadGroupSpec, Table, Tag,
    TimestampRange,
};
use storage_reads_test_helpers::TestEngine;

fn group_spec(
    engine: &TestEngine,
    mode: GroupMode,
    keys: &[&str],
    start: i64,
    stop: i64,
) -> ReadGroupSpec {
    ReadGroupSpec {
        filter: ReadFilterSpec {
            org_id: engine.org_id(),
            bucket_id: engine.bucket_id(),
            bounds: TimestampRange::new(start, stop),
            predicate: None,
        },
        group_mode: mode,
        group_keys: keys.iter().map(|k| k.to_string()).collect(),
    }
}

fn drain(table: &mut dyn Table) -> Vec<RecordBatch> {
    let mut batches = vec![];
    table
        .do_chunks(&mut |batch| {
            batches.push(batch);
            Ok(())
        })
        .expect("table drains cleanly");
    batches
}

fn times(batch: &RecordBatch) -> Vec<i64> {
    batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("_time is Int64")
        .values()
        .to_vec()
}

fn i64_values(batch: &RecordBatch) -> Vec<i64> {
    batch
        .column(1)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("_value is Int64")
        .values()
        .to_vec()
}

#[test_log::test]
fn group_by_host_separates_series() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01,region=useast2 value=1i 0\n\
         cpu,host=server02,region=useast2 value=7i 70\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let mut tables = reader
        .read_group(
            group_spec(&engine, GroupMode::By, &["host"], 0, 60),
            alloc,
        )
        .unwrap();

    // only server01 has rows in bound, but grouping still yields exactly the
    // groups that have member series with data
    let mut table = tables.next().expect("one group");
    assert_eq!(table.key(), &[Tag::new("host", "server01")]);
    let batches = drain(table.as_mut());
    // group key columns only: _time, _value, host
    assert_eq!(batches[0].num_columns(), 3);
    assert_eq!(times(&batches[0]), vec![0]);
    assert_eq!(i64_values(&batches[0]), vec![1]);
    assert!(table.done());

    assert!(tables.next().is_none());
    drop(table);
    drop(tables);
    assert_eq!(engine.open_cursor_count(), 0);
}

#[test_log::test]
fn group_by_yields_one_table_per_distinct_value() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01 value=1i 0\n\
         cpu,host=server02 value=7i 10\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let tables = reader
        .read_group(
            group_spec(&engine, GroupMode::By, &["host"], 0, 60),
            alloc,
        )
        .unwrap();

    let mut seen = vec![];
    for mut table in tables {
        let batches = drain(table.as_mut());
        seen.push((table.key().to_vec(), i64_values(&batches[0])));
    }
    assert_eq!(
        seen,
        vec![
            (vec![Tag::new("host", "server01")], vec![1]),
            (vec![Tag::new("host", "server02")], vec![7]),
        ]
    );
}

#[test_log::test]
fn group_members_merge_by_time() {
    let engine = TestEngine::new();
    // two series sharing host, from different measurements
    engine.write_lp(
        "cpu,host=server01,region=useast2 value=1i 10\n\
         cpu,host=server01,region=useast2 value=2i 30\n\
         mem,host=server01,region=uswest1 value=3i 5\n\
         mem,host=server01,region=uswest1 value=4i 30\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let mut tables = reader
        .read_group(
            group_spec(&engine, GroupMode::By, &["host"], 0, 60),
            alloc,
        )
        .unwrap();

    let mut table = tables.next().expect("one merged group");
    let batches = drain(table.as_mut());
    assert_eq!(times(&batches[0]), vec![5, 10, 30, 30]);
    // t=30 tie: cpu's series enumerates before mem's, so its row comes first
    assert_eq!(i64_values(&batches[0]), vec![3, 1, 2, 4]);
    assert!(tables.next().is_none());
}

#[test_log::test]
fn group_except_clusters_on_remaining_tags() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01,region=useast2 value=1i 0\n\
         cpu,host=server02,region=useast2 value=2i 10\n\
         cpu,host=server03,region=uswest1 value=3i 20\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let tables = reader
        .read_group(
            group_spec(&engine, GroupMode::Except, &["host"], 0, 60),
            alloc,
        )
        .unwrap();

    let mut seen = vec![];
    for mut table in tables {
        let batches = drain(table.as_mut());
        seen.push((table.key().to_vec(), i64_values(&batches[0])));
    }
    assert_eq!(
        seen,
        vec![
            (vec![Tag::new("region", "useast2")], vec![1, 2]),
            (vec![Tag::new("region", "uswest1")], vec![3]),
        ]
    );
}

#[test_log::test]
fn group_none_keeps_every_series_with_full_key() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01,region=useast2 value=1i 0\n\
         cpu,host=server02,region=useast2 value=7i 10\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let tables = reader
        .read_group(group_spec(&engine, GroupMode::None, &[], 0, 60), alloc)
        .unwrap();

    let mut keys = vec![];
    for mut table in tables {
        drain(table.as_mut());
        keys.push(table.key().to_vec());
    }
    assert_eq!(
        keys,
        vec![
            vec![
                Tag::new("host", "server01"),
                Tag::new("region", "useast2")
            ],
            vec![
                Tag::new("host", "server02"),
                Tag::new("region", "useast2")
            ],
        ]
    );
}

#[test_log::test]
fn absent_group_key_groups_under_empty_value() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01 value=1i 0\n\
         cpu,host=server02 value=2i 10\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let mut tables = reader
        .read_group(
            group_spec(&engine, GroupMode::By, &["rack"], 0, 60),
            alloc,
        )
        .unwrap();

    let mut table = tables.next().expect("single group");
    assert_eq!(table.key(), &[Tag::new("rack", "")]);
    let batches = drain(table.as_mut());
    let rack = batches[0]
        .column(2)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("rack column is Utf8");
    assert_eq!(rack.value(0), "");
    assert_eq!(times(&batches[0]), vec![0, 10]);
    assert!(tables.next().is_none());
}

#[test_log::test]
fn field_type_conflict_fails_eagerly_and_releases() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01 value=1i 0\n\
         gpu,host=server01 value=2.5 10\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let err = reader
        .read_group(
            group_spec(&engine, GroupMode::By, &["host"], 0, 60),
            Arc::clone(&alloc),
        )
        .unwrap_err();

    assert!(matches!(err, Error::FieldTypeConflict { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(engine.open_cursor_count(), 0);
    assert_eq!(alloc.allocated(), 0);
}

#[test_log::test]
fn empty_match_yields_empty_iterator() {
    let engine = TestEngine::new();
    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let mut tables = reader
        .read_group(
            group_spec(&engine, GroupMode::By, &["host"], 0, 60),
            alloc,
        )
        .unwrap();
    assert!(tables.next().is_none());
}

#[test_log::test]
fn abandoned_group_iterator_releases_every_cursor() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01 value=1i 0\n\
         cpu,host=server02 value=2i 0\n\
         cpu,host=server03 value=3i 0\n",
    );

    let reader = engine.reader();
    let alloc = Arc::new(Allocator::unbounded());
    let mut tables = reader
        .read_group(
            group_spec(&engine, GroupMode::By, &["host"], 0, 60),
            Arc::clone(&alloc),
        )
        .unwrap();
    assert_eq!(engine.open_cursor_count(), 3);

    let table = tables.next().expect("first group");
    drop(table);
    drop(tables);

    assert_eq!(engine.open_cursor_count(), 0);
    assert_eq!(alloc.allocated(), 0);
}

#[test_log::test]
fn rerun_produces_identical_output() {
    let engine = TestEngine::new();
    engine.write_lp(
        "cpu,host=server01,region=useast2 value=1i 0\n\
         cpu,host=server02,region=useast2 value=7i 10\n\
         mem,host=server01,region=uswest1 value=3i 20\n",
    );

    let reader = engine.reader();
    let run = || {
        let alloc = Arc::new(Allocator::unbounded());
        let tables = reader
            .read_group(
                group_spec(&engine, GroupMode::By, &["host", "region"], 0, 60),
                alloc,
            )
            .unwrap();
        let mut out = vec![];
        for mut table in tables {
            let batches = drain(table.as_mut());
            out.extend(
                pretty_format_batches(&batches)
                    .expect("formatting batches")
                    .to_string()
                    .lines()
                    .map(str::to_string),
            );
        }
        out
    };

    assert_eq!(run(), run());
    assert_eq!(engine.open_cursor_count(), 0);
}
