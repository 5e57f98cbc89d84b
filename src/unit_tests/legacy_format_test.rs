use super::*;
use std::path::Path;

use crate::error::Error;
use crate::model::{Function, Location, Mapping, Stacktrace};
use crate::parquet_tables::{
    FunctionPersister, LocationPersister, MappingPersister, StacktracePersister, StringPersister,
    TableWriter,
};
use crate::{BlockMeta, ParquetConfig, SymbolsReader, open_block};

/// Assembles a legacy block: a `stacktraces.parquet` whose row numbers are
/// the stacktrace ids, the four symbol tables, and no index file.
fn write_v1_block(dir: &Path, stacktraces: &[Stacktrace]) {
    let config = ParquetConfig {
        max_buffer_row_count: 100 << 10,
    };

    let mut st = TableWriter::<StacktracePersister>::create(dir, &config).unwrap();
    st.write_records(stacktraces).unwrap();
    st.close().unwrap();

    let mut strings = TableWriter::<StringPersister>::create(dir, &config).unwrap();
    strings.write_records(&[String::new()]).unwrap();
    strings.close().unwrap();

    let mut functions = TableWriter::<FunctionPersister>::create(dir, &config).unwrap();
    functions.write_records(&[Function::default()]).unwrap();
    functions.close().unwrap();

    let mut mappings = TableWriter::<MappingPersister>::create(dir, &config).unwrap();
    mappings.write_records(&[Mapping::default()]).unwrap();
    mappings.close().unwrap();

    let mut locations = TableWriter::<LocationPersister>::create(dir, &config).unwrap();
    locations.write_records(&[Location::default()]).unwrap();
    locations.close().unwrap();
}

/// Nineteen rows where the rows of interest mirror the tree-format test
/// block; all other rows are single-frame filler.
fn legacy_stacktraces() -> Vec<Stacktrace> {
    let mut rows: Vec<Stacktrace> = (0..19).map(|_| Stacktrace::new(vec![1])).collect();
    rows[2] = Stacktrace::new(vec![2, 1]);
    rows[3] = Stacktrace::new(vec![3, 2, 1]);
    rows[11] = Stacktrace::new(vec![4, 3, 2, 1]);
    rows[16] = Stacktrace::new(vec![3, 1]);
    rows[18] = Stacktrace::new(vec![5, 2, 1]);
    rows
}

#[tokio::test]
async fn test_legacy_block_resolves_by_row_number() {
    let dir = tempfile::tempdir().unwrap();
    write_v1_block(dir.path(), &legacy_stacktraces());

    let reader = open_block(dir.path().to_str().unwrap(), &BlockMeta::default())
        .await
        .unwrap();
    assert!(
        matches!(reader, SymbolsReader::V1(_)),
        "a block without an index file selects the legacy reader"
    );

    let partition = reader.partition(1).await.unwrap();
    let mut sink = RecordingSink::new();
    partition
        .symbols()
        .resolve_stacktrace_locations(&mut sink, &[2, 3, 11, 16, 18])
        .await
        .unwrap();
    assert_eq!(
        sink.inserts,
        vec![
            (2, vec![2, 1]),
            (3, vec![3, 2, 1]),
            (11, vec![4, 3, 2, 1]),
            (16, vec![3, 1]),
            (18, vec![5, 2, 1]),
        ]
    );

    let mut stats = crate::PartitionStats::default();
    partition.write_stats(&mut stats);
    assert_eq!(stats.stacktraces_total, 19);
    assert_eq!(stats.max_stacktrace_id, 19);
}

#[tokio::test]
async fn test_legacy_duplicate_ids_emit_once_each() {
    let dir = tempfile::tempdir().unwrap();
    write_v1_block(dir.path(), &legacy_stacktraces());

    let reader = open_block(dir.path().to_str().unwrap(), &BlockMeta::default())
        .await
        .unwrap();
    let partition = reader.partition(1).await.unwrap();
    let mut sink = RecordingSink::new();
    partition
        .symbols()
        .resolve_stacktrace_locations(&mut sink, &[3, 3, 16])
        .await
        .unwrap();
    assert_eq!(
        sink.inserts,
        vec![
            (3, vec![3, 2, 1]),
            (3, vec![3, 2, 1]),
            (16, vec![3, 1]),
        ]
    );
}

#[tokio::test]
async fn test_legacy_id_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    write_v1_block(dir.path(), &legacy_stacktraces());

    let reader = open_block(dir.path().to_str().unwrap(), &BlockMeta::default())
        .await
        .unwrap();
    let partition = reader.partition(1).await.unwrap();
    match partition
        .symbols()
        .resolve_stacktrace_locations(&mut RecordingSink::new(), &[99])
        .await
    {
        Err(Error::OutOfRange { id: 99, .. }) => {}
        other => panic!("expected OutOfRange, got {other:?}"),
    }
}

#[tokio::test]
async fn test_legacy_empty_stacktrace_table_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_v1_block(dir.path(), &[]);

    let reader = open_block(dir.path().to_str().unwrap(), &BlockMeta::default())
        .await
        .unwrap();
    match reader.partition(1).await {
        Err(Error::EmptyParquetFile(_)) => {}
        other => panic!("expected EmptyParquetFile, got {:?}", other.map(|_| ())),
    }
}
