use super::*;
use crate::error::Error;
use crate::index_format::IndexFile;
use crate::{BlockMeta, SymDb, SymbolsReader, open_block};

async fn reopen(path: &str, files: Vec<crate::BlockFile>) -> SymbolsReader {
    open_block(path, &BlockMeta { files })
        .await
        .expect("block should open")
}

#[tokio::test]
async fn test_block_round_trip_v2() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let mut db = SymDb::new(block_config(dir.path(), 7, 100 << 10));
    let ids = db.partition(1).append_stacktraces(&stacks(&[
        &[3, 2, 1],
        &[2, 1],
        &[4, 3, 2, 1],
        &[3, 1],
        &[5, 2, 1],
    ]));
    assert_eq!(ids, vec![3, 2, 11, 16, 18]);

    let files = db.flush().await.unwrap();
    let names: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "index.symdb",
            "stacktraces.symdb",
            "locations.parquet",
            "mappings.parquet",
            "functions.parquet",
            "strings.parquet",
        ]
    );
    for f in &files {
        assert!(f.size_bytes > 0, "{} should not be empty", f.rel_path);
    }

    let reader = reopen(path, files).await;
    assert!(matches!(reader, SymbolsReader::V2(_)));
    let partition = reader.partition(1).await.unwrap();

    // The batch goes in append order; callbacks arrive in ascending id order.
    let mut sink = RecordingSink::new();
    partition
        .symbols()
        .resolve_stacktrace_locations(&mut sink, &ids)
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
}

#[tokio::test]
async fn test_partition_stats_and_caching() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let mut db = SymDb::new(block_config(dir.path(), 7, 100 << 10));
    db.partition(1).append_stacktraces(&stacks(&[
        &[3, 2, 1],
        &[2, 1],
        &[4, 3, 2, 1],
        &[3, 1],
        &[5, 2, 1],
    ]));
    let files = db.flush().await.unwrap();

    let reader = reopen(path, files).await;
    reader.load().await.unwrap();

    let first = reader.partition(1).await.unwrap();
    let second = reader.partition(1).await.unwrap();
    assert!(
        std::sync::Arc::ptr_eq(&first, &second),
        "partition readers should be cached"
    );

    let mut stats = crate::PartitionStats::default();
    first.write_stats(&mut stats);
    assert_eq!(stats.stacktraces_total, 5);
    // Chunk 2 starts at id 14 and holds 5 nodes.
    assert_eq!(stats.max_stacktrace_id, 19);
    // Only the sentinel rows were appended to the tables.
    assert_eq!(stats.strings_total, 1);
    assert_eq!(stats.functions_total, 1);
    assert_eq!(stats.mappings_total, 1);
    assert_eq!(stats.locations_total, 1);
}

#[tokio::test]
async fn test_missing_partition_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let mut db = SymDb::new(block_config(dir.path(), 7, 100 << 10));
    db.partition(1).append_stacktraces(&stacks(&[&[2, 1]]));
    let files = db.flush().await.unwrap();

    let reader = reopen(path, files).await;
    match reader.partition(2).await {
        Err(Error::PartitionNotFound(2)) => {}
        other => panic!("expected PartitionNotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_partitions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let mut db = SymDb::new(block_config(dir.path(), 7, 100 << 10));
    let p1_ids = db.partition(1).append_stacktraces(&stacks(&[&[1]]));
    let p7 = db.partition(7);
    p7.add_string("only-in-seven");
    let p7_ids = p7.append_stacktraces(&stacks(&[&[9, 8], &[7, 6]]));
    assert_eq!(p1_ids, vec![1]);
    assert_eq!(p7_ids, vec![2, 4]);
    let files = db.flush().await.unwrap();

    let reader = reopen(path, files).await;

    // An id minted in partition 7 is out of range for partition 1.
    let p1 = reader.partition(1).await.unwrap();
    match p1
        .symbols()
        .resolve_stacktrace_locations(&mut RecordingSink::new(), &[4])
        .await
    {
        Err(Error::OutOfRange { id: 4, .. }) => {}
        other => panic!("expected OutOfRange, got {other:?}"),
    }

    // Partition 7 resolves its own ids and sees only its own strings.
    let p7 = reader.partition(7).await.unwrap();
    let mut sink = RecordingSink::new();
    p7.symbols()
        .resolve_stacktrace_locations(&mut sink, &p7_ids)
        .await
        .unwrap();
    assert_eq!(sink.inserts, vec![(2, vec![9, 8]), (4, vec![7, 6])]);
    assert_eq!(p7.symbols().strings, vec!["", "only-in-seven"]);
    assert_eq!(p1.symbols().strings, vec![""]);
}

#[tokio::test]
async fn test_chunk_spill_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let mut db = SymDb::new(block_config(dir.path(), 4, 100 << 10));
    let input: Vec<crate::Stacktrace> = (1..=10u64)
        .map(|l| crate::Stacktrace::new(vec![l]))
        .collect();
    let ids = db.partition(1).append_stacktraces(&input);
    assert!(ids[2] >= 4, "third id should land past the first chunk");
    let files = db.flush().await.unwrap();

    let reader = reopen(path, files).await;
    if let SymbolsReader::V2(r) = &reader {
        assert!(
            r.partition_headers()[0].stacktrace_chunks.len() >= 3,
            "expected at least three chunks"
        );
    } else {
        panic!("expected a v2 block");
    }

    let partition = reader.partition(1).await.unwrap();
    let mut sink = RecordingSink::new();
    partition
        .symbols()
        .resolve_stacktrace_locations(&mut sink, &ids)
        .await
        .unwrap();
    let want: Vec<(u32, Vec<i32>)> = ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, vec![(i + 1) as i32]))
        .collect();
    assert_eq!(sink.inserts, want);
}

#[tokio::test]
async fn test_corrupted_chunk_fails_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let mut db = SymDb::new(block_config(dir.path(), 7, 100 << 10));
    db.partition(1).append_stacktraces(&stacks(&[
        &[3, 2, 1],
        &[2, 1],
        &[4, 3, 2, 1],
        &[3, 1],
        &[5, 2, 1],
    ]));
    let files = db.flush().await.unwrap();

    // Flip a single bit inside the first chunk's body.
    let st_path = dir.path().join("stacktraces.symdb");
    let mut bytes = std::fs::read(&st_path).unwrap();
    bytes[1] ^= 0x01;
    std::fs::write(&st_path, &bytes).unwrap();

    // Opening still succeeds; only resolution against the damaged chunk fails.
    let reader = reopen(path, files).await;
    let partition = reader.partition(1).await.unwrap();
    match partition
        .symbols()
        .resolve_stacktrace_locations(&mut RecordingSink::new(), &[2, 3])
        .await
    {
        Err(Error::InvalidChecksum { .. }) => {}
        other => panic!("expected InvalidChecksum, got {other:?}"),
    }

    // Chunks keep independent scratch state: the untouched chunk still works.
    let mut sink = RecordingSink::new();
    partition
        .symbols()
        .resolve_stacktrace_locations(&mut sink, &[16, 18])
        .await
        .unwrap();
    assert_eq!(sink.inserts, vec![(16, vec![3, 1]), (18, vec![5, 2, 1])]);
}

#[tokio::test]
async fn test_row_ranges_cover_every_table_row() {
    let dir = tempfile::tempdir().unwrap();

    // A small row-group cap forces rows of one partition to straddle groups.
    let mut db = SymDb::new(block_config(dir.path(), 7, 3));
    for key in [1u64, 2, 3] {
        let p = db.partition(key);
        for i in 0..key * 2 {
            p.add_string(&format!("s-{key}-{i}"));
            p.add_function(crate::Function {
                id: i + 1,
                ..Default::default()
            });
        }
        p.append_stacktraces(&stacks(&[&[1]]));
    }
    let files = db.flush().await.unwrap();

    let index_bytes = std::fs::read(dir.path().join("index.symdb")).unwrap();
    let index = IndexFile::decode(&index_bytes).unwrap();
    assert_eq!(index.partitions.len(), 3);

    let table_rows = |rel_path: &str| -> u64 {
        files
            .iter()
            .find(|f| f.rel_path == rel_path)
            .and_then(|f| f.parquet)
            .map(|p| p.num_rows)
            .unwrap_or_else(|| panic!("missing parquet meta for {rel_path}"))
    };
    type Ranges =
        for<'a> fn(&'a crate::index_format::PartitionHeader) -> &'a [crate::index_format::RowRangeReference];
    let tables: [(&str, Ranges); 4] = [
        ("strings.parquet", |p| &p.strings),
        ("functions.parquet", |p| &p.functions),
        ("locations.parquet", |p| &p.locations),
        ("mappings.parquet", |p| &p.mappings),
    ];
    for (rel_path, ranges) in tables {
        let covered: u64 = index
            .partitions
            .iter()
            .flat_map(|p| ranges(p).iter())
            .map(|r| u64::from(r.rows))
            .sum();
        assert_eq!(
            covered,
            table_rows(rel_path),
            "{rel_path}: row ranges must cover the whole table"
        );
    }
}

#[tokio::test]
async fn test_block_opens_from_memory_bucket() {
    use crate::utils::object_storage::register_memory_file;

    let dir = tempfile::tempdir().unwrap();
    let mut db = SymDb::new(block_config(dir.path(), 7, 100 << 10));
    let ids = db
        .partition(1)
        .append_stacktraces(&stacks(&[&[3, 2, 1], &[2, 1]]));
    let files = db.flush().await.unwrap();

    // Ship the block into the in-memory bucket and reopen it from there.
    for f in &files {
        let bytes = std::fs::read(dir.path().join(&f.rel_path)).unwrap();
        register_memory_file(
            &format!("memory://roundtrip-block/{}", f.rel_path),
            bytes.into(),
        )
        .await
        .unwrap();
    }

    let reader = open_block("memory://roundtrip-block", &BlockMeta { files })
        .await
        .unwrap();
    let partition = reader.partition(1).await.unwrap();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    let mut sink = RecordingSink::new();
    partition
        .symbols()
        .resolve_stacktrace_locations(&mut sink, &sorted)
        .await
        .unwrap();
    assert_eq!(sink.inserts, vec![(2, vec![2, 1]), (3, vec![3, 2, 1])]);
}

#[tokio::test]
async fn test_empty_block_is_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_str().unwrap();

    let db = SymDb::new(block_config(dir.path(), 7, 100 << 10));
    let files = db.flush().await.unwrap();

    let reader = reopen(path, files).await;
    match reader.load().await {
        Err(Error::EmptyParquetFile(_)) => {}
        other => panic!("expected EmptyParquetFile, got {other:?}"),
    }
}
