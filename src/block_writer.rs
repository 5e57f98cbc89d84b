//! Block emission.
//!
//! [`write_block`] materializes one block directory from a set of frozen
//! partitions. The five data files are independent, so they are written by
//! five blocking tasks running in parallel: one streams every partition's
//! stacktrace chunks into `stacktraces.symdb`, the other four feed the entity
//! vectors through their table writers. Each task returns its per-partition
//! outputs (chunk headers or row ranges); the writer zips them into partition
//! headers once all five have finished, then writes `index.symdb` last.
//!
//! On failure the directory is left as-is for the caller to remove.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinError;

use crate::error::{Error, Result};
use crate::index_format::{
    CHUNK_ENCODING_GROUP_VARINT, IndexFile, PartitionHeader, RowRangeReference,
    StacktraceChunkHeader,
};
use crate::parquet_tables::{
    FunctionPersister, LocationPersister, MappingPersister, Persister, StringPersister,
    TableWriter,
};
use crate::partition::Partition;
use crate::{BlockFile, Config, INDEX_FILE_NAME, STACKTRACES_FILE_NAME};

pub(crate) async fn write_block(
    config: Config,
    partitions: Vec<Partition>,
) -> Result<Vec<BlockFile>> {
    std::fs::create_dir_all(&config.dir)?;
    let partitions = Arc::new(partitions);
    let dir = config.dir.clone();
    let parquet = config.parquet.clone();

    let stacktraces_task = {
        let partitions = Arc::clone(&partitions);
        let dir = dir.clone();
        tokio::task::spawn_blocking(move || write_stacktraces(&dir, &partitions))
    };
    let strings_task = spawn_table_task::<StringPersister>(
        &dir,
        &parquet,
        &partitions,
        Partition::strings,
    );
    let functions_task = spawn_table_task::<FunctionPersister>(
        &dir,
        &parquet,
        &partitions,
        Partition::functions,
    );
    let locations_task = spawn_table_task::<LocationPersister>(
        &dir,
        &parquet,
        &partitions,
        Partition::locations,
    );
    let mappings_task = spawn_table_task::<MappingPersister>(
        &dir,
        &parquet,
        &partitions,
        Partition::mappings,
    );

    let (stacktraces, strings, functions, locations, mappings) = tokio::try_join!(
        stacktraces_task,
        strings_task,
        functions_task,
        locations_task,
        mappings_task
    )
    .map_err(join_error)?;
    let (chunk_headers, stacktraces_file) = stacktraces?;
    let (string_ranges, strings_file) = strings?;
    let (function_ranges, functions_file) = functions?;
    let (location_ranges, locations_file) = locations?;
    let (mapping_ranges, mappings_file) = mappings?;

    let mut index = IndexFile::default();
    for (i, partition) in partitions.iter().enumerate() {
        index.partitions.push(PartitionHeader {
            partition: partition.key(),
            strings: string_ranges[i].clone(),
            functions: function_ranges[i].clone(),
            locations: location_ranges[i].clone(),
            mappings: mapping_ranges[i].clone(),
            stacktrace_chunks: chunk_headers[i].clone(),
        });
    }

    // The index goes out only after every data file is closed.
    let mut index_writer = FileWriter::create(dir.join(INDEX_FILE_NAME))?;
    index_writer.write_all(&index.encode())?;
    let index_file = index_writer.close()?;

    Ok(vec![
        index_file,
        stacktraces_file,
        locations_file,
        mappings_file,
        functions_file,
        strings_file,
    ])
}

type TableOutput = (Vec<Vec<RowRangeReference>>, BlockFile);

fn spawn_table_task<P: Persister>(
    dir: &Path,
    config: &crate::ParquetConfig,
    partitions: &Arc<Vec<Partition>>,
    records: for<'a> fn(&'a Partition) -> &'a [P::Record],
) -> tokio::task::JoinHandle<Result<TableOutput>> {
    let dir = dir.to_path_buf();
    let config = config.clone();
    let partitions = Arc::clone(partitions);
    tokio::task::spawn_blocking(move || {
        let mut writer = TableWriter::<P>::create(&dir, &config)?;
        let mut ranges = Vec::with_capacity(partitions.len());
        for partition in partitions.iter() {
            ranges.push(writer.write_records(records(partition))?);
        }
        Ok((ranges, writer.close()?))
    })
}

type StacktracesOutput = (Vec<Vec<StacktraceChunkHeader>>, BlockFile);

fn write_stacktraces(dir: &Path, partitions: &[Partition]) -> Result<StacktracesOutput> {
    let mut writer = FileWriter::create(dir.join(STACKTRACES_FILE_NAME))?;
    let mut all_headers = Vec::with_capacity(partitions.len());
    let mut body = Vec::new();
    for partition in partitions {
        let mut headers = Vec::with_capacity(partition.chunks().len());
        for (ci, chunk) in partition.chunks().iter().enumerate() {
            body.clear();
            chunk.tree.encode(&mut body);
            let offset = writer.offset();
            writer.write_all(&body)?;
            headers.push(StacktraceChunkHeader {
                offset,
                size: body.len() as u64,
                partition: partition.key(),
                chunk_index: ci as u16,
                encoding: CHUNK_ENCODING_GROUP_VARINT,
                stacks: chunk.stacks,
                nodes: chunk.tree.len(),
                max_depth: chunk.max_depth,
                max_nodes: partition.max_nodes_per_chunk(),
                crc32c: crc32c::crc32c(&body),
            });
        }
        all_headers.push(headers);
    }
    Ok((all_headers, writer.close()?))
}

fn join_error(err: JoinError) -> Error {
    if err.is_panic() {
        std::panic::resume_unwind(err.into_panic());
    }
    Error::Cancelled
}

/// Buffered local file writer that tracks its write offset, so chunk headers
/// can record where each body starts.
pub(crate) struct FileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
}

impl FileWriter {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            // The default 8K buffer is plenty; chunk bodies arrive in one
            // write each.
            writer: BufWriter::new(file),
            offset: 0,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    pub fn close(mut self) -> Result<BlockFile> {
        self.writer.flush()?;
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        let rel_path = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(BlockFile {
            rel_path,
            size_bytes: std::fs::metadata(&self.path)?.len(),
            parquet: None,
        })
    }
}
