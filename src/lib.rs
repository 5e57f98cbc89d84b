//! Symdb - Symbol Database for a Continuous Profiling Store
//!
//! Persists the symbolic side of sampled call-stack profiles (stacktraces,
//! locations, mappings, functions, and the string pool behind them) as
//! immutable blocks, and resolves stacktrace-id batches back into location
//! lists and full profiles. Works with local filesystems and cloud storage
//! (S3).
//!
//! # Overview
//!
//! This library provides:
//! - **Compact stacktraces**: stacks share prefixes in a parent-pointer
//!   tree, serialized as CRC-protected group-varint chunks
//! - **Columnar symbols**: locations, mappings, functions, and strings live
//!   in parquet tables with per-partition row ranges
//! - **Partitioned blocks**: a block holds many partitions keyed by a 64-bit
//!   id, each resolving independently
//! - **Format compatibility**: reads current (v2, indexed) and legacy (v1,
//!   parquet-row) blocks through one reader surface
//!
//! # Quick Start
//!
//! ```no_run
//! use symdb::{BlockMeta, Config, Samples, Stacktrace, SymDb};
//!
//! #[tokio::main]
//! async fn main() -> symdb::Result<()> {
//!     // Write one block.
//!     let config = Config {
//!         dir: "/var/blocks/01".into(),
//!         ..Config::default()
//!     };
//!     let mut db = SymDb::new(config);
//!     let partition = db.partition(1);
//!     let ids = partition.append_stacktraces(&[Stacktrace::new(vec![3, 2, 1])]);
//!     let files = db.flush().await?;
//!
//!     // Reopen it and resolve the samples into a profile.
//!     let reader = symdb::open_block("/var/blocks/01", &BlockMeta { files }).await?;
//!     let partition = reader.partition(1).await?;
//!     let mut samples = Samples::new(ids, vec![1]);
//!     samples.sort_by_stacktrace_id();
//!     let profile = partition.symbols().resolve_profile(&samples).await?;
//!     println!("{} samples resolved", profile.sample.len());
//!     Ok(())
//! }
//! ```
//!
//! # Performance
//!
//! - **Writing**: the five block files are emitted by five parallel tasks
//! - **Resolution**: each referenced chunk costs one ranged read; symbol
//!   tables load once per block and are shared across partitions
//! - **Memory**: bounded by the decoded tables plus one chunk per in-flight
//!   resolution
pub mod block_reader;
pub mod block_writer;
pub mod error;
pub mod index_format;
pub mod model;
pub mod parquet_stacktraces;
pub mod parquet_tables;
pub mod partition;
pub mod resolver;
pub mod stacktrace_tree;
#[cfg(test)]
pub mod unit_tests;
pub mod utils;

use std::path::PathBuf;

use indexmap::IndexMap;

pub use crate::block_reader::{
    PartitionReader, PartitionStats, Reader, ReaderV1, Symbols, SymbolsReader, open, open_block,
};
pub use crate::error::{Error, Result};
pub use crate::model::{Function, Line, Location, Mapping, Samples, Stacktrace};
pub use crate::partition::Partition;
pub use crate::resolver::{
    Profile, ProfileFunction, ProfileLine, ProfileLocation, ProfileMapping, Sample, StacktraceSink,
};

// ============================================================================
// Block layout
// ============================================================================

/// Index file of a v2 block.
pub const INDEX_FILE_NAME: &str = "index.symdb";

/// Stacktrace chunk file of a v2 block.
pub const STACKTRACES_FILE_NAME: &str = "stacktraces.symdb";

/// Suffix of the columnar table files.
pub const PARQUET_SUFFIX: &str = ".parquet";

/// One file of a flushed block.
#[derive(Debug, Clone, Default)]
pub struct BlockFile {
    /// Path relative to the block directory.
    pub rel_path: String,
    pub size_bytes: u64,
    /// Present for parquet tables only.
    pub parquet: Option<ParquetFileMeta>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParquetFileMeta {
    pub num_rows: u64,
    pub num_row_groups: u64,
}

/// File listing of a block, as recorded at flush time.
#[derive(Debug, Clone, Default)]
pub struct BlockMeta {
    pub files: Vec<BlockFile>,
}

impl BlockMeta {
    /// Size of a block file by relative path, if the listing knows it.
    pub fn size_of(&self, rel_path: &str) -> Option<u64> {
        self.files
            .iter()
            .find(|f| f.rel_path == rel_path)
            .map(|f| f.size_bytes)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Writer configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Output directory of the block.
    pub dir: PathBuf,
    pub stacktraces: StacktracesConfig,
    pub parquet: ParquetConfig,
}

#[derive(Debug, Clone)]
pub struct StacktracesConfig {
    /// Chunk cap of the stacktrace tree. 0 keeps each partition in a single
    /// unbounded chunk.
    pub max_nodes_per_chunk: u32,
}

impl Default for StacktracesConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_chunk: 10 << 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParquetConfig {
    /// Row-group cap of the table files. 0 writes a single row group.
    pub max_buffer_row_count: usize,
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            max_buffer_row_count: 100 << 10,
        }
    }
}

// ============================================================================
// Write-side database
// ============================================================================

/// An in-memory symbol database that flushes into one block.
///
/// Partitions are created on first use and keep insertion order; the index
/// file lists them in the same order. [`SymDb::flush`] consumes the database:
/// a flushed block is immutable.
pub struct SymDb {
    config: Config,
    partitions: IndexMap<u64, Partition>,
}

impl SymDb {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            partitions: IndexMap::new(),
        }
    }

    /// Returns the partition for `key`, creating it on first use.
    pub fn partition(&mut self, key: u64) -> &mut Partition {
        let max_nodes = self.config.stacktraces.max_nodes_per_chunk;
        self.partitions
            .entry(key)
            .or_insert_with(|| Partition::new(key, max_nodes))
    }

    /// Writes the block directory and returns its file listing: the index,
    /// the stacktrace file, and the four parquet tables.
    pub async fn flush(self) -> Result<Vec<BlockFile>> {
        block_writer::write_block(self.config, self.partitions.into_values().collect()).await
    }
}
