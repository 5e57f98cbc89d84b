//! Block opening and stacktrace resolution.
//!
//! [`open`] sniffs the block's format and returns a [`SymbolsReader`]: v2
//! blocks carry an `index.symdb` whose magic and version select the chunked
//! tree reader, while legacy blocks have no index file at all and fall back
//! to the parquet-row reader.
//!
//! Opening parses the index only. The four entity tables are decoded into
//! memory on [`SymbolsReader::load`] or on the first partition request,
//! whichever comes first; partitions themselves are materialized once and
//! cached behind `Arc`s.

use std::sync::Arc;

use dashmap::DashMap;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::index_format::{
    CHUNK_ENCODING_GROUP_VARINT, IndexFile, PartitionHeader, StacktraceChunkHeader,
};
use crate::model::{Function, Location, Mapping, Samples};
use crate::parquet_stacktraces::ParquetStacktraces;
use crate::parquet_tables::{
    FunctionPersister, InMemoryTable, LocationPersister, MappingPersister, StacktracePersister,
    StringPersister, table_file_name,
};
use crate::resolver::{Profile, StacktraceSink};
use crate::stacktrace_tree::{DecodedChunk, split_by_chunk};
use crate::utils::object_storage::get_object_store;
use crate::{BlockMeta, INDEX_FILE_NAME, STACKTRACES_FILE_NAME};

/// Opens the block at `path` (local, `s3://`, or `memory://`), resolving the
/// bucket through [`get_object_store`].
pub async fn open_block(path: &str, meta: &BlockMeta) -> Result<SymbolsReader> {
    let (store, prefix) = get_object_store(path)
        .await
        .map_err(|e| Error::ObjectStore(object_store::Error::Generic {
            store: "symdb",
            source: e,
        }))?;
    open(store, prefix, meta).await
}

/// Opens one block from a bucket and selects the reader for its format.
pub async fn open(
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    meta: &BlockMeta,
) -> Result<SymbolsReader> {
    match store.get(&prefix.child(INDEX_FILE_NAME)).await {
        Ok(result) => {
            let bytes = result.bytes().await?;
            let index = IndexFile::decode(&bytes)?;
            Ok(SymbolsReader::V2(Reader::new(store, prefix, index)))
        }
        // A block without an index file predates the index format.
        Err(object_store::Error::NotFound { .. }) => {
            Ok(SymbolsReader::V1(ReaderV1::new(store, prefix, meta)))
        }
        Err(e) => Err(e.into()),
    }
}

/// A block reader of either format.
pub enum SymbolsReader {
    V2(Reader),
    V1(ReaderV1),
}

impl SymbolsReader {
    /// Eagerly decodes the entity tables. Optional: the first partition
    /// request triggers the same load.
    pub async fn load(&self) -> Result<()> {
        match self {
            Self::V2(r) => r.load().await,
            Self::V1(r) => r.load().await,
        }
    }

    /// Returns the reader for one partition, loading and caching it on first
    /// request. Dropping the `Arc` releases the caller's interest.
    pub async fn partition(&self, key: u64) -> Result<Arc<PartitionReader>> {
        match self {
            Self::V2(r) => r.partition(key).await,
            Self::V1(r) => r.partition(key).await,
        }
    }
}

/// Counters describing one partition, for admission and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub stacktraces_total: usize,
    pub max_stacktrace_id: usize,
    pub locations_total: usize,
    pub mappings_total: usize,
    pub functions_total: usize,
    pub strings_total: usize,
}

/// One partition, materialized for reading.
pub struct PartitionReader {
    partition: u64,
    stats: PartitionStats,
    symbols: Symbols,
}

impl PartitionReader {
    pub fn partition(&self) -> u64 {
        self.partition
    }

    pub fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    pub fn write_stats(&self, stats: &mut PartitionStats) {
        *stats = self.stats.clone();
    }
}

/// A partition's symbol tables plus its stacktrace source.
///
/// The table vectors are immutable once built and safe to share across
/// concurrent resolution calls.
pub struct Symbols {
    pub strings: Vec<String>,
    pub functions: Vec<Function>,
    pub mappings: Vec<Mapping>,
    pub locations: Vec<Location>,
    pub(crate) stacktraces: StacktraceSource,
}

impl Symbols {
    /// Resolves a batch of stacktrace ids into location lists.
    ///
    /// Resolution proceeds in ascending id order: an unsorted batch is
    /// sorted into a scratch copy first. The sink is invoked exactly once
    /// per input id; the location slice it receives is reused between
    /// invocations and must be copied to be retained.
    pub async fn resolve_stacktrace_locations(
        &self,
        sink: &mut dyn StacktraceSink,
        ids: &[u32],
    ) -> Result<()> {
        if ids.windows(2).all(|w| w[0] <= w[1]) {
            return self.resolve_sorted(sink, ids).await;
        }
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        self.resolve_sorted(sink, &sorted).await
    }

    async fn resolve_sorted(&self, sink: &mut dyn StacktraceSink, ids: &[u32]) -> Result<()> {
        match &self.stacktraces {
            StacktraceSource::Tree(tree) => tree.resolve(sink, ids).await,
            StacktraceSource::Rows(rows) => rows.resolve(sink, ids).await,
        }
    }

    /// Resolves samples into a full profile; see [`crate::resolver`].
    pub async fn resolve_profile(&self, samples: &Samples) -> Result<Profile> {
        crate::resolver::resolve_profile(self, samples).await
    }
}

pub(crate) enum StacktraceSource {
    Tree(TreeResolver),
    Rows(ParquetStacktraces),
}

// ============================================================================
// V2: chunked stacktrace tree
// ============================================================================

struct Tables {
    strings: InMemoryTable<StringPersister>,
    functions: InMemoryTable<FunctionPersister>,
    locations: InMemoryTable<LocationPersister>,
    mappings: InMemoryTable<MappingPersister>,
}

impl Tables {
    async fn open(store: &Arc<dyn ObjectStore>, prefix: &ObjectPath) -> Result<Self> {
        let (strings, functions, locations, mappings) = futures::try_join!(
            InMemoryTable::open(store, prefix),
            InMemoryTable::open(store, prefix),
            InMemoryTable::open(store, prefix),
            InMemoryTable::open(store, prefix),
        )?;
        Ok(Self {
            strings,
            functions,
            locations,
            mappings,
        })
    }
}

/// Reader for the current block format.
pub struct Reader {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    index: IndexFile,
    tables: OnceCell<Tables>,
    partitions: DashMap<u64, Arc<PartitionReader>>,
}

impl Reader {
    fn new(store: Arc<dyn ObjectStore>, prefix: ObjectPath, index: IndexFile) -> Self {
        Self {
            store,
            prefix,
            index,
            tables: OnceCell::new(),
            partitions: DashMap::new(),
        }
    }

    /// Partition headers, in block order.
    pub fn partition_headers(&self) -> &[PartitionHeader] {
        &self.index.partitions
    }

    async fn tables(&self) -> Result<&Tables> {
        self.tables
            .get_or_try_init(|| Tables::open(&self.store, &self.prefix))
            .await
    }

    pub async fn load(&self) -> Result<()> {
        self.tables().await.map(|_| ())
    }

    pub async fn partition(&self, key: u64) -> Result<Arc<PartitionReader>> {
        if let Some(cached) = self.partitions.get(&key) {
            return Ok(Arc::clone(&cached));
        }
        let header = self
            .index
            .partitions
            .iter()
            .find(|p| p.partition == key)
            .ok_or(Error::PartitionNotFound(key))?;
        let tables = self.tables().await?;
        let symbols = Symbols {
            strings: tables.strings.slice(&header.strings)?,
            functions: tables.functions.slice(&header.functions)?,
            locations: tables.locations.slice(&header.locations)?,
            mappings: tables.mappings.slice(&header.mappings)?,
            stacktraces: StacktraceSource::Tree(TreeResolver::new(
                Arc::clone(&self.store),
                self.prefix.child(STACKTRACES_FILE_NAME),
                header,
            )),
        };
        let stats = PartitionStats {
            stacktraces_total: header.stacktraces_total() as usize,
            max_stacktrace_id: header.max_stacktrace_id() as usize,
            locations_total: symbols.locations.len(),
            mappings_total: symbols.mappings.len(),
            functions_total: symbols.functions.len(),
            strings_total: symbols.strings.len(),
        };
        let reader = Arc::new(PartitionReader {
            partition: key,
            stats,
            symbols,
        });
        let entry = self.partitions.entry(key).or_insert(reader);
        Ok(Arc::clone(entry.value()))
    }
}

/// Resolves stacktrace ids against the chunked tree of one partition.
///
/// Each referenced chunk is fetched with a single ranged read, CRC-checked,
/// and decoded into an independent scratch array, so a corrupt chunk cannot
/// poison resolution of the others. Decoded chunks are not retained across
/// calls.
pub(crate) struct TreeResolver {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    chunks: Vec<StacktraceChunkHeader>,
    max_nodes: u32,
    max_id: u32,
}

impl TreeResolver {
    fn new(store: Arc<dyn ObjectStore>, path: ObjectPath, header: &PartitionHeader) -> Self {
        Self {
            store,
            path,
            chunks: header.stacktrace_chunks.clone(),
            max_nodes: header
                .stacktrace_chunks
                .first()
                .map(|c| c.max_nodes)
                .unwrap_or(0),
            max_id: header.max_stacktrace_id(),
        }
    }

    async fn resolve(&self, sink: &mut dyn StacktraceSink, ids: &[u32]) -> Result<()> {
        let Some(&last) = ids.last() else {
            return Ok(());
        };
        debug_assert!(ids.windows(2).all(|w| w[0] <= w[1]), "ids must be sorted");
        if last >= self.max_id {
            return Err(Error::OutOfRange {
                what: "stacktrace",
                id: u64::from(last),
                max: u64::from(self.max_id),
            });
        }

        let mut buf: Vec<i32> = Vec::with_capacity(64);
        for (chunk_index, range) in split_by_chunk(ids, self.max_nodes) {
            let header = self.chunks.get(chunk_index as usize).ok_or(Error::OutOfRange {
                what: "stacktrace chunk",
                id: u64::from(chunk_index),
                max: self.chunks.len() as u64,
            })?;
            if header.encoding != CHUNK_ENCODING_GROUP_VARINT {
                return Err(Error::CorruptChunk(format!(
                    "unknown chunk encoding {}",
                    header.encoding
                )));
            }
            let body = self
                .store
                .get_range(&self.path, header.offset..header.offset + header.size)
                .await?;
            let crc = crc32c::crc32c(&body);
            if crc != header.crc32c {
                return Err(Error::InvalidChecksum {
                    got: crc,
                    expected: header.crc32c,
                });
            }
            let chunk = DecodedChunk::decode(&body, header.nodes)?;
            let first_id = header.first_id();
            for &id in &ids[range] {
                let node = id - first_id;
                if node >= chunk.len() {
                    return Err(Error::OutOfRange {
                        what: "stacktrace",
                        id: u64::from(id),
                        max: u64::from(first_id + chunk.len()),
                    });
                }
                chunk.walk(node, &mut buf);
                sink.insert_stacktrace(id, &buf)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// V1: stacktraces as parquet rows
// ============================================================================

/// Reader for legacy blocks. The stacktrace table is consulted row-by-row;
/// the four entity tables load fully into memory, as in v2. Legacy blocks
/// have no partitioning, so every key resolves to the whole block.
pub struct ReaderV1 {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    stacktraces_size: Option<u64>,
    partition: OnceCell<Arc<PartitionReader>>,
}

impl ReaderV1 {
    fn new(store: Arc<dyn ObjectStore>, prefix: ObjectPath, meta: &BlockMeta) -> Self {
        let stacktraces_size = meta.size_of(&table_file_name::<StacktracePersister>());
        Self {
            store,
            prefix,
            stacktraces_size,
            partition: OnceCell::new(),
        }
    }

    pub async fn load(&self) -> Result<()> {
        self.open_partition().await.map(|_| ())
    }

    pub async fn partition(&self, _key: u64) -> Result<Arc<PartitionReader>> {
        let partition = self.open_partition().await?;
        Ok(Arc::clone(partition))
    }

    async fn open_partition(&self) -> Result<&Arc<PartitionReader>> {
        self.partition
            .get_or_try_init(|| async {
                let stacktraces = ParquetStacktraces::open(
                    Arc::clone(&self.store),
                    self.prefix
                        .child(table_file_name::<StacktracePersister>().as_str()),
                    self.stacktraces_size,
                )
                .await?;
                let num_rows = stacktraces.num_rows() as usize;
                let tables = Tables::open(&self.store, &self.prefix).await?;
                let symbols = Symbols {
                    strings: tables.strings.records().to_vec(),
                    functions: tables.functions.records().to_vec(),
                    locations: tables.locations.records().to_vec(),
                    mappings: tables.mappings.records().to_vec(),
                    stacktraces: StacktraceSource::Rows(stacktraces),
                };
                let stats = PartitionStats {
                    stacktraces_total: num_rows,
                    max_stacktrace_id: num_rows,
                    locations_total: symbols.locations.len(),
                    mappings_total: symbols.mappings.len(),
                    functions_total: symbols.functions.len(),
                    strings_total: symbols.strings.len(),
                };
                Ok(Arc::new(PartitionReader {
                    partition: 0,
                    stats,
                    symbols,
                }))
            })
            .await
    }
}
