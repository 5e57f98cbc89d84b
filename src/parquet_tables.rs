//! Parquet-backed entity tables.
//!
//! The four symbol tables (strings, functions, locations, mappings) share one
//! writer/reader shape and differ only in row type. A [`Persister`] bridges
//! the two: it names the table file, declares the arrow schema, and converts
//! between record slices and record batches. [`TableWriter`] splits incoming
//! records into row groups of at most `max_buffer_row_count` rows, handing
//! back one [`RowRangeReference`] per contiguous write so partitions can find
//! their rows again. [`InMemoryTable`] is the read side: it pulls the whole
//! file from the bucket, decodes every row group into a pre-sized vector, and
//! serves per-partition slices by row range.
//!
//! [`StacktracePersister`] serves the legacy block layout, where stacktraces
//! are parquet rows rather than tree chunks.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Int32Array, ListArray, RecordBatch, StringArray, StructArray,
    UInt32Array, UInt64Array,
};
use arrow::buffer::OffsetBuffer;
use arrow::datatypes::{DataType, Field, FieldRef, Fields, Schema, SchemaRef};
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::index_format::RowRangeReference;
use crate::model::{Function, Line, Location, Mapping, Stacktrace};
use crate::{BlockFile, ParquetFileMeta, PARQUET_SUFFIX, ParquetConfig};

/// Adapter between an in-memory record type and its parquet representation.
///
/// `NAME` doubles as the table's file stem (`<name>.parquet`).
pub trait Persister: Default + Send + Sync + 'static {
    type Record: Clone + Send + Sync + 'static;

    const NAME: &'static str;

    fn schema(&self) -> SchemaRef;

    /// Converts a record slice into one record batch matching [`Self::schema`].
    fn deconstruct(&self, records: &[Self::Record]) -> Result<RecordBatch>;

    /// Appends every row of `batch` to `dst` as records.
    fn reconstruct(&self, batch: &RecordBatch, dst: &mut Vec<Self::Record>) -> Result<()>;
}

/// Relative file name of a persister's table within the block directory.
pub(crate) fn table_file_name<P: Persister>() -> String {
    format!("{}{}", P::NAME, PARQUET_SUFFIX)
}

fn typed_column<'a, A: Array + 'static>(
    batch: &'a RecordBatch,
    index: usize,
    table: &str,
) -> Result<&'a A> {
    batch
        .columns()
        .get(index)
        .and_then(|c| c.as_any().downcast_ref::<A>())
        .ok_or_else(|| Error::Schema(format!("{table}: column {index} missing or mistyped")))
}

// ============================================================================
// Persisters
// ============================================================================

#[derive(Debug, Default)]
pub struct StringPersister;

impl Persister for StringPersister {
    type Record = String;

    const NAME: &'static str = "strings";

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("value", DataType::Utf8, false)]))
    }

    fn deconstruct(&self, records: &[String]) -> Result<RecordBatch> {
        let values = StringArray::from_iter_values(records.iter().map(|s| s.as_str()));
        Ok(RecordBatch::try_new(
            self.schema(),
            vec![Arc::new(values) as ArrayRef],
        )?)
    }

    fn reconstruct(&self, batch: &RecordBatch, dst: &mut Vec<String>) -> Result<()> {
        let values: &StringArray = typed_column(batch, 0, Self::NAME)?;
        for i in 0..values.len() {
            dst.push(values.value(i).to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FunctionPersister;

impl Persister for FunctionPersister {
    type Record = Function;

    const NAME: &'static str = "functions";

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("name", DataType::UInt32, false),
            Field::new("system_name", DataType::UInt32, false),
            Field::new("filename", DataType::UInt32, false),
            Field::new("start_line", DataType::UInt32, false),
        ]))
    }

    fn deconstruct(&self, records: &[Function]) -> Result<RecordBatch> {
        Ok(RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(UInt64Array::from_iter_values(records.iter().map(|f| f.id))) as ArrayRef,
                Arc::new(UInt32Array::from_iter_values(records.iter().map(|f| f.name))),
                Arc::new(UInt32Array::from_iter_values(
                    records.iter().map(|f| f.system_name),
                )),
                Arc::new(UInt32Array::from_iter_values(
                    records.iter().map(|f| f.filename),
                )),
                Arc::new(UInt32Array::from_iter_values(
                    records.iter().map(|f| f.start_line),
                )),
            ],
        )?)
    }

    fn reconstruct(&self, batch: &RecordBatch, dst: &mut Vec<Function>) -> Result<()> {
        let ids: &UInt64Array = typed_column(batch, 0, Self::NAME)?;
        let names: &UInt32Array = typed_column(batch, 1, Self::NAME)?;
        let system_names: &UInt32Array = typed_column(batch, 2, Self::NAME)?;
        let filenames: &UInt32Array = typed_column(batch, 3, Self::NAME)?;
        let start_lines: &UInt32Array = typed_column(batch, 4, Self::NAME)?;
        for i in 0..batch.num_rows() {
            dst.push(Function {
                id: ids.value(i),
                name: names.value(i),
                system_name: system_names.value(i),
                filename: filenames.value(i),
                start_line: start_lines.value(i),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MappingPersister;

impl Persister for MappingPersister {
    type Record = Mapping;

    const NAME: &'static str = "mappings";

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("memory_start", DataType::UInt64, false),
            Field::new("memory_limit", DataType::UInt64, false),
            Field::new("file_offset", DataType::UInt64, false),
            Field::new("filename", DataType::UInt32, false),
            Field::new("build_id", DataType::UInt32, false),
            Field::new("has_functions", DataType::Boolean, false),
            Field::new("has_filenames", DataType::Boolean, false),
            Field::new("has_line_numbers", DataType::Boolean, false),
            Field::new("has_inline_frames", DataType::Boolean, false),
        ]))
    }

    fn deconstruct(&self, records: &[Mapping]) -> Result<RecordBatch> {
        Ok(RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(UInt64Array::from_iter_values(records.iter().map(|m| m.id))) as ArrayRef,
                Arc::new(UInt64Array::from_iter_values(
                    records.iter().map(|m| m.memory_start),
                )),
                Arc::new(UInt64Array::from_iter_values(
                    records.iter().map(|m| m.memory_limit),
                )),
                Arc::new(UInt64Array::from_iter_values(
                    records.iter().map(|m| m.file_offset),
                )),
                Arc::new(UInt32Array::from_iter_values(
                    records.iter().map(|m| m.filename),
                )),
                Arc::new(UInt32Array::from_iter_values(
                    records.iter().map(|m| m.build_id),
                )),
                Arc::new(BooleanArray::from_iter(
                    records.iter().map(|m| Some(m.has_functions)),
                )),
                Arc::new(BooleanArray::from_iter(
                    records.iter().map(|m| Some(m.has_filenames)),
                )),
                Arc::new(BooleanArray::from_iter(
                    records.iter().map(|m| Some(m.has_line_numbers)),
                )),
                Arc::new(BooleanArray::from_iter(
                    records.iter().map(|m| Some(m.has_inline_frames)),
                )),
            ],
        )?)
    }

    fn reconstruct(&self, batch: &RecordBatch, dst: &mut Vec<Mapping>) -> Result<()> {
        let ids: &UInt64Array = typed_column(batch, 0, Self::NAME)?;
        let memory_starts: &UInt64Array = typed_column(batch, 1, Self::NAME)?;
        let memory_limits: &UInt64Array = typed_column(batch, 2, Self::NAME)?;
        let file_offsets: &UInt64Array = typed_column(batch, 3, Self::NAME)?;
        let filenames: &UInt32Array = typed_column(batch, 4, Self::NAME)?;
        let build_ids: &UInt32Array = typed_column(batch, 5, Self::NAME)?;
        let has_functions: &BooleanArray = typed_column(batch, 6, Self::NAME)?;
        let has_filenames: &BooleanArray = typed_column(batch, 7, Self::NAME)?;
        let has_line_numbers: &BooleanArray = typed_column(batch, 8, Self::NAME)?;
        let has_inline_frames: &BooleanArray = typed_column(batch, 9, Self::NAME)?;
        for i in 0..batch.num_rows() {
            dst.push(Mapping {
                id: ids.value(i),
                memory_start: memory_starts.value(i),
                memory_limit: memory_limits.value(i),
                file_offset: file_offsets.value(i),
                filename: filenames.value(i),
                build_id: build_ids.value(i),
                has_functions: has_functions.value(i),
                has_filenames: has_filenames.value(i),
                has_line_numbers: has_line_numbers.value(i),
                has_inline_frames: has_inline_frames.value(i),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LocationPersister;

impl LocationPersister {
    fn line_fields() -> Fields {
        Fields::from(vec![
            Field::new("function_id", DataType::UInt32, false),
            Field::new("line", DataType::Int32, false),
        ])
    }

    fn line_element() -> FieldRef {
        Arc::new(Field::new(
            "element",
            DataType::Struct(Self::line_fields()),
            false,
        ))
    }
}

impl Persister for LocationPersister {
    type Record = Location;

    const NAME: &'static str = "locations";

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("mapping_id", DataType::UInt32, false),
            Field::new("address", DataType::UInt64, false),
            Field::new("is_folded", DataType::Boolean, false),
            Field::new("line", DataType::List(Self::line_element()), false),
        ]))
    }

    fn deconstruct(&self, records: &[Location]) -> Result<RecordBatch> {
        let mut function_ids = Vec::new();
        let mut line_numbers = Vec::new();
        let mut lengths = Vec::with_capacity(records.len());
        for loc in records {
            lengths.push(loc.line.len());
            for line in &loc.line {
                function_ids.push(line.function_id);
                line_numbers.push(line.line);
            }
        }
        let lines = StructArray::new(
            Self::line_fields(),
            vec![
                Arc::new(UInt32Array::from(function_ids)) as ArrayRef,
                Arc::new(Int32Array::from(line_numbers)),
            ],
            None,
        );
        let line_list = ListArray::new(
            Self::line_element(),
            OffsetBuffer::from_lengths(lengths),
            Arc::new(lines) as ArrayRef,
            None,
        );
        Ok(RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(UInt64Array::from_iter_values(records.iter().map(|l| l.id))) as ArrayRef,
                Arc::new(UInt32Array::from_iter_values(
                    records.iter().map(|l| l.mapping_id),
                )),
                Arc::new(UInt64Array::from_iter_values(
                    records.iter().map(|l| l.address),
                )),
                Arc::new(BooleanArray::from_iter(
                    records.iter().map(|l| Some(l.is_folded)),
                )),
                Arc::new(line_list),
            ],
        )?)
    }

    fn reconstruct(&self, batch: &RecordBatch, dst: &mut Vec<Location>) -> Result<()> {
        let ids: &UInt64Array = typed_column(batch, 0, Self::NAME)?;
        let mapping_ids: &UInt32Array = typed_column(batch, 1, Self::NAME)?;
        let addresses: &UInt64Array = typed_column(batch, 2, Self::NAME)?;
        let is_folded: &BooleanArray = typed_column(batch, 3, Self::NAME)?;
        let line_list: &ListArray = typed_column(batch, 4, Self::NAME)?;
        let lines = line_list
            .values()
            .as_any()
            .downcast_ref::<StructArray>()
            .ok_or_else(|| Error::Schema("locations: line element is not a struct".into()))?;
        let function_ids = lines
            .column_by_name("function_id")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
            .ok_or_else(|| Error::Schema("locations: line.function_id missing".into()))?;
        let line_numbers = lines
            .column_by_name("line")
            .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
            .ok_or_else(|| Error::Schema("locations: line.line missing".into()))?;
        let offsets = line_list.value_offsets();
        for i in 0..batch.num_rows() {
            let start = offsets[i] as usize;
            let end = offsets[i + 1] as usize;
            let mut line = SmallVec::with_capacity(end - start);
            for j in start..end {
                line.push(Line {
                    function_id: function_ids.value(j),
                    line: line_numbers.value(j),
                });
            }
            dst.push(Location {
                id: ids.value(i),
                mapping_id: mapping_ids.value(i),
                address: addresses.value(i),
                is_folded: is_folded.value(i),
                line,
            });
        }
        Ok(())
    }
}

/// Legacy stacktrace table: one row per stacktrace, row number = id.
#[derive(Debug, Default)]
pub struct StacktracePersister;

impl StacktracePersister {
    fn element() -> FieldRef {
        Arc::new(Field::new("element", DataType::UInt64, false))
    }
}

impl Persister for StacktracePersister {
    type Record = Stacktrace;

    const NAME: &'static str = "stacktraces";

    fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new(
            "LocationIDs",
            DataType::List(Self::element()),
            false,
        )]))
    }

    fn deconstruct(&self, records: &[Stacktrace]) -> Result<RecordBatch> {
        let mut values = Vec::new();
        let mut lengths = Vec::with_capacity(records.len());
        for s in records {
            lengths.push(s.location_ids.len());
            values.extend_from_slice(&s.location_ids);
        }
        let list = ListArray::new(
            Self::element(),
            OffsetBuffer::from_lengths(lengths),
            Arc::new(UInt64Array::from(values)) as ArrayRef,
            None,
        );
        Ok(RecordBatch::try_new(
            self.schema(),
            vec![Arc::new(list) as ArrayRef],
        )?)
    }

    fn reconstruct(&self, batch: &RecordBatch, dst: &mut Vec<Stacktrace>) -> Result<()> {
        let list: &ListArray = typed_column(batch, 0, Self::NAME)?;
        let values = list
            .values()
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| Error::Schema("stacktraces: element is not u64".into()))?;
        let offsets = list.value_offsets();
        for i in 0..batch.num_rows() {
            let start = offsets[i] as usize;
            let end = offsets[i + 1] as usize;
            dst.push(Stacktrace {
                location_ids: (start..end).map(|j| values.value(j)).collect(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Table writer
// ============================================================================

/// Writes one entity table, splitting rows into bounded row groups.
///
/// The arrow writer's automatic row-group cap is pinned to the same value as
/// the manual flush boundary, so the row-group/offset bookkeeping returned in
/// row ranges always matches the file.
pub(crate) struct TableWriter<P: Persister> {
    persister: P,
    row_group_cap: usize,
    path: PathBuf,
    rel_path: String,
    writer: ArrowWriter<File>,
    current_row_group: u32,
    current_rows: u32,
    rows_total: u64,
}

impl<P: Persister> TableWriter<P> {
    pub fn create(dir: &Path, config: &ParquetConfig) -> Result<Self> {
        let persister = P::default();
        let rel_path = table_file_name::<P>();
        let path = dir.join(&rel_path);
        let file = File::create(&path)?;
        let row_group_cap = if config.max_buffer_row_count == 0 {
            usize::MAX
        } else {
            config.max_buffer_row_count
        };
        let props = WriterProperties::builder()
            .set_max_row_group_size(row_group_cap)
            .build();
        let writer = ArrowWriter::try_new(file, persister.schema(), Some(props))?;
        Ok(Self {
            persister,
            row_group_cap,
            path,
            rel_path,
            writer,
            current_row_group: 0,
            current_rows: 0,
            rows_total: 0,
        })
    }

    /// Appends `records` and returns the row ranges they landed in, one per
    /// contiguous run within a row group.
    pub fn write_records(&mut self, records: &[P::Record]) -> Result<Vec<RowRangeReference>> {
        let mut ranges = Vec::new();
        let mut values = records;
        while !values.is_empty() {
            let room = self.row_group_cap - self.current_rows as usize;
            let n = room.min(values.len());
            let batch = self.persister.deconstruct(&values[..n])?;
            self.writer.write(&batch)?;
            ranges.push(RowRangeReference {
                row_group: self.current_row_group,
                index: self.current_rows,
                rows: n as u32,
            });
            self.current_rows += n as u32;
            self.rows_total += n as u64;
            if self.current_rows as usize == self.row_group_cap {
                self.writer.flush()?;
                self.current_row_group += 1;
                self.current_rows = 0;
            }
            values = &values[n..];
        }
        Ok(ranges)
    }

    pub fn close(self) -> Result<BlockFile> {
        self.writer.close()?;
        let size_bytes = std::fs::metadata(&self.path)?.len();
        let num_row_groups = if self.current_rows > 0 {
            u64::from(self.current_row_group) + 1
        } else {
            u64::from(self.current_row_group)
        };
        Ok(BlockFile {
            rel_path: self.rel_path,
            size_bytes,
            parquet: Some(ParquetFileMeta {
                num_rows: self.rows_total,
                num_row_groups,
            }),
        })
    }
}

// ============================================================================
// In-memory table reader
// ============================================================================

/// One entity table decoded entirely into memory.
///
/// Loading fetches the whole file in a single bucket request (the four
/// symbol tables are small next to the stacktrace data), decodes every row
/// group through the persister, and keeps only the record vector plus the
/// row-group offsets needed to translate row ranges into absolute rows.
pub(crate) struct InMemoryTable<P: Persister> {
    records: Vec<P::Record>,
    row_group_offsets: Vec<u64>,
}

impl<P: Persister> InMemoryTable<P> {
    pub async fn open(store: &Arc<dyn ObjectStore>, prefix: &ObjectPath) -> Result<Self> {
        let persister = P::default();
        let path = prefix.child(table_file_name::<P>().as_str());
        let bytes = store.get(&path).await?.bytes().await?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let metadata = Arc::clone(builder.metadata());
        let num_rows = metadata.file_metadata().num_rows();
        if num_rows == 0 {
            return Err(Error::EmptyParquetFile(path.to_string()));
        }
        let mut row_group_offsets = Vec::with_capacity(metadata.num_row_groups());
        let mut offset = 0u64;
        for rg in metadata.row_groups() {
            row_group_offsets.push(offset);
            offset += rg.num_rows() as u64;
        }

        let mut records = Vec::with_capacity(num_rows as usize);
        let reader = builder.with_batch_size(1 << 10).build()?;
        for batch in reader {
            persister.reconstruct(&batch?, &mut records)?;
        }
        Ok(Self {
            records,
            row_group_offsets,
        })
    }

    pub fn records(&self) -> &[P::Record] {
        &self.records
    }

    /// Copies the rows covered by `ranges` out of the table, in range order.
    pub fn slice(&self, ranges: &[RowRangeReference]) -> Result<Vec<P::Record>> {
        let mut out = Vec::new();
        for r in ranges {
            let base = self
                .row_group_offsets
                .get(r.row_group as usize)
                .copied()
                .ok_or_else(|| {
                    Error::CorruptIndex(format!("row range points at row group {}", r.row_group))
                })?;
            let start = (base + u64::from(r.index)) as usize;
            let end = start + r.rows as usize;
            if end > self.records.len() {
                return Err(Error::CorruptIndex(format!(
                    "row range {start}..{end} exceeds table of {} rows",
                    self.records.len()
                )));
            }
            out.extend_from_slice(&self.records[start..end]);
        }
        Ok(out)
    }
}
