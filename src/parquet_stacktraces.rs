//! Legacy stacktrace resolution.
//!
//! Before the chunked tree format, blocks stored stacktraces as rows of a
//! `stacktraces.parquet` file: row *n* holds the location-id list of
//! stacktrace id *n*. Resolution never loads the file wholesale: it turns the
//! sorted id batch into a parquet row selection and streams only the selected
//! rows of the `LocationIDs` column.

use arrow::array::{Array, ListArray, UInt64Array};
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{RowSelection, RowSelector};
use parquet::arrow::async_reader::{ParquetObjectReader, ParquetRecordBatchStreamBuilder};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::resolver::StacktraceSink;

const LOCATION_IDS_COLUMN: &str = "LocationIDs";

/// Row-selecting resolver over a legacy stacktrace table.
pub(crate) struct ParquetStacktraces {
    reader: ParquetObjectReader,
    num_rows: u64,
}

impl ParquetStacktraces {
    /// Opens the table, verifying it is non-empty. `size` comes from the
    /// block metadata when known, saving a head request.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        path: ObjectPath,
        size: Option<u64>,
    ) -> Result<Self> {
        let file_size = match size {
            Some(s) if s > 0 => s,
            _ => store.head(&path).await?.size,
        };
        let reader = ParquetObjectReader::new(store, path.clone()).with_file_size(file_size);
        let builder = ParquetRecordBatchStreamBuilder::new(reader.clone()).await?;
        let num_rows = builder.metadata().file_metadata().num_rows();
        if num_rows <= 0 {
            return Err(Error::EmptyParquetFile(path.to_string()));
        }
        Ok(Self {
            reader,
            num_rows: num_rows as u64,
        })
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    /// Resolves a sorted id batch, invoking the sink once per input id in
    /// order. The scratch buffer handed to the sink is reused between calls.
    pub async fn resolve(&self, sink: &mut dyn StacktraceSink, ids: &[u32]) -> Result<()> {
        let Some(&last) = ids.last() else {
            return Ok(());
        };
        debug_assert!(ids.windows(2).all(|w| w[0] <= w[1]), "ids must be sorted");
        let last = u64::from(last);
        if last >= self.num_rows {
            return Err(Error::OutOfRange {
                what: "stacktrace",
                id: last,
                max: self.num_rows,
            });
        }

        let mut unique: Vec<u32> = ids.to_vec();
        unique.dedup();

        let builder = ParquetRecordBatchStreamBuilder::new(self.reader.clone()).await?;
        let column = builder
            .schema()
            .fields()
            .iter()
            .position(|f| f.name() == LOCATION_IDS_COLUMN)
            .ok_or_else(|| {
                Error::Schema(format!("stacktraces: no {LOCATION_IDS_COLUMN} column"))
            })?;
        let projection =
            ProjectionMask::roots(builder.metadata().file_metadata().schema_descr(), [column]);
        let mut stream = builder
            .with_projection(projection)
            .with_row_selection(row_selection(&unique))
            .with_batch_size(1 << 10)
            .build()?;

        // `cursor` tracks the input batch; duplicate ids re-emit the same row.
        let mut cursor = 0usize;
        let mut row = 0usize;
        let mut scratch: Vec<i32> = Vec::with_capacity(64);
        while let Some(batch) = stream.next().await {
            let batch = batch?;
            let list = batch
                .column(0)
                .as_any()
                .downcast_ref::<ListArray>()
                .ok_or_else(|| {
                    Error::Schema(format!("stacktraces: {LOCATION_IDS_COLUMN} is not a list"))
                })?;
            let values = list
                .values()
                .as_any()
                .downcast_ref::<UInt64Array>()
                .ok_or_else(|| {
                    Error::Schema("stacktraces: location id element is not u64".into())
                })?;
            let offsets = list.value_offsets();
            for i in 0..batch.num_rows() {
                let id = unique[row];
                row += 1;
                scratch.clear();
                for j in offsets[i] as usize..offsets[i + 1] as usize {
                    scratch.push(values.value(j) as i32);
                }
                while cursor < ids.len() && ids[cursor] == id {
                    sink.insert_stacktrace(id, &scratch)?;
                    cursor += 1;
                }
            }
        }
        if cursor != ids.len() {
            return Err(Error::CorruptChunk(
                "stacktrace table returned fewer rows than selected".into(),
            ));
        }
        Ok(())
    }
}

/// Builds a skip/select run sequence for the given sorted, deduplicated row
/// numbers.
fn row_selection(rows: &[u32]) -> RowSelection {
    let mut selectors = Vec::new();
    let mut position = 0u64;
    let mut i = 0usize;
    while i < rows.len() {
        let start = u64::from(rows[i]);
        let mut end = i + 1;
        while end < rows.len() && rows[end] == rows[end - 1] + 1 {
            end += 1;
        }
        if start > position {
            selectors.push(RowSelector::skip((start - position) as usize));
        }
        selectors.push(RowSelector::select(end - i));
        position = start + (end - i) as u64;
        i = end;
    }
    RowSelection::from(selectors)
}
