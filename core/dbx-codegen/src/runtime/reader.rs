//! Table readers handed to a running procedure
//!
//! A procedure receives readers by the integer handle assigned at compile
//! time. A reader walks its table in batches of at most `batch_size` rows over
//! the projected columns; `get_vector(i)` is the `i`-th projected column.

use crate::error::{DbxError, DbxResult};
use crate::runtime::value::{ColumnData, SharedColumn};
use crate::logging::TARGET;
use ahash::AHashMap;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Batch cursor over one table.
pub trait TableReader {
    /// Advance to the next non-empty batch; `false` once exhausted.
    fn load_next_batch(&mut self) -> DbxResult<bool>;

    /// `index`-th projected column of the current batch.
    fn get_vector(&self, index: usize) -> DbxResult<SharedColumn>;

    /// Rows in the current batch.
    fn value_count(&self) -> usize;
}

/// Opens readers for the tables a procedure scans.
pub trait TableSource {
    fn open(&self, table: &str, projection: &[usize], batch_size: usize) -> DbxResult<Box<dyn TableReader>>;
}

/// Current batch converted to executor columns.
#[derive(Debug, Default)]
struct CurrentBatch {
    columns: Vec<SharedColumn>,
    rows: usize,
}

impl CurrentBatch {
    fn load(&mut self, batch: &RecordBatch, order: &[usize]) -> DbxResult<()> {
        self.columns = order
            .iter()
            .map(|&i| ColumnData::from_arrow(batch.column(i)).map(ColumnData::shared))
            .collect::<DbxResult<Vec<_>>>()?;
        self.rows = batch.num_rows();
        Ok(())
    }

    fn vector(&self, index: usize) -> DbxResult<SharedColumn> {
        self.columns.get(index).cloned().ok_or_else(|| {
            DbxError::execution(
                format!("vector #{index} requested"),
                format!("batch has {} columns", self.columns.len()),
            )
        })
    }
}

// ===== In-memory tables =====

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

/// 인메모리 테이블 카탈로그
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    tables: AHashMap<String, MemoryTable>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `batches` under `table`; every batch must have `schema`.
    pub fn register(&mut self, table: &str, schema: SchemaRef, batches: Vec<RecordBatch>) -> DbxResult<()> {
        if let Some(bad) = batches.iter().find(|b| b.schema() != schema) {
            return Err(DbxError::type_mismatch(
                format!("batches of {schema:?}"),
                format!("{:?}", bad.schema()),
            ));
        }
        self.tables.insert(table.to_string(), MemoryTable { schema, batches });
        Ok(())
    }

    pub fn schema(&self, table: &str) -> DbxResult<SchemaRef> {
        self.tables
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| DbxError::TableNotFound(table.to_string()))
    }
}

impl TableSource for MemoryCatalog {
    fn open(&self, table: &str, projection: &[usize], batch_size: usize) -> DbxResult<Box<dyn TableReader>> {
        let source = self
            .tables
            .get(table)
            .ok_or_else(|| DbxError::TableNotFound(table.to_string()))?;
        let batch_size = batch_size.max(1);
        let mut pending = VecDeque::new();
        for batch in &source.batches {
            let projected = batch.project(projection)?;
            let mut offset = 0;
            while offset < projected.num_rows() {
                let len = batch_size.min(projected.num_rows() - offset);
                pending.push_back(projected.slice(offset, len));
                offset += len;
            }
        }
        debug!(target: TARGET, table, batches = pending.len(), "memory reader opened");
        Ok(Box::new(MemoryReader {
            order: (0..projection.len()).collect(),
            pending,
            current: CurrentBatch::default(),
        }))
    }
}

struct MemoryReader {
    order: Vec<usize>,
    pending: VecDeque<RecordBatch>,
    current: CurrentBatch,
}

impl TableReader for MemoryReader {
    fn load_next_batch(&mut self) -> DbxResult<bool> {
        match self.pending.pop_front() {
            Some(batch) => {
                self.current.load(&batch, &self.order)?;
                Ok(true)
            }
            None => {
                self.current = CurrentBatch::default();
                Ok(false)
            }
        }
    }

    fn get_vector(&self, index: usize) -> DbxResult<SharedColumn> {
        self.current.vector(index)
    }

    fn value_count(&self) -> usize {
        self.current.rows
    }
}

// ===== Parquet files =====

/// Tables backed by Parquet files.
#[derive(Debug, Clone, Default)]
pub struct ParquetCatalog {
    files: AHashMap<String, PathBuf>,
}

impl ParquetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: &str, path: impl AsRef<Path>) {
        self.files.insert(table.to_string(), path.as_ref().to_path_buf());
    }

    fn path(&self, table: &str) -> DbxResult<&Path> {
        self.files
            .get(table)
            .map(PathBuf::as_path)
            .ok_or_else(|| DbxError::TableNotFound(table.to_string()))
    }

    /// Arrow schema of the file, read from its footer.
    pub fn schema(&self, table: &str) -> DbxResult<SchemaRef> {
        let file = File::open(self.path(table)?)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        Ok(builder.schema().clone())
    }
}

impl TableSource for ParquetCatalog {
    fn open(&self, table: &str, projection: &[usize], batch_size: usize) -> DbxResult<Box<dyn TableReader>> {
        let file = File::open(self.path(table)?)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        // the decoder yields projected columns in file order
        let mut roots = projection.to_vec();
        roots.sort_unstable();
        roots.dedup();
        let order = projection
            .iter()
            .map(|p| roots.binary_search(p).unwrap_or_default())
            .collect();
        let mask = ProjectionMask::roots(builder.parquet_schema(), roots.iter().copied());
        let reader = builder
            .with_projection(mask)
            .with_batch_size(batch_size.max(1))
            .build()?;
        debug!(target: TARGET, table, columns = roots.len(), "parquet reader opened");
        Ok(Box::new(ParquetTableReader {
            inner: reader,
            order,
            current: CurrentBatch::default(),
        }))
    }
}

struct ParquetTableReader {
    inner: ParquetRecordBatchReader,
    order: Vec<usize>,
    current: CurrentBatch,
}

impl TableReader for ParquetTableReader {
    fn load_next_batch(&mut self) -> DbxResult<bool> {
        for batch in self.inner.by_ref() {
            let batch = batch?;
            if batch.num_rows() == 0 {
                continue;
            }
            self.current.load(&batch, &self.order)?;
            return Ok(true);
        }
        self.current = CurrentBatch::default();
        Ok(false)
    }

    fn get_vector(&self, index: usize) -> DbxResult<SharedColumn> {
        self.current.vector(index)
    }

    fn value_count(&self) -> usize {
        self.current.rows
    }
}
