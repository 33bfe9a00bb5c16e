//! Default in-memory appendable index.

use crate::config::{IndexSpec, WriteOutMedium};
use crate::disk::{DATA_FILE_NAME, SpillMeta, write_meta};
use crate::error::{AppenderatorError, Result};
use crate::identifier::Interval;
use crate::index::{AppendableIndex, AppendableIndexFactory};
use crate::{DataSchema, InputRow};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Estimated heap overhead of one dimension entry beyond its key and value
/// bytes (two string headers plus map-node bookkeeping).
const DIMENSION_ENTRY_OVERHEAD: u64 = 48;

/// Estimated fixed heap overhead of one row.
const ROW_OVERHEAD: u64 = 32;

/// A heap-resident row store with byte accounting.
///
/// Rows are appended by the single producer thread; capacity is bounded by
/// both a row count and a byte estimate so the appenderator's triggers and
/// the index's own limit agree.
pub struct IncrementalRowIndex {
    rows: Vec<InputRow>,
    dimensions: Vec<String>,
    bytes_in_memory: u64,
    min_timestamp: i64,
    max_timestamp: i64,
    max_rows: usize,
    max_bytes: i64,
    write_out_medium: WriteOutMedium,
}

impl IncrementalRowIndex {
    pub fn new(schema: &DataSchema, max_rows: usize, max_bytes: i64) -> Self {
        Self {
            rows: Vec::new(),
            dimensions: schema.dimensions().to_vec(),
            bytes_in_memory: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            max_rows,
            max_bytes,
            write_out_medium: WriteOutMedium::Directory,
        }
    }

    pub fn with_write_out_medium(mut self, medium: WriteOutMedium) -> Self {
        self.write_out_medium = medium;
        self
    }

    fn estimated_row_bytes(row: &InputRow) -> u64 {
        let dimension_bytes: u64 = row
            .dimensions()
            .iter()
            .map(|(k, v)| k.len() as u64 + v.len() as u64 + DIMENSION_ENTRY_OVERHEAD)
            .sum();
        ROW_OVERHEAD + dimension_bytes
    }
}

impl AppendableIndex for IncrementalRowIndex {
    fn add(&mut self, row: &InputRow) -> Result<()> {
        if !self.can_append_row() {
            return Err(AppenderatorError::IndexSizeExceeded {
                rows: self.rows.len(),
                bytes: self.bytes_in_memory,
            });
        }

        self.bytes_in_memory += Self::estimated_row_bytes(row);
        self.min_timestamp = self.min_timestamp.min(row.timestamp());
        self.max_timestamp = self.max_timestamp.max(row.timestamp());
        self.rows.push(row.clone());
        Ok(())
    }

    fn can_append_row(&self) -> bool {
        self.rows.len() < self.max_rows && (self.bytes_in_memory as i64) < self.max_bytes
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn bytes_in_memory(&self) -> u64 {
        self.bytes_in_memory
    }

    fn persist(&self, interval: Interval, out_dir: &Path, spec: &IndexSpec) -> Result<()> {
        fs::create_dir_all(out_dir)?;

        let data_path = out_dir.join(DATA_FILE_NAME);
        let data_file =
            File::create(&data_path).map_err(|e| AppenderatorError::io_at(&data_path, e))?;
        let mut writer = BufWriter::new(data_file);
        match self.write_out_medium {
            WriteOutMedium::OnHeap => {
                let encoded = bincode::serialize(&self.rows)?;
                writer.write_all(&encoded)?;
            }
            WriteOutMedium::Directory => {
                bincode::serialize_into(&mut writer, &self.rows)?;
            }
        }
        writer.flush()?;
        if spec.fsync {
            writer.get_ref().sync_all()?;
        }

        let meta = SpillMeta {
            interval,
            num_rows: self.rows.len(),
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            dimensions: self.dimensions.clone(),
        };
        // Meta is written last so a directory without it reads as invalid.
        write_meta(out_dir, &meta, spec.fsync)?;

        debug!(
            rows = self.rows.len(),
            bytes = self.bytes_in_memory,
            dir = %out_dir.display(),
            "Persisted in-memory index"
        );
        Ok(())
    }
}

/// Factory handing a fresh [`IncrementalRowIndex`] to every new hydrant.
pub struct IncrementalRowIndexFactory {
    write_out_medium: WriteOutMedium,
}

impl IncrementalRowIndexFactory {
    pub fn new(write_out_medium: WriteOutMedium) -> Self {
        Self { write_out_medium }
    }
}

impl Default for IncrementalRowIndexFactory {
    fn default() -> Self {
        Self::new(WriteOutMedium::Directory)
    }
}

impl AppendableIndexFactory for IncrementalRowIndexFactory {
    fn create(
        &self,
        schema: &DataSchema,
        max_rows: usize,
        max_bytes: i64,
    ) -> Box<dyn AppendableIndex> {
        Box::new(
            IncrementalRowIndex::new(schema, max_rows, max_bytes)
                .with_write_out_medium(self.write_out_medium),
        )
    }
}
