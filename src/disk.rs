//! On-disk spill segments, the row merger, and local deep storage.

use crate::config::{IndexSpec, WriteOutMedium};
use crate::error::{AppenderatorError, Result};
use crate::identifier::{DataSegment, Interval};
use crate::index::{IndexMerger, QueryableSegment, SegmentPusher};
use crate::{DataSchema, InputRow};
use memmap2::{Mmap, MmapOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub const DATA_FILE_NAME: &str = "data";
pub const META_FILE_NAME: &str = "meta.json";

/// Metadata describing one spill or merged segment directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpillMeta {
    pub interval: Interval,
    pub num_rows: usize,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub dimensions: Vec<String>,
}

/// Writes segment metadata into `dir`. Callers write it after the data file
/// so a directory without metadata reads as invalid.
pub fn write_meta(dir: &Path, meta: &SpillMeta, fsync: bool) -> Result<()> {
    let meta_path = dir.join(META_FILE_NAME);
    let meta_file = File::create(&meta_path).map_err(|e| AppenderatorError::io_at(&meta_path, e))?;
    serde_json::to_writer_pretty(&meta_file, meta)?;
    if fsync {
        meta_file.sync_all()?;
    }
    Ok(())
}

/// A spill (or merged segment) reopened from disk through a memory map.
pub struct SpillSegment {
    dir_path: PathBuf,
    meta: SpillMeta,
    mapped_data: Mmap,
}

impl SpillSegment {
    /// Opens an existing segment directory.
    pub fn open(dir_path: impl AsRef<Path>) -> Result<Self> {
        let dir_path = dir_path.as_ref();

        let meta_path = dir_path.join(META_FILE_NAME);
        if !meta_path.exists() {
            return Err(AppenderatorError::DataCorruption(format!(
                "segment directory {} has no {}",
                dir_path.display(),
                META_FILE_NAME
            )));
        }
        let meta_file = File::open(&meta_path)?;
        let meta: SpillMeta = serde_json::from_reader(meta_file)?;

        let data_path = dir_path.join(DATA_FILE_NAME);
        let data_file =
            File::open(&data_path).map_err(|e| AppenderatorError::io_at(&data_path, e))?;
        let file_len = data_file.metadata()?.len() as usize;
        if file_len == 0 {
            return Err(AppenderatorError::DataCorruption(format!(
                "segment data file {} is empty",
                data_path.display()
            )));
        }

        let mapped_data = unsafe { MmapOptions::new().len(file_len).map(&data_file)? };

        Ok(Self {
            dir_path: dir_path.to_path_buf(),
            meta,
            mapped_data,
        })
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    fn decode_rows(&self) -> Result<Vec<InputRow>> {
        let rows: Vec<InputRow> = bincode::deserialize(&self.mapped_data[..])?;
        if rows.len() != self.meta.num_rows {
            return Err(AppenderatorError::DataCorruption(format!(
                "segment {} holds {} rows but metadata claims {}",
                self.dir_path.display(),
                rows.len(),
                self.meta.num_rows
            )));
        }
        Ok(rows)
    }
}

impl QueryableSegment for SpillSegment {
    fn num_rows(&self) -> usize {
        self.meta.num_rows
    }

    fn interval(&self) -> Interval {
        self.meta.interval
    }

    fn dimensions(&self) -> Vec<String> {
        self.meta.dimensions.clone()
    }

    fn scan(&self, interval: Interval) -> Result<Vec<InputRow>> {
        // Fast reject when the query range misses the segment entirely.
        if interval.end <= self.meta.min_timestamp || interval.start > self.meta.max_timestamp {
            return Ok(Vec::new());
        }

        let rows = self.decode_rows()?;
        Ok(rows
            .into_iter()
            .filter(|row| interval.contains(row.timestamp()))
            .collect())
    }
}

/// Merger over row-codec segments.
pub struct RowIndexMerger {
    write_out_medium: WriteOutMedium,
}

impl RowIndexMerger {
    pub fn new(write_out_medium: WriteOutMedium) -> Self {
        Self { write_out_medium }
    }
}

impl Default for RowIndexMerger {
    fn default() -> Self {
        Self::new(WriteOutMedium::Directory)
    }
}

impl IndexMerger for RowIndexMerger {
    fn load(&self, dir: &Path) -> Result<Arc<dyn QueryableSegment>> {
        Ok(Arc::new(SpillSegment::open(dir)?))
    }

    fn merge(
        &self,
        segments: &[Arc<dyn QueryableSegment>],
        schema: &DataSchema,
        out_dir: &Path,
        spec: &IndexSpec,
        max_columns_to_merge: i32,
    ) -> Result<PathBuf> {
        if segments.is_empty() {
            return Err(AppenderatorError::InvalidState(
                "no segments to merge".to_string(),
            ));
        }

        // Merged dimension order: the schema's declaration first, then any
        // dimension a spill picked up along the way.
        let mut merged_dimensions: Vec<String> = schema.dimensions().to_vec();
        for segment in segments {
            for dimension in segment.dimensions() {
                if !merged_dimensions.contains(&dimension) {
                    merged_dimensions.push(dimension);
                }
            }
        }
        if max_columns_to_merge >= 0 && merged_dimensions.len() > max_columns_to_merge as usize {
            return Err(AppenderatorError::InvalidConfiguration(format!(
                "merged segment would span {} columns, exceeding max_columns_to_merge {}",
                merged_dimensions.len(),
                max_columns_to_merge
            )));
        }

        let interval = segments[0].interval();
        let mut rows = Vec::new();
        for segment in segments {
            // Full-range scan: merge must carry every row the spills hold,
            // even ones a sloppy producer landed outside the interval.
            rows.extend(segment.scan(Interval::new(i64::MIN, i64::MAX))?);
        }
        // Stable sort keeps arrival order among equal timestamps.
        rows.sort_by_key(InputRow::timestamp);

        let (min_timestamp, max_timestamp) = rows.iter().fold(
            (i64::MAX, i64::MIN),
            |(min_t, max_t), row| (min_t.min(row.timestamp()), max_t.max(row.timestamp())),
        );

        fs::create_dir_all(out_dir)?;
        let data_path = out_dir.join(DATA_FILE_NAME);
        let data_file =
            File::create(&data_path).map_err(|e| AppenderatorError::io_at(&data_path, e))?;
        match self.write_out_medium {
            WriteOutMedium::OnHeap => {
                let encoded = bincode::serialize(&rows)?;
                let mut writer = BufWriter::new(data_file);
                writer.write_all(&encoded)?;
                writer.flush()?;
                if spec.fsync {
                    writer.get_ref().sync_all()?;
                }
            }
            WriteOutMedium::Directory => {
                let mut writer = BufWriter::new(data_file);
                bincode::serialize_into(&mut writer, &rows)?;
                writer.flush()?;
                if spec.fsync {
                    writer.get_ref().sync_all()?;
                }
            }
        }

        let meta = SpillMeta {
            interval,
            num_rows: rows.len(),
            min_timestamp,
            max_timestamp,
            dimensions: merged_dimensions,
        };
        write_meta(out_dir, &meta, spec.fsync)?;

        debug!(
            rows = rows.len(),
            segments = segments.len(),
            dir = %out_dir.display(),
            "Merged segments"
        );
        Ok(out_dir.to_path_buf())
    }
}

static UNIQUE_PATH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Deep storage rooted in a local directory; uploads are recursive copies.
pub struct LocalDeepStorage {
    storage_directory: PathBuf,
}

impl LocalDeepStorage {
    pub fn new(storage_directory: impl Into<PathBuf>) -> Self {
        Self {
            storage_directory: storage_directory.into(),
        }
    }

    fn unique_suffix() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let counter = UNIQUE_PATH_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:x}-{counter}")
    }
}

impl SegmentPusher for LocalDeepStorage {
    fn push(
        &self,
        merged_dir: &Path,
        base: &DataSegment,
        use_unique_path: bool,
    ) -> Result<DataSegment> {
        let identifier = base.identifier();
        let mut destination = self
            .storage_directory
            .join(&base.data_source)
            .join(identifier.to_string());
        if use_unique_path {
            destination = destination.join(Self::unique_suffix());
        }

        // A non-unique re-push of the same identifier overwrites in place.
        if destination.exists() {
            fs::remove_dir_all(&destination)?;
        }
        copy_dir(merged_dir, &destination)?;

        let size = dir_size(&destination)?;
        let mut segment = base.clone();
        segment.size = size;
        segment.load_spec.insert(
            "type".to_string(),
            Value::String("local".to_string()),
        );
        segment.load_spec.insert(
            "path".to_string(),
            Value::String(destination.display().to_string()),
        );

        info!(
            identifier = %identifier,
            bytes = size,
            path = %destination.display(),
            "Pushed segment to deep storage"
        );
        Ok(segment)
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
