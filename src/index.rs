//! Seams between the appenderator core and its external collaborators.
//!
//! The engine never looks inside an index, a segment, or deep storage; it
//! drives them through these traits. Default implementations live in
//! [`crate::memory`] and [`crate::disk`].

use crate::config::IndexSpec;
use crate::error::Result;
use crate::identifier::{DataSegment, Interval};
use crate::{DataSchema, InputRow};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A mutable in-memory index accumulating rows for one hydrant.
///
/// Owned by exactly one hydrant and mutated only by the producer thread
/// until the hydrant is frozen; after that it is read once by the persist
/// thread and dropped.
pub trait AppendableIndex: Send {
    /// Adds one row. Fails with `IndexSizeExceeded` once the index refuses
    /// further rows; callers are expected to gate on [`can_append_row`]
    /// before getting here.
    ///
    /// [`can_append_row`]: AppendableIndex::can_append_row
    fn add(&mut self, row: &InputRow) -> Result<()>;

    /// Whether another row fits within the index's row and byte capacity.
    fn can_append_row(&self) -> bool;

    /// Rows currently held.
    fn num_rows(&self) -> usize;

    /// Estimated heap bytes currently held.
    fn bytes_in_memory(&self) -> u64;

    /// Writes the index as one spill directory. The directory must be
    /// self-describing enough for [`IndexMerger::load`] to reopen it.
    fn persist(&self, interval: Interval, out_dir: &Path, spec: &IndexSpec) -> Result<()>;
}

/// Creates appendable indexes; the appenderator hands one to every fresh
/// hydrant.
pub trait AppendableIndexFactory: Send + Sync {
    fn create(&self, schema: &DataSchema, max_rows: usize, max_bytes: i64)
    -> Box<dyn AppendableIndex>;
}

/// An immutable, queryable segment generation: a reopened spill or a merged
/// segment.
pub trait QueryableSegment: Send + Sync {
    /// Rows in the segment.
    fn num_rows(&self) -> usize;

    /// The segment interval the rows were ingested under.
    fn interval(&self) -> Interval;

    /// Dimension names present in the segment, in declared order.
    fn dimensions(&self) -> Vec<String>;

    /// Rows whose timestamp falls inside the interval.
    fn scan(&self, interval: Interval) -> Result<Vec<InputRow>>;
}

/// Reopens spills and merges them into one segment directory.
pub trait IndexMerger: Send + Sync {
    /// Memory-maps a spill or merged directory as a queryable segment.
    fn load(&self, dir: &Path) -> Result<Arc<dyn QueryableSegment>>;

    /// Merges the given segments into `out_dir`, ordered by timestamp, and
    /// returns the written directory. `max_columns_to_merge` bounds the
    /// merged dimension union when non-negative.
    fn merge(
        &self,
        segments: &[Arc<dyn QueryableSegment>],
        schema: &DataSchema,
        out_dir: &Path,
        spec: &IndexSpec,
        max_columns_to_merge: i32,
    ) -> Result<PathBuf>;
}

/// Uploads a merged segment directory to durable deep storage.
pub trait SegmentPusher: Send + Sync {
    /// Uploads `merged_dir` and returns the completed descriptor. When
    /// `use_unique_path` is set the upload must land on a path that no
    /// earlier upload of the same identifier used.
    fn push(
        &self,
        merged_dir: &Path,
        base: &DataSegment,
        use_unique_path: bool,
    ) -> Result<DataSegment>;
}

/// Announces segment availability to the cluster.
pub trait SegmentAnnouncer: Send + Sync {
    fn announce(&self, segment: &DataSegment) -> Result<()>;
    fn unannounce(&self, segment: &DataSegment) -> Result<()>;
}

/// Announcer that does nothing; the default for standalone batch ingestion.
pub struct NopSegmentAnnouncer;

impl SegmentAnnouncer for NopSegmentAnnouncer {
    fn announce(&self, _segment: &DataSegment) -> Result<()> {
        Ok(())
    }

    fn unannounce(&self, _segment: &DataSegment) -> Result<()> {
        Ok(())
    }
}
