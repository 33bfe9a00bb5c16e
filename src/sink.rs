//! Sink: the in-memory representation of one in-flight segment.

use crate::error::{AppenderatorError, Result};
use crate::hydrant::FireHydrant;
use crate::identifier::{DataSegment, SegmentIdentifier};
use crate::index::AppendableIndexFactory;
use crate::{DataSchema, InputRow};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Owns the ordered hydrant sequence for one segment. Exactly the last
/// hydrant of a writable sink is *current* and accepts rows; every earlier
/// hydrant is frozen.
pub struct Sink {
    identifier: SegmentIdentifier,
    schema: Arc<DataSchema>,
    index_factory: Arc<dyn AppendableIndexFactory>,
    max_rows: usize,
    max_bytes: i64,
    hydrants: RwLock<Vec<Arc<FireHydrant>>>,
    writable: AtomicBool,
}

impl Sink {
    /// Creates a writable sink with one empty current hydrant.
    pub fn new(
        identifier: SegmentIdentifier,
        schema: Arc<DataSchema>,
        index_factory: Arc<dyn AppendableIndexFactory>,
        max_rows: usize,
        max_bytes: i64,
    ) -> Self {
        let index = index_factory.create(&schema, max_rows, max_bytes);
        let hydrants = vec![Arc::new(FireHydrant::new(index, 0))];
        Self {
            identifier,
            schema,
            index_factory,
            max_rows,
            max_bytes,
            hydrants: RwLock::new(hydrants),
            writable: AtomicBool::new(true),
        }
    }

    /// Reconstructs a sink from already-persisted hydrants. The result is
    /// not writable; it exists only to be merged and pushed.
    pub fn from_persisted(
        identifier: SegmentIdentifier,
        schema: Arc<DataSchema>,
        index_factory: Arc<dyn AppendableIndexFactory>,
        max_rows: usize,
        max_bytes: i64,
        hydrants: Vec<Arc<FireHydrant>>,
    ) -> Self {
        Self {
            identifier,
            schema,
            index_factory,
            max_rows,
            max_bytes,
            hydrants: RwLock::new(hydrants),
            writable: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &SegmentIdentifier {
        &self.identifier
    }

    pub fn schema(&self) -> &Arc<DataSchema> {
        &self.schema
    }

    /// The segment descriptor announced when this sink comes to life.
    pub fn segment_base(&self) -> DataSegment {
        DataSegment::base(&self.identifier)
    }

    /// Adds a row to the current hydrant, returning the hydrant's row count
    /// after the add.
    pub fn add(&self, row: &InputRow) -> Result<usize> {
        if !self.is_writable() {
            return Err(AppenderatorError::SegmentNotWritable {
                identifier: self.identifier.to_string(),
            });
        }

        let current = self.current_hydrant();
        match current.add_row(row) {
            Some(result) => result,
            // The current hydrant lost its index (swapped out from under a
            // misbehaving producer); the segment can no longer take rows.
            None => Err(AppenderatorError::SegmentNotWritable {
                identifier: self.identifier.to_string(),
            }),
        }
    }

    /// Whether the current hydrant can take another row.
    pub fn can_append_row(&self) -> bool {
        self.is_writable() && self.current_hydrant().can_append_row()
    }

    /// A sink is swappable when persisting its current hydrant would free
    /// memory: it is writable and the current hydrant holds at least one row.
    pub fn swappable(&self) -> bool {
        self.is_writable() && self.current_hydrant().num_rows_in_memory() > 0
    }

    /// Freezes the current hydrant and installs a fresh empty one, returning
    /// the frozen hydrant for persistence.
    pub fn swap(&self) -> Arc<FireHydrant> {
        let mut hydrants = self.hydrants.write();
        let old = hydrants
            .last()
            .expect("sink always holds at least one hydrant")
            .clone();
        let index = self
            .index_factory
            .create(&self.schema, self.max_rows, self.max_bytes);
        hydrants.push(Arc::new(FireHydrant::new(index, old.count() + 1)));
        old
    }

    /// One-shot transition out of the writable state. Returns whether this
    /// call performed the transition.
    pub fn finish_writing(&self) -> bool {
        self.writable
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Snapshot of the hydrant sequence, oldest first.
    pub fn hydrants(&self) -> Vec<Arc<FireHydrant>> {
        self.hydrants.read().clone()
    }

    pub fn hydrant_count(&self) -> usize {
        self.hydrants.read().len()
    }

    /// The hydrant currently accepting rows (the tail of the sequence).
    pub fn current_hydrant(&self) -> Arc<FireHydrant> {
        self.hydrants
            .read()
            .last()
            .expect("sink always holds at least one hydrant")
            .clone()
    }

    /// Rows in the current hydrant's live index. A sink reconstructed from
    /// disk has no live index and reports 0.
    pub fn num_rows_in_memory(&self) -> usize {
        self.hydrants
            .read()
            .last()
            .map_or(0, |hydrant| hydrant.num_rows_in_memory())
    }

    /// Total rows across every hydrant generation, live or on disk.
    pub fn num_rows_total(&self) -> usize {
        self.hydrants
            .read()
            .iter()
            .map(|hydrant| {
                hydrant
                    .segment()
                    .map_or_else(|| hydrant.num_rows_in_memory(), |segment| segment.num_rows())
            })
            .sum()
    }

    /// Estimated heap bytes across every hydrant still holding a live index.
    pub fn bytes_in_memory(&self) -> u64 {
        self.hydrants
            .read()
            .iter()
            .map(|hydrant| hydrant.bytes_in_memory())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{Interval, ShardSpec};
    use crate::memory::IncrementalRowIndexFactory;

    fn test_sink() -> Sink {
        let schema = Arc::new(DataSchema::new("events", vec![]));
        let identifier = SegmentIdentifier::new(
            "events",
            Interval::new(0, 10_000),
            "v1",
            ShardSpec::default(),
        );
        Sink::new(
            identifier,
            schema,
            Arc::new(IncrementalRowIndexFactory::default()),
            100,
            i64::MAX,
        )
    }

    #[test]
    fn fresh_sink_has_one_empty_hydrant() {
        let sink = test_sink();
        assert_eq!(sink.hydrant_count(), 1);
        assert_eq!(sink.num_rows_in_memory(), 0);
        assert!(sink.is_writable());
        assert!(!sink.swappable());
    }

    #[test]
    fn swap_freezes_current_and_numbers_the_next() {
        let sink = test_sink();
        sink.add(&InputRow::new(1)).unwrap();
        assert!(sink.swappable());

        let frozen = sink.swap();
        assert_eq!(frozen.count(), 0);
        assert_eq!(frozen.num_rows_in_memory(), 1);
        assert_eq!(sink.hydrant_count(), 2);
        assert_eq!(sink.current_hydrant().count(), 1);
        assert_eq!(sink.num_rows_in_memory(), 0);
    }

    #[test]
    fn finish_writing_is_one_shot_and_blocks_adds() {
        let sink = test_sink();
        assert!(sink.finish_writing());
        assert!(!sink.finish_writing());
        assert!(matches!(
            sink.add(&InputRow::new(1)),
            Err(AppenderatorError::SegmentNotWritable { .. })
        ));
        assert!(!sink.can_append_row());
        assert!(!sink.swappable());
    }

    #[test]
    fn byte_accounting_sums_live_hydrants() {
        let sink = test_sink();
        sink.add(&InputRow::new(1)).unwrap();
        let first = sink.bytes_in_memory();
        assert!(first > 0);

        // Freeze the first hydrant without persisting it; its bytes still
        // count until a persist releases the index.
        sink.swap();
        sink.add(&InputRow::new(2)).unwrap();
        assert!(sink.bytes_in_memory() > first);
    }
}
