//! FireHydrant: one generation of a sink's index.

use crate::error::Result;
use crate::index::{AppendableIndex, QueryableSegment};
use crate::InputRow;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// One generation of a sink: either a live in-memory index accepting rows,
/// or a reference to an on-disk queryable segment, or (after the batch
/// engine releases it) nothing at all.
///
/// All state sits behind one mutex so a persist racing a merge observes a
/// consistent swap flag, and persisting an already-swapped hydrant is a
/// no-op.
pub struct FireHydrant {
    state: Mutex<HydrantState>,
    /// Sequence number within the owning sink.
    count: usize,
}

struct HydrantState {
    index: Option<Box<dyn AppendableIndex>>,
    segment: Option<Arc<dyn QueryableSegment>>,
    swapped: bool,
}

impl FireHydrant {
    /// A live hydrant around a fresh in-memory index.
    pub fn new(index: Box<dyn AppendableIndex>, count: usize) -> Self {
        Self {
            state: Mutex::new(HydrantState {
                index: Some(index),
                segment: None,
                swapped: false,
            }),
            count,
        }
    }

    /// A hydrant reconstructed from an on-disk spill; it is born swapped.
    pub fn from_segment(segment: Arc<dyn QueryableSegment>, count: usize) -> Self {
        Self {
            state: Mutex::new(HydrantState {
                index: None,
                segment: Some(segment),
                swapped: true,
            }),
            count,
        }
    }

    /// Sequence number within the sink.
    pub fn count(&self) -> usize {
        self.count
    }

    /// True once the in-memory index has been replaced by (or released to)
    /// its on-disk form.
    pub fn has_swapped(&self) -> bool {
        self.state.lock().swapped
    }

    /// Replaces the hydrant's contents with the given segment reference,
    /// dropping the in-memory index. Passing `None` releases everything;
    /// the on-disk data stays owned by the persist directory tree.
    pub fn swap_segment(&self, segment: Option<Arc<dyn QueryableSegment>>) {
        let mut state = self.state.lock();
        state.index = None;
        state.segment = segment;
        state.swapped = true;
    }

    /// The current segment reference, if any.
    pub fn segment(&self) -> Option<Arc<dyn QueryableSegment>> {
        self.state.lock().segment.clone()
    }

    /// Adds a row to the live index. Returns the index row count after the
    /// add, or `None` when the hydrant no longer holds a live index.
    pub fn add_row(&self, row: &InputRow) -> Option<Result<usize>> {
        let mut state = self.state.lock();
        let index = state.index.as_mut()?;
        Some(index.add(row).map(|()| index.num_rows()))
    }

    /// Whether the live index can take another row; false once swapped.
    pub fn can_append_row(&self) -> bool {
        let state = self.state.lock();
        state.index.as_ref().is_some_and(|index| index.can_append_row())
    }

    /// Rows in the live index; 0 once swapped.
    pub fn num_rows_in_memory(&self) -> usize {
        let state = self.state.lock();
        state.index.as_ref().map_or(0, |index| index.num_rows())
    }

    /// Estimated heap bytes of the live index; 0 once swapped.
    pub fn bytes_in_memory(&self) -> u64 {
        let state = self.state.lock();
        state.index.as_ref().map_or(0, |index| index.bytes_in_memory())
    }

    /// Whether the hydrant still holds a live index.
    pub fn has_index(&self) -> bool {
        self.state.lock().index.is_some()
    }

    /// Runs `f` with the live index under the hydrant lock, unless the
    /// hydrant has already swapped. The persist path uses this so the
    /// swap-check and the write happen under one critical section.
    pub fn with_unswapped_index<T>(
        &self,
        f: impl FnOnce(&dyn AppendableIndex) -> Result<T>,
    ) -> Option<Result<T>> {
        let state = self.state.lock();
        if state.swapped {
            return None;
        }
        let index = state.index.as_deref()?;
        Some(f(index))
    }

    /// Marks the hydrant swapped while holding its lock, releasing the
    /// index. Called by the persist path after a successful spill.
    pub fn finish_swap(&self) {
        let mut state = self.state.lock();
        state.index = None;
        state.swapped = true;
    }
}

impl fmt::Debug for FireHydrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FireHydrant")
            .field("count", &self.count)
            .field("swapped", &state.swapped)
            .field("has_index", &state.index.is_some())
            .field("has_segment", &state.segment.is_some())
            .finish()
    }
}
