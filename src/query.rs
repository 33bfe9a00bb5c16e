//! Query forwarding: the appenderator core never executes queries itself.

use crate::error::Result;
use crate::identifier::Interval;
use crate::InputRow;
use std::sync::Arc;

/// A row scan over some set of segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanQuery {
    pub interval: Interval,
    pub limit: Option<usize>,
}

impl ScanQuery {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Names one queryable segment generation for segment-scoped queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentDescriptor {
    pub interval: Interval,
    pub version: String,
    pub partition_num: u32,
}

/// Executes scans; produced by a [`QuerySegmentWalker`].
pub trait QueryRunner: Send + Sync {
    fn run(&self, query: &ScanQuery) -> Result<Vec<InputRow>>;
}

/// Routes queries to whatever holds the data. Supplied by the host; the
/// appenderator only forwards to it.
pub trait QuerySegmentWalker: Send + Sync {
    fn query_runner_for_intervals(&self, intervals: &[Interval]) -> Arc<dyn QueryRunner>;

    fn query_runner_for_segments(&self, segments: &[SegmentDescriptor]) -> Arc<dyn QueryRunner>;
}
