//! Segment naming: identifiers, intervals, shard specs, and push receipts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A half-open time range `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    /// Creates a new interval. `start` must be strictly below `end`.
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "interval start {start} must be < end {end}");
        Self { start, end }
    }

    /// Whether the timestamp falls inside the half-open range.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether two intervals share any instant.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Placement of a segment within its interval's partition set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec {
    pub partition_num: u32,
}

impl ShardSpec {
    pub fn new(partition_num: u32) -> Self {
        Self { partition_num }
    }
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self { partition_num: 0 }
    }
}

/// Uniquely names one segment: data source, interval, version, shard.
///
/// The `Display` form doubles as the segment's persist directory name, so the
/// data source and version must be filesystem-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentIdentifier {
    data_source: String,
    interval: Interval,
    version: String,
    shard_spec: ShardSpec,
}

impl SegmentIdentifier {
    pub fn new(
        data_source: impl Into<String>,
        interval: Interval,
        version: impl Into<String>,
        shard_spec: ShardSpec,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            interval,
            version: version.into(),
            shard_spec,
        }
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn shard_spec(&self) -> ShardSpec {
        self.shard_spec
    }
}

impl fmt::Display for SegmentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.data_source,
            self.interval.start,
            self.interval.end,
            self.version,
            self.shard_spec.partition_num
        )
    }
}

/// Descriptor of a pushed segment: where it lives in deep storage and what it
/// contains. Serialized as `descriptor.json` after a successful push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSegment {
    pub data_source: String,
    pub interval: Interval,
    pub version: String,
    pub shard_spec: ShardSpec,
    /// Opaque pointer into deep storage, e.g. `{"type": "local", "path": …}`.
    pub load_spec: BTreeMap<String, Value>,
    /// Total bytes in deep storage.
    pub size: u64,
    /// Rows in the merged segment.
    pub num_rows: u64,
}

impl DataSegment {
    /// A descriptor carrying only identity, before merge and push fill in
    /// the load spec and sizes.
    pub fn base(identifier: &SegmentIdentifier) -> Self {
        Self {
            data_source: identifier.data_source().to_string(),
            interval: identifier.interval(),
            version: identifier.version().to_string(),
            shard_spec: identifier.shard_spec(),
            load_spec: BTreeMap::new(),
            size: 0,
            num_rows: 0,
        }
    }

    pub fn identifier(&self) -> SegmentIdentifier {
        SegmentIdentifier::new(
            self.data_source.clone(),
            self.interval,
            self.version.clone(),
            self.shard_spec,
        )
    }
}

/// Result of a push: the descriptors produced plus committed metadata, which
/// batch ingestion always leaves empty.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentsAndCommitMetadata {
    pub segments: Vec<DataSegment>,
    pub commit_metadata: Option<Value>,
}

impl SegmentsAndCommitMetadata {
    pub fn new(segments: Vec<DataSegment>) -> Self {
        Self {
            segments,
            commit_metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_contains_is_half_open() {
        let interval = Interval::new(100, 200);
        assert!(interval.contains(100));
        assert!(interval.contains(199));
        assert!(!interval.contains(200));
        assert!(!interval.contains(99));
    }

    #[test]
    fn identifier_display_is_filesystem_safe() {
        let id = SegmentIdentifier::new(
            "events",
            Interval::new(1000, 2000),
            "v1",
            ShardSpec::new(3),
        );
        assert_eq!(id.to_string(), "events_1000_2000_v1_3");
    }

    #[test]
    fn identifier_round_trips_through_json() {
        let id = SegmentIdentifier::new(
            "events",
            Interval::new(0, 3_600_000),
            "2024-01-01",
            ShardSpec::default(),
        );
        let encoded = serde_json::to_string(&id).unwrap();
        let decoded: SegmentIdentifier = serde_json::from_str(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn base_descriptor_preserves_identity() {
        let id = SegmentIdentifier::new("events", Interval::new(0, 100), "v2", ShardSpec::new(1));
        let segment = DataSegment::base(&id);
        assert_eq!(segment.identifier(), id);
        assert_eq!(segment.size, 0);
        assert!(segment.load_spec.is_empty());
    }
}
