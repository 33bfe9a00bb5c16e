//! appenderator - a batch segment appenderator
//!
//! An in-memory ingestion engine that accepts a serial stream of timestamped
//! rows destined for one or more immutable on-disk segments, spills partial
//! segments to disk under memory pressure, and finally merges and uploads
//! each finished segment to deep storage.

pub mod appenderator;
pub mod config;
pub mod dirlock;
pub mod disk;
pub mod error;
pub mod executor;
pub mod hydrant;
pub mod identifier;
pub mod index;
pub mod memory;
pub mod metrics;
pub mod query;
pub mod sink;

pub use appenderator::{AddResult, BatchAppenderator, BatchAppenderatorBuilder};
pub use config::{AppenderatorConfig, IndexSpec, WriteOutMedium};
pub use error::{AppenderatorError, Result};
pub use identifier::{
    DataSegment, Interval, SegmentIdentifier, SegmentsAndCommitMetadata, ShardSpec,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single input row: a timestamp plus named string dimensions.
///
/// Rows are the unit of ingestion. The appenderator itself treats them as
/// opaque beyond the timestamp; dimensions only matter to the index
/// implementation that stores and merges them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    /// Event time in epoch milliseconds.
    timestamp: i64,
    /// Dimension name to value, kept sorted for deterministic encoding.
    dimensions: BTreeMap<String, String>,
}

impl InputRow {
    /// Creates a row with no dimensions.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            dimensions: BTreeMap::new(),
        }
    }

    /// Creates a row with the given dimensions.
    pub fn with_dimensions(
        timestamp: i64,
        dimensions: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            timestamp,
            dimensions: dimensions.into_iter().collect(),
        }
    }

    /// Gets the event timestamp in epoch milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Gets all dimensions.
    pub fn dimensions(&self) -> &BTreeMap<String, String> {
        &self.dimensions
    }

    /// Gets a single dimension value.
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }

    /// Sets a dimension value.
    pub fn set_dimension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.dimensions.insert(name.into(), value.into());
    }
}

impl fmt::Display for InputRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputRow(ts: {}, dims: {})", self.timestamp, self.dimensions.len())
    }
}

/// Schema shared by every segment of one data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSchema {
    data_source: String,
    dimensions: Vec<String>,
}

impl DataSchema {
    /// Creates a schema for the given data source and dimension order.
    pub fn new(data_source: impl Into<String>, dimensions: Vec<String>) -> Self {
        Self {
            data_source: data_source.into(),
            dimensions,
        }
    }

    /// The data source every ingested identifier must match.
    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// Declared dimension order; merge output follows it.
    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }
}

/// Supplies committed metadata alongside a persist or push.
///
/// Batch ingestion never has a committer; `add` and `push` reject one. The
/// trait exists so the producer-facing signatures can carry the slot.
pub trait Committer: Send + Sync {
    /// Metadata to record atomically with the persisted data.
    fn commit_metadata(&self) -> serde_json::Value;
}
