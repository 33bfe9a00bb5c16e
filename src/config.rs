//! Tuning configuration for the appenderator.

use crate::error::{AppenderatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How the index implementation stages bytes while writing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutMedium {
    /// Accumulate the encoded segment in memory, then write it in one pass.
    OnHeap,
    /// Stream the encoded segment directly into the target directory.
    Directory,
}

/// Knobs passed through to the index implementation for one persist or merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Whether the written files are fsynced before the operation completes.
    /// Intermediate spills skip the sync; the final merge does not.
    pub fsync: bool,
}

impl Default for IndexSpec {
    fn default() -> Self {
        Self { fsync: true }
    }
}

impl IndexSpec {
    /// The default spec for intermediate persists: spills are rewritten into
    /// the merged segment anyway, so they skip the sync.
    pub fn for_intermediate_persists() -> Self {
        Self { fsync: false }
    }
}

/// Tuning configuration, fixed for the lifetime of one appenderator.
#[derive(Debug, Clone)]
pub struct AppenderatorConfig {
    /// Root of all on-disk state for this appenderator.
    pub base_persist_directory: PathBuf,
    /// Row-count persist trigger across all live sinks.
    pub max_rows_in_memory: usize,
    /// Byte-count persist trigger across all live sinks.
    pub max_bytes_in_memory: i64,
    /// Disables the per-sink/per-hydrant overhead estimates and the
    /// post-persist heap-limit assertion.
    pub skip_bytes_in_memory_overhead_check: bool,
    /// Wall-clock persist trigger.
    pub intermediate_persist_period: Duration,
    /// Persist-executor queue capacity; 0 means hand-off directly to the
    /// persist thread (strongest backpressure).
    pub max_pending_persists: usize,
    /// Spec for the final merged segment.
    pub index_spec: IndexSpec,
    /// Spec for intermediate spills.
    pub index_spec_for_intermediate_persists: IndexSpec,
    /// Write staging for persist and merge.
    pub write_out_medium: WriteOutMedium,
    /// Upper bound on the merged dimension union; negative means unlimited.
    pub max_columns_to_merge: i32,
}

impl AppenderatorConfig {
    /// Creates a configuration with defaults for everything but the base
    /// persist directory.
    pub fn new(base_persist_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_persist_directory: base_persist_directory.into(),
            max_rows_in_memory: 150_000,
            max_bytes_in_memory: i64::MAX,
            skip_bytes_in_memory_overhead_check: false,
            intermediate_persist_period: Duration::from_secs(10 * 60),
            max_pending_persists: 0,
            index_spec: IndexSpec::default(),
            index_spec_for_intermediate_persists: IndexSpec::for_intermediate_persists(),
            write_out_medium: WriteOutMedium::Directory,
            max_columns_to_merge: -1,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.base_persist_directory.as_os_str().is_empty() {
            return Err(AppenderatorError::InvalidConfiguration(
                "base_persist_directory must not be empty".to_string(),
            ));
        }
        if self.max_rows_in_memory == 0 {
            return Err(AppenderatorError::InvalidConfiguration(
                "max_rows_in_memory must be positive".to_string(),
            ));
        }
        if self.max_bytes_in_memory <= 0 {
            return Err(AppenderatorError::InvalidConfiguration(
                "max_bytes_in_memory must be positive".to_string(),
            ));
        }
        if self.intermediate_persist_period.is_zero() {
            return Err(AppenderatorError::InvalidConfiguration(
                "intermediate_persist_period must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppenderatorConfig::new("/tmp/appenderator").validate().is_ok());
    }

    #[test]
    fn rejects_zero_row_limit() {
        let mut config = AppenderatorConfig::new("/tmp/appenderator");
        config.max_rows_in_memory = 0;
        assert!(matches!(
            config.validate(),
            Err(AppenderatorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn intermediate_spec_skips_fsync() {
        assert!(IndexSpec::default().fsync);
        assert!(!IndexSpec::for_intermediate_persists().fsync);
    }
}
