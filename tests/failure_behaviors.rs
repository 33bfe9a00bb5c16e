//! Error latching, push retries, and announcer failure handling.

use appenderator::config::IndexSpec;
use appenderator::error::Result;
use appenderator::index::{
    AppendableIndex, AppendableIndexFactory, SegmentAnnouncer, SegmentPusher,
};
use appenderator::memory::IncrementalRowIndex;
use appenderator::{
    AppenderatorConfig, AppenderatorError, BatchAppenderator, DataSchema, DataSegment, InputRow,
    Interval, SegmentIdentifier, ShardSpec,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn schema() -> DataSchema {
    DataSchema::new("events", vec!["host".to_string()])
}

fn identifier(partition: u32) -> SegmentIdentifier {
    SegmentIdentifier::new(
        "events",
        Interval::new(0, 86_400_000),
        "v1",
        ShardSpec::new(partition),
    )
}

fn row(timestamp: i64) -> InputRow {
    let mut row = InputRow::new(timestamp);
    row.set_dimension("host", "server1");
    row
}

/// Index whose spill always fails, for exercising the persist error latch.
struct FailingSpillIndex {
    inner: IncrementalRowIndex,
}

impl AppendableIndex for FailingSpillIndex {
    fn add(&mut self, row: &InputRow) -> Result<()> {
        self.inner.add(row)
    }

    fn can_append_row(&self) -> bool {
        self.inner.can_append_row()
    }

    fn num_rows(&self) -> usize {
        self.inner.num_rows()
    }

    fn bytes_in_memory(&self) -> u64 {
        self.inner.bytes_in_memory()
    }

    fn persist(&self, _interval: Interval, _out_dir: &Path, _spec: &IndexSpec) -> Result<()> {
        Err(AppenderatorError::InvalidState(
            "injected spill failure".to_string(),
        ))
    }
}

struct FailingSpillIndexFactory;

impl AppendableIndexFactory for FailingSpillIndexFactory {
    fn create(
        &self,
        schema: &DataSchema,
        max_rows: usize,
        max_bytes: i64,
    ) -> Box<dyn AppendableIndex> {
        Box::new(FailingSpillIndex {
            inner: IncrementalRowIndex::new(schema, max_rows, max_bytes),
        })
    }
}

/// Pusher that fails until the configured attempt, counting every call.
struct FlakyPusher {
    attempts: AtomicUsize,
    succeed_on_attempt: usize,
    inner: appenderator::disk::LocalDeepStorage,
}

impl FlakyPusher {
    fn new(deep_storage: &Path, succeed_on_attempt: usize) -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            succeed_on_attempt,
            inner: appenderator::disk::LocalDeepStorage::new(deep_storage),
        }
    }
}

impl SegmentPusher for FlakyPusher {
    fn push(
        &self,
        merged_dir: &Path,
        base: &DataSegment,
        use_unique_path: bool,
    ) -> Result<DataSegment> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < self.succeed_on_attempt {
            return Err(AppenderatorError::InvalidState(
                "transient push failure".to_string(),
            ));
        }
        self.inner.push(merged_dir, base, use_unique_path)
    }
}

#[derive(Default)]
struct CountingAnnouncer {
    announced: AtomicUsize,
    unannounced: AtomicUsize,
    fail_announce: bool,
}

impl SegmentAnnouncer for CountingAnnouncer {
    fn announce(&self, _segment: &DataSegment) -> Result<()> {
        self.announced.fetch_add(1, Ordering::SeqCst);
        if self.fail_announce {
            return Err(AppenderatorError::InvalidState(
                "announcer is down".to_string(),
            ));
        }
        Ok(())
    }

    fn unannounce(&self, _segment: &DataSegment) -> Result<()> {
        self.unannounced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn first_persist_error_is_latched_and_fails_fast() {
    let temp_dir = TempDir::new().unwrap();
    let config = {
        let mut config = AppenderatorConfig::new(temp_dir.path().join("persist"));
        config.max_rows_in_memory = 10;
        config
    };
    let appenderator = BatchAppenderator::builder()
        .with_schema(schema())
        .with_config(config)
        .with_deep_storage_directory(temp_dir.path().join("deep"))
        .with_index_factory(Arc::new(FailingSpillIndexFactory))
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    let id = identifier(0);

    for i in 0..9 {
        appenderator.add(&id, &row(i), None, true).unwrap();
    }
    // The tenth row trips the row trigger; the injected spill failure
    // surfaces from the awaited persist.
    let err = appenderator.add(&id, &row(9), None, true).unwrap_err();
    assert!(matches!(err, AppenderatorError::InvalidState(_)));
    assert_eq!(appenderator.metrics().failed_persists(), 1);

    // Every later producer operation fails fast on the latched error.
    assert!(matches!(
        appenderator.add(&id, &row(10), None, true),
        Err(AppenderatorError::PersistFailed(_))
    ));
    assert!(matches!(
        appenderator.persist_all(None),
        Err(AppenderatorError::PersistFailed(_))
    ));
    assert!(matches!(
        appenderator.clear(),
        Err(AppenderatorError::PersistFailed(_))
    ));
}

#[test]
fn push_retries_transient_deep_storage_failures() {
    let temp_dir = TempDir::new().unwrap();
    let pusher = Arc::new(FlakyPusher::new(&temp_dir.path().join("deep"), 3));
    let appenderator = BatchAppenderator::builder()
        .with_schema(schema())
        .with_config(AppenderatorConfig::new(temp_dir.path().join("persist")))
        .with_pusher(pusher.clone())
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    let id = identifier(0);

    for i in 0..20 {
        appenderator.add(&id, &row(i), None, true).unwrap();
    }
    let pushed = appenderator
        .push(&[id], None, false)
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();

    assert_eq!(pushed.segments.len(), 1);
    assert_eq!(pusher.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(appenderator.metrics().failed_handoffs(), 0);

    appenderator.close().unwrap();
}

#[test]
fn push_gives_up_after_five_attempts() {
    let temp_dir = TempDir::new().unwrap();
    let pusher = Arc::new(FlakyPusher::new(&temp_dir.path().join("deep"), usize::MAX));
    let appenderator = BatchAppenderator::builder()
        .with_schema(schema())
        .with_config(AppenderatorConfig::new(temp_dir.path().join("persist")))
        .with_pusher(pusher.clone())
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    let id = identifier(0);

    for i in 0..20 {
        appenderator.add(&id, &row(i), None, true).unwrap();
    }
    let result = appenderator
        .push(&[id], None, false)
        .unwrap()
        .wait()
        .unwrap();

    assert!(matches!(result, Err(AppenderatorError::InvalidState(_))));
    assert_eq!(pusher.attempts.load(Ordering::SeqCst), 5);
    assert_eq!(appenderator.metrics().failed_handoffs(), 1);

    appenderator.close().unwrap();
}

#[test]
fn announcements_track_sink_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let announcer = Arc::new(CountingAnnouncer::default());
    let appenderator = BatchAppenderator::builder()
        .with_schema(schema())
        .with_config(AppenderatorConfig::new(temp_dir.path().join("persist")))
        .with_deep_storage_directory(temp_dir.path().join("deep"))
        .with_announcer(announcer.clone())
        .build()
        .unwrap();
    appenderator.start_job().unwrap();

    appenderator
        .add(&identifier(0), &row(0), None, true)
        .unwrap();
    appenderator
        .add(&identifier(1), &row(1), None, true)
        .unwrap();
    // A second row into an existing sink does not re-announce.
    appenderator
        .add(&identifier(0), &row(2), None, true)
        .unwrap();
    assert_eq!(announcer.announced.load(Ordering::SeqCst), 2);

    appenderator.close_now().unwrap();
    assert_eq!(announcer.unannounced.load(Ordering::SeqCst), 2);
}

#[test]
fn announce_failures_do_not_block_ingestion() {
    let temp_dir = TempDir::new().unwrap();
    let announcer = Arc::new(CountingAnnouncer {
        fail_announce: true,
        ..CountingAnnouncer::default()
    });
    let appenderator = BatchAppenderator::builder()
        .with_schema(schema())
        .with_config(AppenderatorConfig::new(temp_dir.path().join("persist")))
        .with_deep_storage_directory(temp_dir.path().join("deep"))
        .with_announcer(announcer.clone())
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    let id = identifier(0);

    let result = appenderator.add(&id, &row(0), None, true).unwrap();
    assert_eq!(result.num_rows_in_segment, 1);
    assert_eq!(announcer.announced.load(Ordering::SeqCst), 1);

    appenderator.close().unwrap();
}
