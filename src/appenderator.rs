//! The batch segment appenderator.
//!
//! Rows arrive from a single producer, accumulate in per-segment sinks,
//! spill to disk whenever a persist trigger fires, and are merged + uploaded
//! to deep storage on push. Sinks are evicted from memory after every
//! persist and resurrected from disk at push time, so memory stays bounded
//! by the trigger thresholds regardless of how many segments a job covers.

use crate::config::AppenderatorConfig;
use crate::dirlock::DirectoryLock;
use crate::error::{AppenderatorError, Result};
use crate::executor::{SerialExecutor, TaskFuture};
use crate::hydrant::FireHydrant;
use crate::identifier::{DataSegment, Interval, SegmentIdentifier, SegmentsAndCommitMetadata};
use crate::index::{
    AppendableIndexFactory, IndexMerger, NopSegmentAnnouncer, QueryableSegment, SegmentAnnouncer,
    SegmentPusher,
};
use crate::metrics::AppenderatorMetrics;
use crate::query::{QueryRunner, QuerySegmentWalker, SegmentDescriptor};
use crate::sink::Sink;
use crate::{Committer, DataSchema, InputRow};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Rough estimate of the heap footprint of an empty sink, taken from heap
/// dumps of long ingestion runs.
pub const ROUGH_OVERHEAD_PER_SINK: i64 = 5000;
/// Rough estimate of the heap footprint of a swapped-out hydrant.
pub const ROUGH_OVERHEAD_PER_HYDRANT: i64 = 1000;
/// Fixed per-hydrant header: the sequence number plus four refcount words.
const HYDRANT_HEADER_BYTES: i64 =
    (size_of::<u32>() + 4 * size_of::<u16>()) as i64;

/// Submission delays above this threshold log a backpressure warning.
const WARN_DELAY: Duration = Duration::from_millis(1000);
/// Deep-storage pushes are retried this many times on any error.
const PUSH_RETRY_ATTEMPTS: usize = 5;

const IDENTIFIER_FILE_NAME: &str = "identifier.json";
const DESCRIPTOR_FILE_NAME: &str = "descriptor.json";
const MERGED_DIR_NAME: &str = "merged";

/// Per-segment bookkeeping that outlives sink eviction.
///
/// Sinks leave memory after every incremental persist; this record is what
/// remains, and it is authoritative for row counts, for the sanity check at
/// merge time, and for naming the next spill directory.
#[derive(Debug, Default, Clone)]
pub struct SinkMetadata {
    /// Cumulative rows ever added to this segment.
    num_rows_in_segment: usize,
    /// Hydrants expected on disk; checked against the restored sink at merge.
    num_hydrants: usize,
    /// Names the next spill subdirectory; monotonic across sink
    /// reincarnations, so it is tracked here and never inferred from the
    /// sink itself.
    previous_hydrant_count: usize,
}

impl SinkMetadata {
    fn add_rows(&mut self, rows: usize) {
        self.num_rows_in_segment += rows;
    }

    fn add_hydrants(&mut self, hydrants: usize) {
        self.num_hydrants += hydrants;
    }

    fn increment_hydrant_count(&mut self) {
        self.previous_hydrant_count += 1;
    }

    pub fn num_rows_in_segment(&self) -> usize {
        self.num_rows_in_segment
    }

    pub fn num_hydrants(&self) -> usize {
        self.num_hydrants
    }

    pub fn previous_hydrant_count(&self) -> usize {
        self.previous_hydrant_count
    }
}

/// What `add` tells the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddResult {
    pub identifier: SegmentIdentifier,
    /// Cumulative rows in the segment, including already-persisted ones.
    pub num_rows_in_segment: usize,
    /// Always false for batch: persists happen eagerly inside `add`.
    pub is_persist_required: bool,
}

/// Builder wiring the appenderator to its collaborators.
pub struct BatchAppenderatorBuilder {
    id: Option<String>,
    schema: Option<DataSchema>,
    config: Option<AppenderatorConfig>,
    index_factory: Option<Arc<dyn AppendableIndexFactory>>,
    merger: Option<Arc<dyn IndexMerger>>,
    pusher: Option<Arc<dyn SegmentPusher>>,
    deep_storage_directory: Option<PathBuf>,
    announcer: Option<Arc<dyn SegmentAnnouncer>>,
    walker: Option<Arc<dyn QuerySegmentWalker>>,
}

impl BatchAppenderatorBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            schema: None,
            config: None,
            index_factory: None,
            merger: None,
            pusher: None,
            deep_storage_directory: None,
            announcer: None,
            walker: None,
        }
    }

    /// Sets the task id used in thread names and logs.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_schema(mut self, schema: DataSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_config(mut self, config: AppenderatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_index_factory(mut self, factory: Arc<dyn AppendableIndexFactory>) -> Self {
        self.index_factory = Some(factory);
        self
    }

    pub fn with_merger(mut self, merger: Arc<dyn IndexMerger>) -> Self {
        self.merger = Some(merger);
        self
    }

    pub fn with_pusher(mut self, pusher: Arc<dyn SegmentPusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Shortcut for pushing to a [`crate::disk::LocalDeepStorage`] rooted at
    /// the given directory.
    pub fn with_deep_storage_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.deep_storage_directory = Some(dir.into());
        self
    }

    pub fn with_announcer(mut self, announcer: Arc<dyn SegmentAnnouncer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    pub fn with_query_walker(mut self, walker: Arc<dyn QuerySegmentWalker>) -> Self {
        self.walker = Some(walker);
        self
    }

    pub fn build(self) -> Result<BatchAppenderator> {
        let schema = self.schema.ok_or_else(|| {
            AppenderatorError::InvalidConfiguration("a schema is required".to_string())
        })?;
        let config = self.config.ok_or_else(|| {
            AppenderatorError::InvalidConfiguration("a tuning config is required".to_string())
        })?;
        config.validate()?;

        let pusher: Arc<dyn SegmentPusher> = match (self.pusher, self.deep_storage_directory) {
            (Some(pusher), _) => pusher,
            (None, Some(dir)) => Arc::new(crate::disk::LocalDeepStorage::new(dir)),
            (None, None) => {
                return Err(AppenderatorError::InvalidConfiguration(
                    "a segment pusher or deep storage directory is required".to_string(),
                ));
            }
        };
        let index_factory = self.index_factory.unwrap_or_else(|| {
            Arc::new(crate::memory::IncrementalRowIndexFactory::new(
                config.write_out_medium,
            ))
        });
        let merger = self
            .merger
            .unwrap_or_else(|| Arc::new(crate::disk::RowIndexMerger::new(config.write_out_medium)));
        let announcer = self
            .announcer
            .unwrap_or_else(|| Arc::new(NopSegmentAnnouncer));
        let id = self
            .id
            .unwrap_or_else(|| format!("{}-batch", schema.data_source()));

        Ok(BatchAppenderator {
            id,
            schema: Arc::new(schema),
            config: Arc::new(config),
            metrics: Arc::new(AppenderatorMetrics::new()),
            index_factory,
            merger,
            pusher,
            announcer,
            walker: self.walker,
            sinks: Arc::new(DashMap::new()),
            sinks_metadata: Arc::new(DashMap::new()),
            rows_in_memory: Arc::new(AtomicI64::new(0)),
            bytes_in_memory: Arc::new(AtomicI64::new(0)),
            total_rows: Arc::new(AtomicI64::new(0)),
            next_flush: Arc::new(Mutex::new(Instant::now())),
            persist_error: Arc::new(Mutex::new(None)),
            commit_lock: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
            persist_exec: Arc::new(Mutex::new(None)),
            push_exec: Arc::new(Mutex::new(None)),
            abandon_exec: Arc::new(Mutex::new(None)),
            dir_lock: Arc::new(Mutex::new(None)),
        })
    }
}

impl Default for BatchAppenderatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The batch appenderator engine. All producer-facing methods must be called
/// from a single thread; internal work is spread over three serial
/// executors (persist, merge, abandon).
pub struct BatchAppenderator {
    id: String,
    schema: Arc<DataSchema>,
    config: Arc<AppenderatorConfig>,
    metrics: Arc<AppenderatorMetrics>,
    index_factory: Arc<dyn AppendableIndexFactory>,
    merger: Arc<dyn IndexMerger>,
    pusher: Arc<dyn SegmentPusher>,
    announcer: Arc<dyn SegmentAnnouncer>,
    walker: Option<Arc<dyn QuerySegmentWalker>>,
    /// Live sinks. Mutated by the producer thread and the persist executor,
    /// read from anywhere.
    sinks: Arc<DashMap<SegmentIdentifier, Arc<Sink>>>,
    /// Survives sink eviction; see [`SinkMetadata`].
    sinks_metadata: Arc<DashMap<SegmentIdentifier, SinkMetadata>>,
    rows_in_memory: Arc<AtomicI64>,
    bytes_in_memory: Arc<AtomicI64>,
    total_rows: Arc<AtomicI64>,
    next_flush: Arc<Mutex<Instant>>,
    /// First persist error wins; every producer entry point checks it.
    persist_error: Arc<Mutex<Option<String>>>,
    /// Serializes committed-metadata persistence. Batch has no committer,
    /// but the descriptor write goes through it so a future committer path
    /// cannot interleave with it.
    commit_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
    persist_exec: Arc<Mutex<Option<Arc<SerialExecutor>>>>,
    push_exec: Arc<Mutex<Option<Arc<SerialExecutor>>>>,
    abandon_exec: Arc<Mutex<Option<Arc<SerialExecutor>>>>,
    dir_lock: Arc<Mutex<Option<DirectoryLock>>>,
}

impl BatchAppenderator {
    pub fn builder() -> BatchAppenderatorBuilder {
        BatchAppenderatorBuilder::new()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data_source(&self) -> &str {
        self.schema.data_source()
    }

    pub fn metrics(&self) -> &Arc<AppenderatorMetrics> {
        &self.metrics
    }

    /// Creates the base persist directory, takes the exclusive lock on it,
    /// and starts the persist/merge/abandon executors.
    pub fn start_job(&self) -> Result<()> {
        self.ensure_open()?;
        fs::create_dir_all(&self.config.base_persist_directory)?;
        {
            let mut lock_slot = self.dir_lock.lock();
            if lock_slot.is_none() {
                *lock_slot = Some(DirectoryLock::acquire(&self.config.base_persist_directory)?);
            }
        }
        self.initialize_executors()?;
        self.reset_next_flush();
        info!(
            id = %self.id,
            base_dir = %self.config.base_persist_directory.display(),
            "Started appenderator job"
        );
        Ok(())
    }

    /// Adds one row. May persist inline when a trigger fires; see the
    /// module docs for the trigger set.
    pub fn add(
        &self,
        identifier: &SegmentIdentifier,
        row: &InputRow,
        committer: Option<&dyn Committer>,
        allow_incremental_persists: bool,
    ) -> Result<AddResult> {
        self.ensure_open()?;
        self.check_persist_error()?;
        if committer.is_some() {
            return Err(AppenderatorError::CommitterNotSupported);
        }
        if !allow_incremental_persists {
            return Err(AppenderatorError::IncrementalPersistsRequired);
        }
        if identifier.data_source() != self.schema.data_source() {
            return Err(AppenderatorError::WrongDataSource {
                expected: self.schema.data_source().to_string(),
                actual: identifier.data_source().to_string(),
            });
        }

        let sink = self.get_or_create_sink(identifier);
        self.metrics.report_message_max_timestamp(row.timestamp());

        let rows_before = sink.num_rows_in_memory() as i64;
        let bytes_before = sink.bytes_in_memory() as i64;
        let rows_after = match sink.add(row) {
            Ok(rows) => rows as i64,
            Err(e @ AppenderatorError::IndexSizeExceeded { .. }) => {
                // Should be unreachable: can_append_row gates the index
                // before it ever fills up.
                error!(identifier = %identifier, "Sink was unexpectedly full");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let bytes_after = sink.bytes_in_memory() as i64;

        let num_added = rows_after - rows_before;
        self.rows_in_memory.fetch_add(num_added, Ordering::SeqCst);
        self.bytes_in_memory
            .fetch_add(bytes_after - bytes_before, Ordering::SeqCst);
        self.total_rows.fetch_add(num_added, Ordering::SeqCst);
        self.sinks_metadata
            .entry(identifier.clone())
            .or_default()
            .add_rows(num_added as usize);

        let mut persist_reasons: Vec<String> = Vec::new();
        if !sink.can_append_row() {
            persist_reasons.push("no more rows can be appended to sink".to_string());
        }
        if Instant::now() > *self.next_flush.lock() {
            persist_reasons.push(format!(
                "intermediate persist period of {:?} has elapsed",
                self.config.intermediate_persist_period
            ));
        }
        let rows_now = self.rows_in_memory.load(Ordering::SeqCst);
        if rows_now >= self.config.max_rows_in_memory as i64 {
            persist_reasons.push(format!(
                "rowsCurrentlyInMemory[{rows_now}] is greater than maxRowsInMemory[{}]",
                self.config.max_rows_in_memory
            ));
        }
        let bytes_now = self.bytes_in_memory.load(Ordering::SeqCst);
        if bytes_now >= self.config.max_bytes_in_memory {
            persist_reasons.push(format!(
                "bytesCurrentlyInMemory[{bytes_now}] is greater than maxBytesInMemory[{}]",
                self.config.max_bytes_in_memory
            ));
        }

        if !persist_reasons.is_empty() {
            info!(
                reasons = %persist_reasons.join(", "),
                "Incremental persist to disk"
            );

            let mut bytes_to_be_persisted = 0i64;
            let mut projected_hydrant_overhead = 0i64;
            for entry in self.sinks.iter() {
                let sink_entry = entry.value();
                bytes_to_be_persisted += sink_entry.bytes_in_memory() as i64;
                if sink_entry.swappable() {
                    // The current hydrant stays referenced after persist; it
                    // is only estimated here and charged when it swaps.
                    projected_hydrant_overhead += self.hydrant_overhead();
                }
            }

            let bytes_in_memory = self.bytes_in_memory.load(Ordering::SeqCst);
            if !self.config.skip_bytes_in_memory_overhead_check
                && bytes_in_memory + projected_hydrant_overhead - bytes_to_be_persisted
                    > self.config.max_bytes_in_memory
            {
                // Even a full persist leaves the heap over budget: the
                // accumulated per-sink/per-hydrant overheads have eaten the
                // ingestion headroom.
                let num_hydrants: usize = self
                    .sinks
                    .iter()
                    .map(|entry| entry.value().hydrant_count())
                    .sum();
                let err = AppenderatorError::HeapLimitExceeded {
                    num_sinks: self.sinks.len(),
                    num_hydrants,
                    total_rows: self.get_total_row_count(),
                    bytes_in_memory: bytes_in_memory + projected_hydrant_overhead,
                    bytes_to_be_persisted,
                    max_bytes_in_memory: self.config.max_bytes_in_memory,
                };
                error!(data_source = %self.schema.data_source(), "{err}");
                return Err(err);
            }

            self.persist_all_and_clear()?;
        }

        let num_rows_in_segment = self
            .sinks_metadata
            .get(identifier)
            .map(|metadata| metadata.num_rows_in_segment())
            .unwrap_or(0);
        Ok(AddResult {
            identifier: identifier.clone(),
            num_rows_in_segment,
            is_persist_required: false,
        })
    }

    /// Identifiers of currently live sinks.
    pub fn get_segments(&self) -> Vec<SegmentIdentifier> {
        self.sinks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Cumulative rows for a segment, from retained metadata. Live sinks are
    /// evicted after every persist, so metadata is the authoritative count.
    pub fn get_row_count(&self, identifier: &SegmentIdentifier) -> Result<usize> {
        self.sinks_metadata
            .get(identifier)
            .map(|metadata| metadata.num_rows_in_segment())
            .ok_or_else(|| AppenderatorError::SegmentNotFound {
                identifier: identifier.to_string(),
            })
    }

    /// Rows across all segments added and not yet dropped.
    pub fn get_total_row_count(&self) -> usize {
        self.total_rows.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn rows_in_memory(&self) -> i64 {
        self.rows_in_memory.load(Ordering::SeqCst)
    }

    pub fn bytes_in_memory(&self) -> i64 {
        self.bytes_in_memory.load(Ordering::SeqCst)
    }

    /// In-memory bytes for one segment; 0 once its sink has been evicted.
    pub fn bytes_in_memory_for(&self, identifier: &SegmentIdentifier) -> i64 {
        self.sinks
            .get(identifier)
            .map(|sink| sink.bytes_in_memory() as i64)
            .unwrap_or(0)
    }

    /// Spills every unpersisted hydrant to disk. Returns a future resolving
    /// to the number of rows persisted.
    pub fn persist_all(
        &self,
        committer: Option<&dyn Committer>,
    ) -> Result<TaskFuture<Result<usize>>> {
        self.check_persist_error()?;
        if committer.is_some() {
            return Err(AppenderatorError::CommitterNotSupported);
        }

        let mut indexes_to_persist: Vec<(Arc<FireHydrant>, SegmentIdentifier)> = Vec::new();
        let mut num_persisted_rows = 0i64;
        let mut bytes_persisted = 0i64;
        let mut total_hydrants = 0usize;
        let total_sinks = self.sinks.len();

        for entry in self.sinks.iter() {
            let identifier = entry.key().clone();
            let sink = entry.value().clone();
            total_hydrants += sink.hydrant_count();
            num_persisted_rows += sink.num_rows_in_memory() as i64;
            bytes_persisted += sink.bytes_in_memory() as i64;

            // Frozen hydrants that never made it to disk, then the current
            // one if persisting it would free memory.
            let hydrants = sink.hydrants();
            let frozen_limit = if sink.is_writable() {
                hydrants.len().saturating_sub(1)
            } else {
                hydrants.len()
            };
            let mut persisted_for_sink = 0usize;
            for hydrant in &hydrants[..frozen_limit] {
                if !hydrant.has_swapped() {
                    debug!(
                        identifier = %identifier,
                        hydrant = hydrant.count(),
                        "Hydrant has not persisted yet, persisting"
                    );
                    indexes_to_persist.push((hydrant.clone(), identifier.clone()));
                    persisted_for_sink += 1;
                }
            }
            if sink.swappable() {
                indexes_to_persist.push((sink.swap(), identifier.clone()));
                // The swapped hydrant keeps a reference until the sink is
                // abandoned; account for it now that the swap happened.
                self.bytes_in_memory
                    .fetch_add(self.hydrant_overhead(), Ordering::SeqCst);
                persisted_for_sink += 1;
            }

            self.sinks_metadata
                .entry(identifier)
                .or_default()
                .add_hydrants(persisted_for_sink);
        }

        if indexes_to_persist.is_empty() {
            info!("No indexes will be persisted");
        }

        let this = self.clone_refs();
        let persisted_hydrants = indexes_to_persist.len();
        let submit_started = Instant::now();
        let future = self.persist_executor()?.submit(move || -> Result<usize> {
            let persist_started = Instant::now();
            let result: Result<usize> = (|| {
                let mut persisted_rows = 0usize;
                for (hydrant, identifier) in &indexes_to_persist {
                    let rows = this.persist_hydrant(hydrant, identifier)?;
                    this.metrics.increment_rows_out(rows as u64);
                    persisted_rows += rows;
                }
                info!(
                    sinks = total_sinks,
                    hydrants = total_hydrants,
                    persisted_hydrants,
                    rows = persisted_rows,
                    "Persisted in-memory data"
                );
                Ok(persisted_rows)
            })();
            this.metrics.increment_num_persists();
            this.metrics
                .increment_persist_time_millis(persist_started.elapsed().as_millis() as u64);
            if let Err(ref e) = result {
                this.metrics.increment_failed_persists();
                this.latch_persist_error(e.to_string());
            }
            result
        })?;

        // Submission blocks while earlier persists clog the bounded queue;
        // that wait is the backpressure this engine applies to its producer.
        let start_delay = submit_started.elapsed();
        self.metrics
            .increment_persist_back_pressure_millis(start_delay.as_millis() as u64);
        if start_delay > WARN_DELAY {
            warn!(
                millis = start_delay.as_millis() as u64,
                "Ingestion was throttled because persists were pending"
            );
        }
        self.reset_next_flush();

        // Rows stay on the heap until the persist completes, but only rows
        // in active indexes are counted.
        self.rows_in_memory
            .fetch_add(-num_persisted_rows, Ordering::SeqCst);
        self.bytes_in_memory
            .fetch_add(-bytes_persisted, Ordering::SeqCst);
        debug!(
            rows = num_persisted_rows,
            bytes = bytes_persisted,
            "Submitted persist"
        );

        Ok(future)
    }

    /// Persists everything, then drops every live sink while keeping its
    /// on-disk spills. Rows in evicted sinks live on in `sinks_metadata`.
    fn persist_all_and_clear(&self) -> Result<()> {
        let future = self.persist_all(None)?;
        let result = future
            .wait()
            .and_then(|inner| inner)
            .and_then(|_rows| self.clear_inner(false));
        if let Err(ref e) = result {
            self.latch_persist_error(e.to_string());
        }
        result
    }

    /// Merges and uploads every persisted segment. The identifier list is
    /// advisory: the push drains whatever the base persist directory holds,
    /// which after `persist_all_and_clear` is exactly the segments added and
    /// not dropped.
    pub fn push(
        &self,
        identifiers: &[SegmentIdentifier],
        committer: Option<&dyn Committer>,
        use_unique_path: bool,
    ) -> Result<TaskFuture<Result<SegmentsAndCommitMetadata>>> {
        self.ensure_open()?;
        if committer.is_some() {
            return Err(AppenderatorError::CommitterNotSupported);
        }
        debug!(requested = identifiers.len(), "Push requested");

        // Any sinks not persisted so far land on disk before the push task
        // starts reading the base directory.
        self.persist_all_and_clear()?;

        let this = self.clone_refs();
        self.push_executor()?
            .submit(move || -> Result<SegmentsAndCommitMetadata> {
                info!("Preparing to push");
                let mut segments = Vec::new();
                for dir in this.persisted_identifier_paths()? {
                    let (identifier, sink) = this.identifier_and_sink_for_persisted_dir(&dir)?;
                    match this.merge_and_push(&identifier, &sink, use_unique_path)? {
                        Some(segment) => segments.push(segment),
                        None => {
                            warn!(identifier = %identifier, "Merge and push yielded nothing, skipping")
                        }
                    }
                }
                info!(segments = segments.len(), "Push complete");
                Ok(SegmentsAndCommitMetadata::new(segments))
            })
    }

    /// Drops one segment: removes its live sink and metadata, subtracts its
    /// rows from the totals, and scrubs its on-disk data.
    pub fn drop_segment(&self, identifier: &SegmentIdentifier) -> Result<TaskFuture<Result<()>>> {
        self.ensure_open()?;
        let sink = self.sinks.get(identifier).map(|entry| entry.value().clone());

        if let Some((_, metadata)) = self.sinks_metadata.remove(identifier) {
            let original_total = self.total_rows.load(Ordering::SeqCst);
            let rows_to_drop = metadata.num_rows_in_segment() as i64;
            let total_after = original_total - rows_to_drop;
            if total_after < 0 {
                warn!(
                    identifier = %identifier,
                    total_after,
                    rows_to_drop,
                    "Total rows went negative after dropping segment"
                );
            }
            self.total_rows.store(total_after.max(0), Ordering::SeqCst);
        }

        match sink {
            Some(sink) => self.remove_sink(identifier.clone(), sink, true),
            // The sink was already evicted by a persist; its spills may still
            // be on disk, and a later push must not resurrect them.
            None => self.schedule_disk_cleanup(identifier.clone()),
        }
    }

    /// Drops every sink and removes their on-disk data. Blocks until done.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.clear_inner(true)
    }

    fn clear_inner(&self, remove_on_disk_data: bool) -> Result<()> {
        info!(remove_on_disk_data, "Clearing all sinks and hydrants");
        self.check_persist_error()?;

        let entries: Vec<(SegmentIdentifier, Arc<Sink>)> = self
            .sinks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut futures = Vec::new();
        for (identifier, sink) in entries {
            futures.push(self.remove_sink(identifier, sink, remove_on_disk_data)?);
        }
        for future in futures {
            future.wait().and_then(|inner| inner)?;
        }
        Ok(())
    }

    /// Drops every sink without removing on-disk data, waits for all three
    /// executors to terminate, releases the directory lock, and deletes
    /// every remaining persist directory. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Appenderator already closed, skipping close call");
            return Ok(());
        }
        debug!("Shutting down");

        let entries: Vec<(SegmentIdentifier, Arc<Sink>)> = self
            .sinks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut futures = Vec::new();
        for (identifier, sink) in entries {
            match self.remove_sink(identifier, sink, false) {
                Ok(future) => futures.push(future),
                Err(e) => warn!(error = %e, "Unable to schedule sink removal during close"),
            }
        }
        for future in futures {
            if let Err(e) = future.wait().and_then(|inner| inner) {
                warn!(error = %e, "Unable to abandon existing segments during close");
            }
        }

        self.shutdown_executors();
        for slot in [&self.persist_exec, &self.push_exec, &self.abandon_exec] {
            if let Some(executor) = slot.lock().take() {
                executor.join();
            }
        }

        // Only unlock once the executors actually shut down.
        if let Some(lock) = self.dir_lock.lock().take()
            && let Err(e) = lock.release()
        {
            warn!(error = %e, "Failed to release base persist directory lock");
        }

        // Final cleanup: whatever persist directories remain are dead.
        if let Ok(paths) = self.persisted_identifier_paths() {
            for dir in paths {
                self.remove_directory(&dir);
            }
        }

        self.total_rows.store(0, Ordering::SeqCst);
        self.sinks_metadata.clear();
        info!(id = %self.id, "Appenderator closed");
        Ok(())
    }

    /// Unannounces live segments and waits only for the persist and abandon
    /// executors. The merge executor may still be draining, and the
    /// directory lock is deliberately not released: it stays held until this
    /// value is dropped or the process exits, so a restarted job against the
    /// same directory fails fast while this one is alive.
    pub fn close_now(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Appenderator already closed, skipping close_now call");
            return Ok(());
        }
        debug!("Shutting down immediately");

        for entry in self.sinks.iter() {
            if let Err(e) = self.announcer.unannounce(&entry.value().segment_base()) {
                error!(
                    identifier = %entry.key(),
                    error = %e,
                    "Failed to unannounce segment"
                );
            }
        }

        self.shutdown_executors();
        if let Some(executor) = self.persist_exec.lock().take() {
            executor.join();
        }
        if let Some(executor) = self.abandon_exec.lock().take() {
            executor.join();
        }
        Ok(())
    }

    /// Forwards to the configured walker, or refuses when none was supplied.
    pub fn query_runner_for_intervals(
        &self,
        intervals: &[Interval],
    ) -> Result<Arc<dyn QueryRunner>> {
        match &self.walker {
            Some(walker) => Ok(walker.query_runner_for_intervals(intervals)),
            None => Err(AppenderatorError::QueriesNotSupported),
        }
    }

    /// Forwards to the configured walker, or refuses when none was supplied.
    pub fn query_runner_for_segments(
        &self,
        segments: &[SegmentDescriptor],
    ) -> Result<Arc<dyn QueryRunner>> {
        match &self.walker {
            Some(walker) => Ok(walker.query_runner_for_segments(segments)),
            None => Err(AppenderatorError::QueriesNotSupported),
        }
    }

    // ---- internals ----

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppenderatorError::ShuttingDown);
        }
        Ok(())
    }

    fn check_persist_error(&self) -> Result<()> {
        if let Some(message) = self.persist_error.lock().clone() {
            return Err(AppenderatorError::PersistFailed(message));
        }
        Ok(())
    }

    fn latch_persist_error(&self, message: String) {
        let mut slot = self.persist_error.lock();
        if slot.is_none() {
            error!(error = %message, "Latching first persist error");
            *slot = Some(message);
        }
    }

    fn initialize_executors(&self) -> Result<()> {
        let mut persist = self.persist_exec.lock();
        if persist.is_none() {
            *persist = Some(SerialExecutor::new(
                format!("{}-appenderator-persist", self.id),
                self.config.max_pending_persists,
            )?);
        }
        let mut push = self.push_exec.lock();
        if push.is_none() {
            *push = Some(SerialExecutor::new(
                format!("{}-appenderator-merge", self.id),
                1,
            )?);
        }
        let mut abandon = self.abandon_exec.lock();
        if abandon.is_none() {
            // Rendezvous queue: abandon operations hand off one at a time,
            // keeping drop/clear/close strictly sequential.
            *abandon = Some(SerialExecutor::new(
                format!("{}-appenderator-abandon", self.id),
                0,
            )?);
        }
        Ok(())
    }

    fn shutdown_executors(&self) {
        for slot in [&self.persist_exec, &self.push_exec, &self.abandon_exec] {
            if let Some(executor) = slot.lock().as_ref() {
                executor.shutdown_now();
            }
        }
    }

    fn persist_executor(&self) -> Result<Arc<SerialExecutor>> {
        self.persist_exec
            .lock()
            .clone()
            .ok_or(AppenderatorError::NotStarted)
    }

    fn push_executor(&self) -> Result<Arc<SerialExecutor>> {
        self.push_exec
            .lock()
            .clone()
            .ok_or(AppenderatorError::NotStarted)
    }

    fn abandon_executor(&self) -> Result<Arc<SerialExecutor>> {
        self.abandon_exec
            .lock()
            .clone()
            .ok_or(AppenderatorError::NotStarted)
    }

    fn reset_next_flush(&self) {
        *self.next_flush.lock() = Instant::now() + self.config.intermediate_persist_period;
    }

    fn get_or_create_sink(&self, identifier: &SegmentIdentifier) -> Arc<Sink> {
        if let Some(existing) = self.sinks.get(identifier) {
            return existing.value().clone();
        }

        let sink = Arc::new(Sink::new(
            identifier.clone(),
            self.schema.clone(),
            self.index_factory.clone(),
            self.config.max_rows_in_memory,
            self.config.max_bytes_in_memory,
        ));
        self.bytes_in_memory
            .fetch_add(self.sink_overhead(), Ordering::SeqCst);

        if let Err(e) = self.announcer.announce(&sink.segment_base()) {
            // Non-fatal: the sink still ingests; the host just won't see it.
            error!(identifier = %identifier, error = %e, "Failed to announce new segment");
        }

        self.sinks.insert(identifier.clone(), sink.clone());
        self.metrics.set_sink_count(self.sinks.len());
        sink
    }

    /// Spills one hydrant. Runs only on the persist executor; idempotent
    /// under the hydrant's own lock. Returns the rows persisted.
    fn persist_hydrant(
        &self,
        hydrant: &Arc<FireHydrant>,
        identifier: &SegmentIdentifier,
    ) -> Result<usize> {
        // The spill directory name comes from metadata, not from the sink:
        // evicted sinks forget their hydrant count, metadata does not.
        let spill_number = self
            .sinks_metadata
            .get(identifier)
            .map(|metadata| metadata.previous_hydrant_count())
            .ok_or_else(|| {
                AppenderatorError::InvalidState(format!(
                    "no sink metadata for identifier [{identifier}] at persist time"
                ))
            })?;

        let started = Instant::now();
        let result = hydrant.with_unswapped_index(|index| {
            let num_rows = index.num_rows();
            let persist_dir = self.create_persist_dir_if_needed(identifier)?;
            let spill_dir = persist_dir.join(spill_number.to_string());
            index.persist(
                identifier.interval(),
                &spill_dir,
                &self.config.index_spec_for_intermediate_persists,
            )?;
            Ok(num_rows)
        });

        match result {
            None => {
                info!(
                    identifier = %identifier,
                    hydrant = hydrant.count(),
                    "Hydrant already swapped, ignoring request to persist"
                );
                Ok(0)
            }
            Some(Ok(num_rows)) => {
                hydrant.finish_swap();
                if let Some(mut metadata) = self.sinks_metadata.get_mut(identifier) {
                    metadata.increment_hydrant_count();
                }
                info!(
                    identifier = %identifier,
                    spill = spill_number,
                    rows = num_rows,
                    millis = started.elapsed().as_millis() as u64,
                    "Persisted in-memory data for segment spill"
                );
                Ok(num_rows)
            }
            Some(Err(e)) => {
                error!(
                    identifier = %identifier,
                    hydrant = hydrant.count(),
                    error = %e,
                    "Incremental persist failed"
                );
                Err(e)
            }
        }
    }

    /// Merges all spills of one reconstructed sink and uploads the result.
    /// Runs only on the merge executor.
    fn merge_and_push(
        &self,
        identifier: &SegmentIdentifier,
        sink: &Arc<Sink>,
        use_unique_path: bool,
    ) -> Result<Option<DataSegment>> {
        let result = self.merge_and_push_inner(identifier, sink, use_unique_path);
        if let Err(ref e) = result {
            self.metrics.increment_failed_handoffs();
            warn!(identifier = %identifier, error = %e, "Failed to push merged segment");
        }
        result
    }

    fn merge_and_push_inner(
        &self,
        identifier: &SegmentIdentifier,
        sink: &Arc<Sink>,
        use_unique_path: bool,
    ) -> Result<Option<DataSegment>> {
        let persist_dir = self.persist_dir(identifier);
        let merged_target = persist_dir.join(MERGED_DIR_NAME);
        let descriptor_file = persist_dir.join(DESCRIPTOR_FILE_NAME);

        if sink.is_writable() {
            return Err(AppenderatorError::InvalidState(format!(
                "expected sink for segment [{identifier}] to be no longer writable before merge"
            )));
        }

        // The descriptor marks a completed push; its presence short-circuits
        // the idempotent re-push before any hydrant sanity applies, since
        // the spills behind a pushed segment are already cleaned up.
        if descriptor_file.exists() {
            if use_unique_path {
                if sink.hydrant_count() == 0 {
                    warn!(
                        identifier = %identifier,
                        "Segment already pushed and its spills were cleaned up; cannot re-push on a unique path"
                    );
                    return Ok(None);
                }
                debug!(
                    identifier = %identifier,
                    "Segment already pushed, but a unique path was requested; pushing again"
                );
            } else {
                info!(identifier = %identifier, "Segment already pushed, skipping");
                let descriptor: DataSegment =
                    serde_json::from_reader(File::open(&descriptor_file)?)?;
                return Ok(Some(descriptor));
            }
        }

        let hydrants = sink.hydrants();
        for hydrant in &hydrants {
            if !hydrant.has_swapped() {
                return Err(AppenderatorError::InvalidState(format!(
                    "expected sink for segment [{identifier}] to be fully persisted before merge"
                )));
            }
        }
        match self
            .sinks_metadata
            .get(identifier)
            .map(|metadata| metadata.num_hydrants())
        {
            None => warn!(identifier = %identifier, "Sink metadata not found just before merge"),
            Some(expected) if expected != hydrants.len() => {
                return Err(AppenderatorError::InvalidState(format!(
                    "number of restored hydrants [{}] for identifier [{identifier}] does not \
                     match expected value [{expected}]",
                    hydrants.len()
                )));
            }
            Some(_) => {}
        }

        // A stale merge workspace from an interrupted earlier push is dead.
        self.remove_directory(&merged_target);
        if merged_target.exists() {
            return Err(AppenderatorError::InvalidState(format!(
                "merged target [{}] still exists after removal",
                merged_target.display()
            )));
        }

        let merge_started = Instant::now();
        let mut indexes: Vec<Arc<dyn QueryableSegment>> = Vec::with_capacity(hydrants.len());
        for hydrant in &hydrants {
            let segment = hydrant.segment().ok_or_else(|| {
                AppenderatorError::InvalidState(format!(
                    "hydrant [{}] of segment [{identifier}] holds no queryable data",
                    hydrant.count()
                ))
            })?;
            indexes.push(segment);
        }
        let total_rows: usize = indexes.iter().map(|segment| segment.num_rows()).sum();

        let merged_dir = self.merger.merge(
            &indexes,
            &self.schema,
            &merged_target,
            &self.config.index_spec,
            self.config.max_columns_to_merge,
        )?;
        let merge_elapsed = merge_started.elapsed();

        let mut base = DataSegment::base(identifier);
        base.num_rows = total_rows as u64;

        // Uploading to deep storage can fail transiently, especially for
        // cloud targets; retry the push step alone.
        let push_started = Instant::now();
        let mut pushed = None;
        let mut last_error = None;
        for attempt in 1..=PUSH_RETRY_ATTEMPTS {
            match self.pusher.push(&merged_dir, &base, use_unique_path) {
                Ok(segment) => {
                    pushed = Some(segment);
                    break;
                }
                Err(e) => {
                    warn!(
                        identifier = %identifier,
                        attempt,
                        error = %e,
                        "Deep storage push failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        let Some(segment) = pushed else {
            return Err(last_error.unwrap_or_else(|| {
                AppenderatorError::InvalidState("push failed without an error".to_string())
            }));
        };
        let push_elapsed = push_started.elapsed();

        // The mapped spills are no longer needed; keeping them referenced
        // across many segments would pin the address space through the rest
        // of the push.
        for hydrant in &hydrants {
            hydrant.swap_segment(None);
        }

        {
            let _commit_guard = self.commit_lock.lock();
            let descriptor_handle = File::create(&descriptor_file)?;
            serde_json::to_writer_pretty(&descriptor_handle, &segment)?;
        }

        // The spills and the merge workspace are dead; the identifier file
        // and the descriptor stay behind as the receipt an idempotent
        // re-push reads. close() sweeps the rest.
        self.remove_spill_directories(identifier)?;

        info!(
            identifier = %identifier,
            bytes = segment.size,
            spills = hydrants.len(),
            merge_millis = merge_elapsed.as_millis() as u64,
            push_millis = push_elapsed.as_millis() as u64,
            "Segment built and pushed to deep storage"
        );

        Ok(Some(segment))
    }

    /// Removes a sink from memory. The returned future resolves after every
    /// in-flight merge has drained (push barrier) and the eviction has run
    /// on the persist thread, so eviction can never race a persist or an
    /// ongoing merge.
    fn remove_sink(
        &self,
        identifier: SegmentIdentifier,
        sink: Arc<Sink>,
        remove_on_disk_data: bool,
    ) -> Result<TaskFuture<Result<()>>> {
        // Ensure no further writes land in this sink, and only decrement the
        // counters on the call that performed the transition.
        if sink.finish_writing() {
            self.rows_in_memory
                .fetch_add(-(sink.num_rows_in_memory() as i64), Ordering::SeqCst);
            self.bytes_in_memory
                .fetch_add(-(sink.bytes_in_memory() as i64), Ordering::SeqCst);
            self.bytes_in_memory
                .fetch_add(-self.sink_overhead(), Ordering::SeqCst);
            let current = sink.current_hydrant();
            for hydrant in sink.hydrants() {
                if !Arc::ptr_eq(&hydrant, &current) {
                    self.bytes_in_memory
                        .fetch_add(-self.hydrant_overhead(), Ordering::SeqCst);
                }
            }
            // total_rows is untouched: the sink hibernates on disk and is
            // revived just before push.
        }

        let push_exec = self.push_executor()?;
        let persist_exec = self.persist_executor()?;
        let this = self.clone_refs();
        self.abandon_executor()?.submit(move || -> Result<()> {
            // Barrier: an empty task through the merge queue resolves only
            // once in-flight pushes have drained past this point.
            push_exec.submit(|| ())?.wait()?;
            persist_exec
                .submit(move || this.evict_sink(&identifier, &sink, remove_on_disk_data))?
                .wait()?
        })
    }

    /// Disk-only variant of [`remove_sink`] for segments whose sink already
    /// left memory: same barrier ordering, nothing to evict.
    ///
    /// [`remove_sink`]: BatchAppenderator::remove_sink
    fn schedule_disk_cleanup(
        &self,
        identifier: SegmentIdentifier,
    ) -> Result<TaskFuture<Result<()>>> {
        let Ok(abandon) = self.abandon_executor() else {
            // Job never started; there is no executor graph and nothing can
            // be racing the removal.
            self.remove_directory(&self.persist_dir(&identifier));
            return Ok(TaskFuture::ready(Ok(())));
        };
        let push_exec = self.push_executor()?;
        let persist_exec = self.persist_executor()?;
        let this = self.clone_refs();
        abandon.submit(move || -> Result<()> {
            push_exec.submit(|| ())?.wait()?;
            persist_exec
                .submit(move || {
                    this.remove_directory(&this.persist_dir(&identifier));
                    Ok(())
                })?
                .wait()?
        })
    }

    /// Runs on the persist executor.
    fn evict_sink(
        &self,
        identifier: &SegmentIdentifier,
        sink: &Arc<Sink>,
        remove_on_disk_data: bool,
    ) -> Result<()> {
        let removed = self
            .sinks
            .remove_if(identifier, |_, live| Arc::ptr_eq(live, sink))
            .is_some();
        if !removed {
            error!(identifier = %identifier, "Sink no longer valid, not abandoning");
            return Ok(());
        }
        self.metrics.set_sink_count(self.sinks.len());

        for hydrant in sink.hydrants() {
            hydrant.swap_segment(None);
        }
        if remove_on_disk_data {
            self.remove_directory(&self.persist_dir(identifier));
        }

        info!(identifier = %identifier, "Removed sink");
        Ok(())
    }

    /// Segment directories under the base dir, recognized by their
    /// identifier file. Listing order is unspecified.
    pub fn persisted_identifier_paths(&self) -> Result<Vec<PathBuf>> {
        let base_dir = &self.config.base_persist_directory;
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(IDENTIFIER_FILE_NAME).is_file() {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Reconstructs a non-writable sink from one persisted segment
    /// directory: the identifier file plus its numbered spill directories,
    /// reopened as memory-mapped segments in numeric order.
    pub fn identifier_and_sink_for_persisted_dir(
        &self,
        dir: &Path,
    ) -> Result<(SegmentIdentifier, Arc<Sink>)> {
        let identifier_file = dir.join(IDENTIFIER_FILE_NAME);
        let identifier: SegmentIdentifier =
            serde_json::from_reader(File::open(&identifier_file)?)?;

        // Numeric names only, so "merged" and the receipt files are skipped.
        let mut spill_dirs: Vec<(usize, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str())
                && let Ok(number) = name.parse::<usize>()
            {
                spill_dirs.push((number, path));
            }
        }
        spill_dirs.sort_by_key(|(number, _)| *number);

        let mut hydrants = Vec::new();
        for (number, spill_dir) in spill_dirs {
            debug!(
                dir = %spill_dir.display(),
                "Loading previously persisted partial segment"
            );
            if number != hydrants.len() {
                return Err(AppenderatorError::InvalidState(format!(
                    "missing spill [{}] in identifier [{identifier}]",
                    hydrants.len()
                )));
            }
            let segment = self.merger.load(&spill_dir)?;
            hydrants.push(Arc::new(FireHydrant::from_segment(segment, number)));
        }

        let sink = Arc::new(Sink::from_persisted(
            identifier.clone(),
            self.schema.clone(),
            self.index_factory.clone(),
            self.config.max_rows_in_memory,
            self.config.max_bytes_in_memory,
            hydrants,
        ));
        Ok((identifier, sink))
    }

    fn persist_dir(&self, identifier: &SegmentIdentifier) -> PathBuf {
        self.config
            .base_persist_directory
            .join(identifier.to_string())
    }

    fn create_persist_dir_if_needed(&self, identifier: &SegmentIdentifier) -> Result<PathBuf> {
        let persist_dir = self.persist_dir(identifier);
        fs::create_dir_all(&persist_dir)?;

        let identifier_file = persist_dir.join(IDENTIFIER_FILE_NAME);
        let handle = File::create(&identifier_file)
            .map_err(|e| AppenderatorError::io_at(&identifier_file, e))?;
        serde_json::to_writer(&handle, identifier)?;

        Ok(persist_dir)
    }

    /// Deletes the numbered spill directories and the merge workspace after
    /// a successful push, leaving the identifier file and descriptor as the
    /// receipt.
    fn remove_spill_directories(&self, identifier: &SegmentIdentifier) -> Result<()> {
        let persist_dir = self.persist_dir(identifier);
        for entry in fs::read_dir(&persist_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let numeric = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.parse::<usize>().is_ok());
            let merged = path
                .file_name()
                .is_some_and(|name| name == MERGED_DIR_NAME);
            if numeric || merged {
                self.remove_directory(&path);
            }
        }
        Ok(())
    }

    fn remove_directory(&self, target: &Path) {
        if target.exists() {
            match fs::remove_dir_all(target) {
                Ok(()) => info!(dir = %target.display(), "Removed directory"),
                Err(e) => {
                    error!(dir = %target.display(), error = %e, "Failed to remove directory")
                }
            }
        }
    }

    fn sink_overhead(&self) -> i64 {
        if self.config.skip_bytes_in_memory_overhead_check {
            0
        } else {
            ROUGH_OVERHEAD_PER_SINK
        }
    }

    fn hydrant_overhead(&self) -> i64 {
        if self.config.skip_bytes_in_memory_overhead_check {
            0
        } else {
            HYDRANT_HEADER_BYTES + ROUGH_OVERHEAD_PER_HYDRANT
        }
    }

    fn clone_refs(&self) -> BatchAppenderator {
        BatchAppenderator {
            id: self.id.clone(),
            schema: self.schema.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            index_factory: self.index_factory.clone(),
            merger: self.merger.clone(),
            pusher: self.pusher.clone(),
            announcer: self.announcer.clone(),
            walker: self.walker.clone(),
            sinks: self.sinks.clone(),
            sinks_metadata: self.sinks_metadata.clone(),
            rows_in_memory: self.rows_in_memory.clone(),
            bytes_in_memory: self.bytes_in_memory.clone(),
            total_rows: self.total_rows.clone(),
            next_flush: self.next_flush.clone(),
            persist_error: self.persist_error.clone(),
            commit_lock: self.commit_lock.clone(),
            closed: self.closed.clone(),
            persist_exec: self.persist_exec.clone(),
            push_exec: self.push_exec.clone(),
            abandon_exec: self.abandon_exec.clone(),
            dir_lock: self.dir_lock.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::ShardSpec;
    use tempfile::TempDir;

    fn schema() -> DataSchema {
        DataSchema::new("events", vec!["host".to_string()])
    }

    fn identifier() -> SegmentIdentifier {
        SegmentIdentifier::new(
            "events",
            Interval::new(0, 86_400_000),
            "v1",
            ShardSpec::default(),
        )
    }

    fn build(temp_dir: &TempDir) -> BatchAppenderator {
        BatchAppenderator::builder()
            .with_schema(schema())
            .with_config(AppenderatorConfig::new(temp_dir.path().join("persist")))
            .with_deep_storage_directory(temp_dir.path().join("deep"))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_schema_config_and_pusher() {
        assert!(matches!(
            BatchAppenderator::builder().build(),
            Err(AppenderatorError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            BatchAppenderator::builder().with_schema(schema()).build(),
            Err(AppenderatorError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            BatchAppenderator::builder()
                .with_schema(schema())
                .with_config(AppenderatorConfig::new("/tmp/appenderator-test"))
                .build(),
            Err(AppenderatorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn add_validates_its_arguments() {
        let temp_dir = TempDir::new().unwrap();
        let appenderator = build(&temp_dir);
        appenderator.start_job().unwrap();

        struct SomeCommitter;
        impl Committer for SomeCommitter {
            fn commit_metadata(&self) -> serde_json::Value {
                serde_json::Value::Null
            }
        }

        let row = InputRow::new(1000);
        assert!(matches!(
            appenderator.add(&identifier(), &row, Some(&SomeCommitter), true),
            Err(AppenderatorError::CommitterNotSupported)
        ));
        assert!(matches!(
            appenderator.add(&identifier(), &row, None, false),
            Err(AppenderatorError::IncrementalPersistsRequired)
        ));

        let foreign = SegmentIdentifier::new(
            "other_source",
            Interval::new(0, 1000),
            "v1",
            ShardSpec::default(),
        );
        assert!(matches!(
            appenderator.add(&foreign, &row, None, true),
            Err(AppenderatorError::WrongDataSource { .. })
        ));

        appenderator.close().unwrap();
    }

    #[test]
    fn add_registers_rows_without_triggering_persist() {
        let temp_dir = TempDir::new().unwrap();
        let appenderator = build(&temp_dir);
        appenderator.start_job().unwrap();

        let result = appenderator
            .add(&identifier(), &InputRow::new(1000), None, true)
            .unwrap();
        assert_eq!(result.num_rows_in_segment, 1);
        assert!(!result.is_persist_required);
        assert_eq!(appenderator.rows_in_memory(), 1);
        assert_eq!(appenderator.get_total_row_count(), 1);

        appenderator.close().unwrap();
    }

    #[test]
    fn query_runners_require_a_walker() {
        let temp_dir = TempDir::new().unwrap();
        let appenderator = build(&temp_dir);
        assert!(matches!(
            appenderator.query_runner_for_intervals(&[Interval::new(0, 100)]),
            Err(AppenderatorError::QueriesNotSupported)
        ));
        assert!(matches!(
            appenderator.query_runner_for_segments(&[]),
            Err(AppenderatorError::QueriesNotSupported)
        ));
    }

    #[test]
    fn row_count_lookup_fails_for_unknown_segment() {
        let temp_dir = TempDir::new().unwrap();
        let appenderator = build(&temp_dir);
        assert!(matches!(
            appenderator.get_row_count(&identifier()),
            Err(AppenderatorError::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn overhead_estimates_respect_skip_flag() {
        let temp_dir = TempDir::new().unwrap();
        let appenderator = build(&temp_dir);
        assert_eq!(appenderator.sink_overhead(), ROUGH_OVERHEAD_PER_SINK);
        assert!(appenderator.hydrant_overhead() > ROUGH_OVERHEAD_PER_HYDRANT);

        let mut config = AppenderatorConfig::new(temp_dir.path().join("persist2"));
        config.skip_bytes_in_memory_overhead_check = true;
        let skipping = BatchAppenderator::builder()
            .with_schema(schema())
            .with_config(config)
            .with_deep_storage_directory(temp_dir.path().join("deep2"))
            .build()
            .unwrap();
        assert_eq!(skipping.sink_overhead(), 0);
        assert_eq!(skipping.hydrant_overhead(), 0);
    }

    #[test]
    fn operations_fail_after_close() {
        let temp_dir = TempDir::new().unwrap();
        let appenderator = build(&temp_dir);
        appenderator.start_job().unwrap();
        appenderator.close().unwrap();

        assert!(matches!(
            appenderator.add(&identifier(), &InputRow::new(1), None, true),
            Err(AppenderatorError::ShuttingDown)
        ));
        assert!(matches!(
            appenderator.push(&[], None, false),
            Err(AppenderatorError::ShuttingDown)
        ));
        // close is idempotent.
        appenderator.close().unwrap();
    }
}
