//! Counters the appenderator feeds while ingesting.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Atomic counters for persist/push activity. Cheap to share and read from
/// any thread; an emitter can snapshot them on whatever schedule it likes.
#[derive(Debug, Default)]
pub struct AppenderatorMetrics {
    num_persists: AtomicU64,
    failed_persists: AtomicU64,
    failed_handoffs: AtomicU64,
    rows_out: AtomicU64,
    persist_time_millis: AtomicU64,
    persist_back_pressure_millis: AtomicU64,
    sink_count: AtomicUsize,
    message_max_timestamp: AtomicI64,
}

impl AppenderatorMetrics {
    pub fn new() -> Self {
        Self {
            message_max_timestamp: AtomicI64::new(i64::MIN),
            ..Self::default()
        }
    }

    pub fn increment_num_persists(&self) {
        self.num_persists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed_persists(&self) {
        self.failed_persists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed_handoffs(&self) {
        self.failed_handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rows_out(&self, rows: u64) {
        self.rows_out.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn increment_persist_time_millis(&self, millis: u64) {
        self.persist_time_millis.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn increment_persist_back_pressure_millis(&self, millis: u64) {
        self.persist_back_pressure_millis
            .fetch_add(millis, Ordering::Relaxed);
    }

    pub fn set_sink_count(&self, count: usize) {
        self.sink_count.store(count, Ordering::Relaxed);
    }

    pub fn report_message_max_timestamp(&self, timestamp: i64) {
        self.message_max_timestamp
            .fetch_max(timestamp, Ordering::Relaxed);
    }

    pub fn num_persists(&self) -> u64 {
        self.num_persists.load(Ordering::Relaxed)
    }

    pub fn failed_persists(&self) -> u64 {
        self.failed_persists.load(Ordering::Relaxed)
    }

    pub fn failed_handoffs(&self) -> u64 {
        self.failed_handoffs.load(Ordering::Relaxed)
    }

    pub fn rows_out(&self) -> u64 {
        self.rows_out.load(Ordering::Relaxed)
    }

    pub fn persist_time_millis(&self) -> u64 {
        self.persist_time_millis.load(Ordering::Relaxed)
    }

    pub fn persist_back_pressure_millis(&self) -> u64 {
        self.persist_back_pressure_millis.load(Ordering::Relaxed)
    }

    pub fn sink_count(&self) -> usize {
        self.sink_count.load(Ordering::Relaxed)
    }

    pub fn message_max_timestamp(&self) -> i64 {
        self.message_max_timestamp.load(Ordering::Relaxed)
    }
}
