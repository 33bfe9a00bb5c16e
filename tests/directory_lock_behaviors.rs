//! Exclusive ownership of the base persist directory.

use appenderator::{AppenderatorConfig, AppenderatorError, BatchAppenderator, DataSchema};
use tempfile::TempDir;

fn schema() -> DataSchema {
    DataSchema::new("events", vec![])
}

fn build_appenderator(temp_dir: &TempDir) -> BatchAppenderator {
    BatchAppenderator::builder()
        .with_schema(schema())
        .with_config(AppenderatorConfig::new(temp_dir.path().join("persist")))
        .with_deep_storage_directory(temp_dir.path().join("deep"))
        .build()
        .unwrap()
}

#[test]
fn second_appenderator_cannot_start_against_a_locked_directory() {
    let temp_dir = TempDir::new().unwrap();

    let first = build_appenderator(&temp_dir);
    first.start_job().unwrap();

    let second = build_appenderator(&temp_dir);
    assert!(matches!(
        second.start_job(),
        Err(AppenderatorError::LockUnavailable { .. })
    ));

    // close releases the lock; a fresh job can claim the directory.
    first.close().unwrap();
    let third = build_appenderator(&temp_dir);
    third.start_job().unwrap();
    third.close().unwrap();
}

#[test]
fn close_now_keeps_the_lock_until_the_appenderator_is_dropped() {
    let temp_dir = TempDir::new().unwrap();

    let first = build_appenderator(&temp_dir);
    first.start_job().unwrap();
    first.close_now().unwrap();

    // The lock survives close_now on purpose: a restored job against the
    // same directory must fail while this one is still alive.
    let second = build_appenderator(&temp_dir);
    assert!(matches!(
        second.start_job(),
        Err(AppenderatorError::LockUnavailable { .. })
    ));

    drop(first);
    second.start_job().unwrap();
    second.close().unwrap();
}

#[test]
fn start_job_is_idempotent_while_running() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = build_appenderator(&temp_dir);
    appenderator.start_job().unwrap();
    appenderator.start_job().unwrap();
    appenderator.close().unwrap();
}
