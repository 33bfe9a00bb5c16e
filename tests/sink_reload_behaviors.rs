//! Reconstructing sinks from persisted spill directories.

use appenderator::{
    AppenderatorConfig, AppenderatorError, BatchAppenderator, DataSchema, InputRow, Interval,
    SegmentIdentifier, ShardSpec,
};
use std::fs;
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

fn row(timestamp: i64) -> InputRow {
    let mut row = InputRow::new(timestamp);
    row.set_dimension("host", "server1");
    row
}

fn build_appenderator(temp_dir: &TempDir, max_rows_in_memory: usize) -> BatchAppenderator {
    let config = {
        let mut config = AppenderatorConfig::new(temp_dir.path().join("persist"));
        config.max_rows_in_memory = max_rows_in_memory;
        config
    };
    let appenderator = BatchAppenderator::builder()
        .with_schema(schema())
        .with_config(config)
        .with_deep_storage_directory(temp_dir.path().join("deep"))
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    appenderator
}

#[test]
fn reloaded_sink_restores_hydrants_in_numeric_order() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = build_appenderator(&temp_dir, 100);
    let id = identifier();

    // Two row-trigger persists plus one explicit persist of the tail.
    for i in 0..250 {
        appenderator.add(&id, &row(i), None, true).unwrap();
    }
    appenderator
        .persist_all(None)
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();

    let paths = appenderator.persisted_identifier_paths().unwrap();
    assert_eq!(paths.len(), 1);

    let (reloaded_id, sink) = appenderator
        .identifier_and_sink_for_persisted_dir(&paths[0])
        .unwrap();
    assert_eq!(reloaded_id, id);
    assert!(!sink.is_writable());

    let hydrants = sink.hydrants();
    assert_eq!(hydrants.len(), 3);
    for (expected, hydrant) in hydrants.iter().enumerate() {
        assert_eq!(hydrant.count(), expected);
        assert!(hydrant.has_swapped());
    }
    assert_eq!(sink.num_rows_total(), 250);

    appenderator.close().unwrap();
}

#[test]
fn reload_rejects_non_contiguous_spills() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = build_appenderator(&temp_dir, 50);
    let id = identifier();

    for i in 0..150 {
        appenderator.add(&id, &row(i), None, true).unwrap();
    }

    let persist_dir = temp_dir.path().join("persist").join(id.to_string());
    fs::remove_dir_all(persist_dir.join("1")).unwrap();

    let paths = appenderator.persisted_identifier_paths().unwrap();
    let result = appenderator.identifier_and_sink_for_persisted_dir(&paths[0]);
    assert!(matches!(result, Err(AppenderatorError::InvalidState(_))));

    appenderator.close().unwrap();
}

#[test]
fn push_fails_when_hydrant_count_disagrees_with_metadata() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = build_appenderator(&temp_dir, 50);
    let id = identifier();

    for i in 0..100 {
        appenderator.add(&id, &row(i), None, true).unwrap();
    }

    // Deleting the tail spill keeps numbering contiguous but breaks the
    // metadata hydrant count, which the merge sanity check must catch.
    let persist_dir = temp_dir.path().join("persist").join(id.to_string());
    fs::remove_dir_all(persist_dir.join("1")).unwrap();

    let result = appenderator
        .push(&[id], None, false)
        .unwrap()
        .wait()
        .unwrap();
    assert!(matches!(result, Err(AppenderatorError::InvalidState(_))));
    assert_eq!(appenderator.metrics().failed_handoffs(), 1);

    appenderator.close().unwrap();
}

#[test]
fn spill_directories_survive_eviction_until_push() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = build_appenderator(&temp_dir, 60);
    let id = identifier();

    for i in 0..60 {
        appenderator.add(&id, &row(i), None, true).unwrap();
    }
    // The sink left memory, but its spill is intact and metadata remembers
    // the rows.
    assert!(appenderator.get_segments().is_empty());
    assert_eq!(appenderator.get_row_count(&id).unwrap(), 60);
    assert_eq!(appenderator.bytes_in_memory_for(&id), 0);

    let persist_dir = temp_dir.path().join("persist").join(id.to_string());
    assert!(persist_dir.join("identifier.json").is_file());
    assert!(persist_dir.join("0").is_dir());

    let pushed = appenderator
        .push(&[id], None, false)
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();
    assert_eq!(pushed.segments[0].num_rows, 60);

    appenderator.close().unwrap();
}
