//! Basic functionality tests for the Orbit record bus

use std::sync::Arc;
use std::time::Duration;

use orbit::role::ProcessRole;
use orbit::schema::{Field, FieldType, FieldValue, FieldValues, RecordSchema, RecordTiming};
use orbit_record_bus::{BusError, BusResult, Generation, RecordDiscovery, RecordReader, RecordStore};
use tempfile::TempDir;

fn engineering_schema() -> Arc<RecordSchema> {
    Arc::new(
        RecordSchema::new(
            "engineering",
            vec![
                Field::new(1, "throttle", FieldType::FloatingPoint, ProcessRole::Engineering)
                    .read_by([ProcessRole::Piloting]),
                Field::new(2, "engine_mode", FieldType::Character, ProcessRole::Engineering),
                Field::new(3, "navmode", FieldType::FixedString(16), ProcessRole::Engineering),
                Field::new(4, "coolant_pump", FieldType::Integer, ProcessRole::Engineering),
            ],
            RecordTiming::from_interval(Duration::from_millis(100), 5),
            true,
        )
        .unwrap(),
    )
}

fn full_values(throttle: f64) -> FieldValues {
    FieldValues::new()
        .with(1, throttle)
        .with(2, 'F')
        .with(3, "orbit")
        .with(4, 1)
}

#[test]
fn test_basic_publish_read() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;

    let published = store.publish(ProcessRole::Engineering, &full_values(0.75))?;
    let read = store.read_latest()?;

    assert_eq!(read.generation(), Generation::new(1));
    assert_eq!(read.published_by(), ProcessRole::Engineering);
    assert_eq!(*read, *published);
    assert_eq!(read.value(1), Some(&FieldValue::Float(0.75)));
    assert_eq!(read.value(2), Some(&FieldValue::Char('F')));
    assert_eq!(read.value(3), Some(&FieldValue::Text("orbit".to_string())));
    Ok(())
}

#[test]
fn test_fifth_publish_is_generation_five() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;

    for i in 0..4 {
        store.publish(ProcessRole::Engineering, &full_values(i as f64 / 10.0))?;
    }
    store.publish(ProcessRole::Engineering, &full_values(0.75))?;

    let mut reader = RecordReader::new(RecordStore::open(dir.path(), engineering_schema(), false)?);
    let snapshot = reader.read()?;
    assert_eq!(snapshot.generation(), Generation::new(5));
    assert_eq!(snapshot.value(1).and_then(FieldValue::as_f64), Some(0.75));
    assert_eq!(store.read_field(1)?, FieldValue::Float(0.75));
    Ok(())
}

#[test]
fn test_foreign_field_rejected_without_side_effects() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;
    store.publish(ProcessRole::Engineering, &full_values(0.5))?;

    let result = store.publish(ProcessRole::Piloting, &FieldValues::new().with(1, 0.9));
    match result {
        Err(BusError::OwnershipViolation { record, role, index }) => {
            assert_eq!(record, "engineering");
            assert_eq!(role, ProcessRole::Piloting);
            assert_eq!(index, 1);
        }
        other => panic!("expected ownership violation, got {other:?}"),
    }

    let latest = store.read_latest()?;
    assert_eq!(latest.generation(), Generation::new(1));
    assert_eq!(latest.value(1), Some(&FieldValue::Float(0.5)));
    Ok(())
}

#[test]
fn test_rejected_values() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;

    let wrong_type = full_values(0.5).with(1, "fast");
    assert!(matches!(
        store.publish(ProcessRole::Engineering, &wrong_type),
        Err(BusError::TypeMismatch { index: 1, .. })
    ));

    let too_long = full_values(0.5).with(3, "a navmode longer than sixteen bytes");
    assert!(matches!(
        store.publish(ProcessRole::Engineering, &too_long),
        Err(BusError::TypeMismatch { index: 3, .. })
    ));

    let unknown = full_values(0.5).with(99, 1);
    assert!(matches!(
        store.publish(ProcessRole::Engineering, &unknown),
        Err(BusError::UnknownField { index: 99, .. })
    ));

    let partial = FieldValues::new().with(1, 0.5);
    assert!(matches!(
        store.publish(ProcessRole::Engineering, &partial),
        Err(BusError::IncompleteSnapshot { missing: 3, first: 2, .. })
    ));

    assert!(matches!(
        store.read_latest(),
        Err(BusError::RecordUnavailable { .. })
    ));
    assert_eq!(store.generation()?, Generation::ZERO);
    Ok(())
}

#[test]
fn test_corrupted_file_detected_and_generation_continues() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;
    store.publish(ProcessRole::Engineering, &full_values(0.1))?;
    store.publish(ProcessRole::Engineering, &full_values(0.2))?;

    let mut bytes = std::fs::read(store.path())?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(store.path(), &bytes)?;

    let err = store.read_latest().unwrap_err();
    assert!(matches!(err, BusError::RecordCorrupted { .. }));
    assert!(err.is_unreadable());

    let next = store.publish(ProcessRole::Engineering, &full_values(0.3))?;
    assert_eq!(next.generation(), Generation::new(3));
    Ok(())
}

#[test]
fn test_deleted_file_keeps_generations_monotonic() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;
    for _ in 0..3 {
        store.publish(ProcessRole::Engineering, &full_values(0.1))?;
    }
    std::fs::remove_file(store.path())?;

    let next = store.publish(ProcessRole::Engineering, &full_values(0.1))?;
    assert_eq!(next.generation(), Generation::new(4));
    Ok(())
}

#[test]
fn test_reader_change_detection() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;
    let mut reader = RecordReader::new(store.clone());

    assert!(!reader.has_changed());
    store.publish(ProcessRole::Engineering, &full_values(0.1))?;
    assert!(reader.has_changed());

    let first = reader.read()?;
    assert!(!reader.has_changed());
    let again = reader.read()?;
    assert!(Arc::ptr_eq(&first, &again));

    std::fs::write(store.path(), b"garbage")?;
    assert!(reader.read().is_err());
    assert_eq!(reader.held().map(|s| s.generation()), Some(Generation::new(1)));
    Ok(())
}

#[test]
fn test_concurrent_readers() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;
    store.publish(ProcessRole::Engineering, &full_values(0.42))?;

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || -> BusResult<()> {
                let mut reader = RecordReader::new(store);
                let snapshot = reader.read()?;
                assert_eq!(snapshot.value(1), Some(&FieldValue::Float(0.42)));
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap()?;
    }
    Ok(())
}

#[test]
fn test_discovery_lists_published_records() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;
    store.publish(ProcessRole::Engineering, &full_values(0.1))?;

    let records = RecordDiscovery::list(dir.path())?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "engineering");
    assert_eq!(records[0].generation, 1);
    assert_eq!(records[0].field_count, 4);
    assert_eq!(records[0].layout_hash, store.schema().layout_hash());
    Ok(())
}

#[test]
fn test_snapshot_json() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), engineering_schema(), false)?;
    let snapshot = store.publish(ProcessRole::Engineering, &full_values(0.25))?;

    let json = snapshot.to_json(store.schema());
    assert_eq!(json["fields"]["throttle"], 0.25);
    assert_eq!(json["fields"]["navmode"], "orbit");
    Ok(())
}
