//! Co-owned record merges between concurrent writers

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use orbit::config::BusConfig;
use orbit::role::ProcessRole;
use orbit::schema::{Field, FieldType, FieldValue, FieldValues, RecordSchema, RecordTiming};
use orbit_record_bus::{BackupCoordinator, BusError, BusResult, CaptureOutcome, Generation, RecordStore};
use tempfile::TempDir;

fn backup_schema() -> Arc<RecordSchema> {
    let mut fields = Vec::new();
    for i in 1..=10 {
        fields.push(Field::new(
            i,
            format!("engineering_state[{}]", i - 1),
            FieldType::FloatingPoint,
            ProcessRole::Engineering,
        ));
    }
    for i in 11..=20 {
        fields.push(Field::new(
            i,
            format!("piloting_state[{}]", i - 11),
            FieldType::FloatingPoint,
            ProcessRole::Piloting,
        ));
    }
    Arc::new(
        RecordSchema::new(
            "backup",
            fields,
            RecordTiming::from_interval(Duration::from_millis(1000), 5),
            false,
        )
        .unwrap(),
    )
}

fn range_values(range: std::ops::RangeInclusive<u16>, value: f64) -> FieldValues {
    range.fold(FieldValues::new(), |values, i| values.with(i, value))
}

#[test]
fn test_two_roles_fill_the_record() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), backup_schema(), false)?;

    let first = store.publish(ProcessRole::Engineering, &range_values(1..=10, 1.0))?;
    assert_eq!(first.values().len(), 10);
    assert!(matches!(
        store.read_field(11),
        Err(BusError::FieldNotPublished { index: 11, .. })
    ));

    let second = store.publish(ProcessRole::Piloting, &range_values(11..=20, 2.0))?;
    assert_eq!(second.values().len(), 20);
    assert!(second.generation() > first.generation());

    let latest = store.read_latest()?;
    for i in 1..=10 {
        assert_eq!(latest.value(i), Some(&FieldValue::Float(1.0)));
    }
    for i in 11..=20 {
        assert_eq!(latest.value(i), Some(&FieldValue::Float(2.0)));
    }
    Ok(())
}

#[test]
fn test_partial_update_preserves_other_fields() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), backup_schema(), false)?;
    store.publish(ProcessRole::Engineering, &range_values(1..=10, 1.0))?;
    store.publish(ProcessRole::Piloting, &range_values(11..=20, 2.0))?;

    store.publish(ProcessRole::Piloting, &FieldValues::new().with(15, 9.5))?;

    let latest = store.read_latest()?;
    assert_eq!(latest.generation(), Generation::new(3));
    assert_eq!(latest.value(1), Some(&FieldValue::Float(1.0)));
    assert_eq!(latest.value(14), Some(&FieldValue::Float(2.0)));
    assert_eq!(latest.value(15), Some(&FieldValue::Float(9.5)));
    Ok(())
}

#[test]
fn test_co_owner_cannot_write_other_half() -> BusResult<()> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), backup_schema(), false)?;
    assert!(matches!(
        store.publish(ProcessRole::Engineering, &FieldValues::new().with(11, 0.0)),
        Err(BusError::OwnershipViolation { index: 11, .. })
    ));
    Ok(())
}

#[test]
fn test_concurrent_co_owners_never_lose_updates() -> BusResult<()> {
    const ROUNDS: u16 = 25;

    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path(), backup_schema(), false)?;

    let writer = |role: ProcessRole, range: std::ops::RangeInclusive<u16>| {
        let store = store.clone();
        std::thread::spawn(move || -> BusResult<Vec<Generation>> {
            let mut generations = Vec::new();
            for round in 0..ROUNDS {
                let snapshot =
                    store.publish(role, &range_values(range.clone(), f64::from(round)))?;
                generations.push(snapshot.generation());
            }
            Ok(generations)
        })
    };

    let engineering = writer(ProcessRole::Engineering, 1..=10);
    let piloting = writer(ProcessRole::Piloting, 11..=20);
    let engineering = engineering.join().unwrap()?;
    let piloting = piloting.join().unwrap()?;

    for generations in [&engineering, &piloting] {
        assert!(generations.windows(2).all(|w| w[0] < w[1]));
    }

    let all: BTreeSet<_> = engineering.iter().chain(piloting.iter()).copied().collect();
    assert_eq!(all.len(), 2 * ROUNDS as usize, "generation issued twice");

    let latest = store.read_latest()?;
    assert_eq!(latest.generation(), Generation::new(2 * ROUNDS as u64));
    assert!(latest.generation() > *engineering.last().unwrap());
    let last_round = FieldValue::Float(f64::from(ROUNDS - 1));
    for i in 1..=20 {
        assert_eq!(latest.value(i), Some(&last_round), "field {i}");
    }
    Ok(())
}

#[test]
fn test_unreadable_record_merges_onto_backup() -> BusResult<()> {
    let dir = TempDir::new()?;
    let bus = BusConfig::in_dir(dir.path());
    let store = RecordStore::from_config(&bus, backup_schema())?;
    let backups = BackupCoordinator::from_config(&bus)?;

    store.publish(ProcessRole::Engineering, &FieldValues::new().with(1, 12.5))?;
    store.publish(ProcessRole::Piloting, &FieldValues::new().with(11, 3.0))?;
    assert_eq!(backups.capture(&store)?, CaptureOutcome::Captured(Generation::new(2)));

    std::fs::write(store.path(), b"garbage")?;
    let merged = store.publish(ProcessRole::Piloting, &FieldValues::new().with(11, 4.0))?;
    assert_eq!(merged.generation(), Generation::new(3));
    assert_eq!(merged.value(1), Some(&FieldValue::Float(12.5)));
    assert_eq!(merged.value(11), Some(&FieldValue::Float(4.0)));

    let latest = store.read_latest()?;
    assert_eq!(latest.value(1), Some(&FieldValue::Float(12.5)));
    assert_eq!(latest.value(11), Some(&FieldValue::Float(4.0)));
    Ok(())
}

#[test]
fn test_unreadable_record_without_backup_rejects_publish() -> BusResult<()> {
    let dir = TempDir::new()?;
    let bus = BusConfig::in_dir(dir.path());
    let store = RecordStore::from_config(&bus, backup_schema())?;

    store.publish(ProcessRole::Engineering, &FieldValues::new().with(1, 12.5))?;
    std::fs::write(store.path(), b"garbage")?;

    assert!(matches!(
        store.publish(ProcessRole::Piloting, &FieldValues::new().with(11, 4.0)),
        Err(BusError::RecordCorrupted { .. })
    ));
    assert_eq!(std::fs::read(store.path())?, b"garbage");
    assert_eq!(store.generation()?, Generation::new(1));
    Ok(())
}
