//! Property tests: generation monotonicity and snapshot consistency

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use orbit::role::ProcessRole;
use orbit::schema::{Field, FieldType, FieldValue, FieldValues, RecordSchema, RecordTiming};
use orbit_record_bus::{BusError, Generation, RecordReader, RecordStore};
use proptest::prelude::*;
use tempfile::TempDir;

const FIELDS: u16 = 8;

fn schema() -> Arc<RecordSchema> {
    let fields = (1..=FIELDS)
        .map(|i| Field::new(i, format!("sensor[{}]", i - 1), FieldType::Integer, ProcessRole::Engineering))
        .collect();
    Arc::new(
        RecordSchema::new(
            "sensors",
            fields,
            RecordTiming::from_interval(Duration::from_millis(10), 5),
            false,
        )
        .unwrap(),
    )
}

fn uniform(value: i64) -> FieldValues {
    (1..=FIELDS).fold(FieldValues::new(), |values, i| values.with(i, value))
}

#[derive(Debug, Clone)]
enum Step {
    Publish(i64),
    Delete,
    Corrupt(usize),
    Rejected,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => any::<i64>().prop_map(Step::Publish),
        1 => Just(Step::Delete),
        1 => any::<usize>().prop_map(Step::Corrupt),
        1 => Just(Step::Rejected),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn generations_strictly_increase(steps in prop::collection::vec(step(), 1..40)) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path(), schema(), false).unwrap();
        let mut last = Generation::ZERO;

        for step in steps {
            match step {
                Step::Publish(value) => {
                    let snapshot = store.publish(ProcessRole::Engineering, &uniform(value)).unwrap();
                    prop_assert!(snapshot.generation() > last);
                    last = snapshot.generation();
                }
                Step::Delete => {
                    let _ = std::fs::remove_file(store.path());
                }
                Step::Corrupt(at) => {
                    if let Ok(mut bytes) = std::fs::read(store.path()) {
                        let at = at % bytes.len();
                        bytes[at] ^= 0x5A;
                        std::fs::write(store.path(), &bytes).unwrap();
                    }
                }
                Step::Rejected => {
                    let result = store.publish(ProcessRole::Piloting, &uniform(0));
                    let is_violation = matches!(result, Err(BusError::OwnershipViolation { .. }));
                    prop_assert!(is_violation);
                }
            }
            prop_assert!(store.generation().unwrap() >= last);
        }
    }

    #[test]
    fn read_returns_last_accepted_publish(values in prop::collection::vec(any::<i64>(), 1..20)) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path(), schema(), false).unwrap();
        let mut reader = RecordReader::new(store.clone());

        for (i, value) in values.iter().enumerate() {
            store.publish(ProcessRole::Engineering, &uniform(*value)).unwrap();
            let snapshot = reader.read().unwrap();
            prop_assert_eq!(snapshot.generation(), Generation::new(i as u64 + 1));
            prop_assert_eq!(snapshot.value(FIELDS), Some(&FieldValue::Integer(*value)));
        }
    }
}

#[test]
fn concurrent_reader_never_sees_torn_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::open(dir.path(), schema(), false).unwrap();
    store.publish(ProcessRole::Engineering, &uniform(0)).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let store = store.clone();
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut reader = RecordReader::new(store);
            let mut reads = 0u32;
            let mut last = Generation::ZERO;
            while !done.load(Ordering::Acquire) {
                let snapshot = reader.read().unwrap();
                assert!(snapshot.generation() >= last);
                last = snapshot.generation();

                let first = snapshot.value(1).cloned();
                for i in 2..=FIELDS {
                    assert_eq!(snapshot.value(i).cloned(), first, "torn read at {}", snapshot.generation());
                }
                reads += 1;
            }
            reads
        })
    };

    for value in 1..=200 {
        store.publish(ProcessRole::Engineering, &uniform(value)).unwrap();
    }
    done.store(true, Ordering::Release);

    let reads = reader.join().unwrap();
    assert!(reads > 0);
    assert_eq!(store.read_latest().unwrap().generation(), Generation::new(201));
}
