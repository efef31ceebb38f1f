//! Subscriber-side record reader

use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::BusResult;
use crate::generation::Generation;
use crate::snapshot::RecordSnapshot;
use crate::store::RecordStore;

/// Reader handle that never reports a generation older than one it has
/// already returned.
///
/// A regression on disk (record file restored from an old copy, another
/// process replaying a stale stage) is logged and answered with the snapshot
/// already held.
#[derive(Debug, Clone)]
pub struct RecordReader {
    store: RecordStore,
    last_seen: Generation,
    held: Option<Arc<RecordSnapshot>>,
}

impl RecordReader {
    /// Reader over `store`. Nothing is read until the first call.
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            last_seen: Generation::ZERO,
            held: None,
        }
    }

    /// Read the latest snapshot.
    pub fn read(&mut self) -> BusResult<Arc<RecordSnapshot>> {
        let latest = self.store.read_latest()?;
        if let Some(held) = &self.held {
            if latest.generation() < held.generation() {
                warn!(
                    record = %self.store.name(),
                    held = %held.generation(),
                    on_disk = %latest.generation(),
                    "record generation regressed, keeping held snapshot"
                );
                return Ok(Arc::clone(held));
            }
            if latest.generation() == held.generation() {
                return Ok(Arc::clone(held));
            }
        }

        trace!(record = %self.store.name(), generation = %latest.generation(), "new snapshot");
        self.last_seen = latest.generation();
        self.held = Some(Arc::clone(&latest));
        Ok(latest)
    }

    /// Whether the file holds a newer generation than the last one read.
    /// Only the header is read.
    pub fn has_changed(&self) -> bool {
        self.store
            .read_header()
            .map(|h| h.generation() > self.last_seen)
            .unwrap_or(false)
    }

    /// Last generation returned by [`RecordReader::read`].
    pub fn generation(&self) -> Generation {
        self.last_seen
    }

    /// Snapshot returned by the last successful read.
    pub fn held(&self) -> Option<&Arc<RecordSnapshot>> {
        self.held.as_ref()
    }

    /// Underlying store.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Forget the held snapshot, e.g. after the owner was restarted and its
    /// generation sequence is known to continue from the ledger.
    pub fn reset(&mut self) {
        self.last_seen = Generation::ZERO;
        self.held = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, FrameFlags};
    use orbit::role::ProcessRole;
    use orbit::schema::{Field, FieldType, FieldValues, RecordSchema, RecordTiming};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RecordStore {
        let schema = RecordSchema::new(
            "piloting",
            vec![Field::new(1, "srb_time", FieldType::FloatingPoint, ProcessRole::Piloting)],
            RecordTiming::from_interval(Duration::from_millis(50), 5),
            false,
        )
        .unwrap();
        RecordStore::open(dir.path(), Arc::new(schema), false).unwrap()
    }

    #[test]
    fn has_changed_tracks_new_publishes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut reader = RecordReader::new(store.clone());
        assert!(!reader.has_changed());

        store
            .publish(ProcessRole::Piloting, &FieldValues::new().with(1, 1.0))
            .unwrap();
        assert!(reader.has_changed());
        assert_eq!(reader.read().unwrap().generation(), Generation::new(1));
        assert!(!reader.has_changed());
    }

    #[test]
    fn regressed_file_returns_held_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut reader = RecordReader::new(store.clone());

        store
            .publish(ProcessRole::Piloting, &FieldValues::new().with(1, 1.0))
            .unwrap();
        let old_bytes = std::fs::read(store.path()).unwrap();
        store
            .publish(ProcessRole::Piloting, &FieldValues::new().with(1, 2.0))
            .unwrap();
        assert_eq!(reader.read().unwrap().generation(), Generation::new(2));

        std::fs::write(store.path(), old_bytes).unwrap();
        let again = reader.read().unwrap();
        assert_eq!(again.generation(), Generation::new(2));
        assert_eq!(reader.generation(), Generation::new(2));
    }

    #[test]
    fn unreadable_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut reader = RecordReader::new(store.clone());
        assert!(reader.read().unwrap_err().is_unreadable());

        let snap = RecordSnapshot::new(
            "piloting",
            Generation::new(9),
            ProcessRole::Piloting,
            SystemTime::now(),
            FieldValues::new().with(1, 3.0),
        );
        let mut bytes = frame::encode(store.schema(), &snap, FrameFlags::empty(), None);
        bytes.truncate(bytes.len() - 1);
        std::fs::write(store.path(), bytes).unwrap();
        assert!(reader.read().unwrap_err().is_unreadable());
    }
}
