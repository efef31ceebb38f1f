//! Slow-cadence backup copies of live records.
//!
//! Backups are ordinary frames flagged [`FrameFlags::BACKUP`] with the
//! capture time in the auxiliary header slot, stored as
//! `<backup_dir>/<record>.bak`. They are the recovery point when a live file
//! is abandoned or unreadable and no last-known-good snapshot is held.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use orbit::config::BusConfig;
use orbit::consts::LOCK_FILE_EXT;
use orbit::schema::RecordSchema;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{BusError, BusResult};
use crate::frame::{self, FrameFlags, FrameHeader};
use crate::generation::Generation;
use crate::platform::lock_exclusive;
use crate::snapshot::RecordSnapshot;
use crate::stage::write_staged;
use crate::store::{self, RecordStore};

/// Result of [`BackupCoordinator::capture_if_due`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The backup interval has not elapsed since the last capture.
    NotDue,
    /// The live record has never been published.
    NothingToCapture,
    /// The backup already holds this generation or a newer one.
    UpToDate(Generation),
    /// A new backup was written.
    Captured(Generation),
}

/// A value obtained in degraded mode. The caller must unwrap it explicitly
/// with [`Degraded::accept`].
#[derive(Debug, Clone)]
#[must_use = "degraded data must be explicitly accepted"]
pub struct Degraded<T>(T);

impl<T> Degraded<T> {
    /// Accept the degraded value.
    pub fn accept(self) -> T {
        self.0
    }

    /// Inspect without accepting.
    pub fn peek(&self) -> &T {
        &self.0
    }
}

/// A backed-up snapshot and its capture time.
#[derive(Debug, Clone)]
pub struct BackupSnapshot {
    snapshot: Arc<RecordSnapshot>,
    captured_at: SystemTime,
}

impl BackupSnapshot {
    /// The snapshot as it was when captured.
    pub fn snapshot(&self) -> &Arc<RecordSnapshot> {
        &self.snapshot
    }

    /// When the backup was taken.
    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Name of the schema the backup belongs to.
    pub fn schema_name(&self) -> &str {
        self.snapshot.record()
    }
}

impl Deref for BackupSnapshot {
    type Target = RecordSnapshot;

    fn deref(&self) -> &RecordSnapshot {
        &self.snapshot
    }
}

/// Captures and recovers backups for any number of records.
#[derive(Debug)]
pub struct BackupCoordinator {
    dir: PathBuf,
    interval: Duration,
    durable: bool,
    last_capture: Mutex<HashMap<String, Instant>>,
}

impl BackupCoordinator {
    /// Coordinator writing into `dir` (created if missing).
    pub fn new(dir: impl Into<PathBuf>, interval: Duration, durable: bool) -> BusResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            interval,
            durable,
            last_capture: Mutex::new(HashMap::new()),
        })
    }

    /// Coordinator configured from the `[bus]` section.
    pub fn from_config(bus: &BusConfig) -> BusResult<Self> {
        Self::new(bus.backup_dir(), bus.backup_interval(), bus.durable)
    }

    /// Backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Backup file of `record`.
    pub fn backup_path(&self, record: &str) -> PathBuf {
        store::backup_path(&self.dir, record)
    }

    fn lock_path(&self, record: &str) -> PathBuf {
        self.dir.join(format!("{record}.{LOCK_FILE_EXT}"))
    }

    /// Capture a backup of `store` if the interval has elapsed since this
    /// coordinator's last capture of that record.
    pub fn capture_if_due(&self, store: &RecordStore, now: Instant) -> BusResult<CaptureOutcome> {
        {
            let last = self.last_capture.lock();
            if let Some(at) = last.get(store.name()) {
                if now.saturating_duration_since(*at) < self.interval {
                    return Ok(CaptureOutcome::NotDue);
                }
            }
        }
        let outcome = self.capture(store)?;
        if outcome != CaptureOutcome::NothingToCapture {
            self.last_capture.lock().insert(store.name().to_string(), now);
        }
        Ok(outcome)
    }

    /// Capture now, ignoring the cadence.
    ///
    /// Concurrent captures of one record (two co-owners) serialize on
    /// `<record>.lock` in the backup directory, and a backup never moves to
    /// an older generation.
    pub fn capture(&self, store: &RecordStore) -> BusResult<CaptureOutcome> {
        let live = match store.read_frame() {
            Ok(frame) => frame,
            Err(BusError::RecordUnavailable { .. }) => return Ok(CaptureOutcome::NothingToCapture),
            Err(e) => return Err(e),
        };
        let generation = live.snapshot.generation();

        let _lock = lock_exclusive(&self.lock_path(store.name()))?;
        if let Some(existing) = self.backup_header(store.name())? {
            if existing.generation() >= generation {
                debug!(
                    record = %store.name(),
                    backup = %existing.generation(),
                    live = %generation,
                    "backup up to date"
                );
                return Ok(CaptureOutcome::UpToDate(existing.generation()));
            }
        }

        let flags = live.header.flags() | FrameFlags::BACKUP;
        let bytes = frame::encode(store.schema(), &live.snapshot, flags, Some(SystemTime::now()));
        write_staged(&self.backup_path(store.name()), &bytes, self.durable)?;
        info!(record = %store.name(), %generation, "backup captured");
        Ok(CaptureOutcome::Captured(generation))
    }

    /// Latest backup of `schema`, marked degraded.
    ///
    /// # Errors
    ///
    /// - `RecordUnavailable` if no backup exists
    /// - `RecordCorrupted` if the backup fails validation
    pub fn recover(&self, schema: &RecordSchema) -> BusResult<Degraded<BackupSnapshot>> {
        let path = self.backup_path(schema.name());
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BusError::RecordUnavailable {
                    record: schema.name().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let frame = frame::decode(schema, &bytes)?;
        let captured_at = frame
            .header
            .captured_at()
            .unwrap_or_else(|| frame.snapshot.published_at());
        debug!(
            record = %schema.name(),
            generation = %frame.snapshot.generation(),
            "recovered from backup"
        );
        Ok(Degraded(BackupSnapshot {
            snapshot: Arc::new(frame.snapshot),
            captured_at,
        }))
    }

    /// Generation held by the backup of `record`, if any.
    pub fn backup_generation(&self, record: &str) -> BusResult<Option<Generation>> {
        Ok(self.backup_header(record)?.map(|h| h.generation()))
    }

    fn backup_header(&self, record: &str) -> BusResult<Option<FrameHeader>> {
        match std::fs::read(self.backup_path(record)) {
            Ok(bytes) => Ok(FrameHeader::parse(record, &bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
