//! File-backed record store.
//!
//! One [`RecordStore`] per record schema. Files used in the bus directory:
//!
//! | File                               | Purpose                                   |
//! |------------------------------------|-------------------------------------------|
//! | `<record>.rec`                     | Live frame, replaced by rename            |
//! | `<record>.lock`                    | Writer lock and generation ledger         |
//! | `.<record>.rec.<pid>.<rand>.stage` | Frame being written, renamed when complete |
//!
//! Writers serialize on the lock file; readers take no lock and rely on the
//! rename to see either the previous or the next complete frame.
//!
//! A co-owned record whose live file is unreadable is merged onto its backup
//! (`<backup_dir>/<record>.bak`) so no owner's fields are dropped. Without a
//! valid backup such a publish fails with `RecordCorrupted`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use orbit::config::BusConfig;
use orbit::consts::{BACKUP_FILE_EXT, LOCK_FILE_EXT, RECORD_FILE_EXT};
use orbit::role::ProcessRole;
use orbit::schema::{FieldIndex, FieldValue, FieldValues, RecordSchema};
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::frame::{self, Frame, FrameFlags, FrameHeader, HEADER_SIZE};
use crate::generation::{Generation, GenerationLedger};
use crate::snapshot::RecordSnapshot;
use crate::stage::write_staged;

/// Path of the live file of `record` in `dir`.
pub fn record_path(dir: &Path, record: &str) -> PathBuf {
    dir.join(format!("{record}.{RECORD_FILE_EXT}"))
}

/// Path of the lock / ledger file of `record` in `dir`.
pub fn lock_path(dir: &Path, record: &str) -> PathBuf {
    dir.join(format!("{record}.{LOCK_FILE_EXT}"))
}

/// Path of the backup of `record` in `backup_dir`.
pub fn backup_path(backup_dir: &Path, record: &str) -> PathBuf {
    backup_dir.join(format!("{record}.{BACKUP_FILE_EXT}"))
}

/// Atomic publish and consistent read of one record file.
#[derive(Debug, Clone)]
pub struct RecordStore {
    schema: Arc<RecordSchema>,
    dir: PathBuf,
    path: PathBuf,
    backup: Option<PathBuf>,
    ledger: GenerationLedger,
    durable: bool,
}

impl RecordStore {
    /// Open the store for `schema` in `dir`, creating the directory if
    /// needed. No record file is created until the first publish.
    pub fn open(dir: &Path, schema: Arc<RecordSchema>, durable: bool) -> BusResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: record_path(dir, schema.name()),
            ledger: GenerationLedger::new(lock_path(dir, schema.name())),
            dir: dir.to_path_buf(),
            backup: None,
            schema,
            durable,
        })
    }

    /// Open using the `[bus]` configuration section, with the configured
    /// backup directory as merge base for unreadable co-owned records.
    pub fn from_config(bus: &BusConfig, schema: Arc<RecordSchema>) -> BusResult<Self> {
        Ok(Self::open(&bus.dir, schema, bus.durable)?.with_backup_dir(&bus.backup_dir()))
    }

    /// Use the backup in `backup_dir` when a co-owned live file is unreadable.
    pub fn with_backup_dir(mut self, backup_dir: &Path) -> Self {
        self.backup = Some(backup_path(backup_dir, self.schema.name()));
        self
    }

    /// Schema of this record.
    pub fn schema(&self) -> &Arc<RecordSchema> {
        &self.schema
    }

    /// Record name.
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Bus directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Live file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check that `role` may publish `values`, without touching the file.
    ///
    /// # Errors
    ///
    /// - `UnknownField` for an index outside the schema
    /// - `OwnershipViolation` for a field owned by another role
    /// - `TypeMismatch` for a value that does not fit its field
    /// - `IncompleteSnapshot` when a single-owner record is not fully covered
    pub fn validate(&self, role: ProcessRole, values: &FieldValues) -> BusResult<()> {
        let record = self.schema.name();
        for (index, value) in values.iter() {
            let field = self.schema.field(index).ok_or_else(|| BusError::UnknownField {
                record: record.to_string(),
                index,
            })?;
            if field.owner != role {
                return Err(BusError::OwnershipViolation {
                    record: record.to_string(),
                    role,
                    index,
                });
            }
            value
                .check(field.field_type)
                .map_err(|reason| BusError::TypeMismatch {
                    record: record.to_string(),
                    index,
                    reason,
                })?;
        }

        if !self.schema.is_co_owned() {
            let mut missing = self
                .schema
                .fields()
                .iter()
                .filter(|f| !values.contains(f.index))
                .map(|f| f.index);
            if let Some(first) = missing.next() {
                return Err(BusError::IncompleteSnapshot {
                    record: record.to_string(),
                    missing: 1 + missing.count(),
                    first,
                });
            }
        }
        Ok(())
    }

    /// Publish `values` as `role` and return the new snapshot.
    ///
    /// For a co-owned record the caller's fields are merged into the latest
    /// snapshot under the record lock; fields of other owners are preserved.
    /// A rejected publish leaves the previous snapshot untouched.
    ///
    /// # Errors
    ///
    /// - any error of [`RecordStore::validate`]
    /// - `RecordCorrupted` if a co-owned live file is unreadable and there
    ///   is no valid backup to merge onto
    pub fn publish(&self, role: ProcessRole, values: &FieldValues) -> BusResult<Arc<RecordSnapshot>> {
        self.validate(role, values)?;
        let co_owned = self.schema.is_co_owned();

        let mut guard = self.ledger.lock()?;
        let existing = match self.read_frame() {
            Ok(frame) => Some(frame),
            Err(BusError::RecordUnavailable { .. }) => None,
            Err(e @ BusError::RecordCorrupted { .. }) if co_owned => match self.read_backup_frame() {
                Some(frame) => {
                    warn!(
                        record = %self.name(),
                        error = %e,
                        backup = %frame.snapshot.generation(),
                        "merging onto backup of unreadable record"
                    );
                    Some(frame)
                }
                None => {
                    warn!(record = %self.name(), error = %e, "unreadable co-owned record has no backup");
                    return Err(e);
                }
            },
            Err(e @ BusError::RecordCorrupted { .. }) => {
                warn!(record = %self.name(), error = %e, "overwriting unreadable record");
                None
            }
            Err(e) => return Err(e),
        };

        let on_disk = existing
            .as_ref()
            .map(|f| f.snapshot.generation())
            .unwrap_or(Generation::ZERO);
        let previous = guard.last()?.max(on_disk);
        let generation = previous.next();

        let merged = match (co_owned, existing) {
            (true, Some(frame)) => {
                let mut base = frame.snapshot.values().clone();
                base.overlay(values);
                base
            }
            _ => values.clone(),
        };

        let snapshot = RecordSnapshot::new(
            self.name(),
            generation,
            role,
            SystemTime::now(),
            merged,
        );
        let flags = if co_owned {
            FrameFlags::CO_OWNED
        } else {
            FrameFlags::empty()
        };
        let bytes = frame::encode(&self.schema, &snapshot, flags, None);
        write_staged(&self.path, &bytes, self.durable)?;
        guard.record(generation, self.durable)?;
        drop(guard);

        debug!(
            record = %self.name(),
            %role,
            %generation,
            fields = values.len(),
            merged = co_owned,
            "published"
        );
        Ok(Arc::new(snapshot))
    }

    /// Latest complete snapshot.
    ///
    /// # Errors
    ///
    /// - `RecordUnavailable` if the file does not exist
    /// - `RecordCorrupted` if the frame fails validation
    pub fn read_latest(&self) -> BusResult<Arc<RecordSnapshot>> {
        Ok(Arc::new(self.read_frame()?.snapshot))
    }

    /// Latest frame including its header.
    pub fn read_frame(&self) -> BusResult<Frame> {
        let bytes = self.read_bytes()?;
        frame::decode(&self.schema, &bytes)
    }

    /// Header of the live file only; the payload is not decoded.
    pub fn read_header(&self) -> BusResult<FrameHeader> {
        use std::io::Read;

        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.unavailable());
            }
            Err(e) => return Err(e.into()),
        };
        let mut buf = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        FrameHeader::parse(self.name(), &buf[..filled])
    }

    /// Single field of the latest snapshot.
    ///
    /// # Errors
    ///
    /// - `UnknownField` if `index` is not part of the schema
    /// - `FieldNotPublished` if no owner has written it yet
    /// - any error of [`RecordStore::read_latest`]
    pub fn read_field(&self, index: FieldIndex) -> BusResult<FieldValue> {
        if self.schema.field(index).is_none() {
            return Err(BusError::UnknownField {
                record: self.name().to_string(),
                index,
            });
        }
        let snapshot = self.read_latest()?;
        snapshot
            .value(index)
            .cloned()
            .ok_or_else(|| BusError::FieldNotPublished {
                record: self.name().to_string(),
                index,
            })
    }

    /// Last issued generation; [`Generation::ZERO`] if never published.
    pub fn generation(&self) -> BusResult<Generation> {
        let ledger = self.ledger.peek()?;
        let on_disk = self
            .read_header()
            .map(|h| h.generation())
            .unwrap_or(Generation::ZERO);
        Ok(ledger.max(on_disk))
    }

    fn read_bytes(&self) -> BusResult<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(self.unavailable()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_backup_frame(&self) -> Option<Frame> {
        let bytes = std::fs::read(self.backup.as_ref()?).ok()?;
        frame::decode(&self.schema, &bytes).ok()
    }

    fn unavailable(&self) -> BusError {
        BusError::RecordUnavailable {
            record: self.name().to_string(),
        }
    }
}
