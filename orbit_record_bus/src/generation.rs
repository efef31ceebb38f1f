//! Publish generations and the per-record generation ledger.
//!
//! Each record has a sidecar `<record>.lock` file. Writers hold an exclusive
//! `flock` on it for the whole read-merge-stage-swap sequence, and the file
//! body stores the last generation issued. The ledger survives a corrupted
//! or deleted record file, so generations never repeat.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::fcntl::Flock;
use tracing::warn;

use crate::error::BusResult;
use crate::platform::lock_exclusive;

/// Monotonic publish counter of one record. `0` means never published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    /// Generation of a record that was never published.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw counter value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The generation following this one.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Whether anything has been published yet.
    pub const fn is_published(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Path handle for a record's lock / ledger file.
#[derive(Debug, Clone)]
pub struct GenerationLedger {
    path: PathBuf,
}

impl GenerationLedger {
    /// Ledger at `path` (created on first lock).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive lock. Blocks until every other writer of this
    /// record, in any process or thread, has released it.
    pub fn lock(&self) -> BusResult<LedgerGuard> {
        Ok(LedgerGuard {
            file: lock_exclusive(&self.path)?,
            path: self.path.clone(),
        })
    }

    /// Last issued generation, read without locking. Used for cheap
    /// inspection only; writers go through [`GenerationLedger::lock`].
    pub fn peek(&self) -> BusResult<Generation> {
        match File::open(&self.path) {
            Ok(mut file) => read_generation(&mut file, &self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Generation::ZERO),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held ledger lock. Released on drop.
pub struct LedgerGuard {
    file: Flock<File>,
    path: PathBuf,
}

impl LedgerGuard {
    /// Last generation recorded in the ledger.
    pub fn last(&mut self) -> BusResult<Generation> {
        read_generation(&mut self.file, &self.path)
    }

    /// Persist `generation` as the last issued one.
    pub fn record(&mut self, generation: Generation, durable: bool) -> BusResult<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&generation.get().to_le_bytes())?;
        if durable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

fn read_generation(file: &mut File, path: &Path) -> BusResult<Generation> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::with_capacity(8);
    file.read_to_end(&mut buf)?;
    match <[u8; 8]>::try_from(buf.as_slice()) {
        Ok(word) => Ok(Generation::new(u64::from_le_bytes(word))),
        Err(_) if buf.is_empty() => Ok(Generation::ZERO),
        Err(_) => {
            warn!(
                path = %path.display(),
                len = buf.len(),
                "generation ledger has unexpected length, treating as empty"
            );
            Ok(Generation::ZERO)
        }
    }
}
