//! Stage-and-swap writes.
//!
//! A frame is written in full to a hidden stage file next to its target,
//! then renamed over the target. Rename within one directory is atomic, so
//! readers never observe a partially written record. Stage files are named
//! `.<target>.<pid>.<random>.stage`; the pid lets
//! [`StageCleanup`](crate::lifecycle::StageCleanup) tell orphans from
//! in-flight writes.

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use orbit::consts::STAGE_FILE_SUFFIX;
use tracing::trace;

use crate::error::{BusError, BusResult};
use crate::platform::{get_current_pid, sync_dir};

/// Write `bytes` to a stage file and atomically rename it to `target`.
///
/// With `durable`, the stage is `fsync`ed before the rename and the
/// directory after it. On any error the stage file is removed and `target`
/// is left untouched.
pub fn write_staged(target: &Path, bytes: &[u8], durable: bool) -> BusResult<()> {
    let dir = target.parent().ok_or_else(|| {
        BusError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", target.display()),
        ))
    })?;
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            BusError::from(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", target.display()),
            ))
        })?;

    let prefix = format!(".{file_name}.{}.", get_current_pid());
    let mut stage = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(STAGE_FILE_SUFFIX)
        .permissions(Permissions::from_mode(0o644))
        .tempfile_in(dir)?;

    stage.write_all(bytes)?;
    stage.flush()?;
    if durable {
        stage.as_file().sync_all()?;
    }
    trace!(stage = %stage.path().display(), target = %target.display(), "swapping stage");

    stage.persist(target).map_err(|e| BusError::from(e.error))?;
    if durable {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Components of a stage file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageName<'a> {
    /// File the stage was destined for.
    pub target: &'a str,
    /// Writer process id.
    pub pid: u32,
}

/// Parse `.<target>.<pid>.<random>.stage`. Returns `None` for anything else.
pub fn parse_stage_name(file_name: &str) -> Option<StageName<'_>> {
    let inner = file_name
        .strip_prefix('.')?
        .strip_suffix(STAGE_FILE_SUFFIX)?;
    let mut parts = inner.rsplitn(3, '.');
    let _random = parts.next()?;
    let pid = parts.next()?.parse().ok()?;
    let target = parts.next().filter(|t| !t.is_empty())?;
    Some(StageName { target, pid })
}
