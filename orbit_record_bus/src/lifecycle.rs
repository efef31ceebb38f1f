//! Removal of orphaned stage files

use std::path::Path;
use std::time::{Duration, SystemTime};

use orbit::config::BusConfig;
use tracing::{debug, info};

use crate::error::BusResult;
use crate::platform::{get_current_pid, is_process_alive};
use crate::stage::parse_stage_name;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stage files removed.
    pub removed: usize,
    /// Stage files left in place (writer alive and within grace).
    pub kept: usize,
}

/// Sweeps stage files left behind by writers that died between stage and
/// swap.
///
/// A stage file is removed when its writer process is gone, or when it is
/// older than the grace period regardless of the writer.
#[derive(Debug, Clone)]
pub struct StageCleanup {
    grace_period: Duration,
}

impl StageCleanup {
    /// Cleanup with the given grace period.
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Cleanup configured from the `[bus]` section.
    pub fn from_config(bus: &BusConfig) -> Self {
        Self::new(bus.stage_grace())
    }

    /// Grace period before a live writer's stage is considered orphaned.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Sweep `dir`. A missing directory is an empty sweep.
    pub fn sweep(&self, dir: &Path) -> BusResult<SweepReport> {
        let mut report = SweepReport::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        let own_pid = get_current_pid();
        let now = SystemTime::now();

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(stage) = file_name.to_str().and_then(parse_stage_name) else {
                continue;
            };

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or_default();
            let writer_gone = stage.pid != own_pid && !is_process_alive(stage.pid);

            if writer_gone || age > self.grace_period {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        info!(
                            stage = %entry.path().display(),
                            target = stage.target,
                            pid = stage.pid,
                            age_ms = age.as_millis() as u64,
                            "removed orphaned stage file"
                        );
                        report.removed += 1;
                    }
                    // Renamed into place or swept by another process meanwhile.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                report.kept += 1;
            }
        }

        debug!(dir = %dir.display(), removed = report.removed, kept = report.kept, "stage sweep");
        Ok(report)
    }

    /// Sweep the bus directory and the backup directory of `bus`.
    pub fn sweep_bus(&self, bus: &BusConfig) -> BusResult<SweepReport> {
        let mut report = self.sweep(&bus.dir)?;
        let backup_dir = bus.backup_dir();
        if backup_dir != bus.dir {
            let backups = self.sweep(&backup_dir)?;
            report.removed += backups.removed;
            report.kept += backups.kept;
        }
        Ok(report)
    }
}

impl Default for StageCleanup {
    fn default() -> Self {
        Self::new(Duration::from_millis(orbit::consts::DEFAULT_STAGE_GRACE_MS))
    }
}
