//! Linux file locking, directory sync and process helpers

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};
use nix::unistd::getpid;

use crate::error::{BusError, BusResult};

/// Open (creating if needed) `path` and take an exclusive advisory lock.
///
/// Each call opens a new file description, so two threads of one process
/// contend exactly like two processes do.
pub fn lock_exclusive(path: &Path) -> BusResult<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .mode(0o644)
        .open(path)?;

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| BusError::from(errno))
}

/// `fsync` a directory so a completed rename survives power loss.
pub fn sync_dir(dir: &Path) -> BusResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
