//! Bus-wide constants for the Orbit workspace.
//!
//! Single source of truth for file naming, numeric limits and default
//! timings, imported by all crates.

/// Extension of live record files (`<record>.rec`).
pub const RECORD_FILE_EXT: &str = "rec";

/// Extension of record lock / generation ledger files (`<record>.lock`).
pub const LOCK_FILE_EXT: &str = "lock";

/// Extension of backup record files (`<record>.bak`).
pub const BACKUP_FILE_EXT: &str = "bak";

/// Suffix of staging files awaiting rename over a live file.
pub const STAGE_FILE_SUFFIX: &str = ".stage";

/// Restart signal file name inside the bus directory.
pub const RESTART_SIGNAL_FILE: &str = "restart.sig";

/// Lock file serializing restart signal transitions.
pub const RESTART_LOCK_FILE: &str = "restart.lock";

/// Sub-directory of the bus directory holding backups when none is configured.
pub const DEFAULT_BACKUP_SUBDIR: &str = "backup";

/// Default bus directory.
pub const DEFAULT_BUS_DIR: &str = "/var/lib/orbit/bus";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/orbit/bus.toml";

/// Maximum number of fields in one record schema.
pub const MAX_FIELDS: usize = 4096;

/// Maximum length of a fixed string field in bytes.
pub const MAX_FIXED_STRING_LEN: u16 = 1024;

/// Maximum length of a record name.
pub const MAX_RECORD_NAME_LEN: usize = 64;

/// Abandonment threshold as a multiple of the expected publish interval,
/// used when a record does not configure `abandon_after_ms`.
pub const DEFAULT_ABANDON_FACTOR: u32 = 5;

/// Default backup cadence [ms].
pub const DEFAULT_BACKUP_INTERVAL_MS: u64 = 5_000;

/// Default age after which an orphaned stage file is removed [ms].
pub const DEFAULT_STAGE_GRACE_MS: u64 = 10_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(MAX_FIELDS > 0);
        assert!(MAX_FIXED_STRING_LEN > 0);
        assert!(DEFAULT_ABANDON_FACTOR > 1);
        assert!(DEFAULT_BACKUP_INTERVAL_MS > 0);
    }

    #[test]
    fn extensions_are_distinct() {
        assert_ne!(RECORD_FILE_EXT, LOCK_FILE_EXT);
        assert_ne!(RECORD_FILE_EXT, BACKUP_FILE_EXT);
        assert_ne!(LOCK_FILE_EXT, BACKUP_FILE_EXT);
    }
}
