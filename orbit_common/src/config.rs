//! Configuration loading traits and types.
//!
//! Every bus participant reads the same TOML file: a `[shared]` section with
//! per-process identity, a `[bus]` section with directory and cadence
//! settings, and the role table (`[[record]]` / `[[role]]`).
//!
//! # Usage
//!
//! ```rust,no_run
//! use orbit_common::config::{ConfigError, OrbitConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = OrbitConfig::load_validated(Path::new("/etc/orbit/bus.toml"))?;
//!     let table = config.role_table()?;
//!     println!("{} records in {}", table.len(), config.bus.dir.display());
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::consts::{
    DEFAULT_BACKUP_INTERVAL_MS, DEFAULT_BACKUP_SUBDIR, DEFAULT_BUS_DIR, DEFAULT_STAGE_GRACE_MS,
};
use crate::schema::SchemaError;
use crate::table::{RecordConfig, RoleConfig, RoleTable};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// The role table is inconsistent.
    #[error("Role table rejected: {0}")]
    Schema(#[from] SchemaError),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all Orbit processes.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "orbit-engineering"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[bus]` section: where record files live and how they are maintained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Directory holding record, lock and signal files.
    #[serde(default = "default_bus_dir")]
    pub dir: PathBuf,

    /// Backup directory. Defaults to `<dir>/backup`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Minimum time between two backup captures of one record [ms].
    #[serde(default = "default_backup_interval_ms")]
    pub backup_interval_ms: u64,

    /// Age after which an orphaned stage file is swept [ms].
    #[serde(default = "default_stage_grace_ms")]
    pub stage_grace_ms: u64,

    /// `fsync` stages and the directory on every publish.
    #[serde(default)]
    pub durable: bool,
}

fn default_bus_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BUS_DIR)
}

fn default_backup_interval_ms() -> u64 {
    DEFAULT_BACKUP_INTERVAL_MS
}

fn default_stage_grace_ms() -> u64 {
    DEFAULT_STAGE_GRACE_MS
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dir: default_bus_dir(),
            backup_dir: None,
            backup_interval_ms: DEFAULT_BACKUP_INTERVAL_MS,
            stage_grace_ms: DEFAULT_STAGE_GRACE_MS,
            durable: false,
        }
    }
}

impl BusConfig {
    /// Bus configuration rooted at `dir` with default cadences.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Effective backup directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.dir.join(DEFAULT_BACKUP_SUBDIR))
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_millis(self.backup_interval_ms)
    }

    pub fn stage_grace(&self) -> Duration {
        Duration::from_millis(self.stage_grace_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `dir` is empty
    /// - `backup_dir` equals `dir` (backups would shadow live records)
    /// - `backup_interval_ms` or `stage_grace_ms` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "bus.dir cannot be empty".to_string(),
            ));
        }
        if self.backup_dir.as_deref() == Some(self.dir.as_path()) {
            return Err(ConfigError::ValidationError(
                "bus.backup_dir must differ from bus.dir".to_string(),
            ));
        }
        if self.backup_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus.backup_interval_ms must be > 0".to_string(),
            ));
        }
        if self.stage_grace_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bus.stage_grace_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// The complete bus configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrbitConfig {
    pub shared: SharedConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default, rename = "record")]
    pub records: Vec<RecordConfig>,
    #[serde(default, rename = "role")]
    pub roles: Vec<RoleConfig>,
}

impl OrbitConfig {
    /// Load and validate `[shared]` and `[bus]`. The role table is validated
    /// separately by [`OrbitConfig::role_table`].
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.shared.validate()?;
        config.bus.validate()?;
        Ok(config)
    }

    /// Build the validated role table.
    pub fn role_table(&self) -> Result<RoleTable, ConfigError> {
        Ok(RoleTable::from_config(self)?)
    }
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for any `serde::de::DeserializeOwned` type.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::ProcessRole;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
[shared]
service_name = "orbit-engineering"
log_level = "debug"

[bus]
dir = "/tmp/orbit-bus"
backup_interval_ms = 2000
durable = true

[[record]]
name = "engineering"
expected_interval_ms = 100
critical = true

[[record.field]]
index = 1
name = "throttle"
type = "float"
owner = "engineering"
readers = ["piloting"]

[[role]]
name = "topology-mapper"
subscribes = ["engineering"]
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warn.as_filter(), "warn");
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_bus_config_defaults() {
        let bus = BusConfig::in_dir("/tmp/bus");
        assert_eq!(bus.backup_dir(), PathBuf::from("/tmp/bus/backup"));
        assert_eq!(bus.backup_interval(), Duration::from_millis(DEFAULT_BACKUP_INTERVAL_MS));
        assert!(!bus.durable);
        assert!(bus.validate().is_ok());
    }

    #[test]
    fn test_bus_config_validation() {
        let mut bus = BusConfig::in_dir("/tmp/bus");
        bus.backup_dir = Some(PathBuf::from("/tmp/bus"));
        assert!(matches!(bus.validate(), Err(ConfigError::ValidationError(_))));

        let mut bus = BusConfig::in_dir("/tmp/bus");
        bus.backup_interval_ms = 0;
        assert!(matches!(bus.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = OrbitConfig::load(Path::new("/nonexistent/path/bus.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let file = write_config("invalid toml {{{{\n");
        let result = OrbitConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let file = write_config(
            r#"
[shared]
service_name = "x"

[bus]
dir = "/tmp/bus"
compression = true
"#,
        );
        assert!(matches!(
            OrbitConfig::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_full_config_loads() {
        let file = write_config(FULL);
        let config = OrbitConfig::load_validated(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.bus.dir, PathBuf::from("/tmp/orbit-bus"));
        assert_eq!(config.bus.backup_interval_ms, 2000);
        assert_eq!(config.bus.stage_grace_ms, DEFAULT_STAGE_GRACE_MS);
        assert!(config.bus.durable);

        let table = config.role_table().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.subscriptions(ProcessRole::TopologyMapper).count(), 1);
        assert_eq!(table.subscriptions(ProcessRole::Piloting).count(), 1);
    }

    #[test]
    fn test_role_table_errors_surface_as_schema() {
        let file = write_config(
            r#"
[shared]
service_name = "x"

[[role]]
name = "piloting"
subscribes = ["missing"]
"#,
        );
        let config = OrbitConfig::load_validated(file.path()).unwrap();
        assert!(matches!(
            config.role_table(),
            Err(ConfigError::Schema(SchemaError::UnknownRecord { .. }))
        ));
    }
}
