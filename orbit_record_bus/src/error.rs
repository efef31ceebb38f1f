//! Error types for record bus operations

use orbit::config::ConfigError;
use orbit::role::ProcessRole;
use orbit::schema::{FieldIndex, SchemaError};
use thiserror::Error;

use crate::restart::RestartState;

/// Errors that can occur during record bus operations.
///
/// Staleness and abandonment are not errors; see
/// [`Freshness`](crate::staleness::Freshness).
#[derive(Error, Debug)]
pub enum BusError {
    /// A role tried to publish a field it does not own
    #[error("Role {role} does not own field {index} of record '{record}'")]
    OwnershipViolation {
        /// Record name
        record: String,
        /// Offending role
        role: ProcessRole,
        /// Field index
        index: FieldIndex,
    },

    /// Record file does not exist
    #[error("Record unavailable: {record}")]
    RecordUnavailable {
        /// Record name
        record: String,
    },

    /// Record file exists but failed validation
    #[error("Record '{record}' corrupted: {reason}")]
    RecordCorrupted {
        /// Record name
        record: String,
        /// What failed to validate
        reason: String,
    },

    /// Field index is not part of the schema
    #[error("Record '{record}' has no field {index}")]
    UnknownField {
        /// Record name
        record: String,
        /// Field index
        index: FieldIndex,
    },

    /// Co-owned field nobody has written yet
    #[error("Field {index} of record '{record}' has not been published")]
    FieldNotPublished {
        /// Record name
        record: String,
        /// Field index
        index: FieldIndex,
    },

    /// Value does not match the field type
    #[error("Field {index} of record '{record}': {reason}")]
    TypeMismatch {
        /// Record name
        record: String,
        /// Field index
        index: FieldIndex,
        /// Mismatch description
        reason: String,
    },

    /// Single-owner publish that does not cover every field
    #[error("Publish of '{record}' is missing {missing} field(s), first missing index {first}")]
    IncompleteSnapshot {
        /// Record name
        record: String,
        /// Number of missing fields
        missing: usize,
        /// Lowest missing index
        first: FieldIndex,
    },

    /// Restart handshake transition not allowed from the current state
    #[error("Role {role} cannot {action} while restart signal is {state}")]
    InvalidTransition {
        /// Role attempting the transition
        role: ProcessRole,
        /// Attempted action
        action: &'static str,
        /// Current state
        state: RestartState,
    },

    /// Role table validation failed
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Configuration loading failed
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Advisory lock or other system call failed
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl BusError {
    pub(crate) fn corrupted(record: &str, reason: impl Into<String>) -> Self {
        Self::RecordCorrupted {
            record: record.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the record could not be read at all (missing or corrupt);
    /// callers fall back to last-known-good or backup data.
    pub fn is_unreadable(&self) -> bool {
        matches!(
            self,
            Self::RecordUnavailable { .. } | Self::RecordCorrupted { .. }
        )
    }
}

/// Result type for record bus operations
pub type BusResult<T> = Result<T, BusError>;
