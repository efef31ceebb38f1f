//! Prelude module for common re-exports.
//!
//! ```rust
//! use orbit_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{BusConfig, ConfigError, ConfigLoader, LogLevel, OrbitConfig, SharedConfig};

// ─── Roles & Schemas ────────────────────────────────────────────────
pub use crate::binding::{FieldValuesBuilder, ProcessRoleAdapter};
pub use crate::role::ProcessRole;
pub use crate::schema::{
    Field, FieldIndex, FieldType, FieldValue, FieldValues, RecordSchema, RecordTiming, SchemaError,
};
pub use crate::table::RoleTable;
