//! Role table: who writes and who reads which record fields.
//!
//! Deserialized from the `[[record]]` and `[[role]]` sections of the bus
//! configuration and validated once at startup. Immutable after
//! construction; every participant builds the same table from the same
//! file and derives its own [`ProcessRoleAdapter`](crate::binding::ProcessRoleAdapter).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OrbitConfig;
use crate::consts::DEFAULT_ABANDON_FACTOR;
use crate::role::ProcessRole;
use crate::schema::{Field, FieldIndex, FieldType, RecordSchema, RecordTiming, SchemaError};

// ─── Config structs ─────────────────────────────────────────────────

/// Field type as spelled in the role table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Integer,
    Float,
    Char,
    String,
}

/// One `[[record.field]]` entry.
///
/// Exactly one of `index` or `indices` must be given. `indices = [a, b]`
/// declares the inclusive range `a..=b` as an array field whose elements are
/// named `name[0]`, `name[1]`, …
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    #[serde(default)]
    pub index: Option<FieldIndex>,
    #[serde(default)]
    pub indices: Option<[FieldIndex; 2]>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    /// Byte length, required for `type = "string"`.
    #[serde(default)]
    pub len: Option<u16>,
    pub owner: ProcessRole,
    #[serde(default)]
    pub readers: Vec<ProcessRole>,
}

/// One `[[record]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordConfig {
    pub name: String,
    /// Expected publish interval of the owner(s) [ms].
    pub expected_interval_ms: u64,
    /// Silence after which the owner is presumed crashed [ms].
    /// Defaults to `DEFAULT_ABANDON_FACTOR × expected_interval_ms`.
    #[serde(default)]
    pub abandon_after_ms: Option<u64>,
    /// Abandonment triggers a restart request.
    #[serde(default)]
    pub critical: bool,
    #[serde(rename = "field")]
    pub fields: Vec<FieldConfig>,
}

/// One `[[role]]` entry: explicit subscriptions beyond those implied by
/// field `readers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleConfig {
    pub name: ProcessRole,
    #[serde(default)]
    pub subscribes: Vec<String>,
}

// ─── RoleTable ──────────────────────────────────────────────────────

/// Validated set of record schemas plus every role's read set.
#[derive(Debug, Clone)]
pub struct RoleTable {
    schemas: BTreeMap<String, Arc<RecordSchema>>,
    subscriptions: BTreeMap<ProcessRole, BTreeSet<String>>,
}

impl RoleTable {
    /// Build the table, running all validation rules.
    ///
    /// Returns the first validation error encountered. A field index claimed
    /// by two roles fails with [`SchemaError::Conflict`].
    pub fn build(records: &[RecordConfig], roles: &[RoleConfig]) -> Result<Self, SchemaError> {
        let mut schemas = BTreeMap::new();
        let mut subscriptions: BTreeMap<ProcessRole, BTreeSet<String>> = BTreeMap::new();

        for record in records {
            if schemas.contains_key(&record.name) {
                return Err(SchemaError::DuplicateRecord {
                    record: record.name.clone(),
                });
            }

            let mut fields = Vec::new();
            for field in &record.fields {
                expand_field(&record.name, field, &mut fields)?;
            }

            let expected = Duration::from_millis(record.expected_interval_ms);
            let timing = match record.abandon_after_ms {
                Some(ms) => RecordTiming {
                    expected_interval: expected,
                    abandon_after: Duration::from_millis(ms),
                },
                None => RecordTiming::from_interval(expected, DEFAULT_ABANDON_FACTOR),
            };

            let schema = RecordSchema::new(record.name.clone(), fields, timing, record.critical)?;

            // Declared readers subscribe implicitly.
            for field in schema.fields() {
                for reader in &field.readers {
                    if *reader != field.owner {
                        subscriptions
                            .entry(*reader)
                            .or_default()
                            .insert(record.name.clone());
                    }
                }
            }

            schemas.insert(record.name.clone(), Arc::new(schema));
        }

        for role in roles {
            for record in &role.subscribes {
                if !schemas.contains_key(record) {
                    return Err(SchemaError::UnknownRecord {
                        role: role.name,
                        record: record.clone(),
                    });
                }
                subscriptions
                    .entry(role.name)
                    .or_default()
                    .insert(record.clone());
            }
        }

        debug!(
            records = schemas.len(),
            roles = subscriptions.len(),
            "role table built"
        );
        Ok(Self {
            schemas,
            subscriptions,
        })
    }

    /// Build the table from a loaded configuration file.
    pub fn from_config(config: &OrbitConfig) -> Result<Self, SchemaError> {
        Self::build(&config.records, &config.roles)
    }

    /// Build a table directly from schemas (no implicit subscriptions other
    /// than declared field readers).
    pub fn from_schemas(schemas: impl IntoIterator<Item = RecordSchema>) -> Result<Self, SchemaError> {
        let mut table = Self {
            schemas: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
        };
        for schema in schemas {
            if table.schemas.contains_key(schema.name()) {
                return Err(SchemaError::DuplicateRecord {
                    record: schema.name().to_string(),
                });
            }
            for field in schema.fields() {
                for reader in &field.readers {
                    if *reader != field.owner {
                        table
                            .subscriptions
                            .entry(*reader)
                            .or_default()
                            .insert(schema.name().to_string());
                    }
                }
            }
            table
                .schemas
                .insert(schema.name().to_string(), Arc::new(schema));
        }
        Ok(table)
    }

    /// Add an explicit subscription.
    pub fn subscribe(&mut self, role: ProcessRole, record: &str) -> Result<(), SchemaError> {
        if !self.schemas.contains_key(record) {
            return Err(SchemaError::UnknownRecord {
                role,
                record: record.to_string(),
            });
        }
        self.subscriptions
            .entry(role)
            .or_default()
            .insert(record.to_string());
        Ok(())
    }

    pub fn schema(&self, record: &str) -> Option<&Arc<RecordSchema>> {
        self.schemas.get(record)
    }

    /// All schemas, ordered by record name.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<RecordSchema>> {
        self.schemas.values()
    }

    /// Records `role` writes at least one field of.
    pub fn owned_by(&self, role: ProcessRole) -> impl Iterator<Item = &Arc<RecordSchema>> {
        self.schemas
            .values()
            .filter(move |s| s.fields().iter().any(|f| f.owner == role))
    }

    /// Records `role` polls.
    pub fn subscriptions(&self, role: ProcessRole) -> impl Iterator<Item = &Arc<RecordSchema>> {
        self.subscriptions
            .get(&role)
            .into_iter()
            .flat_map(|names| names.iter())
            .filter_map(|name| self.schemas.get(name))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn expand_field(record: &str, cfg: &FieldConfig, out: &mut Vec<Field>) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidField {
        record: record.to_string(),
        field: cfg.name.clone(),
        reason,
    };

    let field_type = match (cfg.kind, cfg.len) {
        (FieldKind::String, Some(len)) => FieldType::FixedString(len),
        (FieldKind::String, None) => return Err(invalid("string fields require `len`".to_string())),
        (_, Some(_)) => return Err(invalid("`len` is only valid for string fields".to_string())),
        (FieldKind::Integer, None) => FieldType::Integer,
        (FieldKind::Float, None) => FieldType::FloatingPoint,
        (FieldKind::Char, None) => FieldType::Character,
    };

    let mut readers = cfg.readers.clone();
    readers.sort();
    readers.dedup();

    match (cfg.index, cfg.indices) {
        (Some(index), None) => {
            out.push(Field {
                index,
                name: cfg.name.clone(),
                field_type,
                owner: cfg.owner,
                readers,
            });
        }
        (None, Some([start, end])) => {
            if start > end {
                return Err(invalid(format!("index range [{start}, {end}] is reversed")));
            }
            for (element, index) in (start..=end).enumerate() {
                out.push(Field {
                    index,
                    name: format!("{}[{element}]", cfg.name),
                    field_type,
                    owner: cfg.owner,
                    readers: readers.clone(),
                });
            }
        }
        (Some(_), Some(_)) => {
            return Err(invalid("give either `index` or `indices`, not both".to_string()));
        }
        (None, None) => return Err(invalid("missing `index` or `indices`".to_string())),
    }
    Ok(())
}

/// Roles that appear anywhere in the table, as owners or subscribers.
pub fn participating_roles(table: &RoleTable) -> Vec<ProcessRole> {
    let mut seen = HashSet::new();
    for schema in table.schemas() {
        for field in schema.fields() {
            seen.insert(field.owner);
        }
    }
    seen.extend(table.subscriptions.keys().copied());
    let mut roles: Vec<_> = seen.into_iter().collect();
    roles.sort();
    roles
}
