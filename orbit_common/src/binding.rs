//! Per-role view of the role table.
//!
//! A [`ProcessRoleAdapter`] is built once per process from the validated
//! [`RoleTable`] and answers "which records do I write, which do I read, and
//! which field does this name refer to". Field values built through it are
//! checked against ownership and type before they ever reach the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::role::ProcessRole;
use crate::schema::{Field, FieldIndex, FieldValue, FieldValues, RecordSchema, SchemaError};
use crate::table::RoleTable;

/// Binding of schema fields to one role's write set and read set.
#[derive(Debug, Clone)]
pub struct ProcessRoleAdapter {
    role: ProcessRole,
    owned: BTreeMap<String, Arc<RecordSchema>>,
    subscribed: BTreeMap<String, Arc<RecordSchema>>,
}

impl ProcessRoleAdapter {
    /// Bind `role` against a validated table.
    pub fn bind(role: ProcessRole, table: &RoleTable) -> Self {
        let owned = table
            .owned_by(role)
            .map(|s| (s.name().to_string(), Arc::clone(s)))
            .collect();
        let subscribed = table
            .subscriptions(role)
            .map(|s| (s.name().to_string(), Arc::clone(s)))
            .collect();
        Self {
            role,
            owned,
            subscribed,
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Records this role writes at least one field of.
    pub fn owned_records(&self) -> impl Iterator<Item = &Arc<RecordSchema>> {
        self.owned.values()
    }

    /// Records this role polls.
    pub fn subscriptions(&self) -> impl Iterator<Item = &Arc<RecordSchema>> {
        self.subscribed.values()
    }

    /// Schema of an owned or subscribed record.
    pub fn schema(&self, record: &str) -> Option<&Arc<RecordSchema>> {
        self.owned.get(record).or_else(|| self.subscribed.get(record))
    }

    /// Whether this role owns field `index` of `record`.
    pub fn owns(&self, record: &str, index: FieldIndex) -> bool {
        self.owned
            .get(record)
            .and_then(|s| s.field(index))
            .is_some_and(|f| f.owner == self.role)
    }

    /// Indices this role writes in `record`, ascending. Empty if not an owner.
    pub fn write_set(&self, record: &str) -> Vec<FieldIndex> {
        self.owned
            .get(record)
            .map(|s| s.owned_by(self.role).map(|f| f.index).collect())
            .unwrap_or_default()
    }

    /// Look up a field of an owned or subscribed record by semantic name.
    pub fn field(&self, record: &str, name: &str) -> Result<&Field, SchemaError> {
        let schema = self.schema(record).ok_or_else(|| SchemaError::UnknownRecord {
            role: self.role,
            record: record.to_string(),
        })?;
        schema
            .field_by_name(name)
            .ok_or_else(|| SchemaError::UnknownFieldName {
                record: record.to_string(),
                field: name.to_string(),
            })
    }

    /// Start building values for an owned record.
    pub fn values(&self, record: &str) -> Result<FieldValuesBuilder, SchemaError> {
        let schema = self.owned.get(record).ok_or_else(|| SchemaError::UnknownRecord {
            role: self.role,
            record: record.to_string(),
        })?;
        Ok(FieldValuesBuilder {
            role: self.role,
            schema: Arc::clone(schema),
            values: FieldValues::new(),
        })
    }
}

/// Builds a [`FieldValues`] set by semantic field name.
///
/// Every `set` checks ownership and type immediately, so a builder that
/// reaches [`FieldValuesBuilder::build`] only holds values the store will
/// accept.
#[derive(Debug, Clone)]
pub struct FieldValuesBuilder {
    role: ProcessRole,
    schema: Arc<RecordSchema>,
    values: FieldValues,
}

impl FieldValuesBuilder {
    /// Set a scalar field, e.g. `"throttle"`.
    pub fn set(mut self, name: &str, value: impl Into<FieldValue>) -> Result<Self, SchemaError> {
        let field = self.owned_field(name)?;
        let index = field.index;
        let value = value.into();
        value
            .check(field.field_type)
            .map_err(|reason| SchemaError::ValueRejected {
                record: self.schema.name().to_string(),
                field: name.to_string(),
                reason,
            })?;
        self.values.insert(index, value);
        Ok(self)
    }

    /// Set consecutive elements of an array field declared with `indices`,
    /// starting at element 0.
    pub fn set_array<V: Into<FieldValue>>(
        mut self,
        name: &str,
        elements: impl IntoIterator<Item = V>,
    ) -> Result<Self, SchemaError> {
        for (i, value) in elements.into_iter().enumerate() {
            self = self.set(&format!("{name}[{i}]"), value)?;
        }
        Ok(self)
    }

    fn owned_field(&self, name: &str) -> Result<&Field, SchemaError> {
        let field = self
            .schema
            .field_by_name(name)
            .ok_or_else(|| SchemaError::UnknownFieldName {
                record: self.schema.name().to_string(),
                field: name.to_string(),
            })?;
        if field.owner != self.role {
            return Err(SchemaError::NotOwned {
                record: self.schema.name().to_string(),
                field: name.to_string(),
                role: self.role,
            });
        }
        Ok(field)
    }

    /// Values set so far.
    pub fn build(self) -> FieldValues {
        self.values
    }
}
