//! Immutable record snapshots

use std::time::SystemTime;

use orbit::role::ProcessRole;
use orbit::schema::{FieldIndex, FieldValue, FieldValues, RecordSchema};
use serde_json::{Map, Value, json};

use crate::frame::system_time_to_ns;
use crate::generation::Generation;

/// One complete, consistent state of a record as published under a single
/// generation. Never mutated after creation; shared as `Arc<RecordSnapshot>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    record: String,
    generation: Generation,
    published_by: ProcessRole,
    published_at: SystemTime,
    values: FieldValues,
}

impl RecordSnapshot {
    /// Assemble a snapshot.
    pub fn new(
        record: impl Into<String>,
        generation: Generation,
        published_by: ProcessRole,
        published_at: SystemTime,
        values: FieldValues,
    ) -> Self {
        Self {
            record: record.into(),
            generation,
            published_by,
            published_at,
            values,
        }
    }

    /// Record name.
    pub fn record(&self) -> &str {
        &self.record
    }

    /// Publish generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Role whose publish produced this snapshot.
    pub fn published_by(&self) -> ProcessRole {
        self.published_by
    }

    /// Publish time.
    pub fn published_at(&self) -> SystemTime {
        self.published_at
    }

    /// All populated values, ordered by index.
    pub fn values(&self) -> &FieldValues {
        &self.values
    }

    /// Value of field `index`, if populated.
    pub fn value(&self, index: FieldIndex) -> Option<&FieldValue> {
        self.values.get(index)
    }

    /// Value by semantic field name.
    pub fn value_by_name(&self, schema: &RecordSchema, name: &str) -> Option<&FieldValue> {
        schema
            .field_by_name(name)
            .and_then(|f| self.values.get(f.index))
    }

    /// Elements of the array `name`, declared in the schema as `name[0]`,
    /// `name[1]`, ... and returned in element order. Unpublished elements are
    /// `None`; an unknown array yields an empty vector.
    pub fn array_by_name(&self, schema: &RecordSchema, name: &str) -> Vec<Option<&FieldValue>> {
        let mut elements: Vec<(usize, FieldIndex)> = schema
            .fields()
            .iter()
            .filter_map(|f| Some((array_element(&f.name, name)?, f.index)))
            .collect();
        elements.sort_unstable();
        elements
            .into_iter()
            .map(|(_, index)| self.values.get(index))
            .collect()
    }

    /// JSON rendering keyed by semantic field name; unpopulated fields are
    /// `null`.
    pub fn to_json(&self, schema: &RecordSchema) -> Value {
        let mut fields = Map::new();
        for field in schema.fields() {
            let value = match self.values.get(field.index) {
                Some(FieldValue::Integer(v)) => json!(v),
                Some(FieldValue::Float(v)) => json!(v),
                Some(FieldValue::Char(c)) => json!(c.to_string()),
                Some(FieldValue::Text(s)) => json!(s),
                None => Value::Null,
            };
            fields.insert(field.name.clone(), value);
        }
        json!({
            "record": self.record,
            "generation": self.generation.get(),
            "published_by": self.published_by.as_str(),
            "published_at_ns": system_time_to_ns(self.published_at),
            "fields": fields,
        })
    }
}

fn array_element(field: &str, array: &str) -> Option<usize> {
    field
        .strip_prefix(array)?
        .strip_prefix('[')?
        .strip_suffix(']')?
        .parse()
        .ok()
}
