//! Record schemas (fixed field layouts of shared record files).
//!
//! A [`RecordSchema`] is built once at startup from the role table and is
//! immutable afterwards. It fixes the order, type and byte slot of every
//! field, and the single owner role allowed to write it.
//!
//! ## Slot layout
//!
//! Each field occupies one slot in the record payload: a presence byte
//! (`0` = never written, `1` = written) followed by the value bytes.
//!
//! | Type            | Value bytes              |
//! |-----------------|--------------------------|
//! | `Integer`       | 8 (`i64`, little-endian) |
//! | `FloatingPoint` | 8 (`f64`, little-endian) |
//! | `Character`     | 4 (`u32` scalar value)   |
//! | `FixedString(n)`| `n` (UTF-8, zero-padded) |

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::consts::{MAX_FIELDS, MAX_FIXED_STRING_LEN, MAX_RECORD_NAME_LEN};
use crate::role::ProcessRole;

/// Numeric index of a field within its record.
pub type FieldIndex = u16;

// ─── Errors ─────────────────────────────────────────────────────────

/// Schema and role table validation error.
///
/// All variants are raised at startup, before any record file is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    /// Two roles claim the same field index (single-writer invariant).
    #[error("schema conflict: index {index} of '{record}' is claimed by both {first} and {second}")]
    Conflict {
        record: String,
        index: FieldIndex,
        first: ProcessRole,
        second: ProcessRole,
    },

    /// The same owner declares an index twice.
    #[error("duplicate index {index} in record '{record}'")]
    DuplicateIndex { record: String, index: FieldIndex },

    /// Two fields of a record share a semantic name.
    #[error("duplicate field name '{field}' in record '{record}'")]
    DuplicateFieldName { record: String, field: String },

    /// Two records share a name.
    #[error("duplicate record '{record}'")]
    DuplicateRecord { record: String },

    /// A record declares no fields.
    #[error("record '{record}' has no fields")]
    EmptyRecord { record: String },

    /// A record name cannot be used as a file name.
    #[error("invalid record name '{record}': {reason}")]
    InvalidName { record: String, reason: String },

    /// A field declaration is malformed.
    #[error("invalid field '{field}' in record '{record}': {reason}")]
    InvalidField {
        record: String,
        field: String,
        reason: String,
    },

    /// Record timing is unusable.
    #[error("invalid timing for record '{record}': {reason}")]
    InvalidTiming { record: String, reason: String },

    /// A role subscribes to a record that does not exist.
    #[error("role {role} subscribes to unknown record '{record}'")]
    UnknownRecord { role: ProcessRole, record: String },

    /// A semantic field name is not part of the record.
    #[error("record '{record}' has no field named '{field}'")]
    UnknownFieldName { record: String, field: String },

    /// A role tried to bind a field it does not own.
    #[error("role {role} does not own field '{field}' of record '{record}'")]
    NotOwned {
        record: String,
        field: String,
        role: ProcessRole,
    },

    /// A value does not fit the field it is bound to.
    #[error("field '{field}' of record '{record}': {reason}")]
    ValueRejected {
        record: String,
        field: String,
        reason: String,
    },
}

// ─── FieldType ──────────────────────────────────────────────────────

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Integer,
    FloatingPoint,
    Character,
    /// UTF-8 string of at most `n` bytes.
    FixedString(u16),
}

impl FieldType {
    /// Number of value bytes in the slot (excluding the presence byte).
    pub const fn value_width(&self) -> usize {
        match self {
            Self::Integer | Self::FloatingPoint => 8,
            Self::Character => 4,
            Self::FixedString(n) => *n as usize,
        }
    }

    /// Type discriminator used in the layout hash.
    pub const fn code(&self) -> u8 {
        match self {
            Self::Integer => 0,
            Self::FloatingPoint => 1,
            Self::Character => 2,
            Self::FixedString(_) => 3,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "integer"),
            Self::FloatingPoint => write!(f, "float"),
            Self::Character => write!(f, "char"),
            Self::FixedString(n) => write!(f, "string[{n}]"),
        }
    }
}

// ─── FieldValue ─────────────────────────────────────────────────────

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Char(char),
    Text(String),
}

impl FieldValue {
    /// Check that this value can be stored in a field of type `ty`.
    pub fn check(&self, ty: FieldType) -> Result<(), String> {
        match (self, ty) {
            (Self::Integer(_), FieldType::Integer)
            | (Self::Float(_), FieldType::FloatingPoint) => Ok(()),
            (Self::Char(c), FieldType::Character) => {
                if c.is_ascii() {
                    Ok(())
                } else {
                    Err(format!("character {c:?} is not ASCII"))
                }
            }
            (Self::Text(s), FieldType::FixedString(n)) => {
                if s.len() > n as usize {
                    Err(format!("string of {} bytes exceeds fixed length {n}", s.len()))
                } else if s.contains('\0') {
                    Err("string contains NUL".to_string())
                } else {
                    Ok(())
                }
            }
            (value, ty) => Err(format!("{} value cannot be stored in {ty} field", value.kind())),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Char(_) => "char",
            Self::Text(_) => "string",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<char> {
        match self {
            Self::Char(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Flag interpretation of an integer field (switch states, pump on/off).
    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|v| v != 0)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Char(c) => write!(f, "{c:?}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<char> for FieldValue {
    fn from(c: char) -> Self {
        Self::Char(c)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

// ─── FieldValues ────────────────────────────────────────────────────

/// A set of field values keyed by index, ordered by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValues(BTreeMap<FieldIndex, FieldValue>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value. Returns `self` for chaining.
    pub fn with(mut self, index: FieldIndex, value: impl Into<FieldValue>) -> Self {
        self.0.insert(index, value.into());
        self
    }

    pub fn insert(&mut self, index: FieldIndex, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.0.insert(index, value.into())
    }

    pub fn get(&self, index: FieldIndex) -> Option<&FieldValue> {
        self.0.get(&index)
    }

    pub fn contains(&self, index: FieldIndex) -> bool {
        self.0.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = FieldIndex> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldIndex, &FieldValue)> {
        self.0.iter().map(|(i, v)| (*i, v))
    }

    /// Overwrite entries of `self` with every entry of `other`.
    pub fn overlay(&mut self, other: &FieldValues) {
        for (index, value) in other.iter() {
            self.0.insert(index, value.clone());
        }
    }
}

impl FromIterator<(FieldIndex, FieldValue)> for FieldValues {
    fn from_iter<I: IntoIterator<Item = (FieldIndex, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ─── Field ──────────────────────────────────────────────────────────

/// One field of a record schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Numeric index, unique within the record.
    pub index: FieldIndex,
    /// Semantic name (`"throttle"`, `"coolant_pump[2]"`).
    pub name: String,
    /// Value type.
    pub field_type: FieldType,
    /// The single role allowed to write this field.
    pub owner: ProcessRole,
    /// Roles declared as readers of this field.
    pub readers: Vec<ProcessRole>,
}

impl Field {
    pub fn new(
        index: FieldIndex,
        name: impl Into<String>,
        field_type: FieldType,
        owner: ProcessRole,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            field_type,
            owner,
            readers: Vec::new(),
        }
    }

    /// Add declared readers.
    pub fn read_by(mut self, readers: impl IntoIterator<Item = ProcessRole>) -> Self {
        self.readers.extend(readers);
        self
    }
}

// ─── RecordTiming ───────────────────────────────────────────────────

/// Publish cadence of a record, used for staleness classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTiming {
    /// Interval at which the owner(s) are expected to publish.
    pub expected_interval: Duration,
    /// Silence after which the owner is presumed crashed.
    pub abandon_after: Duration,
}

impl RecordTiming {
    /// Timing with `abandon_after = factor × expected_interval`.
    pub fn from_interval(expected_interval: Duration, factor: u32) -> Self {
        Self {
            expected_interval,
            abandon_after: expected_interval * factor,
        }
    }
}

// ─── RecordSchema ───────────────────────────────────────────────────

/// Byte position of a field slot within the record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// Offset of the presence byte.
    pub offset: usize,
    /// Slot width including the presence byte.
    pub width: usize,
}

/// Static description of one shared record file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    name: String,
    fields: Vec<Field>,
    slots: Vec<SlotLayout>,
    payload_len: usize,
    layout_hash: u32,
    timing: RecordTiming,
    critical: bool,
}

impl RecordSchema {
    /// Build and validate a schema. Fields are sorted by index.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the name is empty, too long or not file-name safe.
    /// - `EmptyRecord` if `fields` is empty.
    /// - `Conflict` if two different owners claim one index.
    /// - `DuplicateIndex` / `DuplicateFieldName` for repeated declarations.
    /// - `InvalidField` for zero-length or oversized fixed strings.
    /// - `InvalidTiming` for a zero interval or `abandon_after < expected_interval`.
    pub fn new(
        name: impl Into<String>,
        mut fields: Vec<Field>,
        timing: RecordTiming,
        critical: bool,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        validate_record_name(&name)?;

        if fields.is_empty() {
            return Err(SchemaError::EmptyRecord { record: name });
        }
        if fields.len() > MAX_FIELDS {
            return Err(SchemaError::InvalidField {
                record: name,
                field: String::new(),
                reason: format!("more than {MAX_FIELDS} fields"),
            });
        }
        if timing.expected_interval.is_zero() {
            return Err(SchemaError::InvalidTiming {
                record: name,
                reason: "expected interval must be non-zero".to_string(),
            });
        }
        if timing.abandon_after < timing.expected_interval {
            return Err(SchemaError::InvalidTiming {
                record: name,
                reason: format!(
                    "abandon_after ({:?}) is shorter than the expected interval ({:?})",
                    timing.abandon_after, timing.expected_interval
                ),
            });
        }

        fields.sort_by_key(|f| f.index);
        for pair in fields.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.index == b.index {
                if a.owner != b.owner {
                    return Err(SchemaError::Conflict {
                        record: name,
                        index: a.index,
                        first: a.owner,
                        second: b.owner,
                    });
                }
                return Err(SchemaError::DuplicateIndex {
                    record: name,
                    index: a.index,
                });
            }
        }

        let mut seen_names = std::collections::HashSet::new();
        for field in &fields {
            if field.name.is_empty() {
                return Err(SchemaError::InvalidField {
                    record: name,
                    field: format!("#{}", field.index),
                    reason: "field name is empty".to_string(),
                });
            }
            if !seen_names.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateFieldName {
                    record: name,
                    field: field.name.clone(),
                });
            }
            if let FieldType::FixedString(n) = field.field_type {
                if n == 0 || n > MAX_FIXED_STRING_LEN {
                    return Err(SchemaError::InvalidField {
                        record: name,
                        field: field.name.clone(),
                        reason: format!("fixed string length must be 1–{MAX_FIXED_STRING_LEN}, got {n}"),
                    });
                }
            }
        }

        let mut slots = Vec::with_capacity(fields.len());
        let mut offset = 0usize;
        for field in &fields {
            let width = 1 + field.field_type.value_width();
            slots.push(SlotLayout { offset, width });
            offset += width;
        }
        let layout_hash = layout_hash(&name, &fields);

        Ok(Self {
            name,
            fields,
            slots,
            payload_len: offset,
            layout_hash,
            timing,
            critical,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in index order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Position of `index` in [`RecordSchema::fields`].
    pub fn position(&self, index: FieldIndex) -> Option<usize> {
        self.fields.binary_search_by_key(&index, |f| f.index).ok()
    }

    pub fn field(&self, index: FieldIndex) -> Option<&Field> {
        self.position(index).map(|p| &self.fields[p])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Slot of the field at `position`.
    pub fn slot(&self, position: usize) -> SlotLayout {
        self.slots[position]
    }

    /// Payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Hash of the record name and field layout; readers refuse files whose
    /// header carries a different hash.
    pub fn layout_hash(&self) -> u32 {
        self.layout_hash
    }

    pub fn timing(&self) -> RecordTiming {
        self.timing
    }

    /// Whether abandonment of this record should trigger a restart request.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Distinct owner roles, sorted.
    pub fn owners(&self) -> Vec<ProcessRole> {
        let mut owners: Vec<_> = self.fields.iter().map(|f| f.owner).collect();
        owners.sort();
        owners.dedup();
        owners
    }

    /// More than one role writes this record.
    pub fn is_co_owned(&self) -> bool {
        self.owners().len() > 1
    }

    /// The owner of every field, if there is exactly one.
    pub fn sole_owner(&self) -> Option<ProcessRole> {
        match self.owners().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Fields written by `role`.
    pub fn owned_by(&self, role: ProcessRole) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(move |f| f.owner == role)
    }
}

fn validate_record_name(name: &str) -> Result<(), SchemaError> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.len() > MAX_RECORD_NAME_LEN {
        Some(format!("longer than {MAX_RECORD_NAME_LEN} bytes"))
    } else if name.starts_with('.') {
        Some("name starts with '.'".to_string())
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Some("only ASCII letters, digits, '_' and '-' are allowed".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SchemaError::InvalidName {
            record: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// FNV-1a over the record name and each field's `(index, type, width)`.
///
/// Ownership and reader lists do not participate: reassigning an owner does
/// not change the file layout.
fn layout_hash(name: &str, fields: &[Field]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811C_9DC5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash ^= *b as u32;
            hash = hash.wrapping_mul(PRIME);
        }
    };

    feed(name.as_bytes());
    for field in fields {
        feed(&field.index.to_le_bytes());
        feed(&[field.field_type.code()]);
        feed(&(field.field_type.value_width() as u16).to_le_bytes());
    }
    hash
}
