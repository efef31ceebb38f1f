//! On-disk record frame: 64-byte header followed by the field slots.
//!
//! ```text
//! offset  size  field
//!      0     8  magic            "ORBXREC\0"
//!      8     2  format_version
//!     10     2  flags            FrameFlags
//!     12     1  publisher        ProcessRole code
//!     13     1  reserved
//!     14     2  field_count
//!     16     4  layout_hash      RecordSchema::layout_hash
//!     20     4  payload_len
//!     24     8  generation
//!     32     8  published_at_ns  since UNIX epoch
//!     40     8  aux_ns           capture time (backups), else 0
//!     48     4  payload_checksum FNV-1a over the payload
//!     52     4  header_checksum  FNV-1a over bytes 0..52
//!     56     8  reserved
//! ```
//!
//! All integers are little-endian. A frame is only ever written whole to a
//! stage file and renamed into place, so a reader either sees a complete
//! frame or the previous one; the checksums catch everything else
//! (truncation by a full disk, stray edits, files from another schema).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use orbit::role::ProcessRole;
use orbit::schema::{FieldType, FieldValue, FieldValues, RecordSchema};
use static_assertions::const_assert_eq;

use crate::error::{BusError, BusResult};
use crate::generation::Generation;
use crate::snapshot::RecordSnapshot;

/// Magic bytes identifying a record frame: `"ORBXREC\0"`.
pub const FRAME_MAGIC: [u8; 8] = *b"ORBXREC\0";

/// Current frame format version.
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 64;

const HEADER_CHECKSUM_SPAN: usize = 52;

const PRESENT: u8 = 1;
const ABSENT: u8 = 0;

bitflags! {
    /// Frame header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u16 {
        /// Written by a merge of several owners.
        const CO_OWNED = 0x0001;
        /// Frame is a backup copy; `aux_ns` holds the capture time.
        const BACKUP   = 0x0002;
    }
}

/// In-memory image of the header, laid out as on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FrameHeader {
    /// Must equal [`FRAME_MAGIC`].
    pub magic: [u8; 8],
    /// Format version.
    pub format_version: u16,
    /// Raw [`FrameFlags`] bits.
    pub flags: u16,
    /// [`ProcessRole`] code of the last publisher.
    pub publisher: u8,
    /// Reserved, zero.
    pub _reserved0: u8,
    /// Number of fields in the schema.
    pub field_count: u16,
    /// Layout hash of the schema that wrote the frame.
    pub layout_hash: u32,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Publish generation.
    pub generation: u64,
    /// Publish time, ns since UNIX epoch.
    pub published_at_ns: u64,
    /// Auxiliary timestamp (backup capture time), ns since UNIX epoch.
    pub aux_ns: u64,
    /// FNV-1a checksum of the payload.
    pub payload_checksum: u32,
    /// FNV-1a checksum of the first 52 header bytes.
    pub header_checksum: u32,
    /// Reserved, zero.
    pub _reserved1: [u8; 8],
}

const_assert_eq!(core::mem::size_of::<FrameHeader>(), HEADER_SIZE);

impl FrameHeader {
    /// Decoded flags; unknown bits are dropped.
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }

    /// Publisher role, if the code is valid.
    pub fn publisher(&self) -> Option<ProcessRole> {
        ProcessRole::from_u8(self.publisher)
    }

    /// Publish generation of the frame.
    pub fn generation(&self) -> Generation {
        Generation::new(self.generation)
    }

    /// Publish time.
    pub fn published_at(&self) -> SystemTime {
        ns_to_system_time(self.published_at_ns)
    }

    /// Backup capture time, if this is a backup frame.
    pub fn captured_at(&self) -> Option<SystemTime> {
        self.flags()
            .contains(FrameFlags::BACKUP)
            .then(|| ns_to_system_time(self.aux_ns))
    }

    /// Serialize to the on-disk byte layout, computing the header checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..10].copy_from_slice(&self.format_version.to_le_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12] = self.publisher;
        buf[13] = 0;
        buf[14..16].copy_from_slice(&self.field_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.layout_hash.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.generation.to_le_bytes());
        buf[32..40].copy_from_slice(&self.published_at_ns.to_le_bytes());
        buf[40..48].copy_from_slice(&self.aux_ns.to_le_bytes());
        buf[48..52].copy_from_slice(&self.payload_checksum.to_le_bytes());
        let checksum = fnv1a(&buf[..HEADER_CHECKSUM_SPAN]);
        buf[52..56].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse and validate magic, version and header checksum.
    ///
    /// `record` only labels errors.
    pub fn parse(record: &str, bytes: &[u8]) -> BusResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(BusError::corrupted(
                record,
                format!("file is {} bytes, shorter than the header", bytes.len()),
            ));
        }
        let b = &bytes[..HEADER_SIZE];
        if b[0..8] != FRAME_MAGIC {
            return Err(BusError::corrupted(record, "bad magic"));
        }

        let header = Self {
            magic: FRAME_MAGIC,
            format_version: u16::from_le_bytes([b[8], b[9]]),
            flags: u16::from_le_bytes([b[10], b[11]]),
            publisher: b[12],
            _reserved0: 0,
            field_count: u16::from_le_bytes([b[14], b[15]]),
            layout_hash: read_u32(b, 16),
            payload_len: read_u32(b, 20),
            generation: read_u64(b, 24),
            published_at_ns: read_u64(b, 32),
            aux_ns: read_u64(b, 40),
            payload_checksum: read_u32(b, 48),
            header_checksum: read_u32(b, 52),
            _reserved1: [0; 8],
        };

        if header.format_version != FORMAT_VERSION {
            return Err(BusError::corrupted(
                record,
                format!("unsupported format version {}", header.format_version),
            ));
        }
        if fnv1a(&b[..HEADER_CHECKSUM_SPAN]) != header.header_checksum {
            return Err(BusError::corrupted(record, "header checksum mismatch"));
        }
        if header.publisher().is_none() {
            return Err(BusError::corrupted(
                record,
                format!("invalid publisher code {}", header.publisher),
            ));
        }
        Ok(header)
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Validated header.
    pub header: FrameHeader,
    /// Decoded contents.
    pub snapshot: RecordSnapshot,
}

/// Encode `snapshot` as a complete frame for `schema`.
///
/// Values are expected to have been validated against the schema. Fields
/// absent from the snapshot, or whose value does not fit the slot type, are
/// written as not-present slots.
pub fn encode(
    schema: &RecordSchema,
    snapshot: &RecordSnapshot,
    flags: FrameFlags,
    aux: Option<SystemTime>,
) -> Vec<u8> {
    let mut payload = vec![0u8; schema.payload_len()];
    for (position, field) in schema.fields().iter().enumerate() {
        let Some(value) = snapshot.values().get(field.index) else {
            continue;
        };
        let slot = schema.slot(position);
        let out = &mut payload[slot.offset..slot.offset + slot.width];
        if encode_value(value, field.field_type, &mut out[1..]) {
            out[0] = PRESENT;
        }
    }

    let header = FrameHeader {
        magic: FRAME_MAGIC,
        format_version: FORMAT_VERSION,
        flags: flags.bits(),
        publisher: snapshot.published_by().code(),
        _reserved0: 0,
        field_count: schema.fields().len() as u16,
        layout_hash: schema.layout_hash(),
        payload_len: payload.len() as u32,
        generation: snapshot.generation().get(),
        published_at_ns: system_time_to_ns(snapshot.published_at()),
        aux_ns: aux.map(system_time_to_ns).unwrap_or(0),
        payload_checksum: fnv1a(&payload),
        header_checksum: 0,
        _reserved1: [0; 8],
    };

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Decode and fully validate a frame against `schema`.
pub fn decode(schema: &RecordSchema, bytes: &[u8]) -> BusResult<Frame> {
    let record = schema.name();
    let header = FrameHeader::parse(record, bytes)?;

    if header.layout_hash != schema.layout_hash() {
        return Err(BusError::corrupted(
            record,
            format!(
                "layout hash {:#010x} does not match schema {:#010x}",
                header.layout_hash,
                schema.layout_hash()
            ),
        ));
    }
    if header.field_count as usize != schema.fields().len() {
        return Err(BusError::corrupted(
            record,
            format!(
                "frame has {} fields, schema has {}",
                header.field_count,
                schema.fields().len()
            ),
        ));
    }
    let expected_len = HEADER_SIZE + schema.payload_len();
    if header.payload_len as usize != schema.payload_len() || bytes.len() != expected_len {
        return Err(BusError::corrupted(
            record,
            format!("frame is {} bytes, expected {expected_len}", bytes.len()),
        ));
    }

    let payload = &bytes[HEADER_SIZE..];
    if fnv1a(payload) != header.payload_checksum {
        return Err(BusError::corrupted(record, "payload checksum mismatch"));
    }

    let mut values = FieldValues::new();
    for (position, field) in schema.fields().iter().enumerate() {
        let slot = schema.slot(position);
        let raw = &payload[slot.offset..slot.offset + slot.width];
        match raw[0] {
            ABSENT => {}
            PRESENT => {
                let value = decode_value(field.field_type, &raw[1..]).map_err(|reason| {
                    BusError::corrupted(record, format!("field {}: {reason}", field.index))
                })?;
                values.insert(field.index, value);
            }
            other => {
                return Err(BusError::corrupted(
                    record,
                    format!("field {}: invalid presence byte {other}", field.index),
                ));
            }
        }
    }

    let publisher = header
        .publisher()
        .ok_or_else(|| BusError::corrupted(record, "invalid publisher"))?;
    let snapshot = RecordSnapshot::new(
        record,
        header.generation(),
        publisher,
        header.published_at(),
        values,
    );
    Ok(Frame { header, snapshot })
}

fn encode_value(value: &FieldValue, ty: FieldType, out: &mut [u8]) -> bool {
    match (value, ty) {
        (FieldValue::Integer(v), FieldType::Integer) => out.copy_from_slice(&v.to_le_bytes()),
        (FieldValue::Float(v), FieldType::FloatingPoint) => {
            out.copy_from_slice(&v.to_bits().to_le_bytes())
        }
        (FieldValue::Char(c), FieldType::Character) => {
            out.copy_from_slice(&(*c as u32).to_le_bytes())
        }
        (FieldValue::Text(s), FieldType::FixedString(_)) => {
            let bytes = s.as_bytes();
            let n = bytes.len().min(out.len());
            out[..n].copy_from_slice(&bytes[..n]);
        }
        _ => return false,
    }
    true
}

fn decode_value(ty: FieldType, raw: &[u8]) -> Result<FieldValue, String> {
    match ty {
        FieldType::Integer => Ok(FieldValue::Integer(read_u64(raw, 0) as i64)),
        FieldType::FloatingPoint => Ok(FieldValue::Float(f64::from_bits(read_u64(raw, 0)))),
        FieldType::Character => {
            let code = read_u32(raw, 0);
            char::from_u32(code)
                .filter(char::is_ascii)
                .map(FieldValue::Char)
                .ok_or_else(|| format!("invalid character code {code:#x}"))
        }
        FieldType::FixedString(_) => {
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            if raw[end..].iter().any(|b| *b != 0) {
                return Err("string padding is not zeroed".to_string());
            }
            std::str::from_utf8(&raw[..end])
                .map(|s| FieldValue::Text(s.to_string()))
                .map_err(|e| format!("invalid UTF-8: {e}"))
        }
    }
}

#[inline]
fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[inline]
fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(word)
}

/// 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811C_9DC5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET_BASIS, |hash, b| {
        (hash ^ *b as u32).wrapping_mul(PRIME)
    })
}

/// Nanoseconds since UNIX epoch; times before the epoch map to 0.
pub fn system_time_to_ns(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// Inverse of [`system_time_to_ns`].
pub fn ns_to_system_time(ns: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit::schema::{Field, RecordTiming};

    fn schema() -> RecordSchema {
        RecordSchema::new(
            "engineering",
            vec![
                Field::new(1, "throttle", FieldType::FloatingPoint, ProcessRole::Engineering),
                Field::new(2, "pumps", FieldType::Integer, ProcessRole::Engineering),
                Field::new(3, "mode", FieldType::Character, ProcessRole::Engineering),
                Field::new(4, "target", FieldType::FixedString(8), ProcessRole::Piloting),
            ],
            RecordTiming::from_interval(Duration::from_millis(100), 5),
            false,
        )
        .unwrap()
    }

    fn snapshot(values: FieldValues) -> RecordSnapshot {
        RecordSnapshot::new(
            "engineering",
            Generation::new(5),
            ProcessRole::Engineering,
            ns_to_system_time(1_700_000_000_123_456_789),
            values,
        )
    }

    #[test]
    fn header_size() {
        assert_eq!(core::mem::size_of::<FrameHeader>(), HEADER_SIZE);
    }

    #[test]
    fn encode_decode_preserves_values_and_absence() {
        let schema = schema();
        let values = FieldValues::new()
            .with(1, 0.75)
            .with(2, -3i64)
            .with(3, 'R');
        let bytes = encode(&schema, &snapshot(values.clone()), FrameFlags::CO_OWNED, None);
        assert_eq!(bytes.len(), HEADER_SIZE + schema.payload_len());

        let frame = decode(&schema, &bytes).unwrap();
        assert_eq!(frame.snapshot.values(), &values);
        assert!(!frame.snapshot.values().contains(4));
        assert_eq!(frame.snapshot.generation(), Generation::new(5));
        assert_eq!(frame.header.flags(), FrameFlags::CO_OWNED);
        assert_eq!(
            system_time_to_ns(frame.snapshot.published_at()),
            1_700_000_000_123_456_789
        );
        assert_eq!(frame.header.captured_at(), None);
    }

    #[test]
    fn backup_frame_carries_capture_time() {
        let schema = schema();
        let captured = ns_to_system_time(42_000);
        let bytes = encode(
            &schema,
            &snapshot(FieldValues::new().with(4, "AYSE")),
            FrameFlags::BACKUP,
            Some(captured),
        );
        let frame = decode(&schema, &bytes).unwrap();
        assert_eq!(frame.header.captured_at(), Some(captured));
        assert_eq!(
            frame.snapshot.values().get(4).and_then(|v| v.as_str()),
            Some("AYSE")
        );
    }

    #[test]
    fn flipped_payload_byte_detected() {
        let schema = schema();
        let mut bytes = encode(
            &schema,
            &snapshot(FieldValues::new().with(1, 1.0)),
            FrameFlags::empty(),
            None,
        );
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode(&schema, &bytes),
            Err(BusError::RecordCorrupted { .. })
        ));
    }

    #[test]
    fn truncated_and_foreign_frames_rejected() {
        let schema = schema();
        let bytes = encode(
            &schema,
            &snapshot(FieldValues::new().with(1, 1.0)),
            FrameFlags::empty(),
            None,
        );
        assert!(decode(&schema, &bytes[..bytes.len() - 3]).is_err());
        assert!(decode(&schema, &bytes[..10]).is_err());

        let other = RecordSchema::new(
            "engineering",
            vec![Field::new(1, "throttle", FieldType::Integer, ProcessRole::Engineering)],
            RecordTiming::from_interval(Duration::from_millis(100), 5),
            false,
        )
        .unwrap();
        let err = decode(&other, &bytes).unwrap_err();
        assert!(err.to_string().contains("layout hash"));
    }

    #[test]
    fn header_tamper_detected() {
        let schema = schema();
        let mut bytes = encode(
            &schema,
            &snapshot(FieldValues::new().with(1, 1.0)),
            FrameFlags::empty(),
            None,
        );
        bytes[24] ^= 0x01; // generation
        let err = FrameHeader::parse("engineering", &bytes).unwrap_err();
        assert!(err.to_string().contains("header checksum"));
    }

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0x811C_9DC5);
        assert_eq!(fnv1a(b"a"), 0xE40C_292C);
    }
}
