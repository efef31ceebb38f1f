//! Record discovery by scanning the bus directory

use std::path::Path;
use std::time::SystemTime;

use orbit::consts::RECORD_FILE_EXT;
use orbit::role::ProcessRole;
use serde::Serialize;
use tracing::debug;

use crate::error::BusResult;
use crate::frame::{FrameFlags, FrameHeader, HEADER_SIZE};

/// Header-level information about one record file.
#[derive(Serialize, Debug, Clone)]
pub struct RecordInfo {
    /// Record name (file stem)
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Last publish generation
    pub generation: u64,
    /// Last publisher
    pub publisher: Option<ProcessRole>,
    /// Last publish time
    pub published_at: SystemTime,
    /// Written by a co-owner merge
    pub co_owned: bool,
    /// Number of fields
    pub field_count: u16,
    /// Schema layout hash
    pub layout_hash: u32,
    /// Header validation failure, if any
    pub error: Option<String>,
}

/// Enumerates `*.rec` files without decoding payloads.
pub struct RecordDiscovery;

impl RecordDiscovery {
    /// List every record file in `dir`, sorted by name. Files whose header
    /// fails validation are listed with `error` set.
    pub fn list(dir: &Path) -> BusResult<Vec<RecordInfo>> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_FILE_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            records.push(Self::inspect(name, &path)?);
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir = %dir.display(), count = records.len(), "records discovered");
        Ok(records)
    }

    /// Header information of a single record file.
    pub fn inspect(name: &str, path: &Path) -> BusResult<RecordInfo> {
        use std::io::Read;

        let size = std::fs::metadata(path)?.len();
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        std::fs::File::open(path)?
            .take(HEADER_SIZE as u64)
            .read_to_end(&mut buf)?;

        let info = match FrameHeader::parse(name, &buf) {
            Ok(header) => RecordInfo {
                name: name.to_string(),
                size,
                generation: header.generation,
                publisher: header.publisher(),
                published_at: header.published_at(),
                co_owned: header.flags().contains(FrameFlags::CO_OWNED),
                field_count: header.field_count,
                layout_hash: header.layout_hash,
                error: None,
            },
            Err(e) => RecordInfo {
                name: name.to_string(),
                size,
                generation: 0,
                publisher: None,
                published_at: SystemTime::UNIX_EPOCH,
                co_owned: false,
                field_count: 0,
                layout_hash: 0,
                error: Some(e.to_string()),
            },
        };
        Ok(info)
    }
}
