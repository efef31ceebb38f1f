//! # Orbit Record Bus
//!
//! A file-based bus that lets independent simulation processes (engineering
//! console, piloting console, topology mapper, peers) share fixed-layout
//! records. Each record is one file in a shared directory; every field has
//! exactly one owning role, and readers never observe a half-written record.
//!
//! ## Features
//!
//! - **Atomic publish**: frames are staged next to the live file and renamed
//!   over it, so a reader sees either the old or the new frame
//! - **Ownership enforcement**: a role may only publish fields the role
//!   table assigns to it; violations are rejected before any I/O
//! - **Co-owned records**: disjoint write sets of several roles are merged
//!   under an advisory lock
//! - **Monotonic generations**: a per-record ledger survives corrupt or
//!   deleted record files
//! - **Staleness detection**: `Fresh` / `Stale` / `Abandoned` classification
//!   against each record's expected interval
//! - **Backups**: slow-cadence copies used when the live file is unreadable
//! - **Restart handshake**: a single signal file walks
//!   `Normal → RestartRequested → RestartAcknowledged → Normal`
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────────────────┐   read    ┌──────────────┐
//! │ Engineering  ├──────────► │ <dir>/engineering.rec    ├─────────► │ Piloting     │
//! │ Participant  │  (stage +  │ <dir>/engineering.lock   │           │ Participant  │
//! │              │   rename)  │ <dir>/restart.sig        │ ◄─────────┤ (tracker)    │
//! └──────┬───────┘            └────────────┬─────────────┘  request  └──────────────┘
//!        │ capture                         │
//!        ▼                                 ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ <backup>/engineering.bak │   │ StageCleanup (orphans)   │
//! └──────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! ## Basic Publish / Read
//!
//! ```rust
//! use orbit::role::ProcessRole;
//! use orbit::schema::{Field, FieldType, FieldValues, RecordSchema, RecordTiming};
//! use orbit_record_bus::RecordStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let schema = RecordSchema::new(
//!     "engineering",
//!     vec![Field::new(1, "throttle", FieldType::FloatingPoint, ProcessRole::Engineering)],
//!     RecordTiming::from_interval(Duration::from_millis(100), 5),
//!     true,
//! )?;
//! let store = RecordStore::open(dir.path(), Arc::new(schema), false)?;
//!
//! store.publish(ProcessRole::Engineering, &FieldValues::new().with(1, 0.75))?;
//! let snapshot = store.read_latest()?;
//! assert_eq!(snapshot.generation().get(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, BusError>`:
//!
//! ```rust,no_run
//! use orbit_record_bus::{BusError, RecordStore};
//!
//! fn show(store: &RecordStore) {
//!     match store.read_latest() {
//!         Ok(snapshot) => println!("{}", snapshot.generation()),
//!         Err(BusError::RecordUnavailable { record }) => {
//!             eprintln!("'{record}' not published yet - check the owner is running");
//!         }
//!         Err(BusError::RecordCorrupted { record, reason }) => {
//!             eprintln!("'{record}' corrupted: {reason}");
//!         }
//!         Err(e) => eprintln!("unexpected error: {e}"),
//!     }
//! }
//! ```
//!
//! ## Thread Safety
//!
//! - **RecordStore**: `Clone + Send + Sync`; publishes serialize on the
//!   record lock across threads and processes
//! - **RecordReader**: one per consumer; holds the last-known-good snapshot
//! - **BackupCoordinator**: internally synchronized
//! - **Participant**: owned by one process loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod generation;
pub mod lifecycle;
pub mod participant;
pub mod platform;
pub mod reader;
pub mod restart;
pub mod snapshot;
pub mod stage;
pub mod staleness;
pub mod store;

pub use backup::{BackupCoordinator, BackupSnapshot, CaptureOutcome, Degraded};
pub use discovery::{RecordDiscovery, RecordInfo};
pub use error::{BusError, BusResult};
pub use generation::Generation;
pub use lifecycle::{StageCleanup, SweepReport};
pub use participant::{Observation, ObservationSource, Participant, RestartAction};
pub use reader::RecordReader;
pub use restart::{RequestOutcome, RestartSignal, RestartSignalChannel, RestartState};
pub use snapshot::RecordSnapshot;
pub use staleness::{Freshness, StalenessPolicy, StalenessTracker};
pub use store::RecordStore;

use orbit::config::SharedConfig;
use tracing_subscriber::{EnvFilter, fmt};

/// Log filter for a bus participant: `RUST_LOG` when set, otherwise the
/// `[shared] log_level` of the configuration.
pub fn env_filter(shared: &SharedConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(shared.log_level.as_filter()))
}

/// Initialize tracing for bus participants at the configured log level.
pub fn init_tracing(shared: &SharedConfig) {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter(shared))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit::config::LogLevel;

    #[test]
    fn filter_follows_configured_level() {
        let shared = SharedConfig {
            log_level: LogLevel::Debug,
            service_name: "orbit-bus".to_string(),
        };
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(
                env_filter(&shared).max_level_hint(),
                Some(tracing::level_filters::LevelFilter::DEBUG)
            );
        }
        // A second initialization is ignored.
        init_tracing(&shared);
        init_tracing(&shared);
    }
}
