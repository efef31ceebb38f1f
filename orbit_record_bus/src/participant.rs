//! One role's view of the bus: publish owned records, poll subscriptions,
//! keep backups and take part in the restart handshake.
//!
//! A process builds one [`Participant`] at startup and drives it from its
//! own loop:
//!
//! ```rust,no_run
//! use orbit::config::OrbitConfig;
//! use orbit::role::ProcessRole;
//! use orbit_record_bus::participant::{Participant, RestartAction};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrbitConfig::load_validated(Path::new("/etc/orbit/bus.toml"))?;
//! orbit_record_bus::init_tracing(&config.shared);
//! let table = config.role_table()?;
//! let mut bus = Participant::new(ProcessRole::Piloting, &table, &config.bus)?;
//!
//! loop {
//!     if let RestartAction::Reinitialize { .. } = bus.service_restart()? {
//!         // reinitialize local state, then:
//!         bus.acknowledge_restart()?;
//!     }
//!     let values = bus.adapter().values("piloting")?.set("srb_time", 12.5)?.build();
//!     bus.publish("piloting", &values)?;
//!     let engineering = bus.poll("engineering")?;
//!     if engineering.is_degraded() {
//!         // hold last-known-good values
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(50));
//! }
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use orbit::binding::ProcessRoleAdapter;
use orbit::config::BusConfig;
use orbit::role::ProcessRole;
use orbit::schema::{FieldValues, RecordSchema, SchemaError};
use orbit::table::RoleTable;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::BackupCoordinator;
use crate::error::{BusError, BusResult};
use crate::lifecycle::StageCleanup;
use crate::reader::RecordReader;
use crate::restart::{RequestOutcome, RestartSignal, RestartSignalChannel, RestartState};
use crate::snapshot::RecordSnapshot;
use crate::staleness::{Freshness, StalenessTracker};
use crate::store::RecordStore;

/// Where an observed snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObservationSource {
    /// Read from the live record file.
    Live,
    /// Live file unreadable; the reader's held snapshot.
    LastKnownGood,
    /// Live file unreadable; recovered from the backup.
    Backup,
}

/// Result of polling one subscription.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Snapshot to use.
    pub snapshot: Arc<RecordSnapshot>,
    /// Staleness classification of this poll.
    pub freshness: Freshness,
    /// Origin of `snapshot`.
    pub source: ObservationSource,
}

impl Observation {
    /// Anything other than a fresh live read.
    pub fn is_degraded(&self) -> bool {
        self.source != ObservationSource::Live || self.freshness != Freshness::Fresh
    }
}

/// What the caller should do after [`Participant::service_restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    /// A restart targeting this role is pending: reinitialize, then call
    /// [`Participant::acknowledge_restart`].
    Reinitialize {
        /// Role that asked for the restart.
        requested_by: Option<ProcessRole>,
    },
    /// This role's own request was acknowledged; the channel is back to
    /// `Normal` and staleness tracking restarted.
    Resumed,
    /// A cycle is in flight that needs nothing from this role.
    Pending(RestartSignal),
    /// No restart in progress.
    Idle,
}

struct Subscription {
    reader: RecordReader,
    tracker: StalenessTracker,
}

/// Bus endpoint of one process role.
pub struct Participant {
    adapter: ProcessRoleAdapter,
    stores: BTreeMap<String, RecordStore>,
    subscriptions: BTreeMap<String, Subscription>,
    backups: BackupCoordinator,
    restart: RestartSignalChannel,
}

impl Participant {
    /// Bind `role` to the bus described by `bus`.
    ///
    /// Creates the bus and backup directories, opens the restart channel and
    /// sweeps stage files left by crashed writers.
    pub fn new(role: ProcessRole, table: &RoleTable, bus: &BusConfig) -> BusResult<Self> {
        let adapter = ProcessRoleAdapter::bind(role, table);

        let mut stores = BTreeMap::new();
        for schema in adapter.owned_records() {
            stores.insert(
                schema.name().to_string(),
                RecordStore::from_config(bus, Arc::clone(schema))?,
            );
        }

        let now = Instant::now();
        let mut subscriptions = BTreeMap::new();
        for schema in adapter.subscriptions() {
            let store = RecordStore::from_config(bus, Arc::clone(schema))?;
            subscriptions.insert(
                schema.name().to_string(),
                Subscription {
                    reader: RecordReader::new(store),
                    tracker: StalenessTracker::new(schema.name(), schema.timing().into(), now),
                },
            );
        }

        let backups = BackupCoordinator::from_config(bus)?;
        let restart = RestartSignalChannel::from_config(bus)?;
        let swept = StageCleanup::from_config(bus).sweep_bus(bus)?;
        if swept.removed > 0 {
            info!(removed = swept.removed, "removed stage files left by crashed writers");
        }

        info!(
            %role,
            owned = stores.len(),
            subscribed = subscriptions.len(),
            dir = %bus.dir.display(),
            "joined record bus"
        );
        Ok(Self {
            adapter,
            stores,
            subscriptions,
            backups,
            restart,
        })
    }

    /// This participant's role.
    pub fn role(&self) -> ProcessRole {
        self.adapter.role()
    }

    /// Role binding.
    pub fn adapter(&self) -> &ProcessRoleAdapter {
        &self.adapter
    }

    /// Store of an owned record.
    pub fn store(&self, record: &str) -> Option<&RecordStore> {
        self.stores.get(record)
    }

    /// Backup coordinator.
    pub fn backups(&self) -> &BackupCoordinator {
        &self.backups
    }

    /// Restart channel.
    pub fn restart_channel(&self) -> &RestartSignalChannel {
        &self.restart
    }

    /// Publish this role's fields of `record`, then capture a backup if due.
    ///
    /// A failed backup capture is logged and does not fail the publish.
    pub fn publish(&self, record: &str, values: &FieldValues) -> BusResult<Arc<RecordSnapshot>> {
        let store = self.stores.get(record).ok_or_else(|| {
            BusError::Schema(SchemaError::UnknownRecord {
                role: self.adapter.role(),
                record: record.to_string(),
            })
        })?;
        let snapshot = store.publish(self.adapter.role(), values)?;
        if let Err(e) = self.backups.capture_if_due(store, Instant::now()) {
            warn!(record, error = %e, "backup capture failed");
        }
        Ok(snapshot)
    }

    /// Poll a subscription now.
    pub fn poll(&mut self, record: &str) -> BusResult<Observation> {
        self.poll_at(record, Instant::now())
    }

    /// Poll a subscription, classifying against `now`.
    ///
    /// An unreadable live file falls back to the held snapshot or the
    /// backup, whichever is newer. When a critical record becomes
    /// abandoned a restart of its owner is requested.
    pub fn poll_at(&mut self, record: &str, now: Instant) -> BusResult<Observation> {
        let role = self.adapter.role();
        let sub = self
            .subscriptions
            .get_mut(record)
            .ok_or_else(|| {
                BusError::Schema(SchemaError::UnknownRecord {
                    role,
                    record: record.to_string(),
                })
            })?;
        let schema = Arc::clone(sub.reader.store().schema());
        let previous = sub.tracker.last();

        let result = match sub.reader.read() {
            Ok(snapshot) => {
                let freshness = sub.tracker.observe(snapshot.generation(), now);
                Ok(Observation {
                    snapshot,
                    freshness,
                    source: ObservationSource::Live,
                })
            }
            Err(e) if e.is_unreadable() => {
                let freshness = sub.tracker.observe_missing(now);
                let held = sub.reader.held().cloned();
                let backup = match self.backups.recover(&schema) {
                    Ok(degraded) => Some(degraded.accept()),
                    Err(backup_err) => {
                        debug!(record, error = %backup_err, "no usable backup");
                        None
                    }
                };
                let fallback = match (held, backup) {
                    (Some(held), Some(backup)) if backup.generation() > held.generation() => {
                        Some((Arc::clone(backup.snapshot()), ObservationSource::Backup))
                    }
                    (Some(held), _) => Some((held, ObservationSource::LastKnownGood)),
                    (None, Some(backup)) => {
                        Some((Arc::clone(backup.snapshot()), ObservationSource::Backup))
                    }
                    (None, None) => None,
                };
                match fallback {
                    Some((snapshot, source)) => {
                        warn!(
                            record,
                            error = %e,
                            ?source,
                            generation = %snapshot.generation(),
                            "live record unreadable, using fallback"
                        );
                        Ok(Observation {
                            snapshot,
                            freshness,
                            source,
                        })
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let abandoned_now = sub.tracker.just_abandoned(previous);
        if abandoned_now && schema.is_critical() {
            self.request_owner_restart(&schema);
        }
        result
    }

    /// Poll every subscription.
    pub fn poll_all(&mut self) -> Vec<(String, BusResult<Observation>)> {
        let now = Instant::now();
        let records: Vec<String> = self.subscriptions.keys().cloned().collect();
        records
            .into_iter()
            .map(|record| {
                let observation = self.poll_at(&record, now);
                (record, observation)
            })
            .collect()
    }

    fn request_owner_restart(&self, schema: &RecordSchema) {
        let role = self.adapter.role();
        let target = schema.sole_owner();
        if target == Some(role) {
            return;
        }
        match self.restart.request(role, target) {
            Ok(RequestOutcome::Requested) => {
                warn!(record = %schema.name(), ?target, "critical record abandoned, restart requested")
            }
            Ok(RequestOutcome::Coalesced) => {}
            Err(e) => warn!(record = %schema.name(), error = %e, "restart request failed"),
        }
    }

    /// Consult the restart channel; call once per cycle.
    pub fn service_restart(&mut self) -> BusResult<RestartAction> {
        let role = self.adapter.role();
        let signal = self.restart.current()?;
        let action = match signal.state {
            RestartState::Normal => RestartAction::Idle,
            RestartState::RestartRequested
                if signal.targets(role) && signal.requested_by != Some(role) =>
            {
                RestartAction::Reinitialize {
                    requested_by: signal.requested_by,
                }
            }
            RestartState::RestartAcknowledged if signal.requested_by == Some(role) => {
                self.restart.reset(role)?;
                let now = Instant::now();
                for sub in self.subscriptions.values_mut() {
                    sub.reader.reset();
                    sub.tracker.reset(now);
                }
                RestartAction::Resumed
            }
            _ => RestartAction::Pending(signal),
        };
        Ok(action)
    }

    /// Confirm that this role has reinitialized after a restart request.
    pub fn acknowledge_restart(&self) -> BusResult<()> {
        self.restart.acknowledge(self.adapter.role())
    }

    /// Request a restart explicitly (operator action, or a role detecting a
    /// fault the staleness rules cannot see).
    pub fn request_restart(&self, target: Option<ProcessRole>) -> BusResult<RequestOutcome> {
        self.restart.request(self.adapter.role(), target)
    }

    /// Latest classification of a subscription.
    pub fn freshness(&self, record: &str) -> Option<Freshness> {
        self.subscriptions.get(record).and_then(|s| s.tracker.last())
    }
}
