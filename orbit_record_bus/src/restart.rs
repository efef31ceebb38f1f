//! Restart handshake over a single signal file.
//!
//! ```text
//!            request(P, target)         acknowledge(target)
//!   Normal ─────────────────────► Requested ──────────────────► Acknowledged
//!     ▲                                                              │
//!     └──────────────────────────── reset(P) ─────────────────────────┘
//! ```
//!
//! `restart.sig` holds four ASCII bytes: the state (`N`, `R`, `A`), then the
//! tags of the last writer, the requester and the target, `-` for none.
//! Every transition is a read-modify-write under an exclusive lock on
//! `restart.lock`, published by staged rename.

use std::fmt;
use std::path::{Path, PathBuf};

use orbit::config::BusConfig;
use orbit::consts::{RESTART_LOCK_FILE, RESTART_SIGNAL_FILE};
use orbit::role::ProcessRole;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{BusError, BusResult};
use crate::platform::lock_exclusive;
use crate::stage::write_staged;

const NONE_TAG: u8 = b'-';

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartState {
    /// No restart in progress.
    Normal,
    /// A role asked for a restart; waiting for the target.
    RestartRequested,
    /// The target restarted; waiting for the requester to reset.
    RestartAcknowledged,
}

impl RestartState {
    /// On-disk discriminant.
    pub const fn code(self) -> u8 {
        match self {
            Self::Normal => b'N',
            Self::RestartRequested => b'R',
            Self::RestartAcknowledged => b'A',
        }
    }

    /// Inverse of [`RestartState::code`].
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            b'N' => Some(Self::Normal),
            b'R' => Some(Self::RestartRequested),
            b'A' => Some(Self::RestartAcknowledged),
            _ => None,
        }
    }
}

impl fmt::Display for RestartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::RestartRequested => write!(f, "restart-requested"),
            Self::RestartAcknowledged => write!(f, "restart-acknowledged"),
        }
    }
}

/// Decoded contents of the signal file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestartSignal {
    /// Current state.
    pub state: RestartState,
    /// Role that performed the last transition.
    pub written_by: Option<ProcessRole>,
    /// Role that requested the restart in flight.
    pub requested_by: Option<ProcessRole>,
    /// Role asked to restart; `None` means any role may acknowledge.
    pub target: Option<ProcessRole>,
}

impl RestartSignal {
    /// Initial signal.
    pub const NORMAL: Self = Self {
        state: RestartState::Normal,
        written_by: None,
        requested_by: None,
        target: None,
    };

    fn encode(&self) -> [u8; 5] {
        [
            self.state.code(),
            tag(self.written_by),
            tag(self.requested_by),
            tag(self.target),
            b'\n',
        ]
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let body = bytes.trim_ascii_end();
        let [state, written_by, requested_by, target] = body else {
            return Err(format!("expected 4 signal bytes, found {}", body.len()));
        };
        let state = RestartState::from_code(*state)
            .ok_or_else(|| format!("invalid state byte {:?}", *state as char))?;
        let signal = Self {
            state,
            written_by: untag(*written_by)?,
            requested_by: untag(*requested_by)?,
            target: untag(*target)?,
        };
        if signal.state != RestartState::Normal && signal.requested_by.is_none() {
            return Err(format!("state {state} without a requester"));
        }
        Ok(signal)
    }

    /// Whether `role` is the one expected to acknowledge.
    pub fn targets(&self, role: ProcessRole) -> bool {
        self.state == RestartState::RestartRequested && self.target.is_none_or(|t| t == role)
    }
}

impl fmt::Display for RestartSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |r: Option<ProcessRole>| r.map_or("-", ProcessRole::as_str);
        write!(
            f,
            "{} (requested by {}, target {}, last written by {})",
            self.state,
            show(self.requested_by),
            show(self.target),
            show(self.written_by)
        )
    }
}

fn tag(role: Option<ProcessRole>) -> u8 {
    role.map_or(NONE_TAG, ProcessRole::tag)
}

fn untag(byte: u8) -> Result<Option<ProcessRole>, String> {
    if byte == NONE_TAG {
        return Ok(None);
    }
    ProcessRole::from_tag(byte)
        .map(Some)
        .ok_or_else(|| format!("invalid role tag {:?}", byte as char))
}

/// Result of [`RestartSignalChannel::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The channel moved to `RestartRequested`.
    Requested,
    /// A restart cycle was already in flight; the request was merged into it.
    Coalesced,
}

/// The restart signal file and its lock.
#[derive(Debug, Clone)]
pub struct RestartSignalChannel {
    path: PathBuf,
    lock_path: PathBuf,
    durable: bool,
}

impl RestartSignalChannel {
    /// Open the channel in `dir`, creating the signal file in `Normal` if
    /// it does not exist.
    pub fn open(dir: &Path, durable: bool) -> BusResult<Self> {
        std::fs::create_dir_all(dir)?;
        let channel = Self {
            path: dir.join(RESTART_SIGNAL_FILE),
            lock_path: dir.join(RESTART_LOCK_FILE),
            durable,
        };
        let _lock = lock_exclusive(&channel.lock_path)?;
        if !channel.path.exists() {
            channel.write(&RestartSignal::NORMAL)?;
            info!(path = %channel.path.display(), "restart signal initialized");
        }
        Ok(channel)
    }

    /// Open using the `[bus]` configuration section.
    pub fn from_config(bus: &BusConfig) -> BusResult<Self> {
        Self::open(&bus.dir, bus.durable)
    }

    /// Signal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current signal. A malformed file is `RecordCorrupted`.
    pub fn current(&self) -> BusResult<RestartSignal> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BusError::RecordUnavailable {
                    record: RESTART_SIGNAL_FILE.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        RestartSignal::decode(&bytes).map_err(|reason| BusError::corrupted(RESTART_SIGNAL_FILE, reason))
    }

    /// Ask for a restart of `target` (`None`: any role may acknowledge).
    ///
    /// A request while a cycle is in flight is coalesced into it, not queued.
    pub fn request(&self, role: ProcessRole, target: Option<ProcessRole>) -> BusResult<RequestOutcome> {
        let _lock = lock_exclusive(&self.lock_path)?;
        let current = self.current()?;
        if current.state != RestartState::Normal {
            warn!(%role, in_flight = %current, "restart request coalesced");
            return Ok(RequestOutcome::Coalesced);
        }
        self.write(&RestartSignal {
            state: RestartState::RestartRequested,
            written_by: Some(role),
            requested_by: Some(role),
            target,
        })?;
        info!(
            %role,
            target = target.map_or("any", ProcessRole::as_str),
            "restart requested"
        );
        Ok(RequestOutcome::Requested)
    }

    /// Confirm that `role` has reinitialized.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless a request is pending that targets `role`
    /// (or names no target).
    pub fn acknowledge(&self, role: ProcessRole) -> BusResult<()> {
        let _lock = lock_exclusive(&self.lock_path)?;
        let current = self.current()?;
        if !current.targets(role) {
            return Err(BusError::InvalidTransition {
                role,
                action: "acknowledge",
                state: current.state,
            });
        }
        self.write(&RestartSignal {
            state: RestartState::RestartAcknowledged,
            written_by: Some(role),
            ..current
        })?;
        info!(%role, "restart acknowledged");
        Ok(())
    }

    /// Close the cycle and return to `Normal`.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the state is `RestartAcknowledged` and
    /// `role` is the requester.
    pub fn reset(&self, role: ProcessRole) -> BusResult<()> {
        let _lock = lock_exclusive(&self.lock_path)?;
        let current = self.current()?;
        if current.state != RestartState::RestartAcknowledged || current.requested_by != Some(role) {
            return Err(BusError::InvalidTransition {
                role,
                action: "reset",
                state: current.state,
            });
        }
        self.write(&RestartSignal {
            written_by: Some(role),
            ..RestartSignal::NORMAL
        })?;
        info!(%role, "restart cycle complete");
        Ok(())
    }

    /// Operator override: rewrite the file as `Normal` regardless of its
    /// state or contents.
    pub fn force_reset(&self, role: ProcessRole) -> BusResult<()> {
        let _lock = lock_exclusive(&self.lock_path)?;
        warn!(%role, "restart signal forcibly reset");
        self.write(&RestartSignal {
            written_by: Some(role),
            ..RestartSignal::NORMAL
        })
    }

    fn write(&self, signal: &RestartSignal) -> BusResult<()> {
        write_staged(&self.path, &signal.encode(), self.durable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn signal_encoding() {
        let signal = RestartSignal {
            state: RestartState::RestartRequested,
            written_by: Some(ProcessRole::Piloting),
            requested_by: Some(ProcessRole::Piloting),
            target: None,
        };
        assert_eq!(&signal.encode(), b"RPP-\n");
        assert_eq!(RestartSignal::decode(b"RPP-\n"), Ok(signal));
        assert_eq!(RestartSignal::decode(b"N---"), Ok(RestartSignal::NORMAL));
        assert!(RestartSignal::decode(b"X---").is_err());
        assert!(RestartSignal::decode(b"R---").is_err());
        assert!(RestartSignal::decode(b"NE").is_err());
    }

    #[test]
    fn open_creates_normal_signal() {
        let dir = TempDir::new().unwrap();
        let channel = RestartSignalChannel::open(dir.path(), false).unwrap();
        assert_eq!(channel.current().unwrap(), RestartSignal::NORMAL);
        assert_eq!(std::fs::read(channel.path()).unwrap(), b"N---\n");
    }

    #[test]
    fn malformed_signal_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let channel = RestartSignalChannel::open(dir.path(), false).unwrap();
        std::fs::write(channel.path(), b"?").unwrap();
        assert!(matches!(
            channel.current(),
            Err(BusError::RecordCorrupted { .. })
        ));
        assert!(channel.request(ProcessRole::Piloting, None).is_err());

        channel.force_reset(ProcessRole::Other).unwrap();
        assert_eq!(channel.current().unwrap().state, RestartState::Normal);
    }

    #[test]
    fn untargeted_request_acknowledged_by_anyone() {
        let dir = TempDir::new().unwrap();
        let channel = RestartSignalChannel::open(dir.path(), false).unwrap();
        channel.request(ProcessRole::TopologyMapper, None).unwrap();
        channel.acknowledge(ProcessRole::Piloting).unwrap();
        let signal = channel.current().unwrap();
        assert_eq!(signal.state, RestartState::RestartAcknowledged);
        assert_eq!(signal.written_by, Some(ProcessRole::Piloting));
        assert_eq!(signal.requested_by, Some(ProcessRole::TopologyMapper));
    }
}
