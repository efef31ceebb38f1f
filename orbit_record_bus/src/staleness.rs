//! Staleness and abandonment classification.
//!
//! There is no push notification on the bus: a reader only learns that an
//! owner is alive by seeing the generation advance between polls. The rules,
//! with `elapsed` measured from the last observed generation change:
//!
//! 1. `elapsed > abandon_after` → [`Freshness::Abandoned`], whatever the
//!    generation says;
//! 2. generation advanced → [`Freshness::Fresh`];
//! 3. `elapsed < expected_interval` → [`Freshness::Fresh`] (next publish not
//!    yet due);
//! 4. otherwise → [`Freshness::Stale`].

use std::fmt;
use std::time::{Duration, Instant};

use orbit::schema::RecordTiming;
use serde::Serialize;
use tracing::{info, warn};

use crate::generation::Generation;

/// Classification of one observation of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Recently updated, or not yet due.
    Fresh,
    /// Overdue but within the abandonment threshold.
    Stale,
    /// Silent past the abandonment threshold; owner presumed crashed.
    Abandoned,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Thresholds used by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Owner's expected publish interval.
    pub expected_interval: Duration,
    /// Silence after which the owner is presumed crashed.
    pub abandon_after: Duration,
}

impl From<RecordTiming> for StalenessPolicy {
    fn from(timing: RecordTiming) -> Self {
        Self {
            expected_interval: timing.expected_interval,
            abandon_after: timing.abandon_after,
        }
    }
}

/// Pure classification of one observation.
pub fn classify(
    last_generation: Generation,
    last_observed_at: Instant,
    current_generation: Generation,
    now: Instant,
    policy: StalenessPolicy,
) -> Freshness {
    let elapsed = now.saturating_duration_since(last_observed_at);
    if elapsed > policy.abandon_after {
        Freshness::Abandoned
    } else if current_generation > last_generation {
        Freshness::Fresh
    } else if elapsed < policy.expected_interval {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}

/// Per-subscription staleness state.
#[derive(Debug, Clone)]
pub struct StalenessTracker {
    record: String,
    policy: StalenessPolicy,
    last_generation: Generation,
    last_change_at: Instant,
    last: Option<Freshness>,
    stale_count: u32,
}

impl StalenessTracker {
    /// Start tracking at `now`; the first publish is expected within one
    /// interval from here.
    pub fn new(record: impl Into<String>, policy: StalenessPolicy, now: Instant) -> Self {
        Self {
            record: record.into(),
            policy,
            last_generation: Generation::ZERO,
            last_change_at: now,
            last: None,
            stale_count: 0,
        }
    }

    /// Classify an observation of `current` at `now` and remember it.
    pub fn observe(&mut self, current: Generation, now: Instant) -> Freshness {
        let freshness = classify(
            self.last_generation,
            self.last_change_at,
            current,
            now,
            self.policy,
        );
        if current > self.last_generation {
            self.last_generation = current;
            self.last_change_at = now;
        }
        self.note(freshness);
        freshness
    }

    /// Classify a poll that produced no readable generation (file missing
    /// or corrupt): time passes, the generation does not advance.
    pub fn observe_missing(&mut self, now: Instant) -> Freshness {
        self.observe(self.last_generation, now)
    }

    fn note(&mut self, freshness: Freshness) {
        match freshness {
            Freshness::Stale => self.stale_count += 1,
            _ => self.stale_count = 0,
        }
        match (self.last, freshness) {
            (Some(Freshness::Abandoned), Freshness::Abandoned) => {}
            (_, Freshness::Abandoned) => warn!(
                record = %self.record,
                generation = %self.last_generation,
                abandon_after_ms = self.policy.abandon_after.as_millis() as u64,
                "record abandoned"
            ),
            (Some(Freshness::Abandoned), _) => info!(
                record = %self.record,
                generation = %self.last_generation,
                "record recovered from abandonment"
            ),
            _ => {}
        }
        self.last = Some(freshness);
    }

    /// Whether the latest observation moved the record into `Abandoned`.
    pub fn just_abandoned(&self, previous: Option<Freshness>) -> bool {
        self.last == Some(Freshness::Abandoned) && previous != Some(Freshness::Abandoned)
    }

    /// Latest classification.
    pub fn last(&self) -> Option<Freshness> {
        self.last
    }

    /// Consecutive `Stale` observations.
    pub fn stale_count(&self) -> u32 {
        self.stale_count
    }

    /// Last generation seen to advance.
    pub fn last_generation(&self) -> Generation {
        self.last_generation
    }

    /// Policy in force.
    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    /// Restart the observation window (after a restart handshake), keeping
    /// the last generation.
    pub fn reset(&mut self, now: Instant) {
        self.last_change_at = now;
        self.last = None;
        self.stale_count = 0;
    }
}
