//! Resolution handlers, one per entity kind.
//!
//! Every handler follows the same shape: re-read the row, confirm it is
//! still due, attempt the external side effect, then perform the conditional
//! store write. A not-found answer from the platform is terminal cleanup; a
//! transient answer leaves the row untouched for the next sweep.

mod effect;
mod privilege;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::error;

pub use effect::EffectHandler;
pub use privilege::{GrantOutcome, PrivilegeHandler};

use crate::error::Result;
use crate::timers::EntityKey;

/// What one resolution attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Side effect applied and the row reached its terminal state.
    Resolved,
    /// The subject could not be found anywhere; the row was cleaned up.
    Unreachable,
    /// Transient platform failure; the row stays due for the next sweep.
    Deferred,
    /// Another path resolved it first. No side effect was applied.
    AlreadyResolved,
    /// The row is not due yet (or never expires); its timer was re-armed.
    NotDue,
    /// A re-grant replaced the row while this resolution was running; the
    /// newer grant stays in force.
    Superseded,
    /// Another resolution of the same entity is running in this process.
    InFlight,
}

/// Per-sweep tally, logged by the runner.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub resolved: usize,
    pub unreachable: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepStats {
    pub fn record(&mut self, outcome: &Result<Resolution>) {
        match outcome {
            Ok(Resolution::Resolved) => self.resolved += 1,
            Ok(Resolution::Unreachable) => self.unreachable += 1,
            Ok(Resolution::Deferred) => self.deferred += 1,
            Ok(_) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: SweepStats) {
        self.resolved += other.resolved;
        self.unreachable += other.unreachable;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn is_empty(&self) -> bool {
        *self == SweepStats::default()
    }
}

/// Log a failed resolution and keep going. Used by every sweep loop so one
/// entity's failure never stops the rest.
pub(crate) fn log_failure(key: &EntityKey, outcome: &Result<Resolution>) {
    if let Err(e) = outcome {
        error!(key = %key, error = %e, "resolution failed");
    }
}

/// Entities whose resolution is currently running in this process.
///
/// Two interleaved resolutions of the same entity would otherwise both pass
/// the "still due" check before either writes. The conditional store write
/// remains the durable guard; this only avoids duplicate external calls.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<EntityKey>>>,
}

impl InFlight {
    /// Claim `key`, or `None` if another task holds it.
    pub fn try_acquire(&self, key: EntityKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key,
        })
    }

    #[cfg(test)]
    fn contains(&self, key: &EntityKey) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<EntityKey>>>,
    key: EntityKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
