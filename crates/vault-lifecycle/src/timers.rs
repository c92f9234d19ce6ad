//! In-memory timers for known future resolutions.
//!
//! Timers only shorten the gap between "due" and "resolved". They are lost on
//! restart and may be cleared at any time; the poll sweep in
//! [`crate::engine::LifecycleRunner`] resolves every kind without them.
//!
//! Each armed entry carries a generation number. Arming a key again aborts
//! the old task and bumps the generation, so a timer that fired just before
//! being superseded is recognised as stale by [`TimerRegistry::take_if_current`]
//! and discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use vault_core::{Clock, PrivilegeId, SubjectId};

/// Entity kinds that own timers. [`TimerRegistry::clear_kind`] works per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Effect,
    Privilege,
    Contest,
    Heist,
}

/// Identity of the entity a timer resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Effect(String),
    Privilege {
        subject: SubjectId,
        privilege: PrivilegeId,
    },
    Contest(String),
    /// Opening boundary of a pending heist.
    HeistOpen(String),
    /// Closing boundary of a live heist.
    HeistClose(String),
}

impl EntityKey {
    pub fn privilege(subject: &SubjectId, privilege: &PrivilegeId) -> Self {
        EntityKey::Privilege {
            subject: subject.clone(),
            privilege: privilege.clone(),
        }
    }

    pub fn kind(&self) -> TimerKind {
        match self {
            EntityKey::Effect(_) => TimerKind::Effect,
            EntityKey::Privilege { .. } => TimerKind::Privilege,
            EntityKey::Contest(_) => TimerKind::Contest,
            EntityKey::HeistOpen(_) | EntityKey::HeistClose(_) => TimerKind::Heist,
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::Effect(id) => write!(f, "effect:{id}"),
            EntityKey::Privilege { subject, privilege } => {
                write!(f, "privilege:{subject}:{privilege}")
            }
            EntityKey::Contest(id) => write!(f, "contest:{id}"),
            EntityKey::HeistOpen(id) => write!(f, "heist-open:{id}"),
            EntityKey::HeistClose(id) => write!(f, "heist-close:{id}"),
        }
    }
}

/// Message sent to the runner when a timer's sleep completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub key: EntityKey,
    pub generation: u64,
}

struct Armed {
    generation: u64,
    due: DateTime<Utc>,
    handle: Option<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    armed: HashMap<EntityKey, Armed>,
    next_generation: u64,
}

/// Owned table of armed timers, shared by every component that creates
/// schedulable entities.
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<Mutex<Inner>>,
    fired_tx: mpsc::UnboundedSender<Fired>,
    clock: Arc<dyn Clock>,
}

impl TimerRegistry {
    /// Create a registry and the receiver the runner drains fired timers from.
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<Fired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            fired_tx,
            clock,
        };
        (registry, fired_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm (or re-arm) the timer for `key` to fire at `due`.
    ///
    /// A due time in the past fires on the next scheduler turn. Outside a
    /// tokio runtime the entry is recorded but no task is spawned; the poll
    /// sweep still resolves the entity.
    pub fn arm(&self, key: EntityKey, due: DateTime<Utc>) {
        let delay = (due - self.clock.now()).to_std().unwrap_or_default();
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let handle = tokio::runtime::Handle::try_current().ok().map(|rt| {
            let tx = self.fired_tx.clone();
            let fired = Fired {
                key: key.clone(),
                generation,
            };
            rt.spawn(async move {
                tokio::time::sleep(delay).await;
                // The runner may already be gone during shutdown.
                let _ = tx.send(fired);
            })
            .abort_handle()
        });

        debug!(key = %key, due = %due, generation, "timer armed");
        if let Some(old) = inner.armed.insert(
            key,
            Armed {
                generation,
                due,
                handle,
            },
        ) {
            abort(old);
        }
    }

    /// Cancel the timer for `key`, if any.
    pub fn disarm(&self, key: &EntityKey) {
        if let Some(old) = self.lock().armed.remove(key) {
            debug!(key = %key, "timer disarmed");
            abort(old);
        }
    }

    /// Cancel every timer of `kind`. Used before re-arming a kind from a
    /// freshly computed schedule.
    pub fn clear_kind(&self, kind: TimerKind) {
        let mut inner = self.lock();
        let stale: Vec<EntityKey> = inner
            .armed
            .keys()
            .filter(|k| k.kind() == kind)
            .cloned()
            .collect();
        for key in stale {
            if let Some(old) = inner.armed.remove(&key) {
                abort(old);
            }
        }
    }

    /// Accept a fired timer if it is still the armed generation for its key,
    /// removing the entry. Superseded or disarmed timers return false.
    pub fn take_if_current(&self, fired: &Fired) -> bool {
        let mut inner = self.lock();
        match inner.armed.get(&fired.key) {
            Some(armed) if armed.generation == fired.generation => {
                inner.armed.remove(&fired.key);
                true
            }
            _ => {
                debug!(key = %fired.key, generation = fired.generation, "stale timer discarded");
                false
            }
        }
    }

    pub fn is_armed(&self, key: &EntityKey) -> bool {
        self.lock().armed.contains_key(key)
    }

    pub fn due_of(&self, key: &EntityKey) -> Option<DateTime<Utc>> {
        self.lock().armed.get(key).map(|a| a.due)
    }

    pub fn armed_count(&self) -> usize {
        self.lock().armed.len()
    }
}

fn abort(armed: Armed) {
    if let Some(handle) = armed.handle {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vault_core::ManualClock;

    fn registry() -> (TimerRegistry, mpsc::UnboundedReceiver<Fired>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (registry, rx) = TimerRegistry::new(clock.clone());
        (registry, rx, clock)
    }

    #[tokio::test]
    async fn past_due_timer_fires() {
        let (registry, mut rx, clock) = registry();
        let key = EntityKey::Contest("c1".into());
        registry.arm(key.clone(), clock.now() - Duration::seconds(5));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.key, key);
        assert!(registry.take_if_current(&fired));
        assert!(!registry.is_armed(&key));
    }

    #[tokio::test]
    async fn rearming_supersedes_previous_generation() {
        let (registry, _rx, clock) = registry();
        let key = EntityKey::Effect("e1".into());
        registry.arm(key.clone(), clock.now() + Duration::hours(1));
        registry.arm(key.clone(), clock.now() + Duration::hours(2));

        assert_eq!(registry.armed_count(), 1);
        let stale = Fired { key: key.clone(), generation: 1 };
        assert!(!registry.take_if_current(&stale));
        assert!(registry.is_armed(&key));
        assert_eq!(registry.due_of(&key), Some(clock.now() + Duration::hours(2)));
    }

    #[tokio::test]
    async fn clear_kind_leaves_other_kinds() {
        let (registry, _rx, clock) = registry();
        let later = clock.now() + Duration::hours(1);
        registry.arm(EntityKey::HeistOpen("h1".into()), later);
        registry.arm(EntityKey::HeistClose("h1".into()), later);
        registry.arm(EntityKey::Contest("c1".into()), later);

        registry.clear_kind(TimerKind::Heist);
        assert_eq!(registry.armed_count(), 1);
        assert!(registry.is_armed(&EntityKey::Contest("c1".into())));
    }

    #[test]
    fn arming_without_runtime_records_entry() {
        let (registry, _rx, clock) = registry();
        let key = EntityKey::privilege(&"u1".into(), &"vip".into());
        registry.arm(key.clone(), clock.now());
        assert!(registry.is_armed(&key));
        registry.disarm(&key);
        assert_eq!(registry.armed_count(), 0);
    }
}
