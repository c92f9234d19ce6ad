//! `vault-lifecycle`: persistent time-scheduled lifecycle engine.
//!
//! # Overview
//!
//! Every schedulable entity is a row in SQLite whose status column is a
//! persisted state machine. Creation writes the row and returns; resolution
//! happens later, either from an in-memory timer or from the periodic poll
//! sweep, and always through a conditional write so two racing resolutions
//! produce exactly one transition.
//!
//! | Entity                  | Due column   | Terminal transition                    |
//! |-------------------------|--------------|----------------------------------------|
//! | `ScheduledEffect`       | `expires_at` | `active` 1 → 0                         |
//! | `PrivilegeExpiration`   | `expires_at` | row deleted (revoked or unreachable)   |
//! | `Contest`               | `ends_at`    | `active` → `ended` / `cancelled`       |
//! | `Heist`                 | daily window | `pending` → `active` → `closed`        |
//! | `Award`                 | `status`     | `pending` → `settling` → `done`        |
//!
//! Timers are an optimisation; every kind resolves by polling alone. On start
//! the [`reconcile::Reconciler`] resolves everything that fell due while the
//! process was down and re-arms timers for the rest.

pub mod contest;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod heist;
pub mod notice;
pub mod reconcile;
pub mod rewards;
pub mod schedule;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod timers;
pub mod types;

pub use contest::{ContestEngine, DrawResult, JoinOutcome, Payout};
pub use engine::{LifecycleEngine, LifecycleRunner};
pub use error::{LifecycleError, Result};
pub use handlers::{EffectHandler, GrantOutcome, PrivilegeHandler, Resolution, SweepStats};
pub use heist::{HeistService, HeistSettings, SubmitOutcome};
pub use notice::NoticeSnapshot;
pub use reconcile::ReconcileReport;
pub use rewards::{ClaimOutcome, RewardDistributor, RewardOutcome, Settlement};
pub use schedule::{DailyWindow, WindowPhase};
pub use store::LifecycleStore;
pub use timers::{EntityKey, TimerRegistry};
