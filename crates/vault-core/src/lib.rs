//! `vault-core`: types shared by every vault crate.
//!
//! Identifier newtypes, the [`platform::Platform`] capability trait the
//! lifecycle engine calls into, the [`clock::Clock`] abstraction, reward
//! descriptors, and the layered configuration.

pub mod amount;
pub mod clock;
pub mod config;
pub mod error;
pub mod platform;
pub mod reward;
pub mod time;
pub mod types;

pub use amount::Amount;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use platform::{Platform, PlatformError, Subject};
pub use reward::{Reward, WeightedReward};
pub use types::{ChannelId, ContextId, NoticeRef, PrivilegeId, SubjectId};
