use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vault_core::{ChannelId, ContextId, NoticeRef, PrivilegeId, Reward, SubjectId, WeightedReward};

/// Closed set of time-bounded effect kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    /// Payload is a privilege id; expiry revokes it.
    PrivilegeGrant,
    /// Payload is the new display name; `restore` is the name to put back.
    NicknameOverride,
    /// Payload is a multiplier in basis points; expiry simply ends it.
    NumericBoost,
    /// Payload is a flag name; consumed by callers, usually with no expiry.
    OneShotFlag,
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EffectKind::PrivilegeGrant => "privilege_grant",
            EffectKind::NicknameOverride => "nickname_override",
            EffectKind::NumericBoost => "numeric_boost",
            EffectKind::OneShotFlag => "one_shot_flag",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EffectKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "privilege_grant" => Ok(EffectKind::PrivilegeGrant),
            "nickname_override" => Ok(EffectKind::NicknameOverride),
            "numeric_boost" => Ok(EffectKind::NumericBoost),
            "one_shot_flag" => Ok(EffectKind::OneShotFlag),
            other => Err(format!("unknown effect kind: {other}")),
        }
    }
}

/// A time-bounded grant or state change applied to one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEffect {
    /// UUIDv7 string, primary key.
    pub id: String,
    pub subject: SubjectId,
    pub context: ContextId,
    pub kind: EffectKind,
    pub payload: String,
    /// Value needed to undo the effect (e.g. the previous nickname).
    pub restore: Option<String>,
    /// `None` means one-shot: never expired by the poll loop.
    pub expires_at: Option<DateTime<Utc>>,
    /// Flipped to false exactly once, on resolution.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input for creating a [`ScheduledEffect`].
#[derive(Debug, Clone)]
pub struct NewEffect {
    pub subject: SubjectId,
    pub context: ContextId,
    pub kind: EffectKind,
    pub payload: String,
    pub restore: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A temporary privilege held by a subject. Unique per (subject, privilege).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivilegeExpiration {
    pub subject: SubjectId,
    pub privilege: PrivilegeId,
    /// Originating context; when absent every known context is searched.
    pub context: Option<ContextId>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestStatus {
    Active,
    /// Terminal but re-drawable.
    Ended,
    Cancelled,
}

impl std::fmt::Display for ContestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContestStatus::Active => "active",
            ContestStatus::Ended => "ended",
            ContestStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ContestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ContestStatus::Active),
            "ended" => Ok(ContestStatus::Ended),
            "cancelled" => Ok(ContestStatus::Cancelled),
            other => Err(format!("unknown contest status: {other}")),
        }
    }
}

/// A multi-participant, multi-winner timed drawing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contest {
    pub id: String,
    pub context: ContextId,
    pub channel: ChannelId,
    pub title: String,
    pub reward: Reward,
    pub ends_at: DateTime<Utc>,
    pub winner_count: u32,
    pub status: ContestStatus,
    /// Announcement posted at creation, edited with the results.
    pub notice: Option<NoticeRef>,
    pub host: Option<SubjectId>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewContest {
    pub context: ContextId,
    pub channel: ChannelId,
    pub title: String,
    pub reward: Reward,
    pub ends_at: DateTime<Utc>,
    pub winner_count: u32,
    pub host: Option<SubjectId>,
}

/// One recorded draw of a contest (draw 1 is the initial resolution).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestDraw {
    pub contest_id: String,
    pub draw_no: u32,
    pub winners: Vec<SubjectId>,
    pub drawn_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Claimed,
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfferStatus::Pending => write!(f, "pending"),
            OfferStatus::Claimed => write!(f, "claimed"),
        }
    }
}

impl std::str::FromStr for OfferStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OfferStatus::Pending),
            "claimed" => Ok(OfferStatus::Claimed),
            other => Err(format!("unknown offer status: {other}")),
        }
    }
}

/// A deferred `Reward::Choice` waiting for its recipient to pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardOffer {
    pub id: String,
    pub contest_id: Option<String>,
    pub subject: SubjectId,
    pub context: ContextId,
    pub guaranteed: Reward,
    pub alternatives: Vec<WeightedReward>,
    pub status: OfferStatus,
    pub chosen: Option<Reward>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Which side of a [`RewardOffer`] the recipient takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferPick {
    Guaranteed,
    Gamble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeistStatus {
    /// Code fixed, window not yet open; submissions rejected.
    Pending,
    /// Submissions accepted.
    Active,
    Closed,
}

impl HeistStatus {
    pub fn is_live(self) -> bool {
        matches!(self, HeistStatus::Pending | HeistStatus::Active)
    }
}

impl std::fmt::Display for HeistStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HeistStatus::Pending => "pending",
            HeistStatus::Active => "active",
            HeistStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for HeistStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HeistStatus::Pending),
            "active" => Ok(HeistStatus::Active),
            "closed" => Ok(HeistStatus::Closed),
            other => Err(format!("unknown heist status: {other}")),
        }
    }
}

/// Why a heist left the live states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// A submission matched the code.
    Cracked,
    /// The daily closing boundary passed.
    WindowClosed,
    /// Created on an earlier civil day and never closed.
    Stale,
    /// Closed by an operator.
    Cancelled,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Cracked => "cracked",
            CloseReason::WindowClosed => "window_closed",
            CloseReason::Stale => "stale",
            CloseReason::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cracked" => Ok(CloseReason::Cracked),
            "window_closed" => Ok(CloseReason::WindowClosed),
            "stale" => Ok(CloseReason::Stale),
            "cancelled" => Ok(CloseReason::Cancelled),
            other => Err(format!("unknown close reason: {other}")),
        }
    }
}

/// The singleton timed-secret event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heist {
    pub id: String,
    pub context: ContextId,
    pub channel: ChannelId,
    /// Fixed-length digit string.
    pub code: String,
    pub payload: String,
    pub status: HeistStatus,
    /// Wrong guesses submitted while active.
    pub attempts: u32,
    pub winner: Option<SubjectId>,
    pub close_reason: Option<CloseReason>,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwardStatus {
    /// Owed and not yet handed out.
    Pending,
    /// Claimed by a settler. Claimable again once the lease lapses.
    Settling,
    Done,
    /// The recipient could not be found; nothing was handed out.
    Unreachable,
}

impl AwardStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, AwardStatus::Done | AwardStatus::Unreachable)
    }
}

impl std::fmt::Display for AwardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AwardStatus::Pending => "pending",
            AwardStatus::Settling => "settling",
            AwardStatus::Done => "done",
            AwardStatus::Unreachable => "unreachable",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AwardStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AwardStatus::Pending),
            "settling" => Ok(AwardStatus::Settling),
            "done" => Ok(AwardStatus::Done),
            "unreachable" => Ok(AwardStatus::Unreachable),
            other => Err(format!("unknown award status: {other}")),
        }
    }
}

/// A reward owed to one recipient. Written in the same transaction as the
/// contest draw or heist win that earned it, then settled separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub id: String,
    /// Ledger reason, e.g. `contest <id> draw 2`.
    pub source: String,
    pub contest_id: Option<String>,
    pub heist_id: Option<String>,
    pub subject: SubjectId,
    pub context: ContextId,
    pub reward: Reward,
    pub status: AwardStatus,
    /// Settlement attempts so far, including the current one.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn effect_kind_text_roundtrip() {
        for kind in [
            EffectKind::PrivilegeGrant,
            EffectKind::NicknameOverride,
            EffectKind::NumericBoost,
            EffectKind::OneShotFlag,
        ] {
            assert_eq!(EffectKind::from_str(&kind.to_string()), Ok(kind));
        }
        assert!(EffectKind::from_str("mute").is_err());
    }

    #[test]
    fn only_pending_and_active_heists_are_live() {
        assert!(HeistStatus::Pending.is_live());
        assert!(HeistStatus::Active.is_live());
        assert!(!HeistStatus::Closed.is_live());
    }

    #[test]
    fn award_status_text_roundtrip() {
        for status in [
            AwardStatus::Pending,
            AwardStatus::Settling,
            AwardStatus::Done,
            AwardStatus::Unreachable,
        ] {
            assert_eq!(AwardStatus::from_str(&status.to_string()), Ok(status));
        }
        assert!(!AwardStatus::Settling.is_settled());
        assert!(AwardStatus::Unreachable.is_settled());
    }
}
