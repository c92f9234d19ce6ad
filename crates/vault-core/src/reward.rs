use serde::{Deserialize, Serialize};

use crate::amount::{amount_str, Amount};
use crate::types::PrivilegeId;

/// What a contest winner (or heist winner) receives.
///
/// Stored as JSON in the `contests.reward` and `reward_offers` columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reward {
    /// Ledger credit in minor units.
    Balance {
        #[serde(with = "amount_str")]
        amount: Amount,
    },

    /// Credit to the consumable-draw counter.
    Draws { count: i64 },

    /// Privilege granted with no expiry.
    Privilege { privilege: PrivilegeId },

    /// Privilege that is revoked again after `duration_secs`.
    TimedPrivilege {
        privilege: PrivilegeId,
        duration_secs: i64,
    },

    /// Deferred: the recipient later picks `guaranteed` or a weighted draw
    /// from `alternatives`.
    Choice {
        guaranteed: Box<Reward>,
        alternatives: Vec<WeightedReward>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedReward {
    pub weight: u32,
    pub reward: Reward,
}

impl Reward {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Reward::Choice { .. })
    }

    /// One-line human summary used in notices.
    pub fn describe(&self) -> String {
        match self {
            Reward::Balance { amount } => format!("{amount} coins"),
            Reward::Draws { count } => format!("{count} draw(s)"),
            Reward::Privilege { privilege } => format!("role {privilege}"),
            Reward::TimedPrivilege {
                privilege,
                duration_secs,
            } => format!("role {privilege} for {}", describe_secs(*duration_secs)),
            Reward::Choice { guaranteed, .. } => {
                format!("a choice: {} or a gamble", guaranteed.describe())
            }
        }
    }
}

fn describe_secs(secs: i64) -> String {
    match secs {
        s if s >= 86_400 && s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s >= 3_600 && s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s >= 60 && s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_amount_serialises_as_string() {
        let reward = Reward::Balance {
            amount: Amount::from(2500),
        };
        let json = serde_json::to_value(&reward).unwrap();
        assert_eq!(json["kind"], "balance");
        assert_eq!(json["amount"], "2500");
        let back: Reward = serde_json::from_value(json).unwrap();
        assert_eq!(back, reward);
    }

    #[test]
    fn choice_nests() {
        let json = r#"{
            "kind": "choice",
            "guaranteed": {"kind": "draws", "count": 3},
            "alternatives": [
                {"weight": 9, "reward": {"kind": "balance", "amount": "0"}},
                {"weight": 1, "reward": {"kind": "timed_privilege", "privilege": "vip", "duration_secs": 86400}}
            ]
        }"#;
        let reward: Reward = serde_json::from_str(json).unwrap();
        assert!(reward.is_deferred());
        assert_eq!(reward.describe(), "a choice: 3 draw(s) or a gamble");
    }

    #[test]
    fn describes_durations() {
        let reward = Reward::TimedPrivilege {
            privilege: PrivilegeId::from("vip"),
            duration_secs: 7_200,
        };
        assert_eq!(reward.describe(), "role vip for 2h");
    }
}
