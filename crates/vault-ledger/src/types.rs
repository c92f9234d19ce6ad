use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vault_core::amount::{amount_str, Amount};
use vault_core::SubjectId;

/// One ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub subject: SubjectId,
    #[serde(with = "amount_str")]
    pub balance: Amount,
    /// Consumable draw counter (spent by the draw mini-game).
    pub draws: i64,
    pub daily_at: Option<DateTime<Utc>>,
    pub work_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn cooldown(&self, which: Cooldown) -> Option<DateTime<Utc>> {
        match which {
            Cooldown::Daily => self.daily_at,
            Cooldown::Work => self.work_at,
        }
    }
}

/// Per-account cooldown timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    Daily,
    Work,
}

impl Cooldown {
    pub(crate) fn column(self) -> &'static str {
        match self {
            Cooldown::Daily => "daily_at",
            Cooldown::Work => "work_at",
        }
    }
}

/// Which counter a transaction touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    Balance,
    Draws,
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Currency::Balance => write!(f, "balance"),
            Currency::Draws => write!(f, "draws"),
        }
    }
}

impl std::str::FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "balance" => Ok(Currency::Balance),
            "draws" => Ok(Currency::Draws),
            other => Err(format!("unknown currency: {other}")),
        }
    }
}

/// Audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub subject: SubjectId,
    pub currency: Currency,
    #[serde(with = "amount_str")]
    pub delta: Amount,
    /// Counter value after the change.
    #[serde(with = "amount_str")]
    pub balance: Amount,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
