use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::amount::{self, Amount};
use crate::error::{CoreError, Result};

pub const DEFAULT_STARTING_BALANCE: &str = "1000";
pub const DEFAULT_CODE_LENGTH: usize = 4;

/// Top-level config (vault.toml + VAULT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub heist: HeistConfig,
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Balance every account starts with on first touch (decimal string).
    #[serde(default = "default_starting_balance")]
    pub starting_balance: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
        }
    }
}

impl LedgerConfig {
    pub fn starting_balance(&self) -> Result<Amount> {
        amount::parse(&self.starting_balance)
    }
}

/// Poll-sweep cadence per entity kind. Timers shorten latency; these
/// intervals bound it when every timer has been lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_effect_poll")]
    pub effect_poll_secs: u64,
    #[serde(default = "default_privilege_poll")]
    pub privilege_poll_secs: u64,
    #[serde(default = "default_contest_poll")]
    pub contest_poll_secs: u64,
    #[serde(default = "default_heist_poll")]
    pub heist_poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            effect_poll_secs: default_effect_poll(),
            privilege_poll_secs: default_privilege_poll(),
            contest_poll_secs: default_contest_poll(),
            heist_poll_secs: default_heist_poll(),
        }
    }
}

/// Daily window and rewards for the timed-secret event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeistConfig {
    /// IANA zone name the daily window is expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_open_hour")]
    pub open_hour: u8,
    #[serde(default)]
    pub open_minute: u8,
    #[serde(default = "default_close_hour")]
    pub close_hour: u8,
    #[serde(default)]
    pub close_minute: u8,
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// Ledger credit for the winner (decimal string).
    #[serde(default = "default_heist_reward")]
    pub reward: String,
    /// Privilege granted to the winner; no grant when unset.
    pub privilege_id: Option<String>,
    #[serde(default = "default_heist_privilege_secs")]
    pub privilege_secs: i64,
}

impl Default for HeistConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            open_hour: default_open_hour(),
            open_minute: 0,
            close_hour: default_close_hour(),
            close_minute: 0,
            code_length: default_code_length(),
            reward: default_heist_reward(),
            privilege_id: None,
            privilege_secs: default_heist_privilege_secs(),
        }
    }
}

impl HeistConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| CoreError::UnknownTimezone(self.timezone.clone()))
    }

    pub fn reward(&self) -> Result<Amount> {
        amount::parse(&self.reward)
    }

    /// Reject windows that cannot be evaluated: out-of-range clock values,
    /// empty windows, and windows that wrap past midnight.
    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        self.reward()?;
        if self.open_hour > 23
            || self.close_hour > 23
            || self.open_minute > 59
            || self.close_minute > 59
        {
            return Err(CoreError::Config("heist window time out of range".into()));
        }
        let open = u32::from(self.open_hour) * 60 + u32::from(self.open_minute);
        let close = u32::from(self.close_hour) * 60 + u32::from(self.close_minute);
        if close <= open {
            return Err(CoreError::Config(
                "heist close time must be after open time on the same day".into(),
            ));
        }
        if self.code_length == 0 || self.code_length > 12 {
            return Err(CoreError::Config("heist code_length must be 1..=12".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    /// Guilds searched when a record carries no originating context.
    #[serde(default)]
    pub guild_ids: Vec<u64>,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vault/vault.db", home)
}
fn default_starting_balance() -> String {
    DEFAULT_STARTING_BALANCE.to_string()
}
fn default_effect_poll() -> u64 {
    30
}
fn default_privilege_poll() -> u64 {
    60
}
fn default_contest_poll() -> u64 {
    15
}
fn default_heist_poll() -> u64 {
    30
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_open_hour() -> u8 {
    20
}
fn default_close_hour() -> u8 {
    22
}
fn default_code_length() -> usize {
    DEFAULT_CODE_LENGTH
}
fn default_heist_reward() -> String {
    "5000".to_string()
}
fn default_heist_privilege_secs() -> i64 {
    86_400
}

impl VaultConfig {
    /// Load config from a TOML file with VAULT_* env var overrides.
    ///
    /// Nested keys use a double underscore: `VAULT_HEIST__TIMEZONE=Europe/Paris`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: VaultConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("VAULT_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.heist.validate()?;
        config.ledger.starting_balance()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.vault/vault.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = VaultConfig::default();
        config.heist.validate().expect("default heist window");
        assert_eq!(config.ledger.starting_balance().unwrap(), Amount::from(1000));
        assert!(config.discord.is_none());
    }

    #[test]
    fn rejects_wrapping_window() {
        let heist = HeistConfig {
            open_hour: 23,
            close_hour: 1,
            ..HeistConfig::default()
        };
        assert!(heist.validate().is_err());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let heist = HeistConfig {
            timezone: "Mars/Olympus_Mons".into(),
            ..HeistConfig::default()
        };
        assert!(matches!(heist.tz(), Err(CoreError::UnknownTimezone(_))));
    }

    #[test]
    fn parses_toml_sections() {
        let toml = r#"
            [ledger]
            starting_balance = "250"

            [heist]
            timezone = "Europe/Paris"
            open_hour = 18
            close_hour = 19
            close_minute = 30

            [discord]
            bot_token = "t"
            guild_ids = [1, 2]
        "#;
        let config: VaultConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(config.ledger.starting_balance().unwrap(), Amount::from(250));
        assert_eq!(config.heist.tz().unwrap(), chrono_tz::Europe::Paris);
        assert_eq!(config.heist.close_minute, 30);
        assert_eq!(config.scheduler.contest_poll_secs, 15);
        assert_eq!(config.discord.unwrap().guild_ids, vec![1, 2]);
        config.heist.validate().unwrap();
    }
}
