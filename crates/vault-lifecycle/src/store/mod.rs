//! Durable records for every schedulable entity kind.
//!
//! Status updates are conditional writes (`… WHERE id = ? AND status = ?`)
//! returning whether this caller performed the transition. Two racing
//! resolutions therefore yield exactly one `true`; the loser observes `false`
//! and no-ops.

mod awards;
mod contests;
mod effects;
mod heists;
mod offers;
mod privileges;

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::error;
use vault_core::time;

use crate::db::init_db;
use crate::error::{LifecycleError, Result};

/// Shared handle to the lifecycle tables. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleStore {
    conn: Arc<Mutex<Connection>>,
}

impl LifecycleStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn corrupt(entity: &'static str, id: &str, reason: impl Into<String>) -> LifecycleError {
    LifecycleError::Corrupt {
        entity,
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn parse_ts(entity: &'static str, id: &str, raw: &str) -> Result<DateTime<Utc>> {
    time::from_db(raw).ok_or_else(|| corrupt(entity, id, format!("bad timestamp {raw:?}")))
}

fn parse_opt_ts(
    entity: &'static str,
    id: &str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(entity, id, s)).transpose()
}

fn parse_text<T: FromStr<Err = String>>(entity: &'static str, id: &str, raw: &str) -> Result<T> {
    T::from_str(raw).map_err(|e| corrupt(entity, id, e))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    entity: &'static str,
    id: &str,
    raw: &str,
) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| corrupt(entity, id, e.to_string()))
}

/// Decode rows for a poll query, logging and skipping any that are corrupt so
/// one bad row never blocks the rest of the sweep.
fn decode_all<R, T>(entity: &'static str, rows: Vec<R>, decode: impl Fn(R) -> Result<T>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match decode(row) {
            Ok(v) => Some(v),
            Err(e) => {
                error!(entity, error = %e, "skipping corrupt row");
                None
            }
        })
        .collect()
}
