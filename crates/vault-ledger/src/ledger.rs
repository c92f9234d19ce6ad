use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use vault_core::{amount::Amount, time, Clock, SubjectId};

use crate::db::init_db;
use crate::error::{LedgerError, Result};
use crate::types::{Account, Cooldown, Currency, Transaction};

/// Atomic balance mutation with upsert-on-first-touch.
///
/// Every mutation runs in one SQLite transaction while holding the connection
/// mutex, so adjustments to the same account commute: interleaved `+100` and
/// `-30` always land on `base + 70` regardless of order.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
    starting_balance: Amount,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    /// Create a ledger over `conn`, initialising the schema if needed.
    /// Audit and account timestamps are read from `clock`.
    pub fn new(conn: Connection, starting_balance: Amount, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            starting_balance,
            clock,
        })
    }

    pub fn starting_balance(&self) -> &Amount {
        &self.starting_balance
    }

    /// Read an account, creating it with the starting balance if absent.
    pub fn account(&self, subject: &SubjectId) -> Result<Account> {
        let conn = self.lock();
        let now = time::to_db(self.clock.now());
        ensure_account(&conn, subject, &self.starting_balance, &now)?;
        load_account(&conn, subject)
    }

    /// Add `delta` (may be negative) and return the new balance.
    pub fn adjust_balance(
        &self,
        subject: &SubjectId,
        delta: &Amount,
        reason: &str,
    ) -> Result<Amount> {
        let mut conn = self.lock();
        let now = time::to_db(self.clock.now());
        let tx = conn.transaction()?;
        ensure_account(&tx, subject, &self.starting_balance, &now)?;
        let current = read_balance(&tx, subject)?;
        let next = &current + delta;
        write_balance(&tx, subject, &next, &now)?;
        append_log(&tx, subject, Currency::Balance, delta, &next, reason, &now)?;
        tx.commit()?;
        debug!(subject = %subject, delta = %delta, balance = %next, reason, "balance adjusted");
        Ok(next)
    }

    /// Overwrite the balance. The logged delta is the difference applied.
    pub fn set_balance(&self, subject: &SubjectId, value: &Amount, reason: &str) -> Result<Amount> {
        let mut conn = self.lock();
        let now = time::to_db(self.clock.now());
        let tx = conn.transaction()?;
        ensure_account(&tx, subject, &self.starting_balance, &now)?;
        let current = read_balance(&tx, subject)?;
        let delta = value - &current;
        write_balance(&tx, subject, value, &now)?;
        append_log(&tx, subject, Currency::Balance, &delta, value, reason, &now)?;
        tx.commit()?;
        debug!(subject = %subject, balance = %value, reason, "balance set");
        Ok(value.clone())
    }

    /// Add `delta` to the consumable-draw counter and return the new count.
    pub fn adjust_draws(&self, subject: &SubjectId, delta: i64, reason: &str) -> Result<i64> {
        let mut conn = self.lock();
        let now = time::to_db(self.clock.now());
        let tx = conn.transaction()?;
        ensure_account(&tx, subject, &self.starting_balance, &now)?;
        let next: i64 = tx.query_row(
            "UPDATE accounts SET draws = draws + ?1, updated_at = ?2
             WHERE subject_id = ?3
             RETURNING draws",
            rusqlite::params![delta, now, subject.as_str()],
            |row| row.get(0),
        )?;
        append_log(
            &tx,
            subject,
            Currency::Draws,
            &Amount::from(delta),
            &Amount::from(next),
            reason,
            &now,
        )?;
        tx.commit()?;
        debug!(subject = %subject, delta, draws = next, reason, "draws adjusted");
        Ok(next)
    }

    /// Stamp a cooldown timestamp on the account.
    pub fn mark_cooldown(
        &self,
        subject: &SubjectId,
        which: Cooldown,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        let now = time::to_db(self.clock.now());
        ensure_account(&conn, subject, &self.starting_balance, &now)?;
        // Column name comes from a closed enum, never from input.
        let sql = format!(
            "UPDATE accounts SET {} = ?1, updated_at = ?2 WHERE subject_id = ?3",
            which.column()
        );
        conn.execute(&sql, rusqlite::params![time::to_db(at), now, subject.as_str()])?;
        Ok(())
    }

    /// Most recent audit entries for `subject`, newest first.
    pub fn history(&self, subject: &SubjectId, limit: u32) -> Result<Vec<Transaction>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, subject_id, currency, delta, balance, reason, created_at
             FROM ledger_transactions
             WHERE subject_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![subject.as_str(), limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, subject_id, currency, delta, balance, reason, created_at)| {
                let corrupt = |reason: String| LedgerError::Corrupt {
                    subject: subject_id.clone(),
                    reason,
                };
                Ok(Transaction {
                    id,
                    currency: Currency::from_str(&currency).map_err(corrupt)?,
                    delta: parse_amount(&subject_id, &delta)?,
                    balance: parse_amount(&subject_id, &balance)?,
                    reason,
                    created_at: parse_time(&subject_id, &created_at)?,
                    subject: SubjectId::from(subject_id),
                })
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn ensure_account(
    conn: &Connection,
    subject: &SubjectId,
    starting_balance: &Amount,
    now: &str,
) -> Result<()> {
    let created = conn.execute(
        "INSERT OR IGNORE INTO accounts (subject_id, balance, draws, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, ?3)",
        rusqlite::params![subject.as_str(), starting_balance.to_string(), now],
    )?;
    if created > 0 {
        debug!(subject = %subject, balance = %starting_balance, "account created");
    }
    Ok(())
}

fn read_balance(conn: &Connection, subject: &SubjectId) -> Result<Amount> {
    let raw: String = conn.query_row(
        "SELECT balance FROM accounts WHERE subject_id = ?1",
        [subject.as_str()],
        |row| row.get(0),
    )?;
    parse_amount(subject.as_str(), &raw)
}

fn write_balance(conn: &Connection, subject: &SubjectId, value: &Amount, now: &str) -> Result<()> {
    conn.execute(
        "UPDATE accounts SET balance = ?1, updated_at = ?2 WHERE subject_id = ?3",
        rusqlite::params![value.to_string(), now, subject.as_str()],
    )?;
    Ok(())
}

fn append_log(
    conn: &Connection,
    subject: &SubjectId,
    currency: Currency,
    delta: &Amount,
    balance: &Amount,
    reason: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO ledger_transactions
         (subject_id, currency, delta, balance, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            subject.as_str(),
            currency.to_string(),
            delta.to_string(),
            balance.to_string(),
            reason,
            now
        ],
    )?;
    Ok(())
}

fn load_account(conn: &Connection, subject: &SubjectId) -> Result<Account> {
    let row = conn
        .query_row(
            "SELECT balance, draws, daily_at, work_at, created_at, updated_at
             FROM accounts WHERE subject_id = ?1",
            [subject.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((balance, draws, daily_at, work_at, created_at, updated_at)) = row else {
        return Err(LedgerError::Corrupt {
            subject: subject.to_string(),
            reason: "account vanished after upsert".into(),
        });
    };
    let id = subject.as_str();
    Ok(Account {
        subject: subject.clone(),
        balance: parse_amount(id, &balance)?,
        draws,
        daily_at: daily_at.as_deref().map(|s| parse_time(id, s)).transpose()?,
        work_at: work_at.as_deref().map(|s| parse_time(id, s)).transpose()?,
        created_at: parse_time(id, &created_at)?,
        updated_at: parse_time(id, &updated_at)?,
    })
}

fn parse_amount(subject: &str, raw: &str) -> Result<Amount> {
    vault_core::amount::parse(raw).map_err(|e| LedgerError::Corrupt {
        subject: subject.to_string(),
        reason: e.to_string(),
    })
}

fn parse_time(subject: &str, raw: &str) -> Result<DateTime<Utc>> {
    time::from_db(raw).ok_or_else(|| LedgerError::Corrupt {
        subject: subject.to_string(),
        reason: format!("bad timestamp {raw:?}"),
    })
}
