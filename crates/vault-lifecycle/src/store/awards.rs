use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;
use vault_core::{time, ContextId, Reward, SubjectId};

use super::{decode_all, parse_json, parse_opt_ts, parse_text, parse_ts, LifecycleStore};
use crate::error::Result;
use crate::types::{Award, AwardStatus};

const ENTITY: &str = "award";

const COLUMNS: &str = "id, source, contest_id, heist_id, subject_id, context_id, reward,
                       status, attempts, created_at, claimed_at, settled_at";

struct AwardRow {
    id: String,
    source: String,
    contest_id: Option<String>,
    heist_id: Option<String>,
    subject_id: String,
    context_id: String,
    reward: String,
    status: String,
    attempts: u32,
    created_at: String,
    claimed_at: Option<String>,
    settled_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<AwardRow> {
    Ok(AwardRow {
        id: row.get(0)?,
        source: row.get(1)?,
        contest_id: row.get(2)?,
        heist_id: row.get(3)?,
        subject_id: row.get(4)?,
        context_id: row.get(5)?,
        reward: row.get(6)?,
        status: row.get(7)?,
        attempts: row.get(8)?,
        created_at: row.get(9)?,
        claimed_at: row.get(10)?,
        settled_at: row.get(11)?,
    })
}

fn decode(row: AwardRow) -> Result<Award> {
    let id = row.id.as_str();
    Ok(Award {
        reward: parse_json(ENTITY, id, &row.reward)?,
        status: parse_text(ENTITY, id, &row.status)?,
        created_at: parse_ts(ENTITY, id, &row.created_at)?,
        claimed_at: parse_opt_ts(ENTITY, id, row.claimed_at.as_deref())?,
        settled_at: parse_opt_ts(ENTITY, id, row.settled_at.as_deref())?,
        source: row.source,
        contest_id: row.contest_id,
        heist_id: row.heist_id,
        subject: SubjectId::from(row.subject_id),
        context: ContextId::from(row.context_id),
        attempts: row.attempts,
        id: row.id,
    })
}

/// What earned a batch of awards. Shared by every row in the batch.
pub(super) struct AwardOrigin<'a> {
    pub source: String,
    pub contest_id: Option<&'a str>,
    pub heist_id: Option<&'a str>,
    pub context: &'a ContextId,
}

/// Insert one pending award per `(subject, reward)` pair. Runs on the caller's
/// connection so it joins whatever transaction the caller holds.
pub(super) fn insert_awards<'r>(
    conn: &Connection,
    origin: &AwardOrigin<'_>,
    owed: impl IntoIterator<Item = (&'r SubjectId, &'r Reward)>,
    at: DateTime<Utc>,
) -> Result<Vec<Award>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO awards
         (id, source, contest_id, heist_id, subject_id, context_id, reward,
          status, attempts, created_at, claimed_at, settled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, NULL, NULL)",
    )?;
    let mut awards = Vec::new();
    for (subject, reward) in owed {
        let id = Uuid::now_v7().to_string();
        stmt.execute(rusqlite::params![
            id,
            origin.source,
            origin.contest_id,
            origin.heist_id,
            subject.as_str(),
            origin.context.as_str(),
            serde_json::to_string(reward)?,
            time::to_db(at),
        ])?;
        awards.push(Award {
            id,
            source: origin.source.clone(),
            contest_id: origin.contest_id.map(String::from),
            heist_id: origin.heist_id.map(String::from),
            subject: subject.clone(),
            context: origin.context.clone(),
            reward: reward.clone(),
            status: AwardStatus::Pending,
            attempts: 0,
            created_at: at,
            claimed_at: None,
            settled_at: None,
        });
    }
    Ok(awards)
}

impl LifecycleStore {
    pub fn award(&self, id: &str) -> Result<Option<Award>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM awards WHERE id = ?1");
        let row = conn.query_row(&sql, [id], read_row).optional()?;
        row.map(decode).transpose()
    }

    /// Every award a contest has produced, oldest first.
    pub fn contest_awards(&self, contest_id: &str) -> Result<Vec<Award>> {
        self.query_awards("contest_id = ?1", contest_id)
    }

    /// Awards waiting to be settled: pending ones, plus settling ones whose
    /// lease started at or before `stale_before`.
    pub fn due_awards(&self, stale_before: DateTime<Utc>) -> Result<Vec<Award>> {
        self.query_awards(
            "status = 'pending' OR (status = 'settling' AND claimed_at <= ?1)",
            &time::to_db(stale_before),
        )
    }

    fn query_awards(&self, filter: &str, param: &str) -> Result<Vec<Award>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM awards WHERE {filter} ORDER BY created_at, id");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([param], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(ENTITY, rows, decode))
    }

    /// pending → settling, or take over a settling lease that started at or
    /// before `stale_before`. Returns false if someone else holds the award
    /// or it is already settled.
    pub fn claim_award(
        &self,
        id: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE awards SET status = 'settling', claimed_at = ?1, attempts = attempts + 1
             WHERE id = ?2
               AND (status = 'pending' OR (status = 'settling' AND claimed_at <= ?3))",
            rusqlite::params![time::to_db(at), id, time::to_db(stale_before)],
        )?;
        Ok(n == 1)
    }

    /// settling → `status` (done or unreachable). Returns false if the award
    /// was not being settled.
    pub fn finish_award(&self, id: &str, status: AwardStatus, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE awards SET status = ?1, settled_at = ?2
             WHERE id = ?3 AND status = 'settling'",
            rusqlite::params![status.to_string(), time::to_db(at), id],
        )?;
        Ok(n == 1)
    }

    /// settling → pending after a failed attempt.
    pub fn release_award(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE awards SET status = 'pending', claimed_at = NULL
             WHERE id = ?1 AND status = 'settling'",
            [id],
        )?;
        Ok(n == 1)
    }
}
