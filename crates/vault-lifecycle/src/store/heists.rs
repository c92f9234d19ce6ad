use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;
use vault_core::{time, ChannelId, ContextId, Reward, SubjectId};

use super::awards::{insert_awards, AwardOrigin};
use super::{decode_all, parse_opt_ts, parse_text, parse_ts, LifecycleStore};
use crate::error::Result;
use crate::types::{Award, CloseReason, Heist, HeistStatus};

const ENTITY: &str = "heist";

const COLUMNS: &str = "id, context_id, channel_id, code, payload, status, attempts, winner_id,
                       close_reason, created_at, opened_at, closed_at";

struct HeistRow {
    id: String,
    context_id: String,
    channel_id: String,
    code: String,
    payload: String,
    status: String,
    attempts: u32,
    winner_id: Option<String>,
    close_reason: Option<String>,
    created_at: String,
    opened_at: Option<String>,
    closed_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<HeistRow> {
    Ok(HeistRow {
        id: row.get(0)?,
        context_id: row.get(1)?,
        channel_id: row.get(2)?,
        code: row.get(3)?,
        payload: row.get(4)?,
        status: row.get(5)?,
        attempts: row.get(6)?,
        winner_id: row.get(7)?,
        close_reason: row.get(8)?,
        created_at: row.get(9)?,
        opened_at: row.get(10)?,
        closed_at: row.get(11)?,
    })
}

fn decode(row: HeistRow) -> Result<Heist> {
    let id = row.id.as_str();
    Ok(Heist {
        status: parse_text(ENTITY, id, &row.status)?,
        close_reason: row
            .close_reason
            .as_deref()
            .map(|raw| parse_text::<CloseReason>(ENTITY, id, raw))
            .transpose()?,
        created_at: parse_ts(ENTITY, id, &row.created_at)?,
        opened_at: parse_opt_ts(ENTITY, id, row.opened_at.as_deref())?,
        closed_at: parse_opt_ts(ENTITY, id, row.closed_at.as_deref())?,
        context: ContextId::from(row.context_id),
        channel: ChannelId::from(row.channel_id),
        code: row.code,
        payload: row.payload,
        attempts: row.attempts,
        winner: row.winner_id.map(SubjectId::from),
        id: row.id,
    })
}

impl LifecycleStore {
    /// Insert a heist in `status` (pending or active).
    pub fn insert_heist(
        &self,
        context: &ContextId,
        channel: &ChannelId,
        code: &str,
        payload: &str,
        status: HeistStatus,
        now: DateTime<Utc>,
    ) -> Result<Heist> {
        let id = Uuid::now_v7().to_string();
        let opened_at = (status == HeistStatus::Active).then_some(now);
        let conn = self.lock();
        conn.execute(
            "INSERT INTO heists
             (id, context_id, channel_id, code, payload, status, attempts, winner_id,
              close_reason, created_at, opened_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, NULL, ?7, ?8, NULL)",
            rusqlite::params![
                id,
                context.as_str(),
                channel.as_str(),
                code,
                payload,
                status.to_string(),
                time::to_db(now),
                opened_at.map(time::to_db),
            ],
        )?;
        Ok(Heist {
            id,
            context: context.clone(),
            channel: channel.clone(),
            code: code.to_string(),
            payload: payload.to_string(),
            status,
            attempts: 0,
            winner: None,
            close_reason: None,
            created_at: now,
            opened_at,
            closed_at: None,
        })
    }

    pub fn heist(&self, id: &str) -> Result<Option<Heist>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM heists WHERE id = ?1");
        let row = conn.query_row(&sql, [id], read_row).optional()?;
        row.map(decode).transpose()
    }

    /// Every pending or active heist, oldest first. Normally at most one.
    pub fn live_heists(&self) -> Result<Vec<Heist>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM heists
             WHERE status IN ('pending', 'active')
             ORDER BY created_at"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(ENTITY, rows, decode))
    }

    /// The newest live heist owned by `context`.
    pub fn live_heist(&self, context: &ContextId) -> Result<Option<Heist>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM heists
             WHERE context_id = ?1 AND status IN ('pending', 'active')
             ORDER BY created_at DESC
             LIMIT 1"
        );
        let row = conn.query_row(&sql, [context.as_str()], read_row).optional()?;
        row.map(decode).transpose()
    }

    /// pending → active.
    pub fn open_heist_if_pending(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE heists SET status = 'active', opened_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![time::to_db(at), id],
        )?;
        Ok(n == 1)
    }

    /// pending|active → closed with `reason`.
    pub fn close_heist_if_live(
        &self,
        id: &str,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE heists SET status = 'closed', close_reason = ?1, closed_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'active')",
            rusqlite::params![reason.to_string(), time::to_db(at), id],
        )?;
        Ok(n == 1)
    }

    /// active → closed with `winner`, queueing `rewards` for the winner in
    /// the same transaction. Exactly one caller can win; the rest get `None`.
    pub fn claim_heist_win(
        &self,
        heist: &Heist,
        winner: &SubjectId,
        rewards: &[Reward],
        at: DateTime<Utc>,
    ) -> Result<Option<Vec<Award>>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE heists SET status = 'closed', winner_id = ?1, close_reason = 'cracked',
                               closed_at = ?2
             WHERE id = ?3 AND status = 'active'",
            rusqlite::params![winner.as_str(), time::to_db(at), heist.id],
        )?;
        if n != 1 {
            return Ok(None);
        }
        let origin = AwardOrigin {
            source: format!("heist {}", heist.id),
            contest_id: None,
            heist_id: Some(&heist.id),
            context: &heist.context,
        };
        let awards = insert_awards(&tx, &origin, rewards.iter().map(|r| (winner, r)), at)?;
        tx.commit()?;
        Ok(Some(awards))
    }

    pub fn record_heist_attempt(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE heists SET attempts = attempts + 1 WHERE id = ?1 AND status = 'active'",
            [id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn store() -> LifecycleStore {
        LifecycleStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn prize() -> Vec<Reward> {
        vec![
            Reward::Balance {
                amount: vault_core::Amount::from(5000),
            },
            Reward::TimedPrivilege {
                privilege: "vault-master".into(),
                duration_secs: 3600,
            },
        ]
    }

    #[test]
    fn only_one_winner_can_claim() {
        let store = store();
        let now = Utc::now();
        let heist = store
            .insert_heist(&"g1".into(), &"c1".into(), "1234", "{}", HeistStatus::Active, now)
            .unwrap();
        let awards = store
            .claim_heist_win(&heist, &"a".into(), &prize(), now)
            .unwrap()
            .unwrap();
        assert!(store
            .claim_heist_win(&heist, &"b".into(), &prize(), now)
            .unwrap()
            .is_none());
        let stored = store.heist(&heist.id).unwrap().unwrap();
        assert_eq!(stored.winner, Some(SubjectId::from("a")));
        assert_eq!(stored.close_reason, Some(CloseReason::Cracked));

        assert_eq!(awards.len(), 2);
        assert!(awards.iter().all(|a| a.subject == SubjectId::from("a")));
        assert_eq!(awards[0].heist_id.as_deref(), Some(heist.id.as_str()));
        assert_eq!(store.due_awards(now).unwrap().len(), 2);
    }

    #[test]
    fn pending_heist_cannot_be_won() {
        let store = store();
        let now = Utc::now();
        let heist = store
            .insert_heist(&"g1".into(), &"c1".into(), "1234", "{}", HeistStatus::Pending, now)
            .unwrap();
        assert!(store
            .claim_heist_win(&heist, &"a".into(), &prize(), now)
            .unwrap()
            .is_none());
        assert!(store.due_awards(now).unwrap().is_empty());
        assert!(store.open_heist_if_pending(&heist.id, now).unwrap());
        assert!(!store.open_heist_if_pending(&heist.id, now).unwrap());
        assert!(store
            .claim_heist_win(&heist, &"a".into(), &prize(), now)
            .unwrap()
            .is_some());
    }

    #[test]
    fn live_queries_exclude_closed() {
        let store = store();
        let now = Utc::now();
        let heist = store
            .insert_heist(&"g1".into(), &"c1".into(), "1234", "{}", HeistStatus::Pending, now)
            .unwrap();
        assert_eq!(store.live_heists().unwrap().len(), 1);
        assert!(store.close_heist_if_live(&heist.id, CloseReason::Stale, now).unwrap());
        assert!(store.live_heists().unwrap().is_empty());
        assert!(store.live_heist(&"g1".into()).unwrap().is_none());
    }
}
