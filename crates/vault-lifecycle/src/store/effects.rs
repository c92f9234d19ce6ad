use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;
use vault_core::{time, ContextId, SubjectId};

use super::{decode_all, parse_opt_ts, parse_text, parse_ts, LifecycleStore};
use crate::error::Result;
use crate::types::{EffectKind, NewEffect, ScheduledEffect};

const ENTITY: &str = "scheduled_effect";

const COLUMNS: &str = "id, subject_id, context_id, kind, payload, restore, expires_at,
                       active, created_at, resolved_at";

struct EffectRow {
    id: String,
    subject_id: String,
    context_id: String,
    kind: String,
    payload: String,
    restore: Option<String>,
    expires_at: Option<String>,
    active: bool,
    created_at: String,
    resolved_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<EffectRow> {
    Ok(EffectRow {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        context_id: row.get(2)?,
        kind: row.get(3)?,
        payload: row.get(4)?,
        restore: row.get(5)?,
        expires_at: row.get(6)?,
        active: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        resolved_at: row.get(9)?,
    })
}

fn decode(row: EffectRow) -> Result<ScheduledEffect> {
    let id = row.id.as_str();
    Ok(ScheduledEffect {
        kind: parse_text(ENTITY, id, &row.kind)?,
        expires_at: parse_opt_ts(ENTITY, id, row.expires_at.as_deref())?,
        created_at: parse_ts(ENTITY, id, &row.created_at)?,
        resolved_at: parse_opt_ts(ENTITY, id, row.resolved_at.as_deref())?,
        subject: SubjectId::from(row.subject_id),
        context: ContextId::from(row.context_id),
        payload: row.payload,
        restore: row.restore,
        active: row.active,
        id: row.id,
    })
}

impl LifecycleStore {
    pub fn insert_effect(&self, new: &NewEffect, now: DateTime<Utc>) -> Result<ScheduledEffect> {
        let id = Uuid::now_v7().to_string();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO scheduled_effects
             (id, subject_id, context_id, kind, payload, restore, expires_at,
              active, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, NULL)",
            rusqlite::params![
                id,
                new.subject.as_str(),
                new.context.as_str(),
                new.kind.to_string(),
                new.payload,
                new.restore,
                new.expires_at.map(time::to_db),
                time::to_db(now),
            ],
        )?;
        Ok(ScheduledEffect {
            id,
            subject: new.subject.clone(),
            context: new.context.clone(),
            kind: new.kind,
            payload: new.payload.clone(),
            restore: new.restore.clone(),
            expires_at: new.expires_at,
            active: true,
            created_at: now,
            resolved_at: None,
        })
    }

    pub fn effect(&self, id: &str) -> Result<Option<ScheduledEffect>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM scheduled_effects WHERE id = ?1");
        let row = conn.query_row(&sql, [id], read_row).optional()?;
        row.map(decode).transpose()
    }

    /// The newest active, unexpired effect of `kind` for `subject`.
    pub fn active_effect(
        &self,
        subject: &SubjectId,
        kind: EffectKind,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduledEffect>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM scheduled_effects
             WHERE subject_id = ?1 AND kind = ?2 AND active = 1
               AND (expires_at IS NULL OR expires_at > ?3)
             ORDER BY created_at DESC
             LIMIT 1"
        );
        let row = conn
            .query_row(
                &sql,
                rusqlite::params![subject.as_str(), kind.to_string(), time::to_db(now)],
                read_row,
            )
            .optional()?;
        row.map(decode).transpose()
    }

    /// Active effects whose expiry is at or before `now`.
    pub fn due_effects(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledEffect>> {
        self.query_effects(
            "active = 1 AND expires_at IS NOT NULL AND expires_at <= ?1",
            now,
        )
    }

    /// Active effects that will expire after `now`.
    pub fn future_effects(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledEffect>> {
        self.query_effects("active = 1 AND expires_at > ?1", now)
    }

    fn query_effects(&self, filter: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledEffect>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM scheduled_effects WHERE {filter} ORDER BY expires_at"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([time::to_db(now)], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(ENTITY, rows, decode))
    }

    /// Flip `active` to false. Returns false if the effect was already inactive.
    pub fn deactivate_effect(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE scheduled_effects SET active = 0, resolved_at = ?1
             WHERE id = ?2 AND active = 1",
            rusqlite::params![time::to_db(at), id],
        )?;
        Ok(n == 1)
    }

    /// Consume one active one-shot flag named `flag`. Returns false when the
    /// subject holds no such flag.
    pub fn consume_flag(&self, subject: &SubjectId, flag: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE scheduled_effects SET active = 0, resolved_at = ?1
             WHERE id = (
                 SELECT id FROM scheduled_effects
                 WHERE subject_id = ?2 AND kind = 'one_shot_flag' AND payload = ?3
                   AND active = 1 AND (expires_at IS NULL OR expires_at > ?1)
                 ORDER BY created_at
                 LIMIT 1
             ) AND active = 1",
            rusqlite::params![time::to_db(at), subject.as_str(), flag],
        )?;
        Ok(n == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rusqlite::Connection;

    fn store() -> LifecycleStore {
        LifecycleStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn boost(expires_at: Option<DateTime<Utc>>) -> NewEffect {
        NewEffect {
            subject: SubjectId::from("u1"),
            context: ContextId::from("g1"),
            kind: EffectKind::NumericBoost,
            payload: "15000".into(),
            restore: None,
            expires_at,
        }
    }

    #[test]
    fn due_query_splits_past_and_future() {
        let store = store();
        let now = Utc::now();
        let past = store.insert_effect(&boost(Some(now - Duration::seconds(5))), now).unwrap();
        let future = store.insert_effect(&boost(Some(now + Duration::hours(1))), now).unwrap();
        store.insert_effect(&boost(None), now).unwrap();

        let due = store.due_effects(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);

        let pending = store.future_effects(now).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, future.id);
    }

    #[test]
    fn deactivate_is_conditional() {
        let store = store();
        let now = Utc::now();
        let effect = store.insert_effect(&boost(Some(now)), now).unwrap();
        assert!(store.deactivate_effect(&effect.id, now).unwrap());
        assert!(!store.deactivate_effect(&effect.id, now).unwrap());
        let stored = store.effect(&effect.id).unwrap().unwrap();
        assert!(!stored.active);
        assert!(stored.resolved_at.is_some());
        assert!(store.due_effects(now).unwrap().is_empty());
    }

    #[test]
    fn flags_are_consumed_once() {
        let store = store();
        let now = Utc::now();
        let flag = NewEffect {
            kind: EffectKind::OneShotFlag,
            payload: "free_spin".into(),
            ..boost(None)
        };
        store.insert_effect(&flag, now).unwrap();
        let subject = SubjectId::from("u1");
        assert!(store.consume_flag(&subject, "free_spin", now).unwrap());
        assert!(!store.consume_flag(&subject, "free_spin", now).unwrap());
        assert!(!store.consume_flag(&subject, "other", now).unwrap());
    }

    #[test]
    fn active_effect_ignores_expired_rows() {
        let store = store();
        let now = Utc::now();
        store.insert_effect(&boost(Some(now - Duration::seconds(1))), now).unwrap();
        let subject = SubjectId::from("u1");
        assert!(store
            .active_effect(&subject, EffectKind::NumericBoost, now)
            .unwrap()
            .is_none());
        let live = store.insert_effect(&boost(Some(now + Duration::minutes(5))), now).unwrap();
        let found = store
            .active_effect(&subject, EffectKind::NumericBoost, now)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, live.id);
    }
}
