use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use vault_core::{time, ContextId, PrivilegeId, SubjectId};

use super::{decode_all, parse_ts, LifecycleStore};
use crate::error::Result;
use crate::types::PrivilegeExpiration;

const ENTITY: &str = "privilege_expiration";

const COLUMNS: &str = "subject_id, privilege_id, context_id, expires_at, created_at";

struct PrivilegeRow {
    subject_id: String,
    privilege_id: String,
    context_id: Option<String>,
    expires_at: String,
    created_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<PrivilegeRow> {
    Ok(PrivilegeRow {
        subject_id: row.get(0)?,
        privilege_id: row.get(1)?,
        context_id: row.get(2)?,
        expires_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn decode(row: PrivilegeRow) -> Result<PrivilegeExpiration> {
    let key = format!("{}/{}", row.subject_id, row.privilege_id);
    Ok(PrivilegeExpiration {
        expires_at: parse_ts(ENTITY, &key, &row.expires_at)?,
        created_at: parse_ts(ENTITY, &key, &row.created_at)?,
        subject: SubjectId::from(row.subject_id),
        privilege: PrivilegeId::from(row.privilege_id),
        context: row.context_id.map(ContextId::from),
    })
}

impl LifecycleStore {
    /// Insert or replace the expiry for (subject, privilege).
    ///
    /// Re-granting the same privilege never creates a second row; the stored
    /// expiry and context become the new values.
    pub fn upsert_privilege(
        &self,
        subject: &SubjectId,
        privilege: &PrivilegeId,
        context: Option<&ContextId>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PrivilegeExpiration> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO privilege_expirations
             (subject_id, privilege_id, context_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (subject_id, privilege_id) DO UPDATE SET
                 context_id = COALESCE(excluded.context_id, privilege_expirations.context_id),
                 expires_at = excluded.expires_at",
            rusqlite::params![
                subject.as_str(),
                privilege.as_str(),
                context.map(ContextId::as_str),
                time::to_db(expires_at),
                time::to_db(now),
            ],
        )?;
        let sql = format!(
            "SELECT {COLUMNS} FROM privilege_expirations
             WHERE subject_id = ?1 AND privilege_id = ?2"
        );
        let row = conn.query_row(&sql, [subject.as_str(), privilege.as_str()], read_row)?;
        decode(row)
    }

    pub fn privilege(
        &self,
        subject: &SubjectId,
        privilege: &PrivilegeId,
    ) -> Result<Option<PrivilegeExpiration>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM privilege_expirations
             WHERE subject_id = ?1 AND privilege_id = ?2"
        );
        let row = conn
            .query_row(&sql, [subject.as_str(), privilege.as_str()], read_row)
            .optional()?;
        row.map(decode).transpose()
    }

    pub fn privileges_for(&self, subject: &SubjectId) -> Result<Vec<PrivilegeExpiration>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM privilege_expirations
             WHERE subject_id = ?1 ORDER BY expires_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([subject.as_str()], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(ENTITY, rows, decode))
    }

    /// Rows whose expiry is at or before `now`.
    pub fn due_privileges(&self, now: DateTime<Utc>) -> Result<Vec<PrivilegeExpiration>> {
        self.query_privileges("expires_at <= ?1", now)
    }

    /// Rows that expire after `now`.
    pub fn future_privileges(&self, now: DateTime<Utc>) -> Result<Vec<PrivilegeExpiration>> {
        self.query_privileges("expires_at > ?1", now)
    }

    fn query_privileges(
        &self,
        filter: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PrivilegeExpiration>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM privilege_expirations WHERE {filter} ORDER BY expires_at"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([time::to_db(now)], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(ENTITY, rows, decode))
    }

    /// Delete the row only if it still holds `expires_at`.
    ///
    /// A re-grant that replaced the expiry between read and delete keeps its
    /// row; the caller sees `false`.
    pub fn delete_privilege_if(
        &self,
        subject: &SubjectId,
        privilege: &PrivilegeId,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM privilege_expirations
             WHERE subject_id = ?1 AND privilege_id = ?2 AND expires_at = ?3",
            rusqlite::params![subject.as_str(), privilege.as_str(), time::to_db(expires_at)],
        )?;
        Ok(n == 1)
    }

    /// Put a previously read row back exactly as it was.
    pub fn restore_privilege(&self, row: &PrivilegeExpiration) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO privilege_expirations
             (subject_id, privilege_id, context_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (subject_id, privilege_id) DO UPDATE SET
                 context_id = excluded.context_id,
                 expires_at = excluded.expires_at,
                 created_at = excluded.created_at",
            rusqlite::params![
                row.subject.as_str(),
                row.privilege.as_str(),
                row.context.as_ref().map(ContextId::as_str),
                time::to_db(row.expires_at),
                time::to_db(row.created_at),
            ],
        )?;
        Ok(())
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

    #[test]
    fn regrant_replaces_expiry() {
        let store = store();
        let now = Utc::now();
        let subject = SubjectId::from("u1");
        let vip = PrivilegeId::from("vip");
        let ctx = ContextId::from("g1");

        store
            .upsert_privilege(&subject, &vip, Some(&ctx), now + Duration::hours(1), now)
            .unwrap();
        let second = now + Duration::hours(5);
        store.upsert_privilege(&subject, &vip, None, second, now).unwrap();

        let rows = store.privileges_for(&subject).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].expires_at.timestamp_millis(), second.timestamp_millis());
        // A regrant without context keeps the originally recorded one.
        assert_eq!(rows[0].context, Some(ctx));
    }

    #[test]
    fn conditional_delete_respects_regrant() {
        let store = store();
        let now = Utc::now();
        let subject = SubjectId::from("u1");
        let vip = PrivilegeId::from("vip");

        let first = store
            .upsert_privilege(&subject, &vip, None, now - Duration::seconds(1), now)
            .unwrap();
        store
            .upsert_privilege(&subject, &vip, None, now + Duration::hours(1), now)
            .unwrap();

        assert!(!store.delete_privilege_if(&subject, &vip, first.expires_at).unwrap());
        assert!(store.privilege(&subject, &vip).unwrap().is_some());
    }

    #[test]
    fn due_and_future_partition() {
        let store = store();
        let now = Utc::now();
        store
            .upsert_privilege(&"a".into(), &"vip".into(), None, now - Duration::seconds(1), now)
            .unwrap();
        store
            .upsert_privilege(&"b".into(), &"vip".into(), None, now + Duration::seconds(1), now)
            .unwrap();
        assert_eq!(store.due_privileges(now).unwrap()[0].subject, SubjectId::from("a"));
        assert_eq!(store.future_privileges(now).unwrap()[0].subject, SubjectId::from("b"));
    }
}
