use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;
use vault_core::{time, ChannelId, ContextId, NoticeRef, SubjectId};

use super::awards::{insert_awards, AwardOrigin};
use super::{decode_all, parse_json, parse_opt_ts, parse_text, parse_ts, LifecycleStore};
use crate::error::Result;
use crate::types::{Award, Contest, ContestDraw, ContestStatus, NewContest};

const ENTITY: &str = "contest";

const COLUMNS: &str = "id, context_id, channel_id, title, reward, ends_at, winner_count,
                       status, notice, host_id, created_at, ended_at";

struct ContestRow {
    id: String,
    context_id: String,
    channel_id: String,
    title: String,
    reward: String,
    ends_at: String,
    winner_count: u32,
    status: String,
    notice: Option<String>,
    host_id: Option<String>,
    created_at: String,
    ended_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ContestRow> {
    Ok(ContestRow {
        id: row.get(0)?,
        context_id: row.get(1)?,
        channel_id: row.get(2)?,
        title: row.get(3)?,
        reward: row.get(4)?,
        ends_at: row.get(5)?,
        winner_count: row.get(6)?,
        status: row.get(7)?,
        notice: row.get(8)?,
        host_id: row.get(9)?,
        created_at: row.get(10)?,
        ended_at: row.get(11)?,
    })
}

fn decode(row: ContestRow) -> Result<Contest> {
    let id = row.id.as_str();
    Ok(Contest {
        reward: parse_json(ENTITY, id, &row.reward)?,
        ends_at: parse_ts(ENTITY, id, &row.ends_at)?,
        status: parse_text(ENTITY, id, &row.status)?,
        notice: row
            .notice
            .as_deref()
            .map(|raw| parse_json::<NoticeRef>(ENTITY, id, raw))
            .transpose()?,
        created_at: parse_ts(ENTITY, id, &row.created_at)?,
        ended_at: parse_opt_ts(ENTITY, id, row.ended_at.as_deref())?,
        context: ContextId::from(row.context_id),
        channel: ChannelId::from(row.channel_id),
        title: row.title,
        winner_count: row.winner_count,
        host: row.host_id.map(SubjectId::from),
        id: row.id,
    })
}

impl LifecycleStore {
    pub fn insert_contest(&self, new: &NewContest, now: DateTime<Utc>) -> Result<Contest> {
        let id = Uuid::now_v7().to_string();
        let reward_json = serde_json::to_string(&new.reward)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO contests
             (id, context_id, channel_id, title, reward, ends_at, winner_count,
              status, notice, host_id, created_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', NULL, ?8, ?9, NULL)",
            rusqlite::params![
                id,
                new.context.as_str(),
                new.channel.as_str(),
                new.title,
                reward_json,
                time::to_db(new.ends_at),
                new.winner_count,
                new.host.as_ref().map(SubjectId::as_str),
                time::to_db(now),
            ],
        )?;
        Ok(Contest {
            id,
            context: new.context.clone(),
            channel: new.channel.clone(),
            title: new.title.clone(),
            reward: new.reward.clone(),
            ends_at: new.ends_at,
            winner_count: new.winner_count,
            status: ContestStatus::Active,
            notice: None,
            host: new.host.clone(),
            created_at: now,
            ended_at: None,
        })
    }

    pub fn contest(&self, id: &str) -> Result<Option<Contest>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM contests WHERE id = ?1");
        let row = conn.query_row(&sql, [id], read_row).optional()?;
        row.map(decode).transpose()
    }

    pub fn set_contest_notice(&self, id: &str, notice: &NoticeRef) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE contests SET notice = ?1 WHERE id = ?2",
            rusqlite::params![serde_json::to_string(notice)?, id],
        )?;
        Ok(())
    }

    /// Active contests whose end time is at or before `now`.
    pub fn due_contests(&self, now: DateTime<Utc>) -> Result<Vec<Contest>> {
        self.query_contests("status = 'active' AND ends_at <= ?1", Some(now))
    }

    pub fn active_contests(&self) -> Result<Vec<Contest>> {
        self.query_contests("status = 'active'", None)
    }

    fn query_contests(&self, filter: &str, now: Option<DateTime<Utc>>) -> Result<Vec<Contest>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM contests WHERE {filter} ORDER BY ends_at");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = match now {
            Some(now) => stmt.query_map([time::to_db(now)], read_row)?,
            None => stmt.query_map([], read_row)?,
        }
        .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(ENTITY, rows, decode))
    }

    /// active → ended, recording the first draw and one pending award per
    /// winner in the same transaction. `None` if the contest was not active.
    pub fn end_contest_with_draw(
        &self,
        contest: &Contest,
        winners: &[SubjectId],
        at: DateTime<Utc>,
    ) -> Result<Option<(ContestDraw, Vec<Award>)>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE contests SET status = 'ended', ended_at = ?1
             WHERE id = ?2 AND status = 'active'",
            rusqlite::params![time::to_db(at), contest.id],
        )?;
        if n != 1 {
            return Ok(None);
        }
        let drawn = append_draw(&tx, contest, winners, at)?;
        tx.commit()?;
        Ok(Some(drawn))
    }

    /// Record a re-draw of an ended contest together with its pending
    /// awards. `None` if the contest is not ended.
    pub fn redraw_contest(
        &self,
        contest: &Contest,
        winners: &[SubjectId],
        at: DateTime<Utc>,
    ) -> Result<Option<(ContestDraw, Vec<Award>)>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM contests WHERE id = ?1",
                [contest.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() != Some("ended") {
            return Ok(None);
        }
        let drawn = append_draw(&tx, contest, winners, at)?;
        tx.commit()?;
        Ok(Some(drawn))
    }

    /// active → cancelled. Returns false if the contest was not active.
    pub fn cancel_contest_if_active(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE contests SET status = 'cancelled', ended_at = ?1
             WHERE id = ?2 AND status = 'active'",
            rusqlite::params![time::to_db(at), id],
        )?;
        Ok(n == 1)
    }

    /// Record a participant. Returns false if they had already joined.
    pub fn add_participant(
        &self,
        contest_id: &str,
        subject: &SubjectId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "INSERT OR IGNORE INTO contest_participants (contest_id, subject_id, joined_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![contest_id, subject.as_str(), time::to_db(at)],
        )?;
        Ok(n == 1)
    }

    /// Participants in join order.
    pub fn participants(&self, contest_id: &str) -> Result<Vec<SubjectId>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT subject_id FROM contest_participants
             WHERE contest_id = ?1 ORDER BY joined_at, subject_id",
        )?;
        let ids = stmt
            .query_map([contest_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(SubjectId::from).collect())
    }

    /// Every recorded draw, oldest first.
    pub fn draws(&self, contest_id: &str) -> Result<Vec<ContestDraw>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT contest_id, draw_no, winners, drawn_at FROM contest_draws
             WHERE contest_id = ?1 ORDER BY draw_no",
        )?;
        let rows = stmt
            .query_map([contest_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all("contest_draw", rows, |(contest_id, draw_no, winners, drawn_at)| {
            Ok(ContestDraw {
                winners: parse_json("contest_draw", &contest_id, &winners)?,
                drawn_at: parse_ts("contest_draw", &contest_id, &drawn_at)?,
                contest_id,
                draw_no,
            })
        }))
    }
}

/// Append a draw with the next draw number and queue the reward for each
/// winner.
fn append_draw(
    conn: &Connection,
    contest: &Contest,
    winners: &[SubjectId],
    at: DateTime<Utc>,
) -> Result<(ContestDraw, Vec<Award>)> {
    let draw_no: u32 = conn.query_row(
        "SELECT COALESCE(MAX(draw_no), 0) + 1 FROM contest_draws WHERE contest_id = ?1",
        [contest.id.as_str()],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO contest_draws (contest_id, draw_no, winners, drawn_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            contest.id,
            draw_no,
            serde_json::to_string(winners)?,
            time::to_db(at)
        ],
    )?;
    let origin = AwardOrigin {
        source: format!("contest {} draw {draw_no}", contest.id),
        contest_id: Some(&contest.id),
        heist_id: None,
        context: &contest.context,
    };
    let awards = insert_awards(conn, &origin, winners.iter().map(|w| (w, &contest.reward)), at)?;
    let draw = ContestDraw {
        contest_id: contest.id.clone(),
        draw_no,
        winners: winners.to_vec(),
        drawn_at: at,
    };
    Ok((draw, awards))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rusqlite::Connection;
    use vault_core::{amount::Amount, Reward};

    fn store() -> LifecycleStore {
        LifecycleStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn new_contest(ends_at: DateTime<Utc>) -> NewContest {
        NewContest {
            context: ContextId::from("g1"),
            channel: ChannelId::from("c1"),
            title: "Weekly drop".into(),
            reward: Reward::Balance {
                amount: Amount::from(500),
            },
            ends_at,
            winner_count: 2,
            host: Some(SubjectId::from("host")),
        }
    }

    #[test]
    fn contest_roundtrips() {
        let store = store();
        let now = Utc::now();
        let created = store.insert_contest(&new_contest(now), now).unwrap();
        let loaded = store.contest(&created.id).unwrap().unwrap();
        assert_eq!(loaded.reward, created.reward);
        assert_eq!(loaded.status, ContestStatus::Active);
        assert_eq!(loaded.host, Some(SubjectId::from("host")));

        let notice = NoticeRef {
            channel: ChannelId::from("c1"),
            message_id: "m1".into(),
        };
        store.set_contest_notice(&created.id, &notice).unwrap();
        assert_eq!(store.contest(&created.id).unwrap().unwrap().notice, Some(notice));
    }

    #[test]
    fn end_and_cancel_are_exclusive() {
        let store = store();
        let now = Utc::now();
        let contest = store.insert_contest(&new_contest(now), now).unwrap();
        assert!(store.end_contest_with_draw(&contest, &[], now).unwrap().is_some());
        assert!(store.end_contest_with_draw(&contest, &[], now).unwrap().is_none());
        assert!(!store.cancel_contest_if_active(&contest.id, now).unwrap());
        assert_eq!(
            store.contest(&contest.id).unwrap().unwrap().status,
            ContestStatus::Ended
        );
        assert_eq!(store.draws(&contest.id).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_join_is_rejected() {
        let store = store();
        let now = Utc::now();
        let contest = store.insert_contest(&new_contest(now), now).unwrap();
        let alice = SubjectId::from("alice");
        assert!(store.add_participant(&contest.id, &alice, now).unwrap());
        assert!(!store.add_participant(&contest.id, &alice, now).unwrap());
        assert_eq!(store.participants(&contest.id).unwrap(), vec![alice]);
    }

    #[test]
    fn due_contests_only_lists_overdue_active() {
        let store = store();
        let now = Utc::now();
        let overdue = store.insert_contest(&new_contest(now - Duration::seconds(1)), now).unwrap();
        store.insert_contest(&new_contest(now + Duration::hours(1)), now).unwrap();
        let due = store.due_contests(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, overdue.id);
        assert_eq!(store.active_contests().unwrap().len(), 2);
    }

    #[test]
    fn draws_are_numbered_and_queue_one_award_per_winner() {
        let store = store();
        let now = Utc::now();
        let contest = store.insert_contest(&new_contest(now), now).unwrap();
        let winners = [SubjectId::from("a"), SubjectId::from("b")];

        let (first, awards) = store
            .end_contest_with_draw(&contest, &winners, now)
            .unwrap()
            .unwrap();
        let (second, none) = store.redraw_contest(&contest, &[], now).unwrap().unwrap();
        assert_eq!((first.draw_no, second.draw_no), (1, 2));
        assert!(none.is_empty());

        assert_eq!(awards.len(), 2);
        assert!(awards.iter().all(|a| a.reward == contest.reward));
        assert_eq!(awards[0].source, format!("contest {} draw 1", contest.id));
        assert_eq!(store.contest_awards(&contest.id).unwrap().len(), 2);

        let draws = store.draws(&contest.id).unwrap();
        assert_eq!(draws.len(), 2);
        assert!(draws[1].winners.is_empty());
    }

    #[test]
    fn redraw_needs_an_ended_contest() {
        let store = store();
        let now = Utc::now();
        let active = store.insert_contest(&new_contest(now), now).unwrap();
        assert!(store.redraw_contest(&active, &[], now).unwrap().is_none());

        let cancelled = store.insert_contest(&new_contest(now), now).unwrap();
        store.cancel_contest_if_active(&cancelled.id, now).unwrap();
        assert!(store.redraw_contest(&cancelled, &[], now).unwrap().is_none());
        assert!(store.draws(&cancelled.id).unwrap().is_empty());
    }
}
