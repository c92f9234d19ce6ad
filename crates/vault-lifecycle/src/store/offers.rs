use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;
use vault_core::{time, ContextId, Reward, SubjectId, WeightedReward};

use super::{decode_all, parse_json, parse_opt_ts, parse_text, parse_ts, LifecycleStore};
use crate::error::Result;
use crate::types::{OfferStatus, RewardOffer};

const ENTITY: &str = "reward_offer";

const COLUMNS: &str = "id, contest_id, subject_id, context_id, guaranteed, alternatives,
                       status, chosen, created_at, claimed_at";

struct OfferRow {
    id: String,
    contest_id: Option<String>,
    subject_id: String,
    context_id: String,
    guaranteed: String,
    alternatives: String,
    status: String,
    chosen: Option<String>,
    created_at: String,
    claimed_at: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<OfferRow> {
    Ok(OfferRow {
        id: row.get(0)?,
        contest_id: row.get(1)?,
        subject_id: row.get(2)?,
        context_id: row.get(3)?,
        guaranteed: row.get(4)?,
        alternatives: row.get(5)?,
        status: row.get(6)?,
        chosen: row.get(7)?,
        created_at: row.get(8)?,
        claimed_at: row.get(9)?,
    })
}

fn decode(row: OfferRow) -> Result<RewardOffer> {
    let id = row.id.as_str();
    Ok(RewardOffer {
        guaranteed: parse_json(ENTITY, id, &row.guaranteed)?,
        alternatives: parse_json(ENTITY, id, &row.alternatives)?,
        status: parse_text(ENTITY, id, &row.status)?,
        chosen: row
            .chosen
            .as_deref()
            .map(|raw| parse_json::<Reward>(ENTITY, id, raw))
            .transpose()?,
        created_at: parse_ts(ENTITY, id, &row.created_at)?,
        claimed_at: parse_opt_ts(ENTITY, id, row.claimed_at.as_deref())?,
        contest_id: row.contest_id,
        subject: SubjectId::from(row.subject_id),
        context: ContextId::from(row.context_id),
        id: row.id,
    })
}

impl LifecycleStore {
    pub fn insert_offer(
        &self,
        contest_id: Option<&str>,
        subject: &SubjectId,
        context: &ContextId,
        guaranteed: &Reward,
        alternatives: &[WeightedReward],
        now: DateTime<Utc>,
    ) -> Result<RewardOffer> {
        let id = Uuid::now_v7().to_string();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO reward_offers
             (id, contest_id, subject_id, context_id, guaranteed, alternatives,
              status, chosen, created_at, claimed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', NULL, ?7, NULL)",
            rusqlite::params![
                id,
                contest_id,
                subject.as_str(),
                context.as_str(),
                serde_json::to_string(guaranteed)?,
                serde_json::to_string(alternatives)?,
                time::to_db(now),
            ],
        )?;
        Ok(RewardOffer {
            id,
            contest_id: contest_id.map(String::from),
            subject: subject.clone(),
            context: context.clone(),
            guaranteed: guaranteed.clone(),
            alternatives: alternatives.to_vec(),
            status: OfferStatus::Pending,
            chosen: None,
            created_at: now,
            claimed_at: None,
        })
    }

    pub fn offer(&self, id: &str) -> Result<Option<RewardOffer>> {
        let conn = self.lock();
        let sql = format!("SELECT {COLUMNS} FROM reward_offers WHERE id = ?1");
        let row = conn.query_row(&sql, [id], read_row).optional()?;
        row.map(decode).transpose()
    }

    pub fn pending_offers(&self, subject: &SubjectId) -> Result<Vec<RewardOffer>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM reward_offers
             WHERE subject_id = ?1 AND status = 'pending'
             ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([subject.as_str()], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_all(ENTITY, rows, decode))
    }

    /// pending → claimed, recording the reward that was chosen. Returns false
    /// if the offer had already been claimed.
    pub fn claim_offer_if_pending(
        &self,
        id: &str,
        chosen: &Reward,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE reward_offers SET status = 'claimed', chosen = ?1, claimed_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            rusqlite::params![serde_json::to_string(chosen)?, time::to_db(at), id],
        )?;
        Ok(n == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn offer_is_claimed_once() {
        let store = LifecycleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let now = Utc::now();
        let subject = SubjectId::from("u1");
        let guaranteed = Reward::Draws { count: 2 };
        let offer = store
            .insert_offer(Some("c1"), &subject, &ContextId::from("g1"), &guaranteed, &[], now)
            .unwrap();

        assert_eq!(store.pending_offers(&subject).unwrap().len(), 1);
        assert!(store.claim_offer_if_pending(&offer.id, &guaranteed, now).unwrap());
        assert!(!store.claim_offer_if_pending(&offer.id, &guaranteed, now).unwrap());

        let stored = store.offer(&offer.id).unwrap().unwrap();
        assert_eq!(stored.status, OfferStatus::Claimed);
        assert_eq!(stored.chosen, Some(guaranteed));
        assert!(store.pending_offers(&subject).unwrap().is_empty());
    }
}
