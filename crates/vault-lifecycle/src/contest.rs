//! Multi-participant, multi-winner timed contests.
//!
//! A contest is resolved exactly once (active → ended through a conditional
//! write) and may then be re-drawn any number of times. Every draw samples
//! uniformly without replacement from the stored participant set and
//! distributes the reward again; re-draws are not deduplicated against
//! earlier winners.
//!
//! The end, the draw and one queued award per winner commit together. Awards
//! are settled right after the draw; any that fail stay queued and are
//! retried by [`RewardDistributor::settle_due`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, info};
use vault_core::{Clock, SubjectId};

use crate::error::{LifecycleError, Result};
use crate::handlers::{log_failure, InFlight, Resolution, SweepStats};
use crate::notice::Notifier;
use crate::rewards::{ClaimOutcome, RewardDistributor, RewardOutcome};
use crate::store::LifecycleStore;
use crate::timers::{EntityKey, TimerRegistry};
use crate::types::{Award, Contest, ContestDraw, ContestStatus, NewContest, OfferPick};

/// Result of [`ContestEngine::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
    /// The contest has ended, been cancelled, or passed its end time.
    Closed,
}

/// One winner and what they received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub award_id: String,
    pub subject: SubjectId,
    /// `None` while the award is still queued for retry.
    pub outcome: Option<RewardOutcome>,
}

/// A completed draw with its distributions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawResult {
    pub draw: ContestDraw,
    pub awards: Vec<Payout>,
}

#[derive(Clone)]
pub struct ContestEngine {
    store: LifecycleStore,
    rewards: RewardDistributor,
    notifier: Notifier,
    timers: TimerRegistry,
    clock: Arc<dyn Clock>,
    in_flight: InFlight,
}

impl ContestEngine {
    pub fn new(
        store: LifecycleStore,
        rewards: RewardDistributor,
        notifier: Notifier,
        timers: TimerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            rewards,
            notifier,
            timers,
            clock,
            in_flight: InFlight::default(),
        }
    }

    /// Persist a new contest, announce it, and arm its end timer.
    pub async fn create(&self, new: NewContest) -> Result<Contest> {
        let now = self.clock.now();
        if new.winner_count == 0 {
            return Err(LifecycleError::InvalidInput(
                "a contest needs at least one winner".into(),
            ));
        }
        if new.ends_at <= now {
            return Err(LifecycleError::InvalidInput(format!(
                "contest end {} is not in the future",
                new.ends_at
            )));
        }

        let mut contest = self.store.insert_contest(&new, now)?;
        info!(
            contest_id = %contest.id,
            title = %contest.title,
            ends_at = %contest.ends_at,
            winners = contest.winner_count,
            "contest created"
        );

        let announcement = announcement(&contest);
        if let Some(notice) = self
            .notifier
            .send(&contest.context, &contest.channel, &announcement)
            .await
        {
            self.store.set_contest_notice(&contest.id, &notice)?;
            contest.notice = Some(notice);
        }

        self.timers
            .arm(EntityKey::Contest(contest.id.clone()), contest.ends_at);
        Ok(contest)
    }

    pub fn contest(&self, id: &str) -> Result<Contest> {
        self.store.contest(id)?.ok_or_else(|| LifecycleError::NotFound {
            entity: "contest",
            id: id.to_string(),
        })
    }

    pub fn join(&self, contest_id: &str, subject: &SubjectId) -> Result<JoinOutcome> {
        let contest = self.contest(contest_id)?;
        let now = self.clock.now();
        if contest.status != ContestStatus::Active || now >= contest.ends_at {
            return Ok(JoinOutcome::Closed);
        }
        if self.store.add_participant(contest_id, subject, now)? {
            debug!(contest_id, subject = %subject, "participant joined");
            Ok(JoinOutcome::Joined)
        } else {
            Ok(JoinOutcome::AlreadyJoined)
        }
    }

    pub fn participants(&self, contest_id: &str) -> Result<Vec<SubjectId>> {
        self.store.participants(contest_id)
    }

    /// End the contest if it is due, then draw winners and distribute.
    pub async fn resolve(&self, contest_id: &str) -> Result<Resolution> {
        let key = EntityKey::Contest(contest_id.to_string());
        let Some(_guard) = self.in_flight.try_acquire(key.clone()) else {
            return Ok(Resolution::InFlight);
        };

        let contest = self.contest(contest_id)?;
        if contest.status != ContestStatus::Active {
            debug!(contest_id, status = %contest.status, "contest already resolved");
            return Ok(Resolution::AlreadyResolved);
        }
        let now = self.clock.now();
        if contest.ends_at > now {
            self.timers.arm(key, contest.ends_at);
            return Ok(Resolution::NotDue);
        }
        let participants = self.store.participants(contest_id)?;
        let winners = pick_winners(&contest, &participants);
        let Some((draw, awards)) = self.store.end_contest_with_draw(&contest, &winners, now)? else {
            debug!(contest_id, "contest ended concurrently");
            return Ok(Resolution::AlreadyResolved);
        };

        let result = self.pay_out(&contest, draw, awards, participants.len()).await;
        info!(
            contest_id,
            winners = result.draw.winners.len(),
            "contest resolved"
        );
        Ok(Resolution::Resolved)
    }

    /// Draw again from an ended contest and distribute the reward again.
    pub async fn reroll(&self, contest_id: &str) -> Result<DrawResult> {
        let not_ended = |status: ContestStatus| LifecycleError::InvalidTransition {
            entity: "contest",
            id: contest_id.to_string(),
            status: status.to_string(),
            action: "reroll",
        };
        let contest = self.contest(contest_id)?;
        if contest.status != ContestStatus::Ended {
            return Err(not_ended(contest.status));
        }
        let participants = self.store.participants(contest_id)?;
        let winners = pick_winners(&contest, &participants);
        let Some((draw, awards)) = self
            .store
            .redraw_contest(&contest, &winners, self.clock.now())?
        else {
            return Err(not_ended(self.contest(contest_id)?.status));
        };
        let result = self.pay_out(&contest, draw, awards, participants.len()).await;
        info!(
            contest_id,
            draw_no = result.draw.draw_no,
            winners = result.draw.winners.len(),
            "contest re-drawn"
        );
        Ok(result)
    }

    pub async fn cancel(&self, contest_id: &str) -> Result<()> {
        let contest = self.contest(contest_id)?;
        if !self
            .store
            .cancel_contest_if_active(contest_id, self.clock.now())?
        {
            return Err(LifecycleError::InvalidTransition {
                entity: "contest",
                id: contest_id.to_string(),
                status: contest.status.to_string(),
                action: "cancel",
            });
        }
        self.timers.disarm(&EntityKey::Contest(contest_id.to_string()));
        if let Some(notice) = &contest.notice {
            let message = format!("~~{}~~\nThis contest was cancelled.", contest.title);
            self.notifier.edit(notice, &message).await;
        }
        info!(contest_id, "contest cancelled");
        Ok(())
    }

    pub async fn claim_offer(
        &self,
        offer_id: &str,
        subject: &SubjectId,
        pick: OfferPick,
    ) -> Result<ClaimOutcome> {
        self.rewards.claim_offer(offer_id, subject, pick).await
    }

    pub fn draws(&self, contest_id: &str) -> Result<Vec<ContestDraw>> {
        self.store.draws(contest_id)
    }

    /// Settle a draw's queued awards and announce the winners.
    async fn pay_out(
        &self,
        contest: &Contest,
        draw: ContestDraw,
        awards: Vec<Award>,
        entrants: usize,
    ) -> DrawResult {
        let mut payouts = Vec::with_capacity(awards.len());
        for award in awards {
            let outcome = match self.rewards.settle(&award).await {
                Ok(settlement) => settlement.outcome().cloned(),
                Err(e) => {
                    error!(contest_id = %contest.id, subject = %award.subject, error = %e, "award settlement failed");
                    None
                }
            };
            payouts.push(Payout {
                award_id: award.id,
                subject: award.subject,
                outcome,
            });
        }

        let results = results_message(contest, &draw, entrants);
        if let Some(notice) = &contest.notice {
            self.notifier.edit(notice, &results).await;
        }
        self.notifier
            .send(&contest.context, &contest.channel, &results)
            .await;

        DrawResult {
            draw,
            awards: payouts,
        }
    }

    /// Resolve every active contest whose end time has passed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        for contest in self.store.due_contests(now)? {
            let outcome = self.resolve(&contest.id).await;
            log_failure(&EntityKey::Contest(contest.id), &outcome);
            stats.record(&outcome);
        }
        Ok(stats)
    }

    pub async fn arm_future(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut armed = 0;
        for contest in self.store.active_contests()? {
            if contest.ends_at > now {
                self.timers
                    .arm(EntityKey::Contest(contest.id), contest.ends_at);
                armed += 1;
            }
        }
        Ok(armed)
    }
}

fn pick_winners(contest: &Contest, participants: &[SubjectId]) -> Vec<SubjectId> {
    draw_winners(
        participants,
        contest.winner_count as usize,
        &mut rand::thread_rng(),
    )
}

/// Sample `min(count, participants.len())` distinct winners uniformly.
pub fn draw_winners<R: Rng + ?Sized>(
    participants: &[SubjectId],
    count: usize,
    rng: &mut R,
) -> Vec<SubjectId> {
    participants.choose_multiple(rng, count).cloned().collect()
}

fn announcement(contest: &Contest) -> String {
    format!(
        "🎉 **{}**\nPrize: {}\nWinners: {}\nEnds: {}",
        contest.title,
        contest.reward.describe(),
        contest.winner_count,
        contest.ends_at.format("%Y-%m-%d %H:%M UTC"),
    )
}

fn results_message(contest: &Contest, draw: &ContestDraw, entrants: usize) -> String {
    let heading = if draw.draw_no > 1 {
        format!("🔁 **{}** re-draw #{}", contest.title, draw.draw_no - 1)
    } else {
        format!("🎉 **{}** has ended", contest.title)
    };
    if draw.winners.is_empty() {
        return format!("{heading}\nNo one entered, so there are no winners.");
    }
    let winners = draw
        .winners
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{heading}\nWinners ({} of {entrants} entrants): {winners}\nPrize: {}",
        draw.winners.len(),
        contest.reward.describe()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn people(n: usize) -> Vec<SubjectId> {
        (0..n).map(|i| SubjectId::from(format!("u{i}"))).collect()
    }

    #[test]
    fn winners_are_distinct_and_bounded() {
        let mut rng = StdRng::seed_from_u64(42);
        for (entrants, wanted) in [(0, 3), (2, 5), (10, 3), (4, 4)] {
            let pool = people(entrants);
            let winners = draw_winners(&pool, wanted, &mut rng);
            assert_eq!(winners.len(), wanted.min(entrants));
            let unique: HashSet<_> = winners.iter().collect();
            assert_eq!(unique.len(), winners.len());
            assert!(winners.iter().all(|w| pool.contains(w)));
        }
    }

    #[test]
    fn every_entrant_can_win() {
        let pool = people(5);
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.extend(draw_winners(&pool, 1, &mut rng));
        }
        assert_eq!(seen.len(), 5);
    }
}
