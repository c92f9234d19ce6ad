//! Reward distribution, polymorphic over [`Reward`] kind.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::Rng;
use tracing::{debug, error, info, warn};
use vault_core::{Amount, Clock, ContextId, PrivilegeId, Reward, SubjectId, WeightedReward};
use vault_ledger::Ledger;

use crate::error::{LifecycleError, Result};
use crate::handlers::{EffectHandler, GrantOutcome, PrivilegeHandler, Resolution, SweepStats};
use crate::store::LifecycleStore;
use crate::types::{Award, AwardStatus, OfferPick, PrivilegeExpiration, RewardOffer};

/// How long a settler may hold an award before another may take it over.
const SETTLE_LEASE_SECS: i64 = 300;

/// What distributing one reward to one subject did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewardOutcome {
    /// Ledger balance credited by `amount` (after any active boost).
    Credited { amount: Amount },
    DrawsCredited { count: i64 },
    PrivilegeGranted { privilege: PrivilegeId },
    TimedPrivilegeGranted(PrivilegeExpiration),
    /// A choice offer was recorded for the subject to claim later.
    Offered(RewardOffer),
    /// The subject could not be found; nothing was granted.
    Unreachable,
}

/// Result of [`RewardDistributor::settle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Settled(RewardOutcome),
    /// Distribution failed; the award is pending again for the next sweep.
    Deferred,
    /// Settled already, or another settler holds it.
    AlreadySettled,
}

impl Settlement {
    pub fn outcome(&self) -> Option<&RewardOutcome> {
        match self {
            Settlement::Settled(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            Settlement::Settled(RewardOutcome::Unreachable) => Resolution::Unreachable,
            Settlement::Settled(_) => Resolution::Resolved,
            Settlement::Deferred => Resolution::Deferred,
            Settlement::AlreadySettled => Resolution::AlreadyResolved,
        }
    }
}

/// Result of [`RewardDistributor::claim_offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed { reward: Reward, outcome: RewardOutcome },
    AlreadyClaimed,
}

#[derive(Clone)]
pub struct RewardDistributor {
    ledger: Ledger,
    store: LifecycleStore,
    privileges: PrivilegeHandler,
    effects: EffectHandler,
    clock: Arc<dyn Clock>,
}

impl RewardDistributor {
    pub fn new(
        ledger: Ledger,
        store: LifecycleStore,
        privileges: PrivilegeHandler,
        effects: EffectHandler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            store,
            privileges,
            effects,
            clock,
        }
    }

    /// Give `reward` to `subject`. `source` becomes the ledger reason and
    /// `contest_id` is recorded on deferred offers.
    pub async fn distribute(
        &self,
        reward: &Reward,
        subject: &SubjectId,
        context: &ContextId,
        source: &str,
        contest_id: Option<&str>,
    ) -> Result<RewardOutcome> {
        let outcome = match reward {
            Reward::Balance { amount } => {
                let amount = self.effects.apply_boost(subject, amount)?;
                self.ledger.adjust_balance(subject, &amount, source)?;
                RewardOutcome::Credited { amount }
            }
            Reward::Draws { count } => {
                self.ledger.adjust_draws(subject, *count, source)?;
                RewardOutcome::DrawsCredited { count: *count }
            }
            Reward::Privilege { privilege } => {
                if self
                    .privileges
                    .grant_permanent(subject, context, privilege)
                    .await?
                {
                    RewardOutcome::PrivilegeGranted {
                        privilege: privilege.clone(),
                    }
                } else {
                    RewardOutcome::Unreachable
                }
            }
            Reward::TimedPrivilege {
                privilege,
                duration_secs,
            } => {
                let duration = Duration::seconds(*duration_secs);
                match self
                    .privileges
                    .grant(subject, context, privilege, duration)
                    .await?
                {
                    GrantOutcome::Granted(row) => RewardOutcome::TimedPrivilegeGranted(row),
                    GrantOutcome::Unreachable => RewardOutcome::Unreachable,
                }
            }
            Reward::Choice {
                guaranteed,
                alternatives,
            } => {
                let offer = self.store.insert_offer(
                    contest_id,
                    subject,
                    context,
                    guaranteed,
                    alternatives,
                    self.clock.now(),
                )?;
                RewardOutcome::Offered(offer)
            }
        };
        info!(subject = %subject, source, reward = %reward.describe(), "reward distributed");
        Ok(outcome)
    }

    /// Hand out one queued award.
    ///
    /// The award is claimed through a conditional write first, so two
    /// settlers never distribute it together. Any distribution error puts it
    /// back to pending for [`settle_due`](Self::settle_due) to retry.
    pub async fn settle(&self, award: &Award) -> Result<Settlement> {
        let now = self.clock.now();
        if !self.store.claim_award(&award.id, now, lease_start(now))? {
            debug!(award_id = %award.id, "award already settled or being settled");
            return Ok(Settlement::AlreadySettled);
        }

        let distributed = self
            .distribute(
                &award.reward,
                &award.subject,
                &award.context,
                &award.source,
                award.contest_id.as_deref(),
            )
            .await;
        match distributed {
            Ok(outcome) => {
                let status = if outcome == RewardOutcome::Unreachable {
                    AwardStatus::Unreachable
                } else {
                    AwardStatus::Done
                };
                self.store.finish_award(&award.id, status, self.clock.now())?;
                Ok(Settlement::Settled(outcome))
            }
            Err(e) => {
                warn!(
                    award_id = %award.id,
                    subject = %award.subject,
                    source = %award.source,
                    error = %e,
                    "award distribution failed, will retry"
                );
                self.store.release_award(&award.id)?;
                Ok(Settlement::Deferred)
            }
        }
    }

    /// Settle every award still owed at `now`, including any whose settler
    /// stopped before finishing.
    pub async fn settle_due(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        for award in self.store.due_awards(lease_start(now))? {
            let outcome = self.settle(&award).await.map(|s| s.resolution());
            if let Err(e) = &outcome {
                error!(award_id = %award.id, error = %e, "award settlement failed");
            }
            stats.record(&outcome);
        }
        Ok(stats)
    }

    /// Settle a pending offer. The gamble side draws one alternative by
    /// weight; with no usable alternatives it falls back to the guaranteed
    /// reward.
    pub async fn claim_offer(
        &self,
        offer_id: &str,
        subject: &SubjectId,
        pick: OfferPick,
    ) -> Result<ClaimOutcome> {
        let offer = self
            .store
            .offer(offer_id)?
            .ok_or_else(|| LifecycleError::NotFound {
                entity: "reward_offer",
                id: offer_id.to_string(),
            })?;
        if &offer.subject != subject {
            return Err(LifecycleError::InvalidInput(format!(
                "offer {offer_id} belongs to another subject"
            )));
        }

        let reward = match pick {
            OfferPick::Guaranteed => offer.guaranteed.clone(),
            OfferPick::Gamble => pick_alternative(&offer.alternatives, &mut rand::thread_rng())
                .cloned()
                .unwrap_or_else(|| offer.guaranteed.clone()),
        };

        if !self
            .store
            .claim_offer_if_pending(offer_id, &reward, self.clock.now())?
        {
            debug!(offer_id, "offer already claimed");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let source = format!("offer {offer_id}");
        let outcome = self
            .distribute(
                &reward,
                subject,
                &offer.context,
                &source,
                offer.contest_id.as_deref(),
            )
            .await?;
        Ok(ClaimOutcome::Claimed { reward, outcome })
    }
}

fn lease_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(SETTLE_LEASE_SECS)
}

/// Weighted draw over `alternatives`. `None` when empty or every weight is 0.
pub fn pick_alternative<'a, R: Rng + ?Sized>(
    alternatives: &'a [WeightedReward],
    rng: &mut R,
) -> Option<&'a Reward> {
    let index = WeightedIndex::new(alternatives.iter().map(|a| a.weight)).ok()?;
    Some(&alternatives[index.sample(rng)].reward)
}
