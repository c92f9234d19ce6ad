//! The timed-secret event ("heist").
//!
//! ```text
//!   create ── before open ──► pending ── open boundary ──► active
//!      └──── inside window ─────────────────────────────────┘ │
//!                                   first correct code ───────┤
//!                                   close boundary ───────────┼──► closed
//!                                   stale (earlier civil day) ┘
//! ```
//!
//! At most one heist may be pending or active. The check runs before
//! creation; a live heist left over from an earlier civil day is force-closed
//! instead of resumed. Boundaries always come from the heist's own creation
//! date, so a re-armed trigger can never point at a different day's window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};
use vault_core::config::HeistConfig;
use vault_core::{Amount, ChannelId, Clock, ContextId, Platform, PrivilegeId, Reward, SubjectId};

use crate::error::{LifecycleError, Result};
use crate::handlers::{InFlight, Resolution};
use crate::notice::Notifier;
use crate::rewards::{RewardDistributor, RewardOutcome};
use crate::schedule::{DailyWindow, WindowPhase};
use crate::store::LifecycleStore;
use crate::timers::{EntityKey, TimerKind, TimerRegistry};
use crate::types::{CloseReason, Heist, HeistStatus};

/// Static parameters of the daily event.
#[derive(Debug, Clone)]
pub struct HeistSettings {
    pub window: DailyWindow,
    pub code_length: usize,
    pub reward: Amount,
    pub privilege: Option<PrivilegeId>,
    pub privilege_duration: Duration,
}

impl HeistSettings {
    pub fn from_config(cfg: &HeistConfig) -> Result<Self> {
        Ok(Self {
            window: DailyWindow::from_config(cfg)?,
            code_length: cfg.code_length,
            reward: cfg.reward()?,
            privilege: cfg.privilege_id.as_deref().map(PrivilegeId::from),
            privilege_duration: Duration::seconds(cfg.privilege_secs),
        })
    }
}

/// Result of [`HeistService::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No pending or active heist in this context.
    NoHeist,
    /// The heist exists but its window has not opened.
    NotOpen,
    Wrong,
    /// `credited` and `privilege` are `None` while that part of the prize
    /// is still queued for retry.
    Won {
        heist_id: String,
        credited: Option<Amount>,
        privilege: Option<RewardOutcome>,
    },
    /// Someone else cracked it first.
    AlreadyCracked,
    /// The closing boundary passed; the heist has been closed.
    WindowClosed,
}

#[derive(Clone)]
pub struct HeistService {
    store: LifecycleStore,
    platform: Arc<dyn Platform>,
    notifier: Notifier,
    rewards: RewardDistributor,
    timers: TimerRegistry,
    clock: Arc<dyn Clock>,
    settings: HeistSettings,
    in_flight: InFlight,
}

impl HeistService {
    pub fn new(
        store: LifecycleStore,
        platform: Arc<dyn Platform>,
        notifier: Notifier,
        rewards: RewardDistributor,
        timers: TimerRegistry,
        clock: Arc<dyn Clock>,
        settings: HeistSettings,
    ) -> Self {
        Self {
            store,
            platform,
            notifier,
            rewards,
            timers,
            clock,
            settings,
            in_flight: InFlight::default(),
        }
    }

    pub fn settings(&self) -> &HeistSettings {
        &self.settings
    }

    pub fn heist(&self, id: &str) -> Result<Heist> {
        self.store.heist(id)?.ok_or_else(|| LifecycleError::NotFound {
            entity: "heist",
            id: id.to_string(),
        })
    }

    pub fn live_heist(&self, context: &ContextId) -> Result<Option<Heist>> {
        self.store.live_heist(context)
    }

    fn is_stale(&self, heist: &Heist, now: DateTime<Utc>) -> bool {
        let window = &self.settings.window;
        window.civil_date(heist.created_at) < window.civil_date(now)
    }

    fn boundaries(&self, heist: &Heist) -> (DateTime<Utc>, DateTime<Utc>) {
        let window = &self.settings.window;
        window.window_on(window.civil_date(heist.created_at))
    }

    /// Create today's heist in `context`, posting in `channel`.
    ///
    /// Pending before the opening boundary, active inside the window, and
    /// refused after the closing boundary.
    pub async fn create(
        &self,
        context: &ContextId,
        channel: &ChannelId,
        payload: &str,
    ) -> Result<Heist> {
        let now = self.clock.now();
        for live in self.store.live_heists()? {
            if self.is_stale(&live, now) {
                warn!(heist_id = %live.id, created_at = %live.created_at, "closing stale heist");
                self.finish(&live, CloseReason::Stale).await?;
            } else {
                return Err(LifecycleError::HeistAlreadyRunning { id: live.id });
            }
        }

        let status = match self.settings.window.phase_at(now) {
            WindowPhase::BeforeOpen => HeistStatus::Pending,
            WindowPhase::Open => HeistStatus::Active,
            WindowPhase::AfterClose => return Err(LifecycleError::HeistWindowClosed),
        };
        let code = generate_code(self.settings.code_length, &mut rand::thread_rng());
        let heist = self
            .store
            .insert_heist(context, channel, &code, payload, status, now)?;
        info!(heist_id = %heist.id, context = %context, status = %status, "heist created");

        self.set_locked(&heist, status == HeistStatus::Pending).await;
        let (open, close) = self.boundaries(&heist);
        let message = match status {
            HeistStatus::Pending => format!(
                "🔒 A vault has been spotted: {payload}\nIt opens at {}. Crack the {}-digit code to win.",
                open.format("%H:%M UTC"),
                self.settings.code_length
            ),
            _ => format!(
                "🔓 The vault is open: {payload}\nCrack the {}-digit code before {}!",
                self.settings.code_length,
                close.format("%H:%M UTC")
            ),
        };
        self.notifier.send(context, channel, &message).await;

        self.arm_triggers(&heist);
        Ok(heist)
    }

    /// Clear every heist timer and arm the remaining boundaries of `heist`.
    pub fn arm_triggers(&self, heist: &Heist) {
        self.timers.clear_kind(TimerKind::Heist);
        let (open, close) = self.boundaries(heist);
        match heist.status {
            HeistStatus::Pending => {
                self.timers.arm(EntityKey::HeistOpen(heist.id.clone()), open);
                self.timers.arm(EntityKey::HeistClose(heist.id.clone()), close);
            }
            HeistStatus::Active => {
                self.timers.arm(EntityKey::HeistClose(heist.id.clone()), close);
            }
            HeistStatus::Closed => {}
        }
    }

    /// Opening trigger: pending → active once the boundary has passed.
    pub async fn open(&self, id: &str) -> Result<Resolution> {
        let key = EntityKey::HeistOpen(id.to_string());
        let Some(_guard) = self.in_flight.try_acquire(key.clone()) else {
            return Ok(Resolution::InFlight);
        };

        let heist = self.heist(id)?;
        if heist.status != HeistStatus::Pending {
            debug!(heist_id = %id, status = %heist.status, "heist already opened");
            return Ok(Resolution::AlreadyResolved);
        }
        let now = self.clock.now();
        if self.is_stale(&heist, now) {
            return self.finish(&heist, CloseReason::Stale).await;
        }
        let (open, close) = self.boundaries(&heist);
        if now >= close {
            return self.finish(&heist, CloseReason::WindowClosed).await;
        }
        if now < open {
            self.timers.arm(key, open);
            return Ok(Resolution::NotDue);
        }

        if !self.store.open_heist_if_pending(id, now)? {
            debug!(heist_id = %id, "heist opened concurrently");
            return Ok(Resolution::AlreadyResolved);
        }
        info!(heist_id = %id, "heist opened");
        self.set_locked(&heist, false).await;
        let message = format!(
            "🔓 The vault is open! Submit the {}-digit code before {}.",
            self.settings.code_length,
            close.format("%H:%M UTC")
        );
        self.notifier
            .send(&heist.context, &heist.channel, &message)
            .await;
        self.timers.arm(EntityKey::HeistClose(heist.id.clone()), close);
        Ok(Resolution::Resolved)
    }

    /// Closing trigger: close a live heist once its boundary has passed.
    pub async fn close(&self, id: &str) -> Result<Resolution> {
        let key = EntityKey::HeistClose(id.to_string());
        let Some(_guard) = self.in_flight.try_acquire(key.clone()) else {
            return Ok(Resolution::InFlight);
        };

        let heist = self.heist(id)?;
        if !heist.status.is_live() {
            debug!(heist_id = %id, "heist already closed");
            return Ok(Resolution::AlreadyResolved);
        }
        let now = self.clock.now();
        if self.is_stale(&heist, now) {
            return self.finish(&heist, CloseReason::Stale).await;
        }
        let (_, close) = self.boundaries(&heist);
        if now < close {
            self.timers.arm(key, close);
            return Ok(Resolution::NotDue);
        }
        self.finish(&heist, CloseReason::WindowClosed).await
    }

    /// Close a live heist immediately.
    pub async fn cancel(&self, id: &str) -> Result<Resolution> {
        let heist = self.heist(id)?;
        self.finish(&heist, CloseReason::Cancelled).await
    }

    /// Conditional close, then lock the channel and reveal the code.
    async fn finish(&self, heist: &Heist, reason: CloseReason) -> Result<Resolution> {
        if !self
            .store
            .close_heist_if_live(&heist.id, reason, self.clock.now())?
        {
            debug!(heist_id = %heist.id, "heist already closed");
            return Ok(Resolution::AlreadyResolved);
        }
        self.timers.disarm(&EntityKey::HeistOpen(heist.id.clone()));
        self.timers.disarm(&EntityKey::HeistClose(heist.id.clone()));
        info!(heist_id = %heist.id, reason = %reason, attempts = heist.attempts, "heist closed");

        self.set_locked(heist, true).await;
        let message = match reason {
            CloseReason::Stale | CloseReason::Cancelled => {
                format!("The vault job was called off. The code was **{}**.", heist.code)
            }
            _ => format!(
                "⏰ Time's up! Nobody cracked the vault. The code was **{}**.",
                heist.code
            ),
        };
        self.notifier
            .send(&heist.context, &heist.channel, &message)
            .await;
        Ok(Resolution::Resolved)
    }

    /// Submit `guess` for the live heist in `context`.
    ///
    /// A pending heist whose opening boundary has passed is opened first.
    /// The first matching submission wins through a conditional write that
    /// also queues the prize, so a failed payout is retried by the award
    /// sweep instead of being lost.
    pub async fn submit(
        &self,
        context: &ContextId,
        subject: &SubjectId,
        guess: &str,
    ) -> Result<SubmitOutcome> {
        let Some(mut heist) = self.store.live_heist(context)? else {
            return Ok(SubmitOutcome::NoHeist);
        };
        let now = self.clock.now();
        if heist.status == HeistStatus::Pending {
            let (open, _) = self.boundaries(&heist);
            if now < open {
                return Ok(SubmitOutcome::NotOpen);
            }
            // The opening trigger has not run yet; open it here.
            self.open(&heist.id).await?;
            heist = self.heist(&heist.id)?;
            match heist.status {
                HeistStatus::Active => {}
                HeistStatus::Pending => return Ok(SubmitOutcome::NotOpen),
                HeistStatus::Closed => return Ok(SubmitOutcome::WindowClosed),
            }
        }
        let (_, close) = self.boundaries(&heist);
        if now >= close || self.is_stale(&heist, now) {
            self.close(&heist.id).await?;
            return Ok(SubmitOutcome::WindowClosed);
        }

        if guess.trim() != heist.code {
            self.store.record_heist_attempt(&heist.id)?;
            return Ok(SubmitOutcome::Wrong);
        }
        let Some(awards) = self
            .store
            .claim_heist_win(&heist, subject, &self.prize(), now)?
        else {
            return Ok(SubmitOutcome::AlreadyCracked);
        };

        self.set_locked(&heist, true).await;
        self.timers.disarm(&EntityKey::HeistClose(heist.id.clone()));
        info!(heist_id = %heist.id, winner = %subject, "heist cracked");

        let mut credited = None;
        let mut privilege = None;
        for award in &awards {
            let outcome = match self.rewards.settle(award).await {
                Ok(settlement) => settlement.outcome().cloned(),
                Err(e) => {
                    error!(heist_id = %heist.id, winner = %subject, error = %e, "heist prize settlement failed");
                    None
                }
            };
            match (&award.reward, outcome) {
                (Reward::Balance { .. }, Some(RewardOutcome::Credited { amount })) => {
                    credited = Some(amount)
                }
                (Reward::TimedPrivilege { .. }, outcome) => privilege = outcome,
                _ => {}
            }
        }

        let message = format!(
            "💰 {subject} cracked the vault with **{}**! The channel is now locked.",
            heist.code
        );
        self.notifier
            .send(&heist.context, &heist.channel, &message)
            .await;

        Ok(SubmitOutcome::Won {
            heist_id: heist.id,
            credited,
            privilege,
        })
    }

    /// What the winner is owed: the balance reward, plus the timed privilege
    /// when one is configured.
    fn prize(&self) -> Vec<Reward> {
        let mut prize = vec![Reward::Balance {
            amount: self.settings.reward.clone(),
        }];
        if let Some(privilege) = &self.settings.privilege {
            prize.push(Reward::TimedPrivilege {
                privilege: privilege.clone(),
                duration_secs: self.settings.privilege_duration.num_seconds(),
            });
        }
        prize
    }

    /// Bring every live heist in line with the wall clock: close stale or
    /// overdue ones, open pending ones whose boundary passed, and re-arm
    /// triggers for the rest. Used on start and by the poll sweep.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<()> {
        for heist in self.store.live_heists()? {
            let (open, close) = self.boundaries(&heist);
            let outcome = if self.is_stale(&heist, now) {
                warn!(heist_id = %heist.id, "stale heist found");
                self.finish(&heist, CloseReason::Stale).await
            } else if now >= close {
                self.finish(&heist, CloseReason::WindowClosed).await
            } else if heist.status == HeistStatus::Pending && now >= open {
                self.open(&heist.id).await
            } else {
                self.arm_triggers(&heist);
                Ok(Resolution::NotDue)
            };
            if let Err(e) = outcome {
                error!(heist_id = %heist.id, error = %e, "heist reconciliation failed");
            }
        }
        Ok(())
    }

    async fn set_locked(&self, heist: &Heist, locked: bool) {
        if let Err(e) = self
            .platform
            .set_channel_locked(&heist.context, &heist.channel, locked)
            .await
        {
            warn!(heist_id = %heist.id, locked, error = %e, "channel lock change failed");
        }
    }
}

/// Uniformly random digit string of `len` characters.
pub fn generate_code<R: Rng + ?Sized>(len: usize, rng: &mut R) -> String {
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
