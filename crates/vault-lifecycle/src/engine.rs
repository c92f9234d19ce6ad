use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vault_core::config::SchedulerConfig;
use vault_core::{Clock, Platform};
use vault_ledger::Ledger;

use crate::contest::ContestEngine;
use crate::error::Result;
use crate::handlers::{EffectHandler, PrivilegeHandler, Resolution, SweepStats};
use crate::heist::{HeistService, HeistSettings};
use crate::notice::{NoticeSnapshot, NoticeStats, Notifier};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::rewards::RewardDistributor;
use crate::store::LifecycleStore;
use crate::timers::{EntityKey, Fired, TimerRegistry};

/// Shared handle to every lifecycle component. Cheap to clone; hand it to
/// whatever creates entities while the [`LifecycleRunner`] drives resolution.
#[derive(Clone)]
pub struct LifecycleEngine {
    store: LifecycleStore,
    ledger: Ledger,
    effects: EffectHandler,
    privileges: PrivilegeHandler,
    rewards: RewardDistributor,
    contests: ContestEngine,
    heists: HeistService,
    reconciler: Reconciler,
    timers: TimerRegistry,
    notice_stats: Arc<NoticeStats>,
    clock: Arc<dyn Clock>,
}

impl LifecycleEngine {
    /// Wire the components together. The returned runner owns the receiving
    /// end of the timer channel and must be driven with [`LifecycleRunner::run`].
    pub fn new(
        store: LifecycleStore,
        ledger: Ledger,
        platform: Arc<dyn Platform>,
        clock: Arc<dyn Clock>,
        scheduler: SchedulerConfig,
        heist: HeistSettings,
    ) -> (Self, LifecycleRunner) {
        let (timers, fired_rx) = TimerRegistry::new(clock.clone());
        let notice_stats = Arc::new(NoticeStats::default());
        let notifier = Notifier::new(platform.clone(), notice_stats.clone());

        let effects = EffectHandler::new(
            store.clone(),
            platform.clone(),
            timers.clone(),
            clock.clone(),
        );
        let privileges = PrivilegeHandler::new(
            store.clone(),
            platform.clone(),
            timers.clone(),
            clock.clone(),
        );
        let rewards = RewardDistributor::new(
            ledger.clone(),
            store.clone(),
            privileges.clone(),
            effects.clone(),
            clock.clone(),
        );
        let contests = ContestEngine::new(
            store.clone(),
            rewards.clone(),
            notifier.clone(),
            timers.clone(),
            clock.clone(),
        );
        let heists = HeistService::new(
            store.clone(),
            platform,
            notifier,
            rewards.clone(),
            timers.clone(),
            clock.clone(),
            heist,
        );
        let reconciler = Reconciler::new(
            effects.clone(),
            privileges.clone(),
            rewards.clone(),
            contests.clone(),
            heists.clone(),
            clock.clone(),
        );

        let engine = Self {
            store,
            ledger,
            effects,
            privileges,
            rewards,
            contests,
            heists,
            reconciler,
            timers,
            notice_stats,
            clock,
        };
        let runner = LifecycleRunner {
            engine: engine.clone(),
            fired_rx,
            scheduler,
        };
        (engine, runner)
    }

    pub fn store(&self) -> &LifecycleStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn effects(&self) -> &EffectHandler {
        &self.effects
    }

    pub fn privileges(&self) -> &PrivilegeHandler {
        &self.privileges
    }

    pub fn rewards(&self) -> &RewardDistributor {
        &self.rewards
    }

    pub fn contests(&self) -> &ContestEngine {
        &self.contests
    }

    pub fn heists(&self) -> &HeistService {
        &self.heists
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn notice_stats(&self) -> NoticeSnapshot {
        self.notice_stats.snapshot()
    }

    /// Resolve everything overdue and arm timers for the rest.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciler.run().await
    }

    pub async fn sweep_effects(&self) -> Result<SweepStats> {
        self.effects.sweep(self.clock.now()).await
    }

    pub async fn sweep_privileges(&self) -> Result<SweepStats> {
        self.privileges.sweep(self.clock.now()).await
    }

    pub async fn sweep_contests(&self) -> Result<SweepStats> {
        self.contests.sweep(self.clock.now()).await
    }

    /// Settle awards left owed by earlier contest draws and heist wins.
    pub async fn sweep_awards(&self) -> Result<SweepStats> {
        self.rewards.settle_due(self.clock.now()).await
    }

    pub async fn sweep_heists(&self) -> Result<()> {
        self.heists.reconcile(self.clock.now()).await
    }

    /// Resolve the entity a timer fired for.
    pub async fn dispatch(&self, key: &EntityKey) -> Result<Resolution> {
        match key {
            EntityKey::Effect(id) => self.effects.resolve(id).await,
            EntityKey::Privilege { subject, privilege } => {
                self.privileges.resolve(subject, privilege).await
            }
            EntityKey::Contest(id) => self.contests.resolve(id).await,
            EntityKey::HeistOpen(id) => self.heists.open(id).await,
            EntityKey::HeistClose(id) => self.heists.close(id).await,
        }
    }
}

/// Drives timer dispatch and the periodic poll sweeps.
pub struct LifecycleRunner {
    engine: LifecycleEngine,
    fired_rx: mpsc::UnboundedReceiver<Fired>,
    scheduler: SchedulerConfig,
}

impl LifecycleRunner {
    /// Reconcile, then loop until `shutdown` broadcasts `true`.
    ///
    /// Nothing inside the loop can end it early: every resolution and sweep
    /// error is logged and the loop carries on.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("lifecycle engine started");
        self.engine.reconcile().await;

        let mut effects = ticker(self.scheduler.effect_poll_secs);
        let mut privileges = ticker(self.scheduler.privilege_poll_secs);
        let mut contests = ticker(self.scheduler.contest_poll_secs);
        let mut heists = ticker(self.scheduler.heist_poll_secs);
        let mut failed_notices = self.engine.notice_stats().failed;

        loop {
            tokio::select! {
                Some(fired) = self.fired_rx.recv() => {
                    if self.engine.timers.take_if_current(&fired) {
                        let outcome = self.engine.dispatch(&fired.key).await;
                        log_dispatch(&fired.key, &outcome);
                    }
                }
                _ = effects.tick() => {
                    log_sweep("effects", self.engine.sweep_effects().await);
                }
                _ = privileges.tick() => {
                    log_sweep("privileges", self.engine.sweep_privileges().await);
                }
                _ = contests.tick() => {
                    log_sweep("contests", self.engine.sweep_contests().await);
                    log_sweep("awards", self.engine.sweep_awards().await);
                }
                _ = heists.tick() => {
                    if let Err(e) = self.engine.sweep_heists().await {
                        error!(error = %e, "heist sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("lifecycle engine shutting down");
                        break;
                    }
                }
            }

            let failed = self.engine.notice_stats().failed;
            if failed > failed_notices {
                warn!(
                    new = failed - failed_notices,
                    total = failed,
                    "notices failed to deliver"
                );
                failed_notices = failed;
            }
        }
    }
}

fn ticker(secs: u64) -> Interval {
    let period = StdDuration::from_secs(secs.max(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn log_dispatch(key: &EntityKey, outcome: &Result<Resolution>) {
    match outcome {
        Ok(resolution) => debug!(key = %key, ?resolution, "timer dispatched"),
        Err(e) => error!(key = %key, error = %e, "timer resolution failed"),
    }
}

fn log_sweep(kind: &'static str, outcome: Result<SweepStats>) {
    match outcome {
        Ok(stats) if stats.is_empty() => {}
        Ok(stats) => info!(
            kind,
            resolved = stats.resolved,
            unreachable = stats.unreachable,
            deferred = stats.deferred,
            skipped = stats.skipped,
            failed = stats.failed,
            "sweep complete"
        ),
        Err(e) => error!(kind, error = %e, "sweep failed"),
    }
}
