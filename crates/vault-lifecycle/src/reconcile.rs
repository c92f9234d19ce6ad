//! Start-up recovery.
//!
//! Resolves everything that fell due while the process was down, then arms
//! timers for everything still in the future. Running it twice is harmless:
//! the second pass finds nothing due and re-arms the same timers.

use std::sync::Arc;

use tracing::{error, info};
use vault_core::Clock;

use crate::contest::ContestEngine;
use crate::handlers::{EffectHandler, PrivilegeHandler, SweepStats};
use crate::heist::HeistService;
use crate::rewards::RewardDistributor;

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub effects: SweepStats,
    pub privileges: SweepStats,
    pub contests: SweepStats,
    /// Awards owed from before the restart, settled in this pass.
    pub awards: SweepStats,
    /// Future resolutions handed to the timer registry.
    pub armed: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    effects: EffectHandler,
    privileges: PrivilegeHandler,
    rewards: RewardDistributor,
    contests: ContestEngine,
    heists: HeistService,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        effects: EffectHandler,
        privileges: PrivilegeHandler,
        rewards: RewardDistributor,
        contests: ContestEngine,
        heists: HeistService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            effects,
            privileges,
            rewards,
            contests,
            heists,
            clock,
        }
    }

    /// Never fails: each step logs its own error and the pass continues.
    pub async fn run(&self) -> ReconcileReport {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();

        match self.effects.sweep(now).await {
            Ok(stats) => report.effects = stats,
            Err(e) => error!(error = %e, "effect reconciliation failed"),
        }
        match self.privileges.sweep(now).await {
            Ok(stats) => report.privileges = stats,
            Err(e) => error!(error = %e, "privilege reconciliation failed"),
        }
        // Overdue contests are drawn now rather than on the next tick.
        match self.contests.sweep(now).await {
            Ok(stats) => report.contests = stats,
            Err(e) => error!(error = %e, "contest reconciliation failed"),
        }
        match self.rewards.settle_due(now).await {
            Ok(stats) => report.awards = stats,
            Err(e) => error!(error = %e, "award reconciliation failed"),
        }

        match self.effects.arm_future(now).await {
            Ok(n) => report.armed += n,
            Err(e) => error!(error = %e, "arming effect timers failed"),
        }
        match self.privileges.arm_future(now).await {
            Ok(n) => report.armed += n,
            Err(e) => error!(error = %e, "arming privilege timers failed"),
        }
        match self.contests.arm_future(now).await {
            Ok(n) => report.armed += n,
            Err(e) => error!(error = %e, "arming contest timers failed"),
        }

        if let Err(e) = self.heists.reconcile(now).await {
            error!(error = %e, "heist reconciliation failed");
        }

        info!(
            effects = report.effects.resolved,
            privileges = report.privileges.resolved,
            contests = report.contests.resolved,
            awards = report.awards.resolved,
            unreachable = report.effects.unreachable + report.privileges.unreachable,
            deferred = report.effects.deferred + report.privileges.deferred,
            armed = report.armed,
            "reconciliation complete"
        );
        report
    }
}
