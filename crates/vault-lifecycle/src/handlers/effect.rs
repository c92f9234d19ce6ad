use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vault_core::amount::{apply_basis_points, Amount};
use vault_core::{Clock, Platform, PlatformError, PrivilegeId, SubjectId};

use super::{log_failure, InFlight, Resolution, SweepStats};
use crate::error::{LifecycleError, Result};
use crate::store::LifecycleStore;
use crate::timers::{EntityKey, TimerRegistry};
use crate::types::{EffectKind, NewEffect, ScheduledEffect};

/// Starts time-bounded effects and undoes them at expiry.
#[derive(Clone)]
pub struct EffectHandler {
    store: LifecycleStore,
    platform: Arc<dyn Platform>,
    timers: TimerRegistry,
    clock: Arc<dyn Clock>,
    in_flight: InFlight,
}

impl EffectHandler {
    pub fn new(
        store: LifecycleStore,
        platform: Arc<dyn Platform>,
        timers: TimerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            platform,
            timers,
            clock,
            in_flight: InFlight::default(),
        }
    }

    /// Persist `new` and apply its initial side effect.
    ///
    /// If the platform rejects the side effect the row is deactivated
    /// immediately and the error returned to the caller.
    pub async fn start(&self, new: NewEffect) -> Result<ScheduledEffect> {
        if new.kind == EffectKind::NumericBoost && new.payload.parse::<u32>().is_err() {
            return Err(LifecycleError::InvalidInput(format!(
                "boost payload must be basis points, got {:?}",
                new.payload
            )));
        }
        let now = self.clock.now();
        let effect = self.store.insert_effect(&new, now)?;

        if let Err(e) = self.apply(&effect).await {
            self.store.deactivate_effect(&effect.id, now)?;
            warn!(effect_id = %effect.id, kind = %effect.kind, error = %e, "effect could not be applied");
            return Err(e.into());
        }

        if let Some(expires_at) = effect.expires_at {
            self.timers.arm(EntityKey::Effect(effect.id.clone()), expires_at);
        }
        info!(
            effect_id = %effect.id,
            subject = %effect.subject,
            kind = %effect.kind,
            expires_at = ?effect.expires_at,
            "effect started"
        );
        Ok(effect)
    }

    async fn apply(&self, effect: &ScheduledEffect) -> std::result::Result<(), PlatformError> {
        match effect.kind {
            EffectKind::PrivilegeGrant => {
                let target = self
                    .platform
                    .find_subject(&effect.subject, &effect.context)
                    .await?;
                self.platform
                    .grant_privilege(&target, &PrivilegeId::from(effect.payload.as_str()))
                    .await
            }
            EffectKind::NicknameOverride => {
                let target = self
                    .platform
                    .find_subject(&effect.subject, &effect.context)
                    .await?;
                self.platform
                    .override_display_name(&target, Some(effect.payload.as_str()))
                    .await
            }
            EffectKind::NumericBoost | EffectKind::OneShotFlag => Ok(()),
        }
    }

    async fn undo(&self, effect: &ScheduledEffect) -> std::result::Result<(), PlatformError> {
        match effect.kind {
            EffectKind::PrivilegeGrant => {
                let target = self
                    .platform
                    .find_subject(&effect.subject, &effect.context)
                    .await?;
                self.platform
                    .revoke_privilege(&target, &PrivilegeId::from(effect.payload.as_str()))
                    .await
            }
            EffectKind::NicknameOverride => {
                let target = self
                    .platform
                    .find_subject(&effect.subject, &effect.context)
                    .await?;
                self.platform
                    .override_display_name(&target, effect.restore.as_deref())
                    .await
            }
            EffectKind::NumericBoost | EffectKind::OneShotFlag => Ok(()),
        }
    }

    /// Undo effect `id` if it has expired, then deactivate it.
    pub async fn resolve(&self, id: &str) -> Result<Resolution> {
        let key = EntityKey::Effect(id.to_string());
        let Some(_guard) = self.in_flight.try_acquire(key.clone()) else {
            return Ok(Resolution::InFlight);
        };

        let effect = match self.store.effect(id)? {
            Some(effect) if effect.active => effect,
            _ => {
                debug!(effect_id = %id, "effect already resolved");
                return Ok(Resolution::AlreadyResolved);
            }
        };
        let Some(expires_at) = effect.expires_at else {
            // One-shot: consumed by callers, never expired here.
            return Ok(Resolution::NotDue);
        };
        if expires_at > self.clock.now() {
            self.timers.arm(key, expires_at);
            return Ok(Resolution::NotDue);
        }

        let resolution = match self.undo(&effect).await {
            Ok(()) => Resolution::Resolved,
            Err(e) if e.is_not_found() => {
                info!(effect_id = %id, subject = %effect.subject, "effect subject unreachable");
                Resolution::Unreachable
            }
            Err(e) => {
                warn!(effect_id = %id, error = %e, "effect undo failed, will retry");
                return Ok(Resolution::Deferred);
            }
        };

        if !self.store.deactivate_effect(id, self.clock.now())? {
            debug!(effect_id = %id, "effect deactivated concurrently");
            return Ok(Resolution::AlreadyResolved);
        }
        if resolution == Resolution::Resolved {
            info!(effect_id = %id, subject = %effect.subject, kind = %effect.kind, "effect expired");
        }
        Ok(resolution)
    }

    /// Resolve every effect due at `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        for effect in self.store.due_effects(now)? {
            let outcome = self.resolve(&effect.id).await;
            log_failure(&EntityKey::Effect(effect.id), &outcome);
            stats.record(&outcome);
        }
        Ok(stats)
    }

    pub async fn arm_future(&self, now: DateTime<Utc>) -> Result<usize> {
        let effects = self.store.future_effects(now)?;
        for effect in &effects {
            if let Some(expires_at) = effect.expires_at {
                self.timers.arm(EntityKey::Effect(effect.id.clone()), expires_at);
            }
        }
        Ok(effects.len())
    }

    /// Consume one active one-shot `flag` held by `subject`.
    pub fn consume_flag(&self, subject: &SubjectId, flag: &str) -> Result<bool> {
        let consumed = self.store.consume_flag(subject, flag, self.clock.now())?;
        if consumed {
            debug!(subject = %subject, flag, "flag consumed");
        }
        Ok(consumed)
    }

    /// Basis points of the subject's active boost, if any.
    pub fn active_boost(&self, subject: &SubjectId) -> Result<Option<u32>> {
        let Some(effect) =
            self.store
                .active_effect(subject, EffectKind::NumericBoost, self.clock.now())?
        else {
            return Ok(None);
        };
        effect
            .payload
            .parse::<u32>()
            .map(Some)
            .map_err(|_| LifecycleError::Corrupt {
                entity: "scheduled_effect",
                id: effect.id,
                reason: format!("bad boost payload {:?}", effect.payload),
            })
    }

    /// Scale `amount` by the subject's active boost.
    pub fn apply_boost(&self, subject: &SubjectId, amount: &Amount) -> Result<Amount> {
        Ok(match self.active_boost(subject)? {
            Some(bp) => apply_basis_points(amount, bp),
            None => amount.clone(),
        })
    }
}
