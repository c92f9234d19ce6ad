use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use vault_core::{Clock, ContextId, Platform, PlatformError, PrivilegeId, Subject, SubjectId};

use super::{log_failure, InFlight, Resolution, SweepStats};
use crate::error::Result;
use crate::store::LifecycleStore;
use crate::timers::{EntityKey, TimerRegistry};
use crate::types::PrivilegeExpiration;

/// Result of [`PrivilegeHandler::grant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted(PrivilegeExpiration),
    /// The subject is not in the context; nothing was persisted.
    Unreachable,
}

/// Grants temporary privileges and revokes them once they expire.
#[derive(Clone)]
pub struct PrivilegeHandler {
    store: LifecycleStore,
    platform: Arc<dyn Platform>,
    timers: TimerRegistry,
    clock: Arc<dyn Clock>,
    in_flight: InFlight,
}

impl PrivilegeHandler {
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

    /// Grant `privilege` to `subject` in `context` until now + `duration`.
    ///
    /// The expiry row is written before the platform call so a crash after
    /// the grant still leaves a row for the revoke. If the grant fails the
    /// row is put back the way it was.
    pub async fn grant(
        &self,
        subject: &SubjectId,
        context: &ContextId,
        privilege: &PrivilegeId,
        duration: Duration,
    ) -> Result<GrantOutcome> {
        let now = self.clock.now();
        let expires_at = now + duration;
        let previous = self.store.privilege(subject, privilege)?;
        let row = self
            .store
            .upsert_privilege(subject, privilege, Some(context), expires_at, now)?;

        let applied = match self.platform.find_subject(subject, context).await {
            Ok(target) => self.platform.grant_privilege(&target, privilege).await,
            Err(e) => Err(e),
        };

        match applied {
            Ok(()) => {
                self.timers
                    .arm(EntityKey::privilege(subject, privilege), expires_at);
                info!(
                    subject = %subject,
                    privilege = %privilege,
                    expires_at = %expires_at,
                    "timed privilege granted"
                );
                Ok(GrantOutcome::Granted(row))
            }
            Err(e) => {
                self.roll_back(previous, subject, privilege, expires_at)?;
                if e.is_not_found() {
                    warn!(subject = %subject, context = %context, "grant target not found");
                    Ok(GrantOutcome::Unreachable)
                } else {
                    warn!(subject = %subject, privilege = %privilege, error = %e, "grant failed");
                    Err(e.into())
                }
            }
        }
    }

    /// Grant `privilege` with no expiry. Any pending timed expiry for the
    /// same privilege is dropped so it cannot revoke the permanent grant.
    /// Returns false when the subject could not be found.
    pub async fn grant_permanent(
        &self,
        subject: &SubjectId,
        context: &ContextId,
        privilege: &PrivilegeId,
    ) -> Result<bool> {
        let target = match self.platform.find_subject(subject, context).await {
            Ok(target) => target,
            Err(e) if e.is_not_found() => {
                warn!(subject = %subject, context = %context, "grant target not found");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        match self.platform.grant_privilege(&target, privilege).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        if let Some(row) = self.store.privilege(subject, privilege)? {
            self.store
                .delete_privilege_if(subject, privilege, row.expires_at)?;
            self.timers.disarm(&EntityKey::privilege(subject, privilege));
        }
        info!(subject = %subject, privilege = %privilege, "privilege granted");
        Ok(true)
    }

    fn roll_back(
        &self,
        previous: Option<PrivilegeExpiration>,
        subject: &SubjectId,
        privilege: &PrivilegeId,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        match previous {
            Some(row) => self.store.restore_privilege(&row),
            None => self
                .store
                .delete_privilege_if(subject, privilege, expires_at)
                .map(|_| ()),
        }
    }

    /// Revoke `privilege` from `subject` if its expiry has passed.
    pub async fn resolve(
        &self,
        subject: &SubjectId,
        privilege: &PrivilegeId,
    ) -> Result<Resolution> {
        let key = EntityKey::privilege(subject, privilege);
        let Some(_guard) = self.in_flight.try_acquire(key.clone()) else {
            return Ok(Resolution::InFlight);
        };

        let Some(row) = self.store.privilege(subject, privilege)? else {
            debug!(key = %key, "privilege already resolved");
            return Ok(Resolution::AlreadyResolved);
        };
        if row.expires_at > self.clock.now() {
            self.timers.arm(key, row.expires_at);
            return Ok(Resolution::NotDue);
        }

        let target = match self.locate(&row).await {
            Ok(Some(target)) => target,
            Ok(None) => return self.clean_up(&row),
            Err(e) => {
                warn!(key = %key, error = %e, "privilege lookup failed, will retry");
                return Ok(Resolution::Deferred);
            }
        };

        match self.platform.revoke_privilege(&target, privilege).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return self.clean_up(&row),
            Err(e) => {
                warn!(key = %key, error = %e, "revoke failed, will retry");
                return Ok(Resolution::Deferred);
            }
        }

        if self
            .store
            .delete_privilege_if(subject, privilege, row.expires_at)?
        {
            info!(subject = %subject, privilege = %privilege, context = %target.context, "privilege revoked");
            return Ok(Resolution::Resolved);
        }

        // The row changed under us: either another resolver already removed
        // it, or a re-grant replaced it and our revoke undid that grant.
        if !self.regranted_since(&row)? {
            debug!(key = %key, "privilege resolved concurrently");
            return Ok(Resolution::AlreadyResolved);
        }
        warn!(key = %key, "privilege re-granted during revoke, restoring");
        if let Err(e) = self.platform.grant_privilege(&target, privilege).await {
            warn!(key = %key, error = %e, "restoring re-granted privilege failed");
        }
        Ok(Resolution::Superseded)
    }

    /// True when a row for the same privilege now carries a later expiry
    /// than `row`, i.e. it was granted again after `row` was read.
    fn regranted_since(&self, row: &PrivilegeExpiration) -> Result<bool> {
        Ok(self
            .store
            .privilege(&row.subject, &row.privilege)?
            .is_some_and(|current| current.expires_at > row.expires_at))
    }

    /// Find the subject in the row's context, or in every known context when
    /// the row does not record one. `Ok(None)` means absent everywhere.
    async fn locate(
        &self,
        row: &PrivilegeExpiration,
    ) -> std::result::Result<Option<Subject>, PlatformError> {
        let contexts = match &row.context {
            Some(context) => vec![context.clone()],
            None => self.platform.contexts().await?,
        };
        for context in &contexts {
            match self.platform.find_subject(&row.subject, context).await {
                Ok(subject) => return Ok(Some(subject)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn clean_up(&self, row: &PrivilegeExpiration) -> Result<Resolution> {
        let removed = self
            .store
            .delete_privilege_if(&row.subject, &row.privilege, row.expires_at)?;
        if removed {
            info!(
                subject = %row.subject,
                privilege = %row.privilege,
                "subject unreachable, privilege expiry dropped"
            );
            Ok(Resolution::Unreachable)
        } else if self.regranted_since(row)? {
            Ok(Resolution::Superseded)
        } else {
            Ok(Resolution::AlreadyResolved)
        }
    }

    /// Resolve every expiry due at `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        for row in self.store.due_privileges(now)? {
            let outcome = self.resolve(&row.subject, &row.privilege).await;
            log_failure(&EntityKey::privilege(&row.subject, &row.privilege), &outcome);
            stats.record(&outcome);
        }
        Ok(stats)
    }

    /// Arm timers for every expiry still in the future.
    pub async fn arm_future(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.store.future_privileges(now)?;
        for row in &rows {
            self.timers
                .arm(EntityKey::privilege(&row.subject, &row.privilege), row.expires_at);
        }
        Ok(rows.len())
    }
}
