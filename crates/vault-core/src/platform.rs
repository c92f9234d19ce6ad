//! Capability interface implemented by the surrounding chat platform.
//!
//! The lifecycle engine never talks to the platform directly; it only sees
//! this trait, which keeps the engine testable with a recording mock and lets
//! the Discord adapter live in its own crate.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChannelId, ContextId, NoticeRef, PrivilegeId, SubjectId};

/// Outcome taxonomy for every capability call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Subject, context or channel is unreachable. Terminal: never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limiting, timeouts, upstream outages. Retried by the next poll sweep.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

/// A subject confirmed present in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: SubjectId,
    pub context: ContextId,
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Every context the platform currently knows about. Used when a record
    /// does not carry its originating context.
    async fn contexts(&self) -> Result<Vec<ContextId>, PlatformError>;

    async fn find_subject(
        &self,
        subject: &SubjectId,
        context: &ContextId,
    ) -> Result<Subject, PlatformError>;

    async fn grant_privilege(
        &self,
        subject: &Subject,
        privilege: &PrivilegeId,
    ) -> Result<(), PlatformError>;

    async fn revoke_privilege(
        &self,
        subject: &Subject,
        privilege: &PrivilegeId,
    ) -> Result<(), PlatformError>;

    /// Set the subject's display name, or restore the platform default when
    /// `value` is `None`.
    async fn override_display_name(
        &self,
        subject: &Subject,
        value: Option<&str>,
    ) -> Result<(), PlatformError>;

    /// Best-effort notice. Returns a handle when the platform supports editing.
    async fn deliver_notice(
        &self,
        context: &ContextId,
        channel: &ChannelId,
        message: &str,
    ) -> Result<Option<NoticeRef>, PlatformError>;

    async fn edit_notice(&self, notice: &NoticeRef, message: &str) -> Result<(), PlatformError>;

    /// Lock a channel to output-only (`true`) or reopen it for posting.
    async fn set_channel_locked(
        &self,
        context: &ContextId,
        channel: &ChannelId,
        locked: bool,
    ) -> Result<(), PlatformError>;
}
