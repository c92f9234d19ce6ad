//! Recording [`Platform`] double for tests.
//!
//! Every capability call is appended to a log. Subjects can be marked missing
//! (answer `NotFound`) or flaky (answer `Transient`) globally or per context.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use vault_core::{
    ChannelId, ContextId, NoticeRef, Platform, PlatformError, PrivilegeId, Subject, SubjectId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FindSubject {
        subject: SubjectId,
        context: ContextId,
    },
    Grant {
        subject: SubjectId,
        context: ContextId,
        privilege: PrivilegeId,
    },
    Revoke {
        subject: SubjectId,
        context: ContextId,
        privilege: PrivilegeId,
    },
    DisplayName {
        subject: SubjectId,
        value: Option<String>,
    },
    Notice {
        context: ContextId,
        channel: ChannelId,
        message: String,
    },
    EditNotice {
        notice: NoticeRef,
        message: String,
    },
    ChannelLock {
        context: ContextId,
        channel: ChannelId,
        locked: bool,
    },
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    contexts: Vec<ContextId>,
    missing: HashSet<SubjectId>,
    missing_in: HashSet<(SubjectId, ContextId)>,
    transient: HashSet<SubjectId>,
    notices_fail: bool,
    next_notice: u64,
    locks: HashMap<ChannelId, bool>,
}

#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<State>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that reports `contexts` from [`Platform::contexts`].
    pub fn with_contexts(contexts: &[&str]) -> Self {
        let mock = Self::default();
        mock.lock().contexts = contexts.iter().map(|c| ContextId::from(*c)).collect();
        mock
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `subject` is found in no context.
    pub fn mark_missing(&self, subject: &str) {
        self.lock().missing.insert(SubjectId::from(subject));
    }

    /// `subject` is absent from `context` only.
    pub fn mark_missing_in(&self, subject: &str, context: &str) {
        self.lock()
            .missing_in
            .insert((SubjectId::from(subject), ContextId::from(context)));
    }

    /// Every call touching `subject` fails transiently until cleared.
    pub fn mark_transient(&self, subject: &str) {
        self.lock().transient.insert(SubjectId::from(subject));
    }

    pub fn clear_transient(&self, subject: &str) {
        self.lock().transient.remove(&SubjectId::from(subject));
    }

    pub fn fail_notices(&self, fail: bool) {
        self.lock().notices_fail = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn grants_for(&self, subject: &str) -> usize {
        self.count(|c| matches!(c, Call::Grant { subject: s, .. } if s.as_str() == subject))
    }

    pub fn revokes_for(&self, subject: &str) -> usize {
        self.count(|c| matches!(c, Call::Revoke { subject: s, .. } if s.as_str() == subject))
    }

    pub fn display_names_for(&self, subject: &str) -> Vec<Option<String>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::DisplayName { subject: s, value } if s.as_str() == subject => {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Notice { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<(NoticeRef, String)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::EditNotice { notice, message } => Some((notice.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Last lock state set for `channel`, if any.
    pub fn is_locked(&self, channel: &str) -> Option<bool> {
        self.lock().locks.get(&ChannelId::from(channel)).copied()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn check(state: &State, subject: &SubjectId, context: &ContextId) -> Result<(), PlatformError> {
        if state.transient.contains(subject) {
            return Err(PlatformError::Transient(format!("{subject} rate limited")));
        }
        if state.missing.contains(subject)
            || state.missing_in.contains(&(subject.clone(), context.clone()))
        {
            return Err(PlatformError::NotFound(format!("{subject} in {context}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn contexts(&self) -> Result<Vec<ContextId>, PlatformError> {
        Ok(self.lock().contexts.clone())
    }

    async fn find_subject(
        &self,
        subject: &SubjectId,
        context: &ContextId,
    ) -> Result<Subject, PlatformError> {
        let mut state = self.lock();
        state.calls.push(Call::FindSubject {
            subject: subject.clone(),
            context: context.clone(),
        });
        Self::check(&state, subject, context)?;
        Ok(Subject {
            id: subject.clone(),
            context: context.clone(),
        })
    }

    async fn grant_privilege(
        &self,
        subject: &Subject,
        privilege: &PrivilegeId,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check(&state, &subject.id, &subject.context)?;
        state.calls.push(Call::Grant {
            subject: subject.id.clone(),
            context: subject.context.clone(),
            privilege: privilege.clone(),
        });
        Ok(())
    }

    async fn revoke_privilege(
        &self,
        subject: &Subject,
        privilege: &PrivilegeId,
    ) -> Result<(), PlatformError> {
        // Suspend once so concurrent resolvers interleave around the call.
        tokio::task::yield_now().await;
        let mut state = self.lock();
        Self::check(&state, &subject.id, &subject.context)?;
        state.calls.push(Call::Revoke {
            subject: subject.id.clone(),
            context: subject.context.clone(),
            privilege: privilege.clone(),
        });
        Ok(())
    }

    async fn override_display_name(
        &self,
        subject: &Subject,
        value: Option<&str>,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check(&state, &subject.id, &subject.context)?;
        state.calls.push(Call::DisplayName {
            subject: subject.id.clone(),
            value: value.map(String::from),
        });
        Ok(())
    }

    async fn deliver_notice(
        &self,
        context: &ContextId,
        channel: &ChannelId,
        message: &str,
    ) -> Result<Option<NoticeRef>, PlatformError> {
        let mut state = self.lock();
        if state.notices_fail {
            return Err(PlatformError::Transient("notice delivery down".into()));
        }
        state.calls.push(Call::Notice {
            context: context.clone(),
            channel: channel.clone(),
            message: message.to_string(),
        });
        state.next_notice += 1;
        Ok(Some(NoticeRef {
            channel: channel.clone(),
            message_id: state.next_notice.to_string(),
        }))
    }

    async fn edit_notice(&self, notice: &NoticeRef, message: &str) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if state.notices_fail {
            return Err(PlatformError::Transient("notice delivery down".into()));
        }
        state.calls.push(Call::EditNotice {
            notice: notice.clone(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn set_channel_locked(
        &self,
        context: &ContextId,
        channel: &ChannelId,
        locked: bool,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        state.calls.push(Call::ChannelLock {
            context: context.clone(),
            channel: channel.clone(),
            locked,
        });
        state.locks.insert(channel.clone(), locked);
        Ok(())
    }
}
