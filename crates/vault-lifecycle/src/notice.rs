//! Best-effort notices.
//!
//! Delivery failures are logged and counted, never retried: a notice that
//! did not arrive is not worth delaying a resolution for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;
use vault_core::{ChannelId, ContextId, NoticeRef, Platform};

/// Running totals of notice deliveries and edits.
#[derive(Debug, Default)]
pub struct NoticeStats {
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoticeSnapshot {
    pub delivered: u64,
    pub failed: u64,
}

impl NoticeStats {
    pub fn snapshot(&self) -> NoticeSnapshot {
        NoticeSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    platform: Arc<dyn Platform>,
    stats: Arc<NoticeStats>,
}

impl Notifier {
    pub fn new(platform: Arc<dyn Platform>, stats: Arc<NoticeStats>) -> Self {
        Self { platform, stats }
    }

    pub fn stats(&self) -> &Arc<NoticeStats> {
        &self.stats
    }

    pub async fn send(
        &self,
        context: &ContextId,
        channel: &ChannelId,
        message: &str,
    ) -> Option<NoticeRef> {
        match self.platform.deliver_notice(context, channel, message).await {
            Ok(notice) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                notice
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(context = %context, channel = %channel, error = %e, "notice not delivered");
                None
            }
        }
    }

    pub async fn edit(&self, notice: &NoticeRef, message: &str) -> bool {
        match self.platform.edit_notice(notice, message).await {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(notice = %notice, error = %e, "notice edit failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPlatform;

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let platform = Arc::new(MockPlatform::new());
        let notifier = Notifier::new(platform.clone(), Arc::default());
        let (context, channel) = (ContextId::from("g1"), ChannelId::from("c1"));

        let sent = notifier.send(&context, &channel, "hello").await;
        assert!(sent.is_some());

        platform.fail_notices(true);
        assert!(notifier.send(&context, &channel, "again").await.is_none());
        assert!(!notifier.edit(&sent.unwrap(), "edited").await);

        let snapshot = notifier.stats().snapshot();
        assert_eq!(snapshot, NoticeSnapshot { delivered: 1, failed: 2 });
    }
}
