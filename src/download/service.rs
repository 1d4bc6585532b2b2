//! Shared state handle for the two inbound paths: link messages and choice taps.

use super::correlation::{CorrelationStore, NewRequest};
use super::ledger::{UsageLedger, UsageRecord};
use super::notifier::{Button, Markup, Notifier};
use super::platform::{classify, extract_links};
use super::queue::{JobQueue, QueueError};
use super::quota::{Denial, QuotaGate};
use super::{ChatRef, Job, MediaKind, MessageRef, Platform, PresentationMode, UserId};
use crate::utils::{escape_html, truncate_str};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// User-facing replies of the inbound paths
pub mod replies {
    /// Message had no `http(s)://` link
    pub const NO_LINK: &str = "❌ <b>No valid link found</b>";
    /// Choice accepted and queued
    pub const STARTING: &str = "⏳ <b>Starting download...</b>";
    /// Queue at capacity
    pub const QUEUE_FULL: &str = "⚠️ <b>Queue is full, try again later</b>";
    /// Key unknown or expired
    pub const EXPIRED: &str = "❌ <b>Link expired!</b> Send again.";
}

/// Outcome of an inbound text message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextOutcome {
    /// No link in the text
    NoLinks,
    /// The sender is inside the cooldown window
    CoolingDown,
    /// Links were processed; contains the keys of the offered choices
    Offered(Vec<String>),
}

/// Outcome of a choice tap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Callback data was not a download choice
    Ignored,
    /// Key unknown or expired
    Expired,
    /// Job was queued
    Queued,
    /// Queue rejected the job
    QueueFull,
}

/// Runtime counters for `/stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    /// Jobs waiting in the queue
    pub queue_depth: usize,
    /// Queue capacity
    pub queue_capacity: usize,
    /// Pending link choices
    pub pending: usize,
    /// Users with a usage record
    pub users: usize,
}

/// A user's usage and today's quota counters
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Cumulative usage
    pub usage: Option<UsageRecord>,
    /// Admissions today per rate-limited platform
    pub quota: Vec<(Platform, u32)>,
    /// Configured daily limit
    pub daily_limit: u32,
}

/// Callback data for a choice button
#[must_use]
pub fn action_data(kind: MediaKind, key: &str) -> String {
    format!("{}:{key}", kind.action_tag())
}

/// Parses `v:<key>` / `a:<key>`
#[must_use]
pub fn parse_action(data: &str) -> Option<(MediaKind, &str)> {
    let (tag, key) = data.split_once(':')?;
    let mut chars = tag.chars();
    let kind = MediaKind::from_action_tag(chars.next()?)?;
    if chars.next().is_some() || key.is_empty() {
        return None;
    }
    Some((kind, key))
}

/// Video/audio keyboard for a pending key
#[must_use]
pub fn choice_markup(key: &str) -> Markup {
    Markup::row(vec![
        Button::new("🎬 Video", action_data(MediaKind::Video, key)),
        Button::new("🎵 Audio", action_data(MediaKind::Audio, key)),
    ])
}

fn denial_text(denial: &Denial) -> String {
    match denial {
        Denial::Cooldown { remaining } => format!(
            "⏳ <b>Slow down!</b> Wait {}s before the next request.",
            remaining.as_secs().max(1)
        ),
        Denial::DailyLimit { platform, limit } => format!(
            "🚫 <b>Daily limit reached</b>\nYou can download {limit} {} posts per day. Try again tomorrow.",
            platform.display_name()
        ),
    }
}

/// Admission and dispatch over the shared stores
pub struct DownloadService {
    correlations: Arc<CorrelationStore>,
    gate: Arc<QuotaGate>,
    queue: JobQueue,
    ledger: Arc<UsageLedger>,
    notifier: Arc<dyn Notifier>,
}

impl DownloadService {
    /// Creates the service over shared stores
    #[must_use]
    pub fn new(
        correlations: Arc<CorrelationStore>,
        gate: Arc<QuotaGate>,
        queue: JobQueue,
        ledger: Arc<UsageLedger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            correlations,
            gate,
            queue,
            ledger,
            notifier,
        }
    }

    /// Handles a text message: detects links, admits them, and offers choices
    pub async fn handle_text(
        &self,
        chat: ChatRef,
        user_id: UserId,
        text: &str,
        message: MessageRef,
        now: DateTime<Utc>,
    ) -> TextOutcome {
        if text.trim().is_empty() {
            self.reply(chat, replies::NO_LINK, Some(message)).await;
            return TextOutcome::NoLinks;
        }

        // Any non-empty message counts as a request, links or not
        if let Err(denial) = self.gate.touch_cooldown(user_id, now).await {
            debug!(user_id, %denial, "Message rejected by cooldown");
            self.reply(chat, &denial_text(&denial), Some(message)).await;
            return TextOutcome::CoolingDown;
        }

        let links = extract_links(text);
        if links.is_empty() {
            self.reply(chat, replies::NO_LINK, Some(message)).await;
            return TextOutcome::NoLinks;
        }

        let presentation = if links.len() == 1 {
            PresentationMode::Single
        } else {
            PresentationMode::Batch
        };
        let total = links.len();

        let mut keys = Vec::with_capacity(total);
        for (index, url) in links.into_iter().enumerate() {
            let Some(platform) = classify(&url) else {
                let text = format!(
                    "❌ <b>Unsupported link</b>\n<code>{}</code>",
                    escape_html(&truncate_str(&url, 200))
                );
                self.reply(chat, &text, Some(message)).await;
                continue;
            };

            if let Err(denial) = self.gate.admit_platform(user_id, platform, now).await {
                info!(user_id, %platform, %denial, "Link rejected by quota");
                self.reply(chat, &denial_text(&denial), Some(message)).await;
                continue;
            }

            let request = NewRequest {
                source_url: url,
                platform,
                chat,
                user_id,
                origin_message: Some(message),
                presentation,
            };
            if let Some(key) = self.offer(request, index, total, now).await {
                keys.push(key);
            }
        }
        TextOutcome::Offered(keys)
    }

    async fn offer(
        &self,
        request: NewRequest,
        index: usize,
        total: usize,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let chat = request.chat;
        let origin = request.origin_message;
        let presentation = request.presentation;
        let text = match presentation {
            PresentationMode::Single => format!(
                "🔗 <b>{} link detected</b>\nChoose format:",
                request.platform.display_name()
            ),
            PresentationMode::Batch => format!(
                "🔗 <b>{} link {}/{total}</b>\nChoose format:",
                request.platform.display_name(),
                index + 1
            ),
        };

        let key = self.correlations.issue(request, now).await;
        let reply_to = match presentation {
            PresentationMode::Single => None,
            PresentationMode::Batch => origin,
        };

        match self
            .notifier
            .send_message(chat, &text, Some(choice_markup(&key)), reply_to)
            .await
        {
            Ok(status) => {
                self.correlations.attach_status(&key, status).await;
                debug!(key = %key, ?presentation, "Choice offered");
                Some(key)
            }
            Err(e) => {
                warn!(chat = %chat, error = %e, "Failed to offer choice");
                self.correlations.remove(&key).await;
                None
            }
        }
    }

    /// Handles a choice tap on `message` carrying `data`
    pub async fn handle_action(
        &self,
        chat: ChatRef,
        user_id: UserId,
        data: &str,
        message: MessageRef,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        let Some((media_kind, key)) = parse_action(data) else {
            return ActionOutcome::Ignored;
        };

        let Some(pending) = self.correlations.peek(key, now).await else {
            debug!(key, "Tap on expired key");
            // The tapped message may already show another job's final status
            self.reply(chat, replies::EXPIRED, Some(message)).await;
            return ActionOutcome::Expired;
        };

        let status_message = self.set_status(chat, message, replies::STARTING).await;

        let job = Job {
            chat,
            source_url: pending.source_url,
            platform: pending.platform,
            status_message,
            user_id,
            media_kind,
            origin_message: pending.origin_message,
            correlation_key: pending.key,
        };

        match self.queue.enqueue(job) {
            Ok(()) => {
                info!(user_id, key, kind = ?media_kind, depth = self.queue.len(), "Job queued");
                ActionOutcome::Queued
            }
            Err(QueueError::Full(job) | QueueError::Closed(job)) => {
                warn!(user_id, key = %job.correlation_key, "Queue rejected job");
                self.set_status(chat, job.status_message, replies::QUEUE_FULL)
                    .await;
                ActionOutcome::QueueFull
            }
        }
    }

    /// Current runtime counters
    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            pending: self.correlations.len().await,
            users: self.ledger.user_count().await,
        }
    }

    /// Usage and today's counters of one user
    pub async fn profile(&self, user_id: UserId, now: DateTime<Utc>) -> Profile {
        let mut quota = Vec::new();
        for platform in Platform::ALL {
            if self.gate.is_rate_limited(platform) {
                quota.push((platform, self.gate.count_for(user_id, platform, now).await));
            }
        }
        Profile {
            usage: self.ledger.get(user_id).await,
            quota,
            daily_limit: self.gate.daily_limit(),
        }
    }

    async fn reply(&self, chat: ChatRef, text: &str, reply_to: Option<MessageRef>) {
        if let Err(e) = self.notifier.send_message(chat, text, None, reply_to).await {
            warn!(chat = %chat, error = %e, "Failed to send reply");
        }
    }

    /// Rewrites `message`; sends a fresh message when that fails. Returns the message now showing `text`.
    async fn set_status(&self, chat: ChatRef, message: MessageRef, text: &str) -> MessageRef {
        match self.notifier.edit_message(chat, message, text, None).await {
            Ok(()) => message,
            Err(e) => {
                debug!(error = %e, "Status edit failed, sending new message");
                match self.notifier.send_message(chat, text, None, None).await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        warn!(chat = %chat, error = %e, "Failed to send status");
                        message
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::notifier::{MockNotifier, NotifyError};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    fn service(notifier: MockNotifier, capacity: usize) -> (DownloadService, JobQueue) {
        let queue = JobQueue::new(capacity);
        let service = DownloadService::new(
            Arc::new(CorrelationStore::new(Duration::from_secs(3600), 100)),
            Arc::new(QuotaGate::new(
                Duration::from_secs(3),
                2,
                HashSet::from([Platform::Instagram]),
            )),
            queue.clone(),
            Arc::new(UsageLedger::new()),
            Arc::new(notifier),
        );
        (service, queue)
    }

    fn counting_sender(notifier: &mut MockNotifier) {
        let next = AtomicI32::new(100);
        notifier
            .expect_send_message()
            .returning(move |_, _, _, _| Ok(MessageRef(next.fetch_add(1, Ordering::Relaxed))));
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(parse_action("v:abc"), Some((MediaKind::Video, "abc")));
        assert_eq!(parse_action("a:abc"), Some((MediaKind::Audio, "abc")));
        assert_eq!(parse_action("x:abc"), None);
        assert_eq!(parse_action("va:abc"), None);
        assert_eq!(parse_action("v:"), None);
        assert_eq!(parse_action("menu_help"), None);
    }

    #[test]
    fn test_choice_markup_round_trips_key() {
        let markup = choice_markup("k1");
        let actions: Vec<_> = markup.rows[0].iter().map(|b| b.action.as_str()).collect();
        assert_eq!(actions, vec!["v:k1", "a:k1"]);
    }

    #[tokio::test]
    async fn test_single_link_offers_one_choice() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_message()
            .times(1)
            .withf(|_, _, markup, reply_to| markup.is_some() && reply_to.is_none())
            .returning(|_, _, _, _| Ok(MessageRef(50)));
        let (service, _) = service(notifier, 4);

        let outcome = service
            .handle_text(ChatRef(1), 7, "look https://x.com/a/status/1", MessageRef(2), Utc::now())
            .await;

        let TextOutcome::Offered(keys) = outcome else {
            panic!("expected an offer");
        };
        assert_eq!(keys.len(), 1);
        let pending = service.correlations.peek(&keys[0], Utc::now()).await;
        assert_eq!(pending.and_then(|p| p.status_message), Some(MessageRef(50)));
    }

    #[tokio::test]
    async fn test_batch_links_and_unsupported() {
        let mut notifier = MockNotifier::new();
        counting_sender(&mut notifier);
        let (service, _) = service(notifier, 4);

        let outcome = service
            .handle_text(
                ChatRef(1),
                7,
                "https://x.com/1 https://example.org/v https://tiktok.com/@a/video/2",
                MessageRef(2),
                Utc::now(),
            )
            .await;

        assert!(matches!(outcome, TextOutcome::Offered(ref keys) if keys.len() == 2));
        assert_eq!(service.correlations.len().await, 2);
    }

    #[tokio::test]
    async fn test_no_links_and_cooldown() {
        let mut notifier = MockNotifier::new();
        counting_sender(&mut notifier);
        let (service, _) = service(notifier, 4);
        let now = Utc::now();
        let later = |secs| now + chrono::Duration::seconds(secs);

        assert_eq!(
            service.handle_text(ChatRef(1), 7, "   ", MessageRef(1), now).await,
            TextOutcome::NoLinks
        );
        assert!(matches!(
            service.handle_text(ChatRef(1), 7, "https://x.com/1", MessageRef(2), now).await,
            TextOutcome::Offered(_)
        ));
        assert_eq!(
            service.handle_text(ChatRef(1), 7, "https://x.com/2", MessageRef(3), later(1)).await,
            TextOutcome::CoolingDown
        );
    }

    #[tokio::test]
    async fn test_linkless_text_stamps_cooldown() {
        let mut notifier = MockNotifier::new();
        counting_sender(&mut notifier);
        let (service, _) = service(notifier, 4);
        let now = Utc::now();
        let later = |secs| now + chrono::Duration::seconds(secs);

        assert_eq!(
            service.handle_text(ChatRef(1), 7, "hello", MessageRef(1), now).await,
            TextOutcome::NoLinks
        );
        assert_eq!(
            service.handle_text(ChatRef(1), 7, "https://x.com/1", MessageRef(2), later(1)).await,
            TextOutcome::CoolingDown
        );
        assert!(matches!(
            service.handle_text(ChatRef(1), 7, "https://x.com/1", MessageRef(3), later(3)).await,
            TextOutcome::Offered(_)
        ));
    }

    #[tokio::test]
    async fn test_daily_limit_blocks_rate_limited_platform() {
        let mut notifier = MockNotifier::new();
        counting_sender(&mut notifier);
        let (service, _) = service(notifier, 4);
        let now = Utc::now();

        let outcome = service
            .handle_text(
                ChatRef(1),
                7,
                "https://instagram.com/p/1 https://instagram.com/p/2 https://instagram.com/p/3",
                MessageRef(2),
                now,
            )
            .await;

        assert!(matches!(outcome, TextOutcome::Offered(ref keys) if keys.len() == 2));
        let profile = service.profile(7, now).await;
        assert_eq!(profile.quota, vec![(Platform::Instagram, 2)]);
    }

    #[tokio::test]
    async fn test_action_enqueues_once_per_tap() {
        let mut notifier = MockNotifier::new();
        counting_sender(&mut notifier);
        notifier
            .expect_edit_message()
            .withf(|_, _, text, _| text.contains("Starting download"))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let (service, queue) = service(notifier, 4);
        let now = Utc::now();

        let TextOutcome::Offered(keys) = service
            .handle_text(ChatRef(1), 7, "https://x.com/1", MessageRef(2), now)
            .await
        else {
            panic!("expected an offer");
        };

        let data = action_data(MediaKind::Audio, &keys[0]);
        let outcome = service
            .handle_action(ChatRef(1), 7, &data, MessageRef(100), now)
            .await;
        assert_eq!(outcome, ActionOutcome::Queued);

        let job = queue.dequeue().await.expect("job queued");
        assert_eq!(job.media_kind, MediaKind::Audio);
        assert_eq!(job.status_message, MessageRef(100));
        assert_eq!(job.origin_message, Some(MessageRef(2)));
        assert_eq!(job.correlation_key, keys[0]);
    }

    #[tokio::test]
    async fn test_expired_key_replies_without_editing() {
        let mut notifier = MockNotifier::new();
        notifier.expect_edit_message().never();
        notifier
            .expect_send_message()
            .times(1)
            .withf(|_, text, _, reply_to| {
                text.contains("Link expired") && *reply_to == Some(MessageRef(5))
            })
            .returning(|_, _, _, _| Ok(MessageRef(6)));
        let (service, queue) = service(notifier, 4);

        let outcome = service
            .handle_action(ChatRef(1), 7, "v:unknown", MessageRef(5), Utc::now())
            .await;
        assert_eq!(outcome, ActionOutcome::Expired);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_reports_and_status_fallback() {
        let mut notifier = MockNotifier::new();
        counting_sender(&mut notifier);
        notifier
            .expect_edit_message()
            .returning(|_, _, _, _| Err(NotifyError::NotFound));
        let (service, queue) = service(notifier, 1);
        let now = Utc::now();

        let TextOutcome::Offered(keys) = service
            .handle_text(ChatRef(1), 7, "https://x.com/1 https://x.com/2", MessageRef(2), now)
            .await
        else {
            panic!("expected an offer");
        };

        let first = service
            .handle_action(ChatRef(1), 7, &action_data(MediaKind::Video, &keys[0]), MessageRef(100), now)
            .await;
        let second = service
            .handle_action(ChatRef(1), 7, &action_data(MediaKind::Video, &keys[1]), MessageRef(101), now)
            .await;

        assert_eq!(first, ActionOutcome::Queued);
        assert_eq!(second, ActionOutcome::QueueFull);
        assert_eq!(queue.len(), 1);
        // Edit failed, so the status moved to a freshly sent message
        let job = queue.dequeue().await.expect("job queued");
        assert_ne!(job.status_message, MessageRef(100));
    }
}
