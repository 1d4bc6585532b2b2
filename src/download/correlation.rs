//! Correlation store linking inline-button choices back to pending requests.
//!
//! Keys are short fingerprints of `url + issuance time`. Entries expire after a
//! TTL and the store never holds more than its hard cap after a sweep.

use super::{ChatRef, MessageRef, Platform, PresentationMode, UserId};
use crate::utils::short_hash;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Length of a correlation key in hex characters
pub const KEY_LEN: usize = 12;

/// A link waiting for the user to pick video or audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Correlation key
    pub key: String,
    /// Source post URL
    pub source_url: String,
    /// Source platform
    pub platform: Platform,
    /// Issuance time
    pub created_at: DateTime<Utc>,
    /// Chat the link came from
    pub chat: ChatRef,
    /// User who sent the link
    pub user_id: UserId,
    /// The user's message carrying the link
    pub origin_message: Option<MessageRef>,
    /// The choice message, later reused as status message
    pub status_message: Option<MessageRef>,
    /// Single or batch presentation
    pub presentation: PresentationMode,
}

/// Data needed to issue a new pending request
#[derive(Debug, Clone)]
pub struct NewRequest {
    /// Source post URL
    pub source_url: String,
    /// Source platform
    pub platform: Platform,
    /// Chat the link came from
    pub chat: ChatRef,
    /// User who sent the link
    pub user_id: UserId,
    /// The user's message carrying the link
    pub origin_message: Option<MessageRef>,
    /// Single or batch presentation
    pub presentation: PresentationMode,
}

/// Derives a correlation key from a URL and a fine-grained timestamp
#[must_use]
pub fn derive_key(url: &str, at: DateTime<Utc>, nonce: u32) -> String {
    let nanos = at.timestamp_nanos_opt().unwrap_or_else(|| at.timestamp_micros());
    if nonce == 0 {
        short_hash(&format!("{url}{nanos}"), KEY_LEN)
    } else {
        short_hash(&format!("{url}{nanos}#{nonce}"), KEY_LEN)
    }
}

/// TTL- and capacity-bounded map of pending requests
pub struct CorrelationStore {
    entries: Mutex<HashMap<String, PendingRequest>>,
    ttl: Duration,
    max_entries: usize,
}

impl CorrelationStore {
    /// Creates an empty store
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Stores a new pending request and returns its unique key.
    ///
    /// Exceeding the hard cap triggers an inline sweep.
    pub async fn issue(&self, request: NewRequest, now: DateTime<Utc>) -> String {
        let mut entries = self.entries.lock().await;

        let mut nonce = 0u32;
        let mut key = derive_key(&request.source_url, now, nonce);
        while entries.contains_key(&key) {
            nonce += 1;
            key = derive_key(&request.source_url, now, nonce);
        }

        entries.insert(
            key.clone(),
            PendingRequest {
                key: key.clone(),
                source_url: request.source_url,
                platform: request.platform,
                created_at: now,
                chat: request.chat,
                user_id: request.user_id,
                origin_message: request.origin_message,
                status_message: None,
                presentation: request.presentation,
            },
        );

        if entries.len() > self.max_entries {
            self.sweep_locked(&mut entries, now, Some(&key));
        }
        key
    }

    /// Records the choice/status message for an issued key
    pub async fn attach_status(&self, key: &str, message: MessageRef) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.status_message = Some(message);
                true
            }
            None => false,
        }
    }

    /// Non-destructive lookup; expired entries are reported as missing
    pub async fn peek(&self, key: &str, now: DateTime<Utc>) -> Option<PendingRequest> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| !self.is_expired(entry, now))
            .cloned()
    }

    /// Destructive lookup: a key can be taken at most once
    pub async fn take(&self, key: &str, now: DateTime<Utc>) -> Option<PendingRequest> {
        let mut entries = self.entries.lock().await;
        entries
            .remove(key)
            .filter(|entry| !self.is_expired(entry, now))
    }

    /// Removes a key if still present
    pub async fn remove(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    /// Drops entries older than the TTL, then the oldest ones above the cap.
    ///
    /// Returns the number of removed entries.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        self.sweep_locked(&mut entries, now, None)
    }

    /// Number of pending entries
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Configured hard cap
    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn is_expired(&self, entry: &PendingRequest, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.created_at)
            .to_std()
            .is_ok_and(|age| age > self.ttl)
    }

    fn sweep_locked(
        &self,
        entries: &mut HashMap<String, PendingRequest>,
        now: DateTime<Utc>,
        keep: Option<&str>,
    ) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));

        if entries.len() > self.max_entries {
            let mut by_age: Vec<(DateTime<Utc>, String)> = entries
                .values()
                .filter(|entry| Some(entry.key.as_str()) != keep)
                .map(|entry| (entry.created_at, entry.key.clone()))
                .collect();
            by_age.sort();
            let excess = entries.len() - self.max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }

        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept correlation store");
        }
        removed
    }
}
