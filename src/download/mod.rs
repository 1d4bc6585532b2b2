//! Download orchestration core.
//!
//! Inbound links flow through [`platform::classify`], the [`quota::QuotaGate`],
//! and the [`correlation::CorrelationStore`]; a user's choice becomes a
//! [`Job`] on the [`queue::JobQueue`], drained by the [`worker::WorkerPool`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation store for pending link choices
pub mod correlation;
/// External media extraction boundary
pub mod fetcher;
/// Periodic temp-file cleaning and correlation sweeping
pub mod janitor;
/// Usage ledger and persisted documents
pub mod ledger;
/// Transport-neutral notification boundary
pub mod notifier;
/// Platform classification
pub mod platform;
/// Bounded job queue
pub mod queue;
/// Per-user cooldown and daily quotas
pub mod quota;
/// Shared state handle for the inbound paths
pub mod service;
/// Worker pool and job pipeline
pub mod worker;

pub use platform::Platform;

/// Telegram user identifier
pub type UserId = i64;

/// Reference to a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRef(pub i64);

/// Reference to a message inside a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef(pub i32);

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the user asked to extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    /// Streamable video
    Video,
    /// Audio track
    Audio,
}

impl MediaKind {
    /// Single-letter action tag used in callback data
    #[must_use]
    pub const fn action_tag(self) -> char {
        match self {
            Self::Video => 'v',
            Self::Audio => 'a',
        }
    }

    /// Inverse of [`MediaKind::action_tag`]
    #[must_use]
    pub const fn from_action_tag(tag: char) -> Option<Self> {
        match tag {
            'v' => Some(Self::Video),
            'a' => Some(Self::Audio),
            _ => None,
        }
    }
}

/// How the choice for a link was presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationMode {
    /// Message contained one link; the choice is a standalone message
    Single,
    /// Message contained several links; each choice replies to the original
    Batch,
}

/// An admitted download, consumed exactly once by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Chat to deliver into
    pub chat: ChatRef,
    /// Source post URL
    pub source_url: String,
    /// Source platform
    pub platform: Platform,
    /// Message edited with progress updates
    pub status_message: MessageRef,
    /// Requesting user
    pub user_id: UserId,
    /// Video or audio
    pub media_kind: MediaKind,
    /// The user's message that carried the link
    pub origin_message: Option<MessageRef>,
    /// Key of the pending request in the correlation store
    pub correlation_key: String,
}

impl Job {
    /// Message deliveries reply to
    #[must_use]
    pub fn reply_target(&self) -> MessageRef {
        self.origin_message.unwrap_or(self.status_message)
    }
}
