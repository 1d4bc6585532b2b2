//! Notification boundary between the download core and a chat transport.

use super::{ChatRef, MessageRef};
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a transport
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Target message no longer exists
    #[error("message not found")]
    NotFound,
    /// Any other transport failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// One inline button: visible label plus opaque callback data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    /// Label shown to the user
    pub label: String,
    /// Data echoed back on tap
    pub action: String,
}

impl Button {
    /// Creates a button
    pub fn new(label: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
        }
    }
}

/// Rows of inline buttons attached to a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markup {
    /// Button rows
    pub rows: Vec<Vec<Button>>,
}

impl Markup {
    /// Markup with a single row
    #[must_use]
    pub fn row(buttons: Vec<Button>) -> Self {
        Self {
            rows: vec![buttons],
        }
    }
}

/// How a file is presented in the chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    /// Streamable video
    Video,
    /// Audio with caption
    Audio,
    /// Generic document (fallback page)
    Document,
}

/// A file to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDelivery {
    /// Presentation
    pub kind: DeliveryKind,
    /// File on local disk
    pub path: PathBuf,
    /// HTML caption
    pub caption: String,
    /// Message to reply to
    pub reply_to: Option<MessageRef>,
}

/// Outbound chat operations used by the core.
///
/// Texts are Telegram-style HTML.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a new message and returns its reference
    async fn send_message(
        &self,
        chat: ChatRef,
        text: &str,
        markup: Option<Markup>,
        reply_to: Option<MessageRef>,
    ) -> Result<MessageRef, NotifyError>;

    /// Replaces the text (and markup) of an existing message
    async fn edit_message(
        &self,
        chat: ChatRef,
        message: MessageRef,
        text: &str,
        markup: Option<Markup>,
    ) -> Result<(), NotifyError>;

    /// Uploads a local file
    async fn send_media(&self, chat: ChatRef, media: MediaDelivery) -> Result<(), NotifyError>;

    /// Sends a photo by URL
    async fn send_photo_url(
        &self,
        chat: ChatRef,
        url: &str,
        reply_to: Option<MessageRef>,
    ) -> Result<(), NotifyError>;
}
