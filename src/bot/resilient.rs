//! Resilient messaging utilities with automatic retry for Telegram API operations.
//!
//! Every call goes through [`crate::utils::retry_transport_operation`], so
//! transient network failures are retried with exponential backoff and jitter.
//! Edits stop early on answers that a retry cannot change.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InlineKeyboardMarkup, Message, MessageId, ParseMode, ReplyParameters,
};
use tracing::{debug, warn};

/// Telegram's text limit is 4096; keep some room for the suffix
const MAX_TEXT_CHARS: usize = 4000;

/// Telegram error texts that mean "nothing to do"
pub const ERROR_NOT_MODIFIED: &str = "message is not modified";
/// Telegram error text for a deleted or unknown message
pub const ERROR_NOT_FOUND: &str = "message to edit not found";

/// Outcome of a safe edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Message text replaced
    Edited,
    /// Text was identical already
    Unchanged,
    /// Target message is gone
    NotFound,
    /// Failed after all retries
    Failed,
}

fn clamp_text(text: &str) -> String {
    if text.chars().count() > MAX_TEXT_CHARS {
        format!("{}...", crate::utils::truncate_str(text, MAX_TEXT_CHARS))
    } else {
        text.to_string()
    }
}

/// Send an HTML message with automatic retry on network failures.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    markup: Option<InlineKeyboardMarkup>,
    reply_to: Option<MessageId>,
) -> Result<Message> {
    let text = clamp_text(text);
    crate::utils::retry_transport_operation(|| async {
        let mut req = bot
            .send_message(chat_id, text.clone())
            .parse_mode(ParseMode::Html);
        if let Some(ref markup) = markup {
            req = req.reply_markup(markup.clone());
        }
        if let Some(id) = reply_to {
            req = req.reply_parameters(ReplyParameters::new(id).allow_sending_without_reply());
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Edit an HTML message with automatic retry on network failures.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn edit_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<Message> {
    let text = clamp_text(text);
    crate::utils::retry_transport_operation_if(
        || async {
            let mut req = bot
                .edit_message_text(chat_id, msg_id, text.clone())
                .parse_mode(ParseMode::Html);
            if let Some(ref markup) = markup {
                req = req.reply_markup(markup.clone());
            }
            req.await
                .map_err(|e| anyhow::anyhow!("Telegram edit error: {e}"))
        },
        |e| is_retryable_edit_error(&e.to_string()),
    )
    .await
}

/// Whether another attempt could change the outcome of a failed edit
fn is_retryable_edit_error(err_msg: &str) -> bool {
    !(err_msg.contains(ERROR_NOT_MODIFIED) || err_msg.contains(ERROR_NOT_FOUND))
}

/// Edit a message with graceful degradation.
///
/// "Not modified" counts as success; "not found" is reported so the caller
/// can send a fresh message instead.
pub async fn edit_message_safe_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
    markup: Option<InlineKeyboardMarkup>,
) -> EditOutcome {
    match edit_message_resilient(bot, chat_id, msg_id, text, markup).await {
        Ok(_) => EditOutcome::Edited,
        Err(e) => classify_edit_error(&e.to_string()),
    }
}

fn classify_edit_error(err_msg: &str) -> EditOutcome {
    if err_msg.contains(ERROR_NOT_MODIFIED) {
        debug!("Message update skipped: {err_msg}");
        EditOutcome::Unchanged
    } else if err_msg.contains(ERROR_NOT_FOUND) {
        debug!("Message to edit is gone: {err_msg}");
        EditOutcome::NotFound
    } else {
        warn!("Failed to edit message after retries: {err_msg}");
        EditOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_text() {
        assert_eq!(clamp_text("short"), "short");
        let long = "x".repeat(5000);
        assert_eq!(clamp_text(&long).chars().count(), MAX_TEXT_CHARS + 3);
    }

    #[test]
    fn test_permanent_edit_errors_are_not_retried() {
        assert!(!is_retryable_edit_error(
            "Telegram edit error: Bad Request: message to edit not found"
        ));
        assert!(!is_retryable_edit_error(
            "Telegram edit error: Bad Request: message is not modified"
        ));
        assert!(is_retryable_edit_error("Telegram edit error: network timeout"));
    }

    #[test]
    fn test_classify_edit_error() {
        assert_eq!(
            classify_edit_error("Telegram edit error: Bad Request: message is not modified"),
            EditOutcome::Unchanged
        );
        assert_eq!(
            classify_edit_error("Telegram edit error: Bad Request: message to edit not found"),
            EditOutcome::NotFound
        );
        assert_eq!(
            classify_edit_error("Telegram edit error: network"),
            EditOutcome::Failed
        );
    }
}
