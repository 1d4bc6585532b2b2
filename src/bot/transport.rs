//! Telegram implementation of the download core's [`Notifier`].

use super::resilient::{
    edit_message_safe_resilient, send_message_resilient, EditOutcome,
};
use crate::download::notifier::{DeliveryKind, Markup, MediaDelivery, Notifier, NotifyError};
use crate::download::{ChatRef, MessageRef};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode,
    ReplyParameters,
};
use tracing::debug;

/// Converts transport-neutral markup into an inline keyboard
#[must_use]
pub fn to_inline_keyboard(markup: &Markup) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(markup.rows.iter().map(|row| {
        row.iter()
            .map(|button| InlineKeyboardButton::callback(button.label.clone(), button.action.clone()))
            .collect::<Vec<_>>()
    }))
}

/// [`Notifier`] backed by a teloxide [`Bot`]
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    /// Wraps a bot handle
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

const fn chat_id(chat: ChatRef) -> ChatId {
    ChatId(chat.0)
}

const fn message_id(message: MessageRef) -> MessageId {
    MessageId(message.0)
}

fn reply_params(reply_to: Option<MessageRef>) -> Option<ReplyParameters> {
    reply_to.map(|m| ReplyParameters::new(message_id(m)).allow_sending_without_reply())
}

fn transport_error(e: impl std::fmt::Display) -> NotifyError {
    NotifyError::Transport(e.to_string())
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(
        &self,
        chat: ChatRef,
        text: &str,
        markup: Option<Markup>,
        reply_to: Option<MessageRef>,
    ) -> Result<MessageRef, NotifyError> {
        let keyboard = markup.as_ref().map(to_inline_keyboard);
        send_message_resilient(
            &self.bot,
            chat_id(chat),
            text,
            keyboard,
            reply_to.map(message_id),
        )
        .await
        .map(|msg| MessageRef(msg.id.0))
        .map_err(transport_error)
    }

    async fn edit_message(
        &self,
        chat: ChatRef,
        message: MessageRef,
        text: &str,
        markup: Option<Markup>,
    ) -> Result<(), NotifyError> {
        let keyboard = markup.as_ref().map(to_inline_keyboard);
        match edit_message_safe_resilient(&self.bot, chat_id(chat), message_id(message), text, keyboard)
            .await
        {
            EditOutcome::Edited | EditOutcome::Unchanged => Ok(()),
            EditOutcome::NotFound => Err(NotifyError::NotFound),
            EditOutcome::Failed => Err(NotifyError::Transport("edit failed".to_string())),
        }
    }

    async fn send_media(&self, chat: ChatRef, media: MediaDelivery) -> Result<(), NotifyError> {
        let chat = chat_id(chat);
        let reply = reply_params(media.reply_to);
        debug!(chat = chat.0, kind = ?media.kind, path = %media.path.display(), "Uploading media");

        // Uploads are sent once, without retry
        let result = match media.kind {
            DeliveryKind::Video => {
                let mut req = self
                    .bot
                    .send_video(chat, InputFile::file(media.path.clone()))
                    .caption(media.caption)
                    .parse_mode(ParseMode::Html)
                    .supports_streaming(true);
                if let Some(reply) = reply {
                    req = req.reply_parameters(reply);
                }
                req.await.map(drop)
            }
            DeliveryKind::Audio => {
                let mut req = self
                    .bot
                    .send_audio(chat, InputFile::file(media.path.clone()))
                    .caption(media.caption)
                    .parse_mode(ParseMode::Html);
                if let Some(reply) = reply {
                    req = req.reply_parameters(reply);
                }
                req.await.map(drop)
            }
            DeliveryKind::Document => {
                let mut req = self
                    .bot
                    .send_document(chat, InputFile::file(media.path.clone()))
                    .caption(media.caption)
                    .parse_mode(ParseMode::Html);
                if let Some(reply) = reply {
                    req = req.reply_parameters(reply);
                }
                req.await.map(drop)
            }
        };
        result.map_err(transport_error)
    }

    async fn send_photo_url(
        &self,
        chat: ChatRef,
        url: &str,
        reply_to: Option<MessageRef>,
    ) -> Result<(), NotifyError> {
        let url = reqwest::Url::parse(url).map_err(transport_error)?;
        let mut req = self.bot.send_photo(chat_id(chat), InputFile::url(url));
        if let Some(reply) = reply_params(reply_to) {
            req = req.reply_parameters(reply);
        }
        req.await.map(drop).map_err(transport_error)
    }
}
