use super::resilient::{edit_message_safe_resilient, send_message_resilient};
use super::views::{self, MenuPage};
use crate::config::Settings;
use crate::download::service::DownloadService;
use crate::download::{ChatRef, MessageRef, Platform};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use teloxide::{prelude::*, types::InlineKeyboardMarkup, utils::command::BotCommands};
use tracing::{debug, info};

/// Shared state handed to every handler through the dispatcher
pub struct BotContext {
    /// Download admission and dispatch
    pub service: Arc<DownloadService>,
    /// Loaded settings
    pub settings: Arc<Settings>,
    /// Worker pool size
    pub workers: usize,
}

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Show the welcome menu
    #[command(description = "Start the bot.")]
    Start,
    /// Show usage instructions
    #[command(description = "How to use the bot.")]
    Help,
    /// About the bot
    #[command(description = "About the bot.")]
    About,
    /// Show the caller's statistics
    #[command(description = "Your download statistics.")]
    Profile,
    /// Show runtime counters
    #[command(description = "Bot statistics.")]
    Stats,
}

impl From<&Command> for MenuPage {
    fn from(cmd: &Command) -> Self {
        match cmd {
            Command::Start => Self::Start,
            Command::Help => Self::Help,
            Command::About => Self::About,
            Command::Profile => Self::Profile,
            Command::Stats => Self::Stats,
        }
    }
}

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

fn get_first_name(msg: &Message) -> String {
    msg.from
        .as_ref()
        .map(|u| u.first_name.clone())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "there".to_string())
}

async fn render_page(
    page: MenuPage,
    ctx: &BotContext,
    user_id: i64,
    first_name: &str,
) -> (String, InlineKeyboardMarkup) {
    let settings = &ctx.settings;
    let text = match page {
        MenuPage::Start => views::start_text(first_name, &settings.bot_name),
        MenuPage::Help => {
            let mut limited: Vec<Platform> = settings.rate_limited().into_iter().collect();
            limited.sort();
            views::help_text(settings.daily_limit, &limited, settings.max_send_mb)
        }
        MenuPage::About => views::about_text(&settings.bot_name),
        MenuPage::Profile => {
            let profile = ctx.service.profile(user_id, Utc::now()).await;
            views::profile_text(user_id, &profile)
        }
        MenuPage::Stats => views::stats_text(&ctx.service.stats().await, ctx.workers),
    };
    (text, views::keyboard_for(page))
}

/// Answers a command with its menu page.
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn handle_command(bot: Bot, msg: Message, cmd: Command, ctx: Arc<BotContext>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!(user_id, command = ?cmd, "Command received");

    let (text, keyboard) = render_page(MenuPage::from(&cmd), &ctx, user_id, &get_first_name(&msg)).await;
    send_message_resilient(&bot, msg.chat.id, &text, Some(keyboard), None).await?;
    Ok(())
}

/// Passes a text message to the download service.
///
/// # Errors
///
/// Never fails; delivery problems are logged by the service.
pub async fn handle_text(msg: Message, ctx: Arc<BotContext>) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let user_id = get_user_id_safe(&msg);
    debug!(user_id, chat = msg.chat.id.0, "Text received");

    ctx.service
        .handle_text(
            ChatRef(msg.chat.id.0),
            user_id,
            text,
            MessageRef(msg.id.0),
            Utc::now(),
        )
        .await;
    Ok(())
}

/// Handles inline-button taps: menu navigation or a download choice.
///
/// # Errors
///
/// Returns an error if a menu page cannot be rendered in place.
pub async fn handle_callback(bot: Bot, q: CallbackQuery, ctx: Arc<BotContext>) -> Result<()> {
    let _ = bot.answer_callback_query(q.id.clone()).await;

    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let Some(message) = q.regular_message() else {
        debug!("Callback without accessible message");
        return Ok(());
    };
    let user_id = q.from.id.0.cast_signed();

    if let Some(page) = MenuPage::from_callback(data) {
        let (text, keyboard) = render_page(page, &ctx, user_id, &q.from.first_name).await;
        edit_message_safe_resilient(&bot, message.chat.id, message.id, &text, Some(keyboard)).await;
        return Ok(());
    }

    let outcome = ctx
        .service
        .handle_action(
            ChatRef(message.chat.id.0),
            user_id,
            data,
            MessageRef(message.id.0),
            Utc::now(),
        )
        .await;
    debug!(user_id, ?outcome, "Choice handled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_parse() {
        assert_eq!(Command::parse("/start", "tb_loader_bot").ok(), Some(Command::Start));
        assert_eq!(Command::parse("/stats", "tb_loader_bot").ok(), Some(Command::Stats));
        assert!(Command::parse("/unknown", "tb_loader_bot").is_err());
    }

    #[test]
    fn test_command_pages() {
        assert_eq!(MenuPage::from(&Command::Profile), MenuPage::Profile);
        assert_eq!(MenuPage::from(&Command::Help), MenuPage::Help);
    }
}
