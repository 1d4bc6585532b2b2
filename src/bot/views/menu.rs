//! Menu UI components
//!
//! Texts and inline keyboards for the command menu pages.

use crate::download::ledger::UsageRecord;
use crate::download::service::{Profile, ServiceStats};
use crate::download::Platform;
use crate::utils::escape_html;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

// ─────────────────────────────────────────────────────────────────────────────
// Callback constants
// ─────────────────────────────────────────────────────────────────────────────

/// Prefix of menu navigation callbacks
pub const MENU_CALLBACK_PREFIX: &str = "menu:";

/// Pages reachable from the menu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuPage {
    /// Welcome page
    Start,
    /// Usage instructions
    Help,
    /// About the bot
    About,
    /// Caller's statistics
    Profile,
    /// Runtime counters
    Stats,
}

impl MenuPage {
    /// Callback data opening this page
    #[must_use]
    pub const fn callback_data(self) -> &'static str {
        match self {
            Self::Start => "menu:start",
            Self::Help => "menu:help",
            Self::About => "menu:about",
            Self::Profile => "menu:profile",
            Self::Stats => "menu:stats",
        }
    }

    /// Parses menu callback data
    #[must_use]
    pub fn from_callback(data: &str) -> Option<Self> {
        match data.strip_prefix(MENU_CALLBACK_PREFIX)? {
            "start" => Some(Self::Start),
            "help" => Some(Self::Help),
            "about" => Some(Self::About),
            "profile" => Some(Self::Profile),
            "stats" => Some(Self::Stats),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyboards
// ─────────────────────────────────────────────────────────────────────────────

/// Main menu keyboard
#[must_use]
pub fn main_menu_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("📖 Help", MenuPage::Help.callback_data()),
            InlineKeyboardButton::callback("ℹ️ About", MenuPage::About.callback_data()),
        ],
        vec![
            InlineKeyboardButton::callback("👤 Profile", MenuPage::Profile.callback_data()),
            InlineKeyboardButton::callback("📊 Stats", MenuPage::Stats.callback_data()),
        ],
    ])
}

/// Single "back" button
#[must_use]
pub fn back_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "⬅️ Back",
        MenuPage::Start.callback_data(),
    )]])
}

/// Keyboard shown under a page
#[must_use]
pub fn keyboard_for(page: MenuPage) -> InlineKeyboardMarkup {
    match page {
        MenuPage::Start => main_menu_keyboard(),
        _ => back_keyboard(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Texts
// ─────────────────────────────────────────────────────────────────────────────

fn supported_platforms() -> String {
    Platform::ALL
        .iter()
        .map(|p| format!("• {}", p.display_name()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Welcome text
#[must_use]
pub fn start_text(first_name: &str, bot_name: &str) -> String {
    format!(
        "👋 Hi, <b>{}</b>!\n\nI'm <b>{}</b>. Send me a link and pick video or audio.\n\n<b>Supported:</b>\n{}",
        escape_html(first_name),
        escape_html(bot_name),
        supported_platforms()
    )
}

/// Usage instructions
#[must_use]
pub fn help_text(daily_limit: u32, rate_limited: &[Platform], max_send_mb: u64) -> String {
    let limited = if rate_limited.is_empty() {
        "none".to_string()
    } else {
        rate_limited
            .iter()
            .map(|p| p.display_name())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "📖 <b>How to use</b>\n\n\
         1. Send one or more post links in a message\n\
         2. Tap 🎬 Video or 🎵 Audio under each link\n\
         3. Wait for the file\n\n\
         <b>Limits:</b>\n\
         • {daily_limit} downloads per day for: {limited}\n\
         • Files above {max_send_mb} MB arrive as a download page\n\
         • Choices expire after an hour"
    )
}

/// About text
#[must_use]
pub fn about_text(bot_name: &str) -> String {
    format!(
        "ℹ️ <b>{}</b>\n\nDownloads public posts with yt-dlp. Nothing you send is stored beyond usage counters.",
        escape_html(bot_name)
    )
}

fn usage_lines(usage: Option<&UsageRecord>) -> String {
    match usage {
        Some(record) => {
            let last = record
                .last_download
                .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M UTC").to_string());
            format!(
                "Downloads: <b>{}</b>\nTotal: <b>{:.1} MB</b>\nLast: <i>{last}</i>",
                record.downloads, record.total_mb
            )
        }
        None => "No downloads yet.".to_string(),
    }
}

/// Caller's profile page
#[must_use]
pub fn profile_text(user_id: i64, profile: &Profile) -> String {
    let mut text = format!(
        "👤 <b>Profile</b> <code>{user_id}</code>\n\n{}",
        usage_lines(profile.usage.as_ref())
    );
    for (platform, used) in &profile.quota {
        text.push_str(&format!(
            "\n{} today: <b>{used}/{}</b>",
            platform.display_name(),
            profile.daily_limit
        ));
    }
    text
}

/// Runtime counters page
#[must_use]
pub fn stats_text(stats: &ServiceStats, workers: usize) -> String {
    format!(
        "📊 <b>Stats</b>\n\nWorkers: <b>{workers}</b>\nQueue: <b>{}/{}</b>\nPending choices: <b>{}</b>\nUsers: <b>{}</b>",
        stats.queue_depth, stats.queue_capacity, stats.pending, stats.users
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_callbacks_round_trip() {
        for page in [
            MenuPage::Start,
            MenuPage::Help,
            MenuPage::About,
            MenuPage::Profile,
            MenuPage::Stats,
        ] {
            assert_eq!(MenuPage::from_callback(page.callback_data()), Some(page));
        }
        assert_eq!(MenuPage::from_callback("v:abc"), None);
        assert_eq!(MenuPage::from_callback("menu:nope"), None);
    }

    #[test]
    fn test_start_text_escapes_name() {
        let text = start_text("<Bob>", "TB_Loader");
        assert!(text.contains("&lt;Bob&gt;"));
        assert!(text.contains("TikTok"));
    }

    #[test]
    fn test_profile_text() {
        let profile = Profile {
            usage: None,
            quota: vec![(Platform::Instagram, 3)],
            daily_limit: 10,
        };
        let text = profile_text(42, &profile);
        assert!(text.contains("No downloads yet."));
        assert!(text.contains("Instagram today: <b>3/10</b>"));
    }
}
