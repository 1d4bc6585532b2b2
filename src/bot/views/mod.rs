//! View layer for bot UI components
//!
//! Contains keyboards, messages, and formatting for Telegram UI.

/// Command menu pages
pub mod menu;

pub use menu::*;
