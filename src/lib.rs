#![deny(missing_docs)]
//! TB Loader library.
//!
//! Download orchestration (classification, admission, correlation, queueing and
//! workers) plus the Telegram transport that drives it.

/// Telegram transport: dispatcher, handlers, keyboards.
pub mod bot;
/// Configuration management.
pub mod config;
/// Download orchestration core.
pub mod download;
/// Utility functions.
pub mod utils;
