/// Command, text and callback handlers
pub mod handlers;
/// Resilient messaging with retry
pub mod resilient;
/// Dispatcher setup and process lifecycle
pub mod runner;
/// Telegram implementation of the notification boundary
pub mod transport;
/// UI texts and keyboards
pub mod views;

pub use transport::TelegramNotifier;
