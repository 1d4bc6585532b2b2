//! Utility functions shared by the download core and the Telegram transport.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, warn};

/// Number of attempts for transport operations (initial + retries)
const TRANSPORT_RETRY_ATTEMPTS: usize = 3;

/// Returns the first `len` hex characters of the SHA-256 digest of `input`.
///
/// # Examples
///
/// ```
/// use tb_loader::utils::short_hash;
/// let h = short_hash("https://x.com/a", 12);
/// assert_eq!(h.len(), 12);
/// assert_eq!(h, short_hash("https://x.com/a", 12));
/// ```
#[must_use]
pub fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out.truncate(len);
    out
}

/// Truncates a string to at most `max_chars` characters, respecting char boundaries.
#[must_use]
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Escapes text for Telegram HTML parse mode.
#[must_use]
pub fn escape_html(text: &str) -> String {
    html_escape::encode_text(text).to_string()
}

/// Converts a byte count to megabytes.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Retries a transport operation with exponential backoff and jitter.
///
/// # Errors
///
/// Returns the last error once all attempts are exhausted.
pub async fn retry_transport_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_transport_operation_if(operation, |_| true).await
}

/// Like [`retry_transport_operation`], but stops at the first error `is_transient` rejects.
///
/// # Errors
///
/// Returns the first permanent error, or the last error once all attempts are exhausted.
pub async fn retry_transport_operation_if<F, Fut, T, C>(
    mut operation: F,
    is_transient: C,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&anyhow::Error) -> bool,
{
    // 200ms, 400ms, 800ms, ...
    let mut delays = ExponentialBackoff::from_millis(2)
        .factor(100)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(TRANSPORT_RETRY_ATTEMPTS - 1);

    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !is_transient(&err) {
            debug!(attempt, error = %err, "Transport operation failed permanently");
            return Err(err);
        }
        warn!(attempt, error = %err, "Transport operation failed");
        match delays.next() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return Err(err),
        }
    }
}
