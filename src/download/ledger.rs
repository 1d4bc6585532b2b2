//! Usage ledger and on-disk persistence of the two state documents.
//!
//! Both documents are flat JSON objects keyed by user id, loaded at startup and
//! rewritten wholesale on each save. A missing or corrupt file never stops the
//! bot; it starts from an empty document instead.

use super::quota::{QuotaGate, QuotaSnapshot};
use super::UserId;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur while loading or saving documents
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cumulative statistics for one user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Completed downloads
    #[serde(default)]
    pub downloads: u64,
    /// Total delivered size in megabytes
    #[serde(default)]
    pub total_mb: f64,
    /// Time of the last completed download
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_download: Option<DateTime<Utc>>,
}

/// Naive `YYYY-MM-DD HH:MM:SS` stamps written by older builds
const PLAIN_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

/// Accepts RFC 3339 or a plain timestamp (read as UTC); anything else loads as `None`
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    Ok(NaiveDateTime::parse_from_str(&raw, PLAIN_TIMESTAMP)
        .ok()
        .map(|naive| naive.and_utc()))
}

/// Persisted form: user id (as string) to record
pub type UsageSnapshot = BTreeMap<String, UsageRecord>;

/// Per-user usage statistics, mutated by workers after a job completes
#[derive(Default)]
pub struct UsageLedger {
    records: Mutex<HashMap<UserId, UsageRecord>>,
}

impl UsageLedger {
    /// Creates an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one completed download for `user_id`
    pub async fn record_success(&self, user_id: UserId, size_mb: f64, now: DateTime<Utc>) {
        let mut records = self.records.lock().await;
        let record = records.entry(user_id).or_default();
        record.downloads += 1;
        record.total_mb += size_mb;
        record.last_download = Some(now);
        debug!(user_id, downloads = record.downloads, "Usage recorded");
    }

    /// Current record of a user
    pub async fn get(&self, user_id: UserId) -> Option<UsageRecord> {
        self.records.lock().await.get(&user_id).cloned()
    }

    /// Number of users with at least one record
    pub async fn user_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Serializable copy of all records
    pub async fn snapshot(&self) -> UsageSnapshot {
        self.records
            .lock()
            .await
            .iter()
            .map(|(user, record)| (user.to_string(), record.clone()))
            .collect()
    }

    /// Replaces all records with a persisted snapshot.
    ///
    /// Entries with non-numeric user ids are skipped.
    pub async fn restore(&self, snapshot: UsageSnapshot) {
        let records: HashMap<UserId, UsageRecord> = snapshot
            .into_iter()
            .filter_map(|(user, record)| user.parse::<UserId>().ok().map(|id| (id, record)))
            .collect();
        *self.records.lock().await = records;
    }
}

/// Locations of the persisted documents
#[derive(Debug, Clone)]
pub struct Persistence {
    usage_path: PathBuf,
    quota_path: PathBuf,
}

impl Persistence {
    /// Creates a persistence handle for the two document paths
    #[must_use]
    pub const fn new(usage_path: PathBuf, quota_path: PathBuf) -> Self {
        Self {
            usage_path,
            quota_path,
        }
    }

    /// Loads both documents into the ledger and the gate, falling back to empty state
    pub async fn load_into(&self, ledger: &UsageLedger, gate: &QuotaGate) {
        let usage: UsageSnapshot = load_or_default(&self.usage_path).await;
        let quota: QuotaSnapshot = load_or_default(&self.quota_path).await;
        info!(
            usage_users = usage.len(),
            quota_users = quota.len(),
            "Loaded persisted state"
        );
        ledger.restore(usage).await;
        gate.restore(quota).await;
    }

    /// Writes both documents.
    ///
    /// # Errors
    ///
    /// Returns the first write error; the other document is still attempted.
    pub async fn save(&self, ledger: &UsageLedger, gate: &QuotaGate) -> Result<(), LedgerError> {
        let usage = ledger.snapshot().await;
        let quota = gate.snapshot().await;

        let usage_result = write_json(&self.usage_path, &usage).await;
        let quota_result = write_json(&self.quota_path, &quota).await;

        if let Err(ref e) = usage_result {
            error!(path = %self.usage_path.display(), error = %e, "Failed to save usage");
        }
        if let Err(ref e) = quota_result {
            error!(path = %self.quota_path.display(), error = %e, "Failed to save quota");
        }
        usage_result.and(quota_result)
    }

    /// Spawns the periodic autosave task; it stops when `token` is cancelled
    #[must_use]
    pub fn spawn_autosave(
        self: Arc<Self>,
        ledger: Arc<UsageLedger>,
        gate: Arc<QuotaGate>,
        every: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if self.save(&ledger, &gate).await.is_ok() {
                            debug!("Autosaved usage and quota");
                        }
                    }
                }
            }
            debug!("Autosave task stopped");
        })
    }
}

async fn load_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    match read_json(path).await {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to load state, starting empty");
            T::default()
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LedgerError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes to a sibling temp file, then renames over the target
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
