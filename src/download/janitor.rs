//! Recurring housekeeping tasks: temp-directory cleaning and correlation sweeping.

use super::correlation::CorrelationStore;
use super::quota::QuotaGate;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether a file name looks like one of our temporary artifacts
#[must_use]
pub fn is_temp_artifact(name: &str) -> bool {
    name.starts_with("dl_")
        || Path::new(name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("tmp"))
}

/// Deletes temporary artifacts in `dir` last modified more than `max_age` ago.
///
/// Returns the number of removed files.
pub async fn clean_temp_dir(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Temp directory unreadable");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !is_temp_artifact(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => debug!(path = %entry.path().display(), error = %e, "Stale file not removed"),
        }
    }
    removed
}

/// Spawns the recurring temp cleaner
#[must_use]
pub fn spawn_temp_cleaner(
    dir: PathBuf,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = clean_temp_dir(&dir, every, SystemTime::now()).await;
                    if removed > 0 {
                        info!(removed, dir = %dir.display(), "Cleaned stale temp files");
                    }
                }
            }
        }
        debug!("Temp cleaner stopped");
    })
}

/// Spawns the periodic correlation sweep; it also forgets expired cooldown stamps
#[must_use]
pub fn spawn_sweeper(
    correlations: Arc<CorrelationStore>,
    gate: Arc<QuotaGate>,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let swept = correlations.sweep(now).await;
                    let pruned = gate.prune_cooldowns(now).await;
                    debug!(swept, pruned, "Periodic sweep");
                }
            }
        }
        debug!("Sweeper stopped");
    })
}
