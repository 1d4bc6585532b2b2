//! Worker pool draining the job queue.
//!
//! Each worker runs one job to completion before pulling the next:
//! resolve key → fetch (with one credential retry) → locate artifact →
//! size check → deliver media or fallback page → ledger update → cleanup.
//! Every failure is caught at the job boundary, and cleanup runs on all paths.

use super::correlation::CorrelationStore;
use super::fetcher::{credential_file_for, FetchError, FetchOptions, FetchOutcome, MediaFetcher};
use super::ledger::UsageLedger;
use super::notifier::{DeliveryKind, MediaDelivery, Notifier, NotifyError};
use super::queue::JobQueue;
use super::{Job, MediaKind};
use crate::utils::{bytes_to_mb, escape_html};
use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Status texts shown while a job runs
pub mod status {
    /// Fetch finished; `{size}` is replaced by megabytes
    pub const PROCESSED: &str = "⚙️ <b>Processing complete!</b>\nSize: <i>{size} MB</i>";
    /// Uploading media
    pub const SENDING: &str = "📤 <b>Sending directly...</b>";
    /// Media delivered
    pub const SENT: &str = "✅ <b>Sent successfully! Enjoy! 🎉</b>";
    /// Fallback page delivered instead of media
    pub const TOO_LARGE: &str =
        "❌ <b>File too large!</b> Failed to send\n<i>Sent fallback download page</i>";
    /// Any terminal failure
    pub const FAILED: &str = "❌ <b>Download failed!</b>\nTry again";
    /// Correlation key gone before the job started
    pub const EXPIRED: &str = "❌ <b>Link expired!</b> Send again.";
}

/// Per-job failures
#[derive(Debug, Error)]
pub enum JobError {
    /// The correlation key was already consumed or expired
    #[error("correlation key expired")]
    Expired,
    /// Extraction failed, including the credential retry
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    /// Extraction reported success but no file was found
    #[error("artifact not found after download")]
    ArtifactMissing,
    /// Local file error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport could not deliver the artifact
    #[error("delivery failed: {0}")]
    Delivery(#[from] NotifyError),
}

/// Result of a successful job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobReport {
    /// Size of the downloaded media
    pub size_bytes: u64,
    /// Whether the fallback page was sent instead of the media
    pub oversize: bool,
}

/// Static worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Directory for temporary artifacts
    pub tmp_dir: PathBuf,
    /// Directory holding `<platform>_cookies.txt` files
    pub cookies_dir: PathBuf,
    /// Largest file sent as media
    pub max_send_bytes: u64,
    /// Whether ffmpeg is available
    pub merge_capable: bool,
    /// Name shown in captions
    pub bot_name: String,
}

/// Shared dependencies of all workers
pub struct WorkerContext {
    /// Queue to drain
    pub queue: JobQueue,
    /// Pending requests
    pub correlations: Arc<CorrelationStore>,
    /// Usage statistics
    pub ledger: Arc<UsageLedger>,
    /// Extraction boundary
    pub fetcher: Arc<dyn MediaFetcher>,
    /// Chat transport
    pub notifier: Arc<dyn Notifier>,
    /// Settings
    pub config: WorkerConfig,
    sequence: AtomicU64,
}

impl WorkerContext {
    /// Bundles worker dependencies
    #[must_use]
    pub fn new(
        queue: JobQueue,
        correlations: Arc<CorrelationStore>,
        ledger: Arc<UsageLedger>,
        fetcher: Arc<dyn MediaFetcher>,
        notifier: Arc<dyn Notifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            correlations,
            ledger,
            fetcher,
            notifier,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    /// Unique file-name prefix for one job's temporary artifacts
    fn next_base_name(&self, job: &Job) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "dl_{}_{}_{}_{seq}",
            job.chat,
            job.status_message,
            Utc::now().timestamp()
        )
    }
}

/// Fixed-size pool of queue consumers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `workers` consumers; they stop when `token` is cancelled or the queue closes
    #[must_use]
    pub fn spawn(ctx: Arc<WorkerContext>, workers: usize, token: CancellationToken) -> Self {
        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, ctx.clone(), token.clone())))
            .collect();
        info!(workers = workers.max(1), "Worker pool started");
        Self { handles }
    }

    /// Number of workers
    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>, token: CancellationToken) {
    debug!(worker = id, "Worker started");
    loop {
        let job = tokio::select! {
            () = token.cancelled() => break,
            job = ctx.queue.dequeue() => match job {
                Some(job) => job,
                None => break,
            },
        };
        run_one(id, &ctx, job).await;
    }
    debug!(worker = id, "Worker stopped");
}

/// Runs a single job, reports a terminal failure, and always cleans up
pub async fn run_one(worker: usize, ctx: &WorkerContext, job: Job) {
    let base = ctx.next_base_name(&job);
    info!(
        worker,
        user_id = job.user_id,
        platform = %job.platform,
        kind = ?job.media_kind,
        key = %job.correlation_key,
        "Job started"
    );

    let outcome = AssertUnwindSafe(process_job(ctx, &job, &base))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(report)) => {
            info!(
                worker,
                user_id = job.user_id,
                size_mb = bytes_to_mb(report.size_bytes),
                oversize = report.oversize,
                "Job finished"
            );
        }
        Ok(Err(JobError::Expired)) => {
            info!(worker, key = %job.correlation_key, "Job skipped: key expired");
            report_expired(ctx, &job).await;
        }
        Ok(Err(e)) => {
            warn!(worker, user_id = job.user_id, error = %e, "Job failed");
            report_failure(ctx, &job, status::FAILED).await;
        }
        Err(_) => {
            error!(worker, user_id = job.user_id, "Job panicked");
            report_failure(ctx, &job, status::FAILED).await;
        }
    }

    cleanup(ctx, &job, &base).await;
}

async fn process_job(ctx: &WorkerContext, job: &Job, base: &str) -> Result<JobReport, JobError> {
    let pending = ctx
        .correlations
        .take(&job.correlation_key, Utc::now())
        .await
        .ok_or(JobError::Expired)?;

    let output_base = ctx.config.tmp_dir.join(base);
    let outcome =
        fetch_with_credential_fallback(ctx, job, &pending.source_url, &output_base).await?;

    let artifact = locate_artifact(
        &ctx.config.tmp_dir,
        base,
        &outcome,
        job.media_kind,
        ctx.config.merge_capable,
    )
    .await
    .ok_or(JobError::ArtifactMissing)?;
    let size_bytes = tokio::fs::metadata(&artifact).await?.len();
    let size_mb = bytes_to_mb(size_bytes);

    if job.media_kind == MediaKind::Audio {
        if let Some(ref thumb) = outcome.thumbnail {
            if let Err(e) = ctx
                .notifier
                .send_photo_url(job.chat, thumb, Some(job.reply_target()))
                .await
            {
                debug!(error = %e, "Thumbnail not sent");
            }
        }
    }

    update_status(
        ctx,
        job,
        &status::PROCESSED.replace("{size}", &format!("{size_mb:.1}")),
    )
    .await;

    let oversize = size_bytes > ctx.config.max_send_bytes;
    if oversize {
        deliver_fallback(ctx, job, &pending.source_url, &output_base).await?;
    } else {
        deliver_media(ctx, job, &artifact, &outcome).await?;
    }

    ctx.ledger
        .record_success(job.user_id, size_mb, Utc::now())
        .await;

    Ok(JobReport {
        size_bytes,
        oversize,
    })
}

async fn fetch_with_credential_fallback(
    ctx: &WorkerContext,
    job: &Job,
    url: &str,
    output_base: &Path,
) -> Result<FetchOutcome, FetchError> {
    let mut options = FetchOptions {
        media_kind: job.media_kind,
        merge_capable: ctx.config.merge_capable,
        credential_file: None,
        output_base: output_base.to_path_buf(),
    };

    let first_err = match ctx.fetcher.fetch(url, &options).await {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };

    let Some(cookies) = credential_file_for(&ctx.config.cookies_dir, job.platform.tag()) else {
        return Err(first_err);
    };

    info!(platform = %job.platform, error = %first_err, "Retrying fetch with credential file");
    options.credential_file = Some(cookies);
    ctx.fetcher.fetch(url, &options).await
}

/// Finds the produced artifact by its predictable name
async fn locate_artifact(
    tmp_dir: &Path,
    base: &str,
    outcome: &FetchOutcome,
    kind: MediaKind,
    merge_capable: bool,
) -> Option<PathBuf> {
    if let Some(ref reported) = outcome.artifact {
        if tokio::fs::try_exists(reported).await.unwrap_or(false) {
            return Some(reported.clone());
        }
    }

    let ext = match (kind, merge_capable) {
        (MediaKind::Audio, true) => Some("mp3".to_string()),
        _ => outcome.ext.clone(),
    };
    if let Some(ext) = ext {
        let candidate = tmp_dir.join(format!("{base}.{ext}"));
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }

    let prefix = format!("{base}.");
    let mut entries = tokio::fs::read_dir(tmp_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && !name.ends_with(".part") && !name.ends_with(".html") {
            return Some(entry.path());
        }
    }
    None
}

async fn deliver_media(
    ctx: &WorkerContext,
    job: &Job,
    artifact: &Path,
    outcome: &FetchOutcome,
) -> Result<(), JobError> {
    update_status(ctx, job, status::SENDING).await;

    let title = escape_html(outcome.title.as_deref().unwrap_or("Your file"));
    let bot_name = escape_html(&ctx.config.bot_name);
    let (kind, caption) = match job.media_kind {
        MediaKind::Video => (
            DeliveryKind::Video,
            format!("🎬 <b>{title}</b>\n<b>{bot_name}</b>"),
        ),
        MediaKind::Audio => (
            DeliveryKind::Audio,
            format!("🎵 <b>{title}</b>\n<b>{bot_name}</b>"),
        ),
    };

    ctx.notifier
        .send_media(
            job.chat,
            MediaDelivery {
                kind,
                path: artifact.to_path_buf(),
                caption,
                reply_to: Some(job.reply_target()),
            },
        )
        .await?;

    update_status(ctx, job, status::SENT).await;
    Ok(())
}

/// HTML page pointing at the original post
#[must_use]
pub fn fallback_page(url: &str) -> String {
    let escaped = html_escape::encode_double_quoted_attribute(url);
    let text = escape_html(url);
    format!(
        "<html><body><h3>Download File</h3><p>Original: <a href=\"{escaped}\">{text}</a></p></body></html>"
    )
}

async fn deliver_fallback(
    ctx: &WorkerContext,
    job: &Job,
    url: &str,
    output_base: &Path,
) -> Result<(), JobError> {
    let mut page = output_base.as_os_str().to_owned();
    page.push(".fallback.html");
    let page = PathBuf::from(page);

    tokio::fs::write(&page, fallback_page(url)).await?;
    update_status(ctx, job, status::TOO_LARGE).await;

    let max_mb = ctx.config.max_send_bytes / (1024 * 1024);
    let result = ctx
        .notifier
        .send_media(
            job.chat,
            MediaDelivery {
                kind: DeliveryKind::Document,
                path: page.clone(),
                caption: format!("⚠️ File >{max_mb}MB, open this page to download manually"),
                reply_to: Some(job.reply_target()),
            },
        )
        .await;

    if let Err(e) = tokio::fs::remove_file(&page).await {
        debug!(path = %page.display(), error = %e, "Fallback page already gone");
    }
    result.map_err(JobError::from)
}

async fn update_status(ctx: &WorkerContext, job: &Job, text: &str) {
    if let Err(e) = ctx
        .notifier
        .edit_message(job.chat, job.status_message, text, None)
        .await
    {
        debug!(error = %e, "Status update skipped");
    }
}

/// Rewrites the status message; falls back to a new message if editing fails
async fn report_failure(ctx: &WorkerContext, job: &Job, text: &str) {
    if ctx
        .notifier
        .edit_message(job.chat, job.status_message, text, None)
        .await
        .is_ok()
    {
        return;
    }
    if let Err(e) = ctx.notifier.send_message(job.chat, text, None, None).await {
        warn!(chat = %job.chat, error = %e, "Failed to report job failure");
    }
}

/// Replies to the tapped message; its status belongs to the job that consumed the key
async fn report_expired(ctx: &WorkerContext, job: &Job) {
    if let Err(e) = ctx
        .notifier
        .send_message(job.chat, status::EXPIRED, None, Some(job.status_message))
        .await
    {
        warn!(chat = %job.chat, error = %e, "Failed to report expired key");
    }
}

async fn cleanup(ctx: &WorkerContext, job: &Job, base: &str) {
    let removed = remove_prefixed(&ctx.config.tmp_dir, &format!("{base}.")).await;
    if removed > 0 {
        debug!(removed, base, "Removed temporary artifacts");
    }
    ctx.correlations.remove(&job.correlation_key).await;
}

/// Deletes files in `dir` whose names start with `prefix`
async fn remove_prefixed(dir: &Path, prefix: &str) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove temp file"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::correlation::NewRequest;
    use crate::download::fetcher::MockMediaFetcher;
    use crate::download::notifier::MockNotifier;
    use crate::download::{ChatRef, MessageRef, Platform, PresentationMode};
    use std::time::Duration;

    fn config(tmp: &Path) -> WorkerConfig {
        WorkerConfig {
            tmp_dir: tmp.to_path_buf(),
            cookies_dir: tmp.to_path_buf(),
            max_send_bytes: 1024,
            merge_capable: true,
            bot_name: "TB_Loader".to_string(),
        }
    }

    async fn issue(store: &CorrelationStore) -> String {
        store
            .issue(
                NewRequest {
                    source_url: "https://x.com/a".to_string(),
                    platform: Platform::Twitter,
                    chat: ChatRef(1),
                    user_id: 9,
                    origin_message: Some(MessageRef(3)),
                    presentation: PresentationMode::Single,
                },
                Utc::now(),
            )
            .await
    }

    fn job(key: &str) -> Job {
        Job {
            chat: ChatRef(1),
            source_url: "https://x.com/a".to_string(),
            platform: Platform::Twitter,
            status_message: MessageRef(4),
            user_id: 9,
            media_kind: MediaKind::Video,
            origin_message: Some(MessageRef(3)),
            correlation_key: key.to_string(),
        }
    }

    fn writing_fetcher(bytes: usize) -> MockMediaFetcher {
        let mut fetcher = MockMediaFetcher::new();
        fetcher.expect_fetch().times(1).returning(move |_, opts| {
            let path = PathBuf::from(format!("{}.mp4", opts.output_base.display()));
            std::fs::write(&path, vec![0u8; bytes]).map_err(FetchError::Spawn)?;
            Ok(FetchOutcome {
                title: Some("Clip <1>".to_string()),
                ext: Some("mp4".to_string()),
                thumbnail: None,
                artifact: None,
            })
        });
        fetcher
    }

    fn lenient_notifier() -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier.expect_edit_message().returning(|_, _, _, _| Ok(()));
        notifier
    }

    #[tokio::test]
    async fn test_success_delivers_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(CorrelationStore::new(Duration::from_secs(60), 10));
        let key = issue(&store).await;
        let ledger = Arc::new(UsageLedger::new());

        let mut notifier = lenient_notifier();
        notifier
            .expect_send_media()
            .times(1)
            .withf(|_, media| {
                media.kind == DeliveryKind::Video
                    && media.caption.contains("Clip &lt;1&gt;")
                    && media.reply_to == Some(MessageRef(3))
            })
            .returning(|_, _| Ok(()));

        let ctx = WorkerContext::new(
            JobQueue::new(1),
            store.clone(),
            ledger.clone(),
            Arc::new(writing_fetcher(100)),
            Arc::new(notifier),
            config(dir.path()),
        );
        run_one(0, &ctx, job(&key)).await;

        assert_eq!(ledger.get(9).await.map(|r| r.downloads), Some(1));
        assert!(store.is_empty().await);
        let leftovers = std::fs::read_dir(dir.path()).expect("read").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_oversize_sends_fallback_page() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(CorrelationStore::new(Duration::from_secs(60), 10));
        let key = issue(&store).await;

        let mut notifier = lenient_notifier();
        notifier
            .expect_send_media()
            .times(1)
            .withf(|_, media| {
                media.kind == DeliveryKind::Document
                    && media.path.to_string_lossy().ends_with(".fallback.html")
                    && std::fs::read_to_string(&media.path)
                        .is_ok_and(|page| page.contains("https://x.com/a"))
            })
            .returning(|_, _| Ok(()));

        let ctx = WorkerContext::new(
            JobQueue::new(1),
            store,
            Arc::new(UsageLedger::new()),
            Arc::new(writing_fetcher(4096)),
            Arc::new(notifier),
            config(dir.path()),
        );
        run_one(0, &ctx, job(&key)).await;

        assert_eq!(std::fs::read_dir(dir.path()).expect("read").count(), 0);
    }

    #[tokio::test]
    async fn test_expired_key_skips_fetch_and_keeps_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut fetcher = MockMediaFetcher::new();
        fetcher.expect_fetch().never();

        let mut notifier = MockNotifier::new();
        notifier.expect_edit_message().never();
        notifier
            .expect_send_message()
            .times(1)
            .withf(|_, text, _, reply_to| {
                text.contains("Link expired") && *reply_to == Some(MessageRef(4))
            })
            .returning(|_, _, _, _| Ok(MessageRef(8)));

        let ctx = WorkerContext::new(
            JobQueue::new(1),
            Arc::new(CorrelationStore::new(Duration::from_secs(60), 10)),
            Arc::new(UsageLedger::new()),
            Arc::new(fetcher),
            Arc::new(notifier),
            config(dir.path()),
        );
        run_one(0, &ctx, job("gone")).await;
    }

    #[tokio::test]
    async fn test_credential_retry_then_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("twitter_cookies.txt"), "# cookies").expect("write");
        let store = Arc::new(CorrelationStore::new(Duration::from_secs(60), 10));
        let key = issue(&store).await;
        let ledger = Arc::new(UsageLedger::new());

        let mut fetcher = MockMediaFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .withf(|_, opts| opts.credential_file.is_none())
            .returning(|_, _| Err(FetchError::NoResult));
        fetcher
            .expect_fetch()
            .times(1)
            .withf(|_, opts| opts.credential_file.is_some())
            .returning(|_, _| Err(FetchError::NoResult));

        let mut notifier = MockNotifier::new();
        notifier
            .expect_edit_message()
            .times(1)
            .withf(|_, _, text, _| text.contains("Download failed"))
            .returning(|_, _, _, _| Ok(()));

        let ctx = WorkerContext::new(
            JobQueue::new(1),
            store.clone(),
            ledger.clone(),
            Arc::new(fetcher),
            Arc::new(notifier),
            config(dir.path()),
        );
        run_one(0, &ctx, job(&key)).await;

        assert!(ledger.get(9).await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failure_edit_falls_back_to_new_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(CorrelationStore::new(Duration::from_secs(60), 10));
        let key = issue(&store).await;

        let mut fetcher = MockMediaFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_, _| Err(FetchError::Failed("boom".to_string())));

        let mut notifier = MockNotifier::new();
        notifier
            .expect_edit_message()
            .returning(|_, _, _, _| Err(NotifyError::NotFound));
        notifier
            .expect_send_message()
            .times(1)
            .returning(|_, _, _, _| Ok(MessageRef(50)));

        let ctx = WorkerContext::new(
            JobQueue::new(1),
            store,
            Arc::new(UsageLedger::new()),
            Arc::new(fetcher),
            Arc::new(notifier),
            config(dir.path()),
        );
        run_one(0, &ctx, job(&key)).await;
    }

    #[tokio::test]
    async fn test_cleanup_spares_jobs_with_longer_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("dl_1_4_100_1.mp4"), b"a").expect("write");
        std::fs::write(dir.path().join("dl_1_4_100_10.mp4"), b"b").expect("write");
        std::fs::write(dir.path().join("dl_1_4_100_10.mp3"), b"c").expect("write");

        let outcome = FetchOutcome {
            title: None,
            ext: Some("webm".to_string()),
            thumbnail: None,
            artifact: None,
        };
        let found = locate_artifact(dir.path(), "dl_1_4_100_1", &outcome, MediaKind::Video, false)
            .await
            .expect("artifact");
        assert_eq!(found, dir.path().join("dl_1_4_100_1.mp4"));

        assert_eq!(remove_prefixed(dir.path(), "dl_1_4_100_1.").await, 1);
        assert!(dir.path().join("dl_1_4_100_10.mp4").exists());
        assert!(dir.path().join("dl_1_4_100_10.mp3").exists());
    }

    #[test]
    fn test_fallback_page_escapes_url() {
        let page = fallback_page("https://x.com/a?b=1&c=\"2\"");
        assert!(page.contains("href=\"https://x.com/a?b=1&amp;c=&quot;2&quot;\""));
    }
}
