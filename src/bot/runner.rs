use super::handlers::{self, BotContext, Command};
use super::transport::TelegramNotifier;
use crate::config::Settings;
use crate::download::correlation::CorrelationStore;
use crate::download::fetcher::{probe_merge_capability, YtDlpFetcher};
use crate::download::janitor;
use crate::download::ledger::{Persistence, UsageLedger};
use crate::download::notifier::Notifier;
use crate::download::queue::JobQueue;
use crate::download::quota::QuotaGate;
use crate::download::service::DownloadService;
use crate::download::worker::{WorkerConfig, WorkerContext, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::{ShutdownToken, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::utils::command::BotCommands;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Longest wait for in-flight jobs at shutdown
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the Telegram transport runtime until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the temp directory cannot be created.
pub async fn run_bot(settings: Arc<Settings>) -> anyhow::Result<()> {
    let bot = Bot::new(settings.telegram_token.clone());
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone()));
    let token = CancellationToken::new();

    let correlations = Arc::new(CorrelationStore::new(
        settings.correlation_ttl(),
        settings.correlation_max_entries,
    ));
    let gate = Arc::new(QuotaGate::new(
        settings.cooldown(),
        settings.daily_limit,
        settings.rate_limited(),
    ));
    let ledger = Arc::new(UsageLedger::new());
    let persistence = Arc::new(Persistence::new(
        settings.usage_file.clone(),
        settings.quota_file.clone(),
    ));
    persistence.load_into(&ledger, &gate).await;

    tokio::fs::create_dir_all(&settings.tmp_dir).await?;
    let merge_capable = probe_merge_capability(&settings.ffmpeg_path).await;

    let queue = JobQueue::new(settings.queue_capacity);
    let worker_ctx = Arc::new(WorkerContext::new(
        queue.clone(),
        correlations.clone(),
        ledger.clone(),
        Arc::new(YtDlpFetcher::new(settings.ytdlp_path.clone())),
        notifier.clone(),
        WorkerConfig {
            tmp_dir: settings.tmp_dir.clone(),
            cookies_dir: settings.cookies_dir.clone(),
            max_send_bytes: settings.max_send_bytes(),
            merge_capable,
            bot_name: settings.bot_name.clone(),
        },
    ));
    let pool = WorkerPool::spawn(worker_ctx, settings.max_workers, token.clone());
    let background = spawn_background(&settings, &persistence, &ledger, &gate, &correlations, &token);

    let ctx = Arc::new(BotContext {
        service: Arc::new(DownloadService::new(
            correlations,
            gate.clone(),
            queue,
            ledger.clone(),
            notifier,
        )),
        settings: settings.clone(),
        workers: pool.size(),
    });

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!(error = %e, "Failed to register bot commands");
    }

    info!(
        workers = pool.size(),
        queue_capacity = settings.queue_capacity,
        merge_capable,
        "Bot is running..."
    );

    let mut dispatcher = Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![ctx])
        .enable_ctrlc_handler()
        .build();
    spawn_sigterm_listener(dispatcher.shutdown_token());
    dispatcher.dispatch().await;

    info!("Dispatcher stopped, shutting down");
    token.cancel();
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, pool.join()).await.is_err() {
        warn!("Workers did not finish in time");
    }
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task ended abnormally");
        }
    }

    match persistence.save(&ledger, &gate).await {
        Ok(()) => info!("Final state saved"),
        Err(e) => error!(error = %e, "Final save failed"),
    }
    Ok(())
}

fn spawn_background(
    settings: &Settings,
    persistence: &Arc<Persistence>,
    ledger: &Arc<UsageLedger>,
    gate: &Arc<QuotaGate>,
    correlations: &Arc<CorrelationStore>,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        persistence.clone().spawn_autosave(
            ledger.clone(),
            gate.clone(),
            Duration::from_secs(settings.autosave_interval_secs.max(1)),
            token.clone(),
        ),
        janitor::spawn_temp_cleaner(
            settings.tmp_dir.clone(),
            Duration::from_secs(settings.tmp_clean_interval_secs.max(1)),
            token.clone(),
        ),
        janitor::spawn_sweeper(
            correlations.clone(),
            gate.clone(),
            Duration::from_secs(settings.correlation_sweep_interval_secs.max(1)),
            token.clone(),
        ),
    ]
}

#[cfg(unix)]
fn spawn_sigterm_listener(shutdown: ShutdownToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                return;
            }
        };
        sigterm.recv().await;
        info!("SIGTERM received");
        if let Ok(done) = shutdown.shutdown() {
            done.await;
        }
    });
}

#[cfg(not(unix))]
fn spawn_sigterm_listener(_shutdown: ShutdownToken) {}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handle_callback))
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(
                    dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text),
                ),
        )
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<BotContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_command(bot, msg, cmd, ctx).await {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_text(msg: Message, ctx: Arc<BotContext>) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_text(msg, ctx).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    ctx: Arc<BotContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_callback(bot, q, ctx).await {
        error!("Callback handler error: {}", e);
    }
    respond(())
}
