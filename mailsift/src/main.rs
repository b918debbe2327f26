use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use mailsift::analysis::OpenAiCompatAnalyzer;
use mailsift::api::{ApiServer, AppState};
use mailsift::archive::NoopArchiver;
use mailsift::config::AppConfig;
use mailsift::database::Database;
use mailsift::database::repositories::{
    SqlxCursorRepository, SqlxLockRepository, SqlxRecordRepository, SqlxScheduleRepository,
    SqlxTenantRepository,
};
use mailsift::events::EventBus;
use mailsift::lock::DistributedLock;
use mailsift::logging::init_logging;
use mailsift::notification::{
    LogChannel, NotificationChannel, ReminderDispatcher, WebhookChannel, WebhookConfig,
};
use mailsift::pipeline::{CursorStore, IngestionPipeline, ResultSink};
use mailsift::schedule::SqliteScheduler;
use mailsift::source::HttpMailboxSource;
use mailsift::task::TaskController;
use mailsift::utils::http_client::install_rustls_provider;
use mailsift::worker::AutoSyncWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    let logging = init_logging(&config.logging).context("initializing logging")?;
    install_rustls_provider();
    config.log_summary();

    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.child_token());

    let db = Database::open(&config.database_url)
        .await
        .context("opening database")?;

    let records = Arc::new(SqlxRecordRepository::new(db.pool.clone()));
    let schedule_repo = Arc::new(SqlxScheduleRepository::new(db.pool.clone()));

    let cursor = Arc::new(CursorStore::new(
        Arc::new(SqlxCursorRepository::new(db.pool.clone())),
        records.clone(),
    ));
    let sink = Arc::new(ResultSink::new(
        db.write_pool.clone(),
        records.clone(),
        Arc::new(SqliteScheduler::new(schedule_repo.clone())),
        Arc::new(NoopArchiver),
    ));
    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::new(HttpMailboxSource::new(config.source.clone())?),
        Arc::new(OpenAiCompatAnalyzer::new(config.analysis.clone())?),
        records,
        cursor,
        sink,
        config.pipeline.clone(),
    ));

    let lock = Arc::new(DistributedLock::new(
        Arc::new(SqlxLockRepository::new(db.pool.clone())),
        config.lock.clone(),
    ));
    let bus = Arc::new(EventBus::new(config.bus.clone()));
    let controller = Arc::new(TaskController::new(
        pipeline,
        lock,
        bus,
        config.task.clone(),
    ));

    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    channels.push(Arc::new(LogChannel));
    if let Some(url) = &config.reminder_webhook_url {
        channels.push(Arc::new(WebhookChannel::new(WebhookConfig::new(url.clone()))?));
    }
    let dispatcher = Arc::new(ReminderDispatcher::new(schedule_repo, channels));

    let worker = if config.auto_sync_enabled {
        let worker = Arc::new(AutoSyncWorker::new(
            controller.clone(),
            Arc::new(SqlxTenantRepository::new(db.pool.clone())),
            dispatcher.clone(),
            config.auto_sync.clone(),
        ));
        Some(worker.spawn(shutdown.child_token()))
    } else {
        tracing::info!("auto-sync disabled");
        None
    };

    let server = ApiServer::new(
        config.api.clone(),
        AppState::new(controller.clone(), dispatcher, config.analysis_workers),
        shutdown.child_token(),
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown requested");
        signal_token.cancel();
    });

    let served = server.run().await;
    shutdown.cancel();

    controller.shutdown().await;
    if let Some(worker) = worker
        && let Err(e) = worker.await
    {
        tracing::warn!(error = %e, "auto-sync worker ended abnormally");
    }
    db.close().await;

    served.context("running API server")?;
    tracing::info!("mailsift stopped");
    Ok(())
}
