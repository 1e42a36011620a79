//! Download worker binary.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tubeq_media::{check_ffmpeg, check_ytdlp, MediaFetchService, YtDlpFetcher};
use tubeq_queue::{
    JobEvents, LocalBroadcaster, MemoryQueue, ProgressBroadcaster, QueueBackend, QueueConfig,
    QueueRepository, RedisBroadcaster, RedisQueue,
};
use tubeq_worker::{metrics, CleanupScheduler, JobControls, JobExecutor, StallReaper, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for rediss:// connections).
    // Fails only if a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tubeq=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting tubeq-worker");

    let config = WorkerConfig::from_env()?;
    info!("Worker config: {:?}", config);

    if let Some(port) = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
    {
        metrics::init_metrics(port)?;
        info!("Prometheus metrics on :{}", port);
    }

    if let Err(e) = check_ytdlp().and_then(|_| check_ffmpeg()) {
        error!("Media tooling unavailable: {}", e);
        return Err(e.into());
    }
    tokio::fs::create_dir_all(&config.work_dir).await?;
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let queue_config = QueueConfig::from_env();
    let (repo, broadcaster): (Arc<dyn QueueRepository>, Arc<dyn ProgressBroadcaster>) =
        match queue_config.backend {
            QueueBackend::Redis => {
                let queue = RedisQueue::connect(&queue_config).await?;
                let broadcaster =
                    RedisBroadcaster::connect(&queue_config.redis_url, queue_config.prefix.clone())
                        .await?;
                (Arc::new(queue), Arc::new(broadcaster))
            }
            QueueBackend::Memory => {
                warn!("Using in-memory queue; jobs do not survive a restart");
                (Arc::new(MemoryQueue::new()), Arc::new(LocalBroadcaster::new()))
            }
        };

    let media: Arc<dyn MediaFetchService> = Arc::new(YtDlpFetcher::new(&config.work_dir));
    let events = JobEvents::new(broadcaster);

    let reaper = StallReaper::new(&config, Arc::clone(&repo), events.clone());
    let cleanup = CleanupScheduler::new(&config, Arc::clone(&repo));
    let executor = Arc::new(JobExecutor::new(
        config,
        repo,
        media,
        events,
        JobControls::new(),
    ));

    let reaper_task = tokio::spawn(reaper.run(executor.subscribe_shutdown()));
    let cleanup_task = tokio::spawn(cleanup.run(executor.subscribe_shutdown()));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        return Err(e.into());
    }

    reaper_task.await.ok();
    cleanup_task.await.ok();
    info!("Worker shutdown complete");
    Ok(())
}
