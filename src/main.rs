//! JENGU — Hospitality Pricing Enrichment & Analytics Service
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the store, queue, pipeline, worker pools, scheduler, and API
//! server, and runs until SIGINT/SIGTERM triggers a graceful drain.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use jengu::auth::rate_limit::SlidingWindowLimiter;
use jengu::auth::{Authenticator, NoSessionAuth};
use jengu::cache::EnrichmentCache;
use jengu::config::AppConfig;
use jengu::enrichment::EnrichmentPipeline;
use jengu::fetchers::geocode::GeocodeClient;
use jengu::fetchers::holidays::HolidayClient;
use jengu::fetchers::weather::WeatherClient;
use jengu::index::IndexEngine;
use jengu::jobs::handlers::{Dispatcher, JobContext};
use jengu::jobs::UnconfiguredScraper;
use jengu::progress::ProgressBus;
use jengu::queue::sqlite::SqliteQueue;
use jengu::queue::{names, JobQueue, RetentionPolicy};
use jengu::scheduler;
use jengu::server::{spawn_server, ServerState};
use jengu::store::sqlite::SqliteStore;
use jengu::workers::{spawn_maintenance, PoolConfig, WorkerPool};

const BANNER: &str = r#"
     _ _____ _   _  ____ _   _
    | | ____| \ | |/ ___| | | |
 _  | |  _| |  \| | |  _| | | |
| |_| | |___| |\  | |_| | |_| |
 \___/|_____|_| \_|\____|\___/

  Hospitality Pricing Enrichment & Analytics
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;
    init_logging();

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        port = cfg.service.port,
        database = %cfg.service.database_path,
        "JENGU starting up"
    );
    info!(
        enrichment = cfg.workers.enrichment_concurrency,
        competitor = cfg.workers.competitor_concurrency,
        analytics = cfg.workers.analytics_concurrency,
        enrichment_starts_per_minute = cfg.workers.enrichment_starts_per_minute,
        "Worker configuration loaded"
    );
    info!(
        auto_analytics = cfg.enrichment.auto_analytics,
        holidays_enabled = cfg.enrichment.holidays_enabled,
        "Enrichment configuration loaded"
    );

    let cfg = Arc::new(cfg);

    // -- Storage & queue --------------------------------------------------
    let store = Arc::new(SqliteStore::open(&cfg.service.database_path).await?);
    let queue: Arc<dyn JobQueue> = Arc::new(
        SqliteQueue::open(
            &cfg.service.database_path,
            cfg.queue.lease_secs,
            RetentionPolicy {
                age_secs: cfg.queue.remove_on_complete_age_secs,
                max_count: cfg.queue.remove_on_complete_max_count,
            },
            RetentionPolicy {
                age_secs: cfg.queue.remove_on_fail_age_secs,
                max_count: cfg.queue.remove_on_fail_max_count,
            },
        )
        .await?,
    );

    // -- Enrichment stack -------------------------------------------------
    let cache = Arc::new(EnrichmentCache::new());
    let pipeline = Arc::new(EnrichmentPipeline::new(
        cache.clone(),
        Arc::new(WeatherClient::new(&cfg.fetchers)?),
        Arc::new(HolidayClient::new(&cfg.fetchers)?),
        Arc::new(GeocodeClient::new(&cfg.fetchers)?),
        cfg.enrichment.holidays_enabled,
    ));

    let bus = Arc::new(ProgressBus::new());
    let dispatcher = Arc::new(Dispatcher::new(JobContext {
        config: cfg.clone(),
        store: store.clone(),
        queue: queue.clone(),
        pipeline,
        index: Arc::new(IndexEngine::new()),
        scraper: Arc::new(UnconfiguredScraper),
    }));

    // -- Workers, scheduler, maintenance ----------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let job_timeout = Duration::from_secs(cfg.queue.job_timeout_secs);
    let idle_poll = Duration::from_millis(cfg.workers.idle_poll_ms);

    let pools = vec![
        WorkerPool::spawn(
            PoolConfig {
                queue_name: names::ENRICHMENT.to_string(),
                concurrency: cfg.workers.enrichment_concurrency,
                starts_per_window: Some((
                    cfg.workers.enrichment_starts_per_minute as usize,
                    Duration::from_secs(60),
                )),
                job_timeout,
                idle_poll,
            },
            queue.clone(),
            dispatcher.clone(),
            bus.clone(),
            shutdown_rx.clone(),
        ),
        WorkerPool::spawn(
            PoolConfig {
                queue_name: names::COMPETITOR.to_string(),
                concurrency: cfg.workers.competitor_concurrency,
                starts_per_window: None,
                job_timeout,
                idle_poll,
            },
            queue.clone(),
            dispatcher.clone(),
            bus.clone(),
            shutdown_rx.clone(),
        ),
        WorkerPool::spawn(
            PoolConfig {
                queue_name: names::ANALYTICS.to_string(),
                concurrency: cfg.workers.analytics_concurrency,
                starts_per_window: None,
                job_timeout,
                idle_poll,
            },
            queue.clone(),
            dispatcher.clone(),
            bus.clone(),
            shutdown_rx.clone(),
        ),
    ];

    let maintenance = spawn_maintenance(
        queue.clone(),
        cache,
        bus.clone(),
        Duration::from_secs(cfg.workers.lease_sweep_secs),
        shutdown_rx.clone(),
    );

    let scheduler_handle = if cfg.scheduler.enabled {
        scheduler::register_standing_schedules(queue.as_ref()).await?;
        Some(scheduler::spawn_scheduler(queue.clone(), shutdown_rx.clone()))
    } else {
        info!("Scheduler disabled by configuration");
        None
    };

    // -- API server -------------------------------------------------------
    let (authenticator, usage_writer) =
        Authenticator::new(store.clone(), &cfg.auth.key_prefix, Arc::new(NoSessionAuth));
    let state = Arc::new(ServerState {
        config: cfg.clone(),
        store: store.clone(),
        queue: queue.clone(),
        bus: bus.clone(),
        auth: Arc::new(authenticator),
        limiter: Arc::new(SlidingWindowLimiter::new()),
    });
    spawn_server(state, cfg.service.port)?;

    info!("JENGU running. Press Ctrl+C to stop.");
    wait_for_shutdown().await;

    // -- Graceful drain ---------------------------------------------------
    info!("Shutdown signal received. Draining workers...");
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(cfg.workers.shutdown_grace_secs);
    for pool in pools {
        pool.shutdown(grace).await;
    }
    if let Some(handle) = scheduler_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), maintenance).await;
    // Release any leases stragglers still hold so a restart picks the
    // jobs up immediately.
    let _ = queue.recover_leases().await;
    drop(usage_writer);

    info!("JENGU shut down cleanly.");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Initialise the `tracing` subscriber.
///
/// - In development (RUST_LOG set), uses human-readable format.
/// - With JENGU_LOG_JSON set, uses structured JSON logging to stdout.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jengu=info"));

    let json_logging = std::env::var("JENGU_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
