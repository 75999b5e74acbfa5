//! Cron scheduler.
//!
//! Instead of a cron library, a single background task wakes on a short
//! cadence, checks the registered repeatable jobs against the current
//! minute, and enqueues an instance per due schedule. Instance ids are
//! `<schedule-id>:<minute-bucket>`, so a restart (or an overlapping
//! tick) collapses onto the already-enqueued instance.

pub mod cron;

use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::jobs::job_names;
use crate::queue::{names, EnqueueOptions, JobQueue, RepeatableJob};
use crate::types::JenguError;

/// Tick cadence. Sub-minute so a slow tick can't skip a whole minute;
/// bucket-stable ids make the extra checks free.
const TICK_INTERVAL: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Standing schedules
// ---------------------------------------------------------------------------

/// Daily competitor price refresh for properties whose scrape is due.
pub const COMPETITOR_DAILY: &str = "competitor-daily";
pub const COMPETITOR_DAILY_CRON: &str = "0 2 * * *";

/// Daily neighborhood-index computation for graphed properties.
pub const INDEX_DAILY: &str = "index-daily";
pub const INDEX_DAILY_CRON: &str = "0 3 * * *";

/// Daily graph construction for properties still lacking one.
pub const GRAPH_BUILD: &str = "competitor-graph-build";
pub const GRAPH_BUILD_CRON: &str = "0 4 * * *";

/// Register the three standing schedules. Stable ids make this
/// idempotent across restarts.
pub async fn register_standing_schedules(queue: &dyn JobQueue) -> Result<(), JenguError> {
    queue
        .schedule_repeatable(RepeatableJob {
            id: COMPETITOR_DAILY.to_string(),
            queue: names::COMPETITOR.to_string(),
            name: job_names::SCRAPE_SWEEP.to_string(),
            cron_expr: COMPETITOR_DAILY_CRON.to_string(),
            payload: json!({}),
        })
        .await?;
    queue
        .schedule_repeatable(RepeatableJob {
            id: INDEX_DAILY.to_string(),
            queue: names::ANALYTICS.to_string(),
            name: job_names::INDEX_SWEEP.to_string(),
            cron_expr: INDEX_DAILY_CRON.to_string(),
            payload: json!({}),
        })
        .await?;
    queue
        .schedule_repeatable(RepeatableJob {
            id: GRAPH_BUILD.to_string(),
            queue: names::COMPETITOR.to_string(),
            name: job_names::GRAPH_BUILD_SWEEP.to_string(),
            cron_expr: GRAPH_BUILD_CRON.to_string(),
            payload: json!({}),
        })
        .await?;
    info!("Standing schedules registered");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// Check every repeatable against the current minute and enqueue due
/// instances. Returns the number of instances enqueued.
pub async fn tick(queue: &dyn JobQueue, now: DateTime<Utc>) -> Result<usize, JenguError> {
    let minute = now.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(now);
    let bucket = minute.timestamp();
    let mut enqueued = 0;

    for repeatable in queue.repeatables().await? {
        let expr = match cron::parse(&repeatable.cron_expr) {
            Ok(expr) => expr,
            Err(e) => {
                warn!(
                    schedule = %repeatable.id,
                    cron = %repeatable.cron_expr,
                    error = %e,
                    "Skipping repeatable with invalid cron expression"
                );
                continue;
            }
        };
        if !expr.matches(minute) {
            continue;
        }

        let instance_id = format!("{}:{bucket}", repeatable.id);
        let opts = EnqueueOptions {
            job_id: Some(instance_id.clone()),
            ..Default::default()
        };
        queue
            .enqueue(&repeatable.queue, &repeatable.name, repeatable.payload.clone(), opts)
            .await?;
        debug!(schedule = %repeatable.id, instance = %instance_id, "Schedule fired");
        enqueued += 1;
    }

    Ok(enqueued)
}

/// Spawn the scheduler loop.
pub fn spawn_scheduler(
    queue: Arc<dyn JobQueue>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tick(queue.as_ref(), Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => info!(instances = n, "Scheduler tick enqueued instances"),
                        Err(e) => warn!(error = %e, "Scheduler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
