//! Scheduler-driven maintenance chain: graph build → competitor scrape
//! → neighborhood index, end-to-end through the dispatcher.

use chrono::{TimeZone, Utc};
use std::time::Duration;

use jengu::jobs::CompetitorScraper;
use jengu::queue::{names, JobQueue};
use jengu::scheduler;
use jengu::store::Store;
use jengu::types::JobState;
use jengu::workers::{PoolConfig, WorkerPool};
use tokio::sync::watch;

use crate::mocks::TestRig;

fn pool_config(queue_name: &str) -> PoolConfig {
    PoolConfig {
        queue_name: queue_name.to_string(),
        concurrency: 2,
        starts_per_window: None,
        job_timeout: Duration::from_secs(10),
        idle_poll: Duration::from_millis(10),
    }
}

async fn wait_until<F, Fut>(rig: &TestRig, predicate: F)
where
    F: Fn(&TestRig) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if predicate(rig).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_daily_chain_builds_graph_scrapes_and_indexes() {
    let rig = TestRig::new();
    rig.seed_property("prop-1", 10).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let competitor_pool = WorkerPool::spawn(
        pool_config(names::COMPETITOR),
        rig.queue.clone(),
        rig.dispatcher.clone(),
        rig.bus.clone(),
        shutdown_rx.clone(),
    );
    let analytics_pool = WorkerPool::spawn(
        pool_config(names::ANALYTICS),
        rig.queue.clone(),
        rig.dispatcher.clone(),
        rig.bus.clone(),
        shutdown_rx,
    );

    scheduler::register_standing_schedules(rig.queue.as_ref())
        .await
        .unwrap();

    // 04:00 — graph build sweep discovers competitors for prop-1.
    let t_graph = Utc.with_ymd_and_hms(2024, 6, 3, 4, 0, 0).unwrap();
    assert_eq!(scheduler::tick(rig.queue.as_ref(), t_graph).await.unwrap(), 1);
    wait_until(&rig, |rig| {
        let store = rig.store.clone();
        async move { !store.competitors_for("prop-1").await.unwrap().is_empty() }
    })
    .await;

    let competitors = rig.store.competitors_for("prop-1").await.unwrap();
    assert_eq!(competitors.len(), 5, "mock discovery yields 5 rivals");

    // The build sets the first scrape due immediately; 02:00 next day
    // fires the scrape sweep.
    let t_scrape = Utc.with_ymd_and_hms(2024, 6, 4, 2, 0, 0).unwrap();
    assert_eq!(scheduler::tick(rig.queue.as_ref(), t_scrape).await.unwrap(), 1);
    wait_until(&rig, |rig| {
        let scraper = rig.scraper.clone();
        async move { scraper.scrapes() >= 1 }
    })
    .await;

    wait_until(&rig, |rig| {
        let store = rig.store.clone();
        async move {
            store
                .competitors_for("prop-1")
                .await
                .unwrap()
                .iter()
                .all(|c| c.last_price.is_some())
        }
    })
    .await;

    // The property's next scrape moved ~24h out.
    let property = rig.store.get_property("prop-1").await.unwrap().unwrap();
    assert!(property.next_scrape_at.unwrap() > Utc::now() + chrono::Duration::hours(20));

    // 03:00 — index sweep computes today's neighborhood index.
    let t_index = Utc.with_ymd_and_hms(2024, 6, 4, 3, 0, 0).unwrap();
    assert_eq!(scheduler::tick(rig.queue.as_ref(), t_index).await.unwrap(), 1);
    wait_until(&rig, |rig| {
        let store = rig.store.clone();
        async move { store.latest_index("prop-1").await.unwrap().is_some() }
    })
    .await;

    let index = rig.store.latest_index("prop-1").await.unwrap().unwrap();
    assert_eq!(index.competitors_analyzed, 5);
    assert!(index.overall_index > 0.0 && index.overall_index <= 100.0);

    shutdown_tx.send(true).unwrap();
    competitor_pool.shutdown(Duration::from_secs(1)).await;
    analytics_pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_scheduler_instances_survive_restart_without_duplication() {
    let rig = TestRig::new();
    scheduler::register_standing_schedules(rig.queue.as_ref())
        .await
        .unwrap();

    let t = Utc.with_ymd_and_hms(2024, 6, 3, 2, 0, 0).unwrap();
    scheduler::tick(rig.queue.as_ref(), t).await.unwrap();
    // "Restart": registration and tick happen again within the minute.
    scheduler::register_standing_schedules(rig.queue.as_ref())
        .await
        .unwrap();
    scheduler::tick(rig.queue.as_ref(), t).await.unwrap();

    let (first, lease) = rig
        .queue
        .dequeue(names::COMPETITOR, "w")
        .await
        .unwrap()
        .unwrap();
    assert!(first.job_id.starts_with("competitor-daily:"));
    rig.queue
        .complete(&lease, serde_json::json!(null))
        .await
        .unwrap();
    assert!(
        rig.queue
            .dequeue(names::COMPETITOR, "w")
            .await
            .unwrap()
            .is_none(),
        "one instance per minute bucket"
    );
}

#[tokio::test]
async fn test_scrape_failure_retries_then_fails() {
    let rig = TestRig::new();
    rig.seed_property("prop-1", 3).await;

    // Graph exists but the scraper is down.
    let competitors = rig
        .scraper
        .discover(
            &rig.store.get_property("prop-1").await.unwrap().unwrap(),
            5,
        )
        .await
        .unwrap();
    rig.store
        .replace_competitors("prop-1", &competitors)
        .await
        .unwrap();
    rig.scraper.set_error("scraper offline");

    let job_id = rig
        .queue
        .enqueue(
            names::COMPETITOR,
            "scrape",
            serde_json::json!({
                "property_id": "prop-1",
                "location": {"latitude": 48.85, "longitude": 2.35}
            }),
            jengu::queue::EnqueueOptions {
                max_attempts: 2,
                backoff: jengu::queue::Backoff::new(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::spawn(
        pool_config(names::COMPETITOR),
        rig.queue.clone(),
        rig.dispatcher.clone(),
        rig.bus.clone(),
        shutdown_rx,
    );

    for _ in 0..500 {
        if let Some(job) = rig.queue.get(&job_id).await.unwrap() {
            if job.state == JobState::Failed {
                assert_eq!(job.attempts_made, 2, "transient error used both attempts");
                assert!(job.last_error.unwrap().contains("scraper offline"));
                shutdown_tx.send(true).unwrap();
                pool.shutdown(Duration::from_secs(1)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scrape job never failed terminally");
}
