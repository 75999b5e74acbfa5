//! End-to-end enrichment through the worker pool: batching, cache
//! idempotence, the auto-analytics chain, and progress event ordering.

use std::time::Duration;

use jengu::jobs::{enqueue_job, EnrichPayload, JobSpec};
use jengu::progress::ProgressEvent;
use jengu::queue::{names, EnqueueOptions, JobQueue};
use jengu::store::Store;
use jengu::types::{EnrichmentStatus, JobState};
use jengu::workers::{PoolConfig, WorkerPool};
use tokio::sync::watch;

use crate::mocks::TestRig;

fn pool_config(queue_name: &str, concurrency: usize) -> PoolConfig {
    PoolConfig {
        queue_name: queue_name.to_string(),
        concurrency,
        starts_per_window: None,
        job_timeout: Duration::from_secs(10),
        idle_poll: Duration::from_millis(10),
    }
}

async fn wait_for_terminal(rig: &TestRig, job_id: &str) -> jengu::queue::JobDescriptor {
    for _ in 0..500 {
        if let Some(job) = rig.queue.get(job_id).await.unwrap() {
            if job.state.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never finished");
}

#[tokio::test]
async fn test_enrichment_batches_upstream_and_is_idempotent() {
    // 30 dates: one batched weather request plus one holiday year on
    // the first run; zero upstream calls and unchanged rows on the second.
    let rig = TestRig::new();
    rig.seed_property("prop-1", 30).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let enrichment_pool = WorkerPool::spawn(
        pool_config(names::ENRICHMENT, 3),
        rig.queue.clone(),
        rig.dispatcher.clone(),
        rig.bus.clone(),
        shutdown_rx.clone(),
    );
    let analytics_pool = WorkerPool::spawn(
        pool_config(names::ANALYTICS, 2),
        rig.queue.clone(),
        rig.dispatcher.clone(),
        rig.bus.clone(),
        shutdown_rx,
    );

    let spec = JobSpec::Enrich(EnrichPayload {
        property_id: "prop-1".to_string(),
    });
    let first_id = enqueue_job(rig.queue.as_ref(), &spec, EnqueueOptions::default())
        .await
        .unwrap();
    let job = wait_for_terminal(&rig, &first_id).await;
    assert_eq!(job.state, JobState::Completed);

    assert_eq!(rig.weather.calls(), 1, "one batched range request");
    assert_eq!(rig.holidays.calls(), 1, "one year of holidays");

    let after_first = rig.store.rows_for_property("prop-1").await.unwrap();
    assert!(after_first.iter().all(|r| r.has_weather()));
    assert_eq!(
        after_first[0].weather_description.as_deref(),
        Some("Rainy"),
        "WMO 61 maps to Rainy"
    );
    assert_eq!(after_first[0].is_holiday, Some(true), "Jan 1 is a holiday");

    // Second run: no fresh upstream traffic, no row changes.
    tokio::time::sleep(Duration::from_millis(5)).await; // distinct job id millis
    let second_id = enqueue_job(rig.queue.as_ref(), &spec, EnqueueOptions::default())
        .await
        .unwrap();
    assert_ne!(second_id, first_id);
    let job = wait_for_terminal(&rig, &second_id).await;
    assert_eq!(job.state, JobState::Completed);

    assert_eq!(rig.weather.calls(), 1, "repeat run served from cache");
    assert_eq!(rig.holidays.calls(), 1);

    let after_second = rig.store.rows_for_property("prop-1").await.unwrap();
    for (a, b) in after_first.iter().zip(after_second.iter()) {
        assert_eq!(
            serde_json::to_value(a).unwrap(),
            serde_json::to_value(b).unwrap()
        );
    }

    let property = rig.store.get_property("prop-1").await.unwrap().unwrap();
    assert_eq!(property.enrichment_status, EnrichmentStatus::Completed);

    shutdown_tx.send(true).unwrap();
    enrichment_pool.shutdown(Duration::from_secs(1)).await;
    analytics_pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_enrichment_chains_analytics_summary() {
    // Completion auto-enqueues exactly one low-priority summary job
    // for the same property.
    let rig = TestRig::new();
    rig.seed_property("prop-1", 5).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let enrichment_pool = WorkerPool::spawn(
        pool_config(names::ENRICHMENT, 1),
        rig.queue.clone(),
        rig.dispatcher.clone(),
        rig.bus.clone(),
        shutdown_rx,
    );

    let spec = JobSpec::Enrich(EnrichPayload {
        property_id: "prop-1".to_string(),
    });
    let job_id = enqueue_job(rig.queue.as_ref(), &spec, EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_terminal(&rig, &job_id).await;

    // No analytics pool is running, so the chained job sits waiting.
    let (summary, _lease) = rig
        .queue
        .dequeue(names::ANALYTICS, "inspector")
        .await
        .unwrap()
        .expect("summary job chained");
    assert_eq!(summary.name, "summary");
    assert_eq!(summary.priority, jengu::queue::priority::LOW);
    assert_eq!(summary.payload["property_id"], "prop-1");
    assert!(
        rig.queue
            .dequeue(names::ANALYTICS, "inspector")
            .await
            .unwrap()
            .is_none(),
        "exactly one"
    );

    shutdown_tx.send(true).unwrap();
    enrichment_pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_progress_events_are_monotone() {
    let rig = TestRig::new();
    rig.seed_property("prop-1", 10).await;

    let spec = JobSpec::Enrich(EnrichPayload {
        property_id: "prop-1".to_string(),
    });
    let job_id = enqueue_job(rig.queue.as_ref(), &spec, EnqueueOptions::default())
        .await
        .unwrap();
    let mut events = rig.bus.subscribe(&job_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::spawn(
        pool_config(names::ENRICHMENT, 1),
        rig.queue.clone(),
        rig.dispatcher.clone(),
        rig.bus.clone(),
        shutdown_rx,
    );
    wait_for_terminal(&rig, &job_id).await;

    let mut progress_seen = Vec::new();
    let mut saw_active = false;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::Active { .. } => saw_active = true,
            ProgressEvent::Progress { progress, .. } => progress_seen.push(progress),
            ProgressEvent::Completed { .. } => saw_completed = true,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_active);
    assert!(saw_completed);
    assert!(!progress_seen.is_empty());
    assert!(
        progress_seen.windows(2).all(|w| w[0] <= w[1]),
        "monotone sequence: {progress_seen:?}"
    );

    shutdown_tx.send(true).unwrap();
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_repeat_run_at_same_fingerprint_is_all_cache_hits() {
    // Two properties at the same coordinates and dates: the first run
    // warms the cache, the second consumes it without a single miss —
    // repeat-run hit ratio 100%, comfortably past the 80% floor.
    let rig = TestRig::new();
    rig.seed_property("prop-1", 20).await;
    rig.seed_property("prop-2", 20).await;

    let progress = jengu::enrichment::no_progress();
    let descriptor = |property_id: &str| {
        let spec = JobSpec::Enrich(EnrichPayload {
            property_id: property_id.to_string(),
        });
        jengu::queue::JobDescriptor {
            job_id: format!("enrich-{property_id}-1"),
            queue: names::ENRICHMENT.to_string(),
            name: "enrich".to_string(),
            payload: spec.payload(),
            priority: 5,
            attempts_made: 1,
            max_attempts: 3,
            backoff: jengu::queue::Backoff::default(),
            scheduled_at: chrono::Utc::now(),
            state: JobState::Active,
            progress: 0,
            return_value: None,
            last_error: None,
            created_at: chrono::Utc::now(),
            processed_on: None,
            finished_on: None,
        }
    };

    rig.dispatcher
        .run(&descriptor("prop-1"), &progress)
        .await
        .unwrap();
    let misses_after_warmup = rig.cache.misses();
    let hits_after_warmup = rig.cache.hits();

    rig.dispatcher
        .run(&descriptor("prop-2"), &progress)
        .await
        .unwrap();

    assert_eq!(rig.weather.calls(), 1, "warm run needs no upstream fetch");
    assert_eq!(rig.holidays.calls(), 1);
    assert_eq!(
        rig.cache.misses(),
        misses_after_warmup,
        "warm run has zero misses"
    );
    assert!(
        rig.cache.hits() >= hits_after_warmup + 20,
        "every date served from cache"
    );
}
