//! Queue invariants under concurrency: single-consumer leases, priority
//! order, and idempotent enqueue.

use std::collections::HashSet;
use std::sync::Arc;

use jengu::queue::memory::MemoryQueue;
use jengu::queue::{names, EnqueueOptions, JobQueue};
use serde_json::json;

#[tokio::test]
async fn test_no_job_is_dequeued_twice_under_contention() {
    let queue = Arc::new(MemoryQueue::new(120));
    let mut expected = HashSet::new();
    for i in 0..50 {
        let id = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({ "i": i }),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        expected.insert(id);
    }

    // Eight consumers race over the backlog.
    let mut tasks = Vec::new();
    for w in 0..8 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let consumer = format!("w-{w}");
            let mut claimed = Vec::new();
            while let Some((job, lease)) =
                queue.dequeue(names::ENRICHMENT, &consumer).await.unwrap()
            {
                claimed.push(job.job_id.clone());
                queue.complete(&lease, json!(null)).await.unwrap();
            }
            claimed
        }));
    }

    let mut seen = Vec::new();
    for task in tasks {
        seen.extend(task.await.unwrap());
    }

    assert_eq!(seen.len(), 50, "every job processed exactly once");
    let unique: HashSet<&String> = seen.iter().collect();
    assert_eq!(unique.len(), 50, "no double-claims");
    assert_eq!(
        expected,
        seen.iter().cloned().collect::<HashSet<_>>(),
        "all jobs accounted for"
    );
}

#[tokio::test]
async fn test_priority_beats_arrival_order() {
    let queue = MemoryQueue::new(120);
    // Enqueue NORMAL first, then HIGH: HIGH must still dequeue first.
    queue
        .enqueue(names::ANALYTICS, "summary", json!({"rank": "normal"}), EnqueueOptions::default())
        .await
        .unwrap();
    queue
        .enqueue(
            names::ANALYTICS,
            "summary",
            json!({"rank": "high"}),
            EnqueueOptions {
                priority: jengu::queue::priority::HIGH,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (first, lease) = queue.dequeue(names::ANALYTICS, "w").await.unwrap().unwrap();
    assert_eq!(first.payload["rank"], "high");
    queue.complete(&lease, json!(null)).await.unwrap();

    let (second, _) = queue.dequeue(names::ANALYTICS, "w").await.unwrap().unwrap();
    assert_eq!(second.payload["rank"], "normal");
}

#[tokio::test]
async fn test_client_id_collapse_is_concurrency_safe() {
    let queue = Arc::new(MemoryQueue::new(120));
    let mut tasks = Vec::new();
    for i in 0..16 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue
                .enqueue(
                    names::ANALYTICS,
                    "neighborhood-index",
                    json!({ "attempt": i }),
                    EnqueueOptions {
                        job_id: Some("index-prop-1-2024-06-01".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), "index-prop-1-2024-06-01");
    }
    assert_eq!(queue.len(), 1);
}
