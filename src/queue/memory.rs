//! In-memory queue.
//!
//! Exercises the full `JobQueue` contract — priorities, delays, leases,
//! backoff, retention, repeatables — with all state behind one mutex.
//! Tests run against this implementation; production uses `sqlite`.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    names, Clock, EnqueueOptions, JobDescriptor, JobQueue, LeaseToken, RepeatableJob,
    RetentionPolicy, SystemClock,
};
use crate::types::{JenguError, JobState};

struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

struct JobRecord {
    descriptor: JobDescriptor,
    lease: Option<Lease>,
    /// Enqueue sequence number — FIFO tie-break within a priority.
    seq: u64,
    remove_on_complete: RetentionPolicy,
    remove_on_fail: RetentionPolicy,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    repeatables: HashMap<String, RepeatableJob>,
    next_seq: u64,
}

/// A fully in-memory `JobQueue`.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    lease_secs: i64,
}

impl MemoryQueue {
    pub fn new(lease_secs: u64) -> Self {
        Self::with_clock(lease_secs, Arc::new(SystemClock))
    }

    /// Construct with an injected clock — how the backoff and lease
    /// tests stay deterministic.
    pub fn with_clock(lease_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            lease_secs: lease_secs as i64,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Move due delayed jobs to waiting. Caller holds the lock.
    fn promote_due(inner: &mut Inner, now: DateTime<Utc>) {
        for record in inner.jobs.values_mut() {
            if record.descriptor.state == JobState::Delayed && record.descriptor.scheduled_at <= now
            {
                record.descriptor.state = JobState::Waiting;
            }
        }
    }

    /// Validate that `lease` is the current claim on an active job and
    /// hand back the record.
    fn claimed<'a>(
        inner: &'a mut Inner,
        lease: &LeaseToken,
    ) -> Result<&'a mut JobRecord, JenguError> {
        let record = inner
            .jobs
            .get_mut(&lease.job_id)
            .ok_or_else(|| JenguError::NotFound(format!("job {}", lease.job_id)))?;
        let held = record
            .lease
            .as_ref()
            .map(|l| l.token == lease.token)
            .unwrap_or(false);
        if record.descriptor.state != JobState::Active || !held {
            return Err(JenguError::Conflict(format!(
                "lease not held for job {}",
                lease.job_id
            )));
        }
        Ok(record)
    }

    /// Apply retention to terminal jobs. Caller holds the lock.
    fn prune(inner: &mut Inner, now: DateTime<Utc>) {
        // Per (queue, state), newest first; a job is pruned when it is
        // past its own age limit or beyond its own max_count position.
        let mut terminal: Vec<(String, JobState, DateTime<Utc>, u64, u64, usize)> = inner
            .jobs
            .values()
            .filter(|r| r.descriptor.state.is_terminal())
            .map(|r| {
                let policy = if r.descriptor.state == JobState::Completed {
                    &r.remove_on_complete
                } else {
                    &r.remove_on_fail
                };
                (
                    r.descriptor.job_id.clone(),
                    r.descriptor.state,
                    r.descriptor.finished_on.unwrap_or(r.descriptor.created_at),
                    r.seq,
                    policy.age_secs,
                    policy.max_count,
                )
            })
            .collect();
        terminal.sort_by(|a, b| b.2.cmp(&a.2).then(b.3.cmp(&a.3)));

        let mut position: HashMap<(String, JobState), usize> = HashMap::new();
        let mut remove = Vec::new();
        for (job_id, state, finished, _seq, age_secs, max_count) in terminal {
            let queue = inner.jobs[&job_id].descriptor.queue.clone();
            let slot = position.entry((queue, state)).or_insert(0);
            let too_old = now - finished > Duration::seconds(age_secs as i64);
            let too_many = *slot >= max_count;
            if too_old || too_many {
                remove.push(job_id);
            }
            *slot += 1;
        }
        for job_id in remove {
            debug!(job_id, "Pruning terminal job");
            inner.jobs.remove(&job_id);
        }
    }

    /// Jobs currently stored (test inspection).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<String, JenguError> {
        if !names::is_valid(queue) {
            return Err(JenguError::Validation(format!("unknown queue {queue:?}")));
        }
        if let Some(id) = &opts.job_id {
            if !super::job_id::has_valid_family(id) {
                return Err(JenguError::Validation(format!(
                    "job id {id:?} lacks a recognised family prefix"
                )));
            }
        }

        let now = self.now();
        let mut inner = self.inner.lock().unwrap();

        let job_id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| format!("{name}-{}", Uuid::new_v4()));

        // Client-supplied ids collapse: the existing job wins.
        if inner.jobs.contains_key(&job_id) {
            debug!(job_id, "Enqueue collapsed onto existing job");
            return Ok(job_id);
        }

        let delay = opts.delay_ms.unwrap_or(0);
        let scheduled_at = now + Duration::milliseconds(delay as i64);
        let state = if delay > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let descriptor = JobDescriptor {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            priority: opts.priority,
            attempts_made: 0,
            max_attempts: opts.max_attempts,
            backoff: opts.backoff,
            scheduled_at,
            state,
            progress: 0,
            return_value: None,
            last_error: None,
            created_at: now,
            processed_on: None,
            finished_on: None,
        };
        inner.jobs.insert(
            job_id.clone(),
            JobRecord {
                descriptor,
                lease: None,
                seq,
                remove_on_complete: opts.remove_on_complete,
                remove_on_fail: opts.remove_on_fail,
            },
        );
        debug!(job_id, queue, name, "Job enqueued");
        Ok(job_id)
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobDescriptor>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.get(job_id).map(|r| r.descriptor.clone()))
    }

    async fn schedule_repeatable(&self, repeatable: RepeatableJob) -> Result<(), JenguError> {
        if !names::is_valid(&repeatable.queue) {
            return Err(JenguError::Validation(format!(
                "unknown queue {:?}",
                repeatable.queue
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.repeatables.insert(repeatable.id.clone(), repeatable);
        Ok(())
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>, JenguError> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<RepeatableJob> = inner.repeatables.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn dequeue(
        &self,
        queue: &str,
        consumer_id: &str,
    ) -> Result<Option<(JobDescriptor, LeaseToken)>, JenguError> {
        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        Self::promote_due(&mut inner, now);

        let next = inner
            .jobs
            .values()
            .filter(|r| {
                r.descriptor.queue == queue
                    && r.descriptor.state == JobState::Waiting
                    && r.descriptor.scheduled_at <= now
            })
            .min_by_key(|r| (r.descriptor.priority, r.seq))
            .map(|r| r.descriptor.job_id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };

        let record = inner.jobs.get_mut(&job_id).expect("selected above");
        record.descriptor.state = JobState::Active;
        record.descriptor.attempts_made += 1;
        record.descriptor.processed_on = Some(now);
        let token = Uuid::new_v4().to_string();
        record.lease = Some(Lease {
            token: token.clone(),
            expires_at: now + Duration::seconds(self.lease_secs),
        });
        debug!(
            job_id,
            consumer_id,
            attempt = record.descriptor.attempts_made,
            "Job leased"
        );
        Ok(Some((
            record.descriptor.clone(),
            LeaseToken { job_id, token },
        )))
    }

    async fn complete(
        &self,
        lease: &LeaseToken,
        return_value: serde_json::Value,
    ) -> Result<(), JenguError> {
        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        let record = Self::claimed(&mut inner, lease)?;
        record.descriptor.state = JobState::Completed;
        record.descriptor.progress = 100;
        record.descriptor.return_value = Some(return_value);
        record.descriptor.finished_on = Some(now);
        record.lease = None;
        debug!(job_id = %lease.job_id, "Job completed");
        Ok(())
    }

    async fn fail(
        &self,
        lease: &LeaseToken,
        error: &str,
        retryable: bool,
    ) -> Result<(), JenguError> {
        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        let record = Self::claimed(&mut inner, lease)?;

        record.descriptor.last_error = Some(error.to_string());
        record.lease = None;

        let attempts = record.descriptor.attempts_made;
        if retryable && attempts < record.descriptor.max_attempts {
            let delay = record.descriptor.backoff.delay_ms(attempts);
            record.descriptor.state = JobState::Delayed;
            record.descriptor.scheduled_at = now + Duration::milliseconds(delay as i64);
            debug!(
                job_id = %lease.job_id,
                attempt = attempts,
                retry_in_ms = delay,
                "Job failed, retry scheduled"
            );
        } else {
            record.descriptor.state = JobState::Failed;
            record.descriptor.finished_on = Some(now);
            warn!(
                job_id = %lease.job_id,
                attempts,
                retryable,
                error,
                "Job terminally failed"
            );
        }
        Ok(())
    }

    async fn update_progress(&self, lease: &LeaseToken, progress: u8) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        let record = Self::claimed(&mut inner, lease)?;
        record.descriptor.progress = progress.min(100);
        Ok(())
    }

    async fn recover_leases(&self) -> Result<usize, JenguError> {
        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        Self::promote_due(&mut inner, now);

        let mut recovered = 0;
        for record in inner.jobs.values_mut() {
            if record.descriptor.state != JobState::Active {
                continue;
            }
            let expired = record
                .lease
                .as_ref()
                .map(|l| l.expires_at <= now)
                .unwrap_or(true);
            if expired {
                warn!(job_id = %record.descriptor.job_id, "Recovering expired lease");
                record.lease = None;
                record.descriptor.state = JobState::Waiting;
                // The crashed attempt doesn't count against the budget.
                record.descriptor.attempts_made =
                    record.descriptor.attempts_made.saturating_sub(1);
                recovered += 1;
            }
        }

        Self::prune(&mut inner, now);
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{job_id, priority, ManualClock};
    use serde_json::json;

    fn queue_with_clock() -> (MemoryQueue, Arc<ManualClock>) {
        let clock = ManualClock::new();
        (MemoryQueue::with_clock(120, clock.clone()), clock)
    }

    async fn enqueue_simple(queue: &MemoryQueue, name: &str) -> String {
        queue
            .enqueue(names::ENRICHMENT, name, json!({}), EnqueueOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let (queue, _) = queue_with_clock();
        let id = enqueue_simple(&queue, "enrich").await;

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.progress, 0);
        assert!(queue.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let (queue, _) = queue_with_clock();
        let err = queue
            .enqueue("rates", "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_client_job_id_needs_family_prefix() {
        let (queue, _) = queue_with_clock();
        let opts = EnqueueOptions {
            job_id: Some("mystery-123".to_string()),
            ..Default::default()
        };
        let err = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_duplicate_job_id_collapses() {
        let (queue, _) = queue_with_clock();
        let opts = EnqueueOptions {
            job_id: Some("enrich-prop-1-42".to_string()),
            ..Default::default()
        };
        let a = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({"run": 1}), opts.clone())
            .await
            .unwrap();
        let b = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({"run": 2}), opts)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(queue.len(), 1);

        // The original payload wins.
        let job = queue.get(&a).await.unwrap().unwrap();
        assert_eq!(job.payload, json!({"run": 1}));
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let (queue, _) = queue_with_clock();
        let low = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({}),
                EnqueueOptions {
                    priority: priority::LOW,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let high = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({}),
                EnqueueOptions {
                    priority: priority::HIGH,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let normal_a = enqueue_simple(&queue, "enrich").await;
        let normal_b = enqueue_simple(&queue, "enrich").await;

        let order: Vec<String> = {
            let mut out = Vec::new();
            while let Some((job, lease)) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap() {
                out.push(job.job_id.clone());
                queue.complete(&lease, json!(null)).await.unwrap();
            }
            out
        };
        assert_eq!(order, vec![high, normal_a, normal_b, low]);
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_schedule() {
        let (queue, clock) = queue_with_clock();
        queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({}),
                EnqueueOptions {
                    delay_ms: Some(5000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().is_none());
        clock.advance_ms(4999);
        assert!(queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().is_none());
        clock.advance_ms(1);
        assert!(queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_at_most_one_active_lease() {
        let (queue, _) = queue_with_clock();
        enqueue_simple(&queue, "enrich").await;

        let first = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap();
        assert!(first.is_some());
        let second = queue.dequeue(names::ENRICHMENT, "w-2").await.unwrap();
        assert!(second.is_none(), "only one worker may hold the job");
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let (queue, _) = queue_with_clock();
        enqueue_simple(&queue, "enrich").await;
        assert!(queue.dequeue(names::COMPETITOR, "w-1").await.unwrap().is_none());
        assert!(queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_complete_records_return_value() {
        let (queue, _) = queue_with_clock();
        let id = enqueue_simple(&queue, "enrich").await;
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.complete(&lease, json!({"rows": 30})).await.unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.return_value, Some(json!({"rows": 30})));
        assert!(job.finished_on.is_some());
    }

    #[tokio::test]
    async fn test_backoff_schedule_follows_the_law() {
        // Base 1000 ms, max 3 attempts.
        let (queue, clock) = queue_with_clock();
        let id = enqueue_simple(&queue, "enrich").await;

        // Attempt 1 fails at t=0: retry no earlier than t+1000.
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.fail(&lease, "upstream 503", true).await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().state, JobState::Delayed);

        clock.advance_ms(999);
        assert!(queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().is_none());
        clock.advance_ms(1);
        let (job, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);

        // Attempt 2 fails at t=1000: retry no earlier than t+2000 (t=3000).
        queue.fail(&lease, "upstream 503", true).await.unwrap();
        clock.advance_ms(1999);
        assert!(queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().is_none());
        clock.advance_ms(1);
        let (job, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 3);

        // Attempt 3 fails: retries exhausted.
        queue.fail(&lease, "upstream 503", true).await.unwrap();
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("upstream 503"));
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let (queue, _) = queue_with_clock();
        let id = enqueue_simple(&queue, "enrich").await;
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.fail(&lease, "bad request", false).await.unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed, "no retry for permanent errors");
        assert_eq!(job.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_progress_updates() {
        let (queue, _) = queue_with_clock();
        let id = enqueue_simple(&queue, "enrich").await;
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();

        queue.update_progress(&lease, 40).await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().progress, 40);

        queue.update_progress(&lease, 150).await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().progress, 100, "clamped");
    }

    #[tokio::test]
    async fn test_lease_recovery_requeues_without_burning_attempt() {
        let (queue, clock) = queue_with_clock();
        let id = enqueue_simple(&queue, "enrich").await;
        let (job, stale_lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);

        clock.advance_secs(121); // past the 120 s lease
        let recovered = queue.recover_leases().await.unwrap();
        assert_eq!(recovered, 1);

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0, "crashed attempt not counted");

        // The stale holder can no longer act on the job.
        let err = queue.complete(&stale_lease, json!(null)).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // And another worker can pick it up.
        assert!(queue.dequeue(names::ENRICHMENT, "w-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_live_lease_not_recovered() {
        let (queue, clock) = queue_with_clock();
        enqueue_simple(&queue, "enrich").await;
        let _held = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();

        clock.advance_secs(60); // half the lease
        assert_eq!(queue.recover_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retention_prunes_old_completed_jobs() {
        let (queue, clock) = queue_with_clock();
        let id = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({}),
                EnqueueOptions {
                    remove_on_complete: RetentionPolicy {
                        age_secs: 60,
                        max_count: 100,
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.complete(&lease, json!(null)).await.unwrap();

        clock.advance_secs(61);
        queue.recover_leases().await.unwrap();
        assert!(queue.get(&id).await.unwrap().is_none(), "aged out");
    }

    #[tokio::test]
    async fn test_retention_caps_completed_count() {
        let (queue, _) = queue_with_clock();
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = queue
                .enqueue(
                    names::ENRICHMENT,
                    "enrich",
                    json!({ "i": i }),
                    EnqueueOptions {
                        remove_on_complete: RetentionPolicy {
                            age_secs: 3600,
                            max_count: 2,
                        },
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
            queue.complete(&lease, json!(null)).await.unwrap();
            ids.push(id);
        }

        queue.recover_leases().await.unwrap();
        let surviving: Vec<bool> = {
            let mut out = Vec::new();
            for id in &ids {
                out.push(queue.get(id).await.unwrap().is_some());
            }
            out
        };
        assert_eq!(surviving, vec![false, false, false, true, true]);
    }

    #[tokio::test]
    async fn test_repeatable_registration_is_idempotent() {
        let (queue, _) = queue_with_clock();
        let repeatable = RepeatableJob {
            id: "competitor-daily".to_string(),
            queue: names::COMPETITOR.to_string(),
            name: "scrape-sweep".to_string(),
            cron_expr: "0 2 * * *".to_string(),
            payload: json!({}),
        };
        queue.schedule_repeatable(repeatable.clone()).await.unwrap();
        queue.schedule_repeatable(repeatable).await.unwrap();

        let list = queue.repeatables().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].cron_expr, "0 2 * * *");
    }

    #[tokio::test]
    async fn test_generated_instance_ids_carry_families() {
        // Scheduler instance ids like "competitor-daily:<bucket>" must
        // pass the family validation applied to client ids.
        let (queue, _) = queue_with_clock();
        for id in [
            "competitor-daily:1719878400",
            "index-daily:1719882000",
            "competitor-graph-build:1719885600",
        ] {
            let opts = EnqueueOptions {
                job_id: Some(id.to_string()),
                ..Default::default()
            };
            queue
                .enqueue(names::COMPETITOR, "sweep", json!({}), opts)
                .await
                .unwrap();
        }
        assert!(job_id::has_valid_family("competitor-daily:1719878400"));
        assert!(job_id::has_valid_family("index-daily:1719882000"));
    }
}
