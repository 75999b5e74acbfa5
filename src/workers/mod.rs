//! Worker pools.
//!
//! One pool per queue: a bounded set of long-lived tasks that dequeue,
//! dispatch to the job runner, report lifecycle events to the progress
//! bus, and respect cooperative shutdown. A pool-level limiter caps how
//! many jobs may start per window; a per-job timeout bounds handler
//! runtime.
//!
//! Progress events for a single job flow through one forwarder task so
//! subscribers observe them in monotone order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::enrichment::ProgressSink;
use crate::jobs::handlers::JobRunner;
use crate::progress::{ProgressBus, ProgressEvent};
use crate::queue::{JobDescriptor, JobQueue, LeaseToken};
use crate::types::JenguError;

// ---------------------------------------------------------------------------
// Start-rate limiter
// ---------------------------------------------------------------------------

/// Sliding window over job start times: at most `max` starts per
/// `window`, shared across the pool's workers.
pub struct StartRateLimiter {
    window: Duration,
    max: usize,
    starts: Mutex<VecDeque<Instant>>,
}

impl StartRateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            window,
            max,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Reserve a start slot. Call `release` if no job was actually
    /// dequeued so an empty poll doesn't burn budget.
    fn try_reserve(&self) -> bool {
        let mut starts = self.starts.lock().unwrap();
        let cutoff = Instant::now() - self.window;
        while starts.front().map_or(false, |t| *t < cutoff) {
            starts.pop_front();
        }
        if starts.len() >= self.max {
            return false;
        }
        starts.push_back(Instant::now());
        true
    }

    fn release(&self) {
        let mut starts = self.starts.lock().unwrap();
        starts.pop_back();
    }

    #[cfg(test)]
    fn in_window(&self) -> usize {
        let mut starts = self.starts.lock().unwrap();
        let cutoff = Instant::now() - self.window;
        while starts.front().map_or(false, |t| *t < cutoff) {
            starts.pop_front();
        }
        starts.len()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Configuration of one pool.
#[derive(Clone)]
pub struct PoolConfig {
    pub queue_name: String,
    pub concurrency: usize,
    /// None = unthrottled.
    pub starts_per_window: Option<(usize, Duration)>,
    pub job_timeout: Duration,
    pub idle_poll: Duration,
}

/// A running pool: the worker task handles, joinable on shutdown.
pub struct WorkerPool {
    queue_name: String,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers against a queue. Workers run until
    /// the shutdown signal flips, then finish their in-flight job.
    pub fn spawn(
        cfg: PoolConfig,
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn JobRunner>,
        bus: Arc<ProgressBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let limiter = cfg
            .starts_per_window
            .map(|(max, window)| Arc::new(StartRateLimiter::new(max, window)));

        let mut handles = Vec::with_capacity(cfg.concurrency);
        for i in 0..cfg.concurrency {
            let worker = Worker {
                consumer_id: format!("{}-{i}", cfg.queue_name),
                queue_name: cfg.queue_name.clone(),
                queue: queue.clone(),
                runner: runner.clone(),
                bus: bus.clone(),
                limiter: limiter.clone(),
                job_timeout: cfg.job_timeout,
                idle_poll: cfg.idle_poll,
            };
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(worker.run(shutdown)));
        }
        info!(queue = %cfg.queue_name, workers = cfg.concurrency, "Worker pool started");
        Self {
            queue_name: cfg.queue_name,
            handles,
        }
    }

    /// Wait up to `grace` for workers to drain, then abort stragglers —
    /// their leases expire and the recovery sweep re-queues the jobs.
    pub async fn shutdown(self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for mut handle in self.handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!(queue = %self.queue_name, "Worker exceeded grace period, aborting");
                handle.abort();
            }
        }
        info!(queue = %self.queue_name, "Worker pool stopped");
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    consumer_id: String,
    queue_name: String,
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn JobRunner>,
    bus: Arc<ProgressBus>,
    limiter: Option<Arc<StartRateLimiter>>,
    job_timeout: Duration,
    idle_poll: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(consumer = %self.consumer_id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(limiter) = &self.limiter {
                if !limiter.try_reserve() {
                    if Self::idle(&mut shutdown, self.idle_poll).await {
                        break;
                    }
                    continue;
                }
            }

            match self.queue.dequeue(&self.queue_name, &self.consumer_id).await {
                Ok(Some((job, lease))) => {
                    self.run_one(job, lease).await;
                }
                Ok(None) => {
                    if let Some(limiter) = &self.limiter {
                        limiter.release();
                    }
                    if Self::idle(&mut shutdown, self.idle_poll).await {
                        break;
                    }
                }
                Err(e) => {
                    if let Some(limiter) = &self.limiter {
                        limiter.release();
                    }
                    warn!(consumer = %self.consumer_id, error = %e, "Dequeue failed");
                    if Self::idle(&mut shutdown, self.idle_poll).await {
                        break;
                    }
                }
            }
        }
        debug!(consumer = %self.consumer_id, "Worker stopped");
    }

    /// Sleep for the poll interval, waking early on shutdown. Returns
    /// true when shutdown fired.
    async fn idle(shutdown: &mut watch::Receiver<bool>, poll: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(poll) => *shutdown.borrow(),
            _ = shutdown.changed() => *shutdown.borrow(),
        }
    }

    async fn run_one(&self, job: JobDescriptor, lease: LeaseToken) {
        let job_id = job.job_id.clone();
        self.bus.publish(ProgressEvent::Active {
            job_id: job_id.clone(),
        });

        // One forwarder per job keeps progress updates ordered.
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let forwarder = {
            let queue = self.queue.clone();
            let bus = self.bus.clone();
            let lease = lease.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                while let Some(pct) = rx.recv().await {
                    if let Err(e) = queue.update_progress(&lease, pct).await {
                        debug!(job_id = %job_id, error = %e, "Progress update dropped");
                    }
                    bus.publish(ProgressEvent::Progress {
                        job_id: job_id.clone(),
                        progress: pct,
                    });
                }
            })
        };
        let sink: ProgressSink = Arc::new(move |pct| {
            let _ = tx.send(pct);
        });

        let started = Instant::now();
        let result = tokio::time::timeout(self.job_timeout, self.runner.run(&job, &sink)).await;

        drop(sink); // close the channel so the forwarder drains and exits
        let _ = forwarder.await;

        match result {
            Ok(Ok(value)) => {
                if let Err(e) = self.queue.complete(&lease, value.clone()).await {
                    warn!(job_id = %job_id, error = %e, "Complete failed");
                    return;
                }
                info!(
                    job_id = %job_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                self.bus.publish(ProgressEvent::Completed {
                    job_id,
                    result: value,
                });
            }
            Ok(Err(e)) => {
                self.finish_failed(&job, &lease, e).await;
            }
            Err(_) => {
                let e = JenguError::Timeout(format!(
                    "job exceeded {}s deadline",
                    self.job_timeout.as_secs()
                ));
                self.finish_failed(&job, &lease, e).await;
            }
        }
    }

    async fn finish_failed(&self, job: &JobDescriptor, lease: &LeaseToken, error: JenguError) {
        let retryable = error.is_transient();
        let message = error.to_string();
        if let Err(e) = self.queue.fail(lease, &message, retryable).await {
            warn!(job_id = %job.job_id, error = %e, "Fail recording failed");
            return;
        }

        // attempts_made already counts this attempt (set at dequeue).
        let will_retry = retryable && job.attempts_made < job.max_attempts;
        if will_retry {
            warn!(job_id = %job.job_id, attempt = job.attempts_made, error = %message, "Job failed, will retry");
            self.bus.publish(ProgressEvent::Error {
                job_id: job.job_id.clone(),
                error: message,
            });
        } else {
            warn!(job_id = %job.job_id, attempts = job.attempts_made, error = %message, "Job failed terminally");
            self.bus.publish(ProgressEvent::Failed {
                job_id: job.job_id.clone(),
                error: message,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Background sweep: lease recovery, cache eviction, bus topic cleanup.
pub fn spawn_maintenance(
    queue: Arc<dyn JobQueue>,
    cache: Arc<crate::cache::EnrichmentCache>,
    bus: Arc<ProgressBus>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match queue.recover_leases().await {
                        Ok(0) => {}
                        Ok(n) => info!(recovered = n, "Lease recovery sweep"),
                        Err(e) => warn!(error = %e, "Lease recovery failed"),
                    }
                    cache.sweep();
                    bus.sweep();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryQueue;
    use crate::queue::{names, EnqueueOptions};
    use crate::types::JobState;
    use serde_json::json;

    /// Stub runner driven by a closure.
    struct StubRunner<F>(F);

    #[async_trait::async_trait]
    impl<F> JobRunner for StubRunner<F>
    where
        F: Fn(&JobDescriptor, &ProgressSink) -> Result<serde_json::Value, JenguError>
            + Send
            + Sync,
    {
        async fn run(
            &self,
            job: &JobDescriptor,
            progress: &ProgressSink,
        ) -> Result<serde_json::Value, JenguError> {
            (self.0)(job, progress)
        }
    }

    /// Runner that sleeps longer than any test timeout.
    struct SlowRunner;

    #[async_trait::async_trait]
    impl JobRunner for SlowRunner {
        async fn run(
            &self,
            _job: &JobDescriptor,
            _progress: &ProgressSink,
        ) -> Result<serde_json::Value, JenguError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!(null))
        }
    }

    fn pool_config(queue_name: &str) -> PoolConfig {
        PoolConfig {
            queue_name: queue_name.to_string(),
            concurrency: 1,
            starts_per_window: None,
            job_timeout: Duration::from_secs(5),
            idle_poll: Duration::from_millis(10),
        }
    }

    async fn wait_for_state(
        queue: &MemoryQueue,
        job_id: &str,
        state: JobState,
    ) -> crate::queue::JobDescriptor {
        for _ in 0..200 {
            if let Some(job) = queue.get(job_id).await.unwrap() {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached {state}");
    }

    #[tokio::test]
    async fn test_pool_completes_jobs_and_publishes_events() {
        let queue = Arc::new(MemoryQueue::new(120));
        let bus = Arc::new(ProgressBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let job_id = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let mut events = bus.subscribe(&job_id);

        let runner = Arc::new(StubRunner(|_: &JobDescriptor, progress: &ProgressSink| {
            progress(50);
            Ok(json!({"ok": true}))
        }));
        let pool = WorkerPool::spawn(
            pool_config(names::ENRICHMENT),
            queue.clone(),
            runner,
            bus.clone(),
            shutdown_rx,
        );

        let job = wait_for_state(&queue, &job_id, JobState::Completed).await;
        assert_eq!(job.return_value, Some(json!({"ok": true})));

        // active → progress(50) → completed, in order.
        assert!(matches!(events.recv().await.unwrap(), ProgressEvent::Active { .. }));
        match events.recv().await.unwrap() {
            ProgressEvent::Progress { progress, .. } => assert_eq!(progress, 50),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), ProgressEvent::Completed { .. }));

        shutdown_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let queue = Arc::new(MemoryQueue::new(120));
        let bus = Arc::new(ProgressBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let job_id = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({}),
                EnqueueOptions {
                    backoff: crate::queue::Backoff::new(60_000), // park it after first failure
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let runner = Arc::new(StubRunner(|_: &JobDescriptor, _: &ProgressSink| {
            Err(JenguError::TransientUpstream("503".into()))
        }));
        let pool = WorkerPool::spawn(
            pool_config(names::ENRICHMENT),
            queue.clone(),
            runner,
            bus.clone(),
            shutdown_rx,
        );

        let job = wait_for_state(&queue, &job_id, JobState::Delayed).await;
        assert_eq!(job.attempts_made, 1);
        assert!(job.last_error.unwrap().contains("503"));

        shutdown_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let queue = Arc::new(MemoryQueue::new(120));
        let bus = Arc::new(ProgressBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let job_id = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let mut events = bus.subscribe(&job_id);

        let runner = Arc::new(StubRunner(|_: &JobDescriptor, _: &ProgressSink| {
            Err(JenguError::PermanentUpstream("400".into()))
        }));
        let pool = WorkerPool::spawn(
            pool_config(names::ENRICHMENT),
            queue.clone(),
            runner,
            bus.clone(),
            shutdown_rx,
        );

        let job = wait_for_state(&queue, &job_id, JobState::Failed).await;
        assert_eq!(job.attempts_made, 1, "no retry burned");

        assert!(matches!(events.recv().await.unwrap(), ProgressEvent::Active { .. }));
        assert!(matches!(events.recv().await.unwrap(), ProgressEvent::Failed { .. }));

        shutdown_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_job_timeout_fails_with_timeout_error() {
        let queue = Arc::new(MemoryQueue::new(120));
        let bus = Arc::new(ProgressBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let job_id = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({}),
                EnqueueOptions {
                    max_attempts: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut cfg = pool_config(names::ENRICHMENT);
        cfg.job_timeout = Duration::from_millis(50);
        let pool = WorkerPool::spawn(cfg, queue.clone(), Arc::new(SlowRunner), bus, shutdown_rx);

        let job = wait_for_state(&queue, &job_id, JobState::Failed).await;
        assert!(job.last_error.unwrap().contains("deadline"));

        shutdown_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_dequeueing() {
        let queue = Arc::new(MemoryQueue::new(120));
        let bus = Arc::new(ProgressBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = Arc::new(StubRunner(|_: &JobDescriptor, _: &ProgressSink| {
            Ok(json!(null))
        }));
        let pool = WorkerPool::spawn(
            pool_config(names::ENRICHMENT),
            queue.clone(),
            runner,
            bus,
            shutdown_rx,
        );

        shutdown_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;

        // A job enqueued after shutdown is never picked up.
        let job_id = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_start_rate_limiter_caps_starts() {
        let limiter = StartRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_reserve());
        assert!(limiter.try_reserve());
        assert!(!limiter.try_reserve(), "third start within window denied");
        assert_eq!(limiter.in_window(), 2);

        limiter.release();
        assert!(limiter.try_reserve(), "released slot is reusable");
    }

    #[tokio::test]
    async fn test_start_rate_limiter_window_expiry() {
        let limiter = StartRateLimiter::new(1, Duration::from_millis(50));
        assert!(limiter.try_reserve());
        assert!(!limiter.try_reserve());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.try_reserve(), "window rolled over");
    }

    #[tokio::test]
    async fn test_pool_rate_limit_blocks_third_job() {
        let queue = Arc::new(MemoryQueue::new(120));
        let bus = Arc::new(ProgressBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                queue
                    .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
                    .await
                    .unwrap(),
            );
        }

        let mut cfg = pool_config(names::ENRICHMENT);
        cfg.starts_per_window = Some((2, Duration::from_secs(60)));
        let runner = Arc::new(StubRunner(|_: &JobDescriptor, _: &ProgressSink| {
            Ok(json!(null))
        }));
        let pool = WorkerPool::spawn(cfg, queue.clone(), runner, bus, shutdown_rx);

        wait_for_state(&queue, &ids[0], JobState::Completed).await;
        wait_for_state(&queue, &ids[1], JobState::Completed).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let third = queue.get(&ids[2]).await.unwrap().unwrap();
        assert_eq!(third.state, JobState::Waiting, "third start throttled");

        shutdown_tx.send(true).unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_maintenance_sweep_runs() {
        let queue = Arc::new(MemoryQueue::new(120));
        let cache = Arc::new(crate::cache::EnrichmentCache::new());
        let bus = Arc::new(ProgressBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_maintenance(
            queue.clone(),
            cache,
            bus,
            Duration::from_millis(10),
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
