//! Durable priority job queue.
//!
//! The queue is an interface: enqueue/dequeue with leases, progress,
//! retries with exponential backoff, delayed jobs, repeatable (cron)
//! registrations, and retention. Two implementations honour the same
//! contract — `memory` for tests and `sqlite` for durability — and the
//! worker pool only ever sees the trait.
//!
//! Lease discipline: at most one consumer holds a job `active` at any
//! moment. Ownership of a dequeued job belongs to the holder of its
//! lease token until complete, fail, or lease expiry; the recovery sweep
//! is the only outside mutation path.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JenguError, JobState};

// ---------------------------------------------------------------------------
// Queue names & priorities
// ---------------------------------------------------------------------------

/// The three queues. Anything else is rejected at enqueue.
pub mod names {
    pub const ENRICHMENT: &str = "enrichment";
    pub const COMPETITOR: &str = "competitor";
    pub const ANALYTICS: &str = "analytics";

    pub const ALL: [&str; 3] = [ENRICHMENT, COMPETITOR, ANALYTICS];

    pub fn is_valid(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// Priority values — lower dequeues first.
pub mod priority {
    pub const HIGH: i32 = 1;
    pub const NORMAL: i32 = 5;
    pub const LOW: i32 = 10;
}

// ---------------------------------------------------------------------------
// Job ids
// ---------------------------------------------------------------------------

/// Job-id family prefixes. The status endpoint and the progress bus both
/// dispatch on these.
pub mod job_id {
    pub const FAMILIES: [&str; 4] = ["enrich-", "competitor-", "analytics-", "index-"];

    /// The family prefix of a job id, if it carries one.
    pub fn family(id: &str) -> Option<&'static str> {
        FAMILIES.iter().copied().find(|f| id.starts_with(f))
    }

    pub fn has_valid_family(id: &str) -> bool {
        family(id).is_some()
    }

    /// `enrich-<property_id>-<millis>`
    pub fn enrichment(property_id: &str, now: chrono::DateTime<chrono::Utc>) -> String {
        format!("enrich-{property_id}-{}", now.timestamp_millis())
    }

    /// `competitor-<property_id>-<millis>`
    pub fn competitor(property_id: &str, now: chrono::DateTime<chrono::Utc>) -> String {
        format!("competitor-{property_id}-{}", now.timestamp_millis())
    }

    /// `analytics-<uuid>`
    pub fn analytics() -> String {
        format!("analytics-{}", uuid::Uuid::new_v4())
    }

    /// `index-<property_id>-<date>`
    pub fn index(property_id: &str, date: chrono::NaiveDate) -> String {
        format!("index-{property_id}-{date}")
    }
}

// ---------------------------------------------------------------------------
// Options & descriptors
// ---------------------------------------------------------------------------

/// Exponential backoff: attempt n retries after `base_ms × 2^(n-1)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64) -> Self {
        Self { base_ms }
    }

    /// Delay before the retry that follows failing attempt `attempt`
    /// (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base_ms: 1000 }
    }
}

/// Retention for terminal jobs: pruned once older than `age_secs` or
/// beyond the newest `max_count` in their queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub age_secs: u64,
    pub max_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            age_secs: 24 * 3600,
            max_count: 1000,
        }
    }
}

/// Options accepted at enqueue time.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Lower = dequeued first.
    pub priority: i32,
    /// Initial delay before the job becomes waiting.
    pub delay_ms: Option<u64>,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Client-provided id. Re-enqueueing an existing id is a no-op that
    /// returns the existing job (idempotent cron registration).
    pub job_id: Option<String>,
    pub remove_on_complete: RetentionPolicy,
    pub remove_on_fail: RetentionPolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: priority::NORMAL,
            delay_ms: None,
            max_attempts: 3,
            backoff: Backoff::default(),
            job_id: None,
            remove_on_complete: RetentionPolicy::default(),
            remove_on_fail: RetentionPolicy {
                age_secs: 7 * 24 * 3600,
                max_count: 5000,
            },
        }
    }
}

/// The externally visible state of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Earliest moment the job may be dequeued.
    pub scheduled_at: DateTime<Utc>,
    pub state: JobState,
    pub progress: u8,
    pub return_value: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

/// Exclusive claim over an active job. Only the holder may complete,
/// fail, or report progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub job_id: String,
    pub token: String,
}

/// A registered repeatable job: the scheduler tick turns these into
/// concrete instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatableJob {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub cron_expr: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Injectable time source so backoff and delay behaviour is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A hand-advanced clock for deterministic backoff, lease, and
/// rate-limit tests.
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> std::sync::Arc<Self> {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(start: DateTime<Utc>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            now: std::sync::Mutex::new(start),
        })
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::milliseconds(ms);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance_ms(secs * 1000);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Queue trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns its id. A client-supplied id that already
    /// exists collapses to the existing job.
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<String, JenguError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobDescriptor>, JenguError>;

    /// Register (or replace) a repeatable job under a stable id.
    async fn schedule_repeatable(&self, repeatable: RepeatableJob) -> Result<(), JenguError>;

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>, JenguError>;

    /// Atomically claim the next due job: moves it `active`, assigns a
    /// lease, increments `attempts_made`. Priority is honoured within
    /// the queue, FIFO within a priority.
    async fn dequeue(
        &self,
        queue: &str,
        consumer_id: &str,
    ) -> Result<Option<(JobDescriptor, LeaseToken)>, JenguError>;

    async fn complete(
        &self,
        lease: &LeaseToken,
        return_value: serde_json::Value,
    ) -> Result<(), JenguError>;

    /// Record a failure. Retryable failures re-schedule with exponential
    /// backoff until `max_attempts`; non-retryable ones (and exhausted
    /// retries) terminate in `failed`.
    async fn fail(
        &self,
        lease: &LeaseToken,
        error: &str,
        retryable: bool,
    ) -> Result<(), JenguError>;

    async fn update_progress(&self, lease: &LeaseToken, progress: u8) -> Result<(), JenguError>;

    /// Crash-recovery sweep: re-queue jobs whose lease expired, promote
    /// due delayed jobs, and prune terminal jobs per retention. Returns
    /// the number of recovered leases.
    async fn recover_leases(&self) -> Result<usize, JenguError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
