//! Real-time progress bus.
//!
//! Pub/sub of job lifecycle events keyed by job id. Topics are lazily
//! created `tokio::sync::broadcast` channels; delivery is best-effort,
//! at-least-once per subscriber, and subscribers that fall behind are
//! dropped by the channel (lag error) rather than buffered forever.
//!
//! A subscriber that joins after the job finished gets the terminal
//! state from the snapshot probe its transport performs on join (the
//! server composes `JobQueue::get` + `subscribe`); the bus itself holds
//! no history.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::queue::JobDescriptor;

/// Default per-topic buffer: slow subscribers beyond this are dropped.
const DEFAULT_TOPIC_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One lifecycle event on a job's topic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ProgressEvent {
    /// Current-state probe result, sent on subscribe.
    #[serde(rename = "job:status")]
    Status {
        job_id: String,
        status: String,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A worker picked the job up.
    #[serde(rename = "job:active")]
    Active { job_id: String },
    #[serde(rename = "job:progress")]
    Progress { job_id: String, progress: u8 },
    #[serde(rename = "job:completed")]
    Completed {
        job_id: String,
        result: serde_json::Value,
    },
    /// Terminal failure (retries exhausted or permanent error).
    #[serde(rename = "job:failed")]
    Failed { job_id: String, error: String },
    /// Non-terminal failure: a retry is scheduled.
    #[serde(rename = "job:error")]
    Error { job_id: String, error: String },
}

impl ProgressEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ProgressEvent::Status { job_id, .. }
            | ProgressEvent::Active { job_id }
            | ProgressEvent::Progress { job_id, .. }
            | ProgressEvent::Completed { job_id, .. }
            | ProgressEvent::Failed { job_id, .. }
            | ProgressEvent::Error { job_id, .. } => job_id,
        }
    }

    /// Build the snapshot event for a descriptor — what a late
    /// subscriber sees first.
    pub fn status_of(job: &JobDescriptor) -> Self {
        ProgressEvent::Status {
            job_id: job.job_id.clone(),
            status: job.state.to_string(),
            progress: job.progress,
            error: job.last_error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Topic map `job_id → broadcast sender`.
pub struct ProgressBus {
    topics: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to a job's lifecycle. The receiver yields live events;
    /// the caller is responsible for the initial snapshot probe.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to its job's topic. Events for topics nobody is
    /// watching are dropped silently.
    pub fn publish(&self, event: ProgressEvent) {
        let topics = self.topics.lock().unwrap();
        if let Some(sender) = topics.get(event.job_id()) {
            let delivered = sender.send(event).map(|n| n > 0).unwrap_or(false);
            if !delivered {
                debug!("Progress event had no live subscribers");
            }
        }
    }

    /// Drop topics with no remaining subscribers. Called periodically by
    /// the maintenance sweep so finished jobs release their channels.
    pub fn sweep(&self) -> usize {
        let mut topics = self.topics.lock().unwrap();
        let before = topics.len();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        before - topics.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap().len()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
