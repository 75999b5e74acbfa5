//! Durable queue over sqlite.
//!
//! Same contract as the in-memory queue, persisted through sqlx with
//! runtime-checked queries. Dequeue uses a conditional update on the
//! job's state, which is what makes the claim atomic: two workers can
//! select the same candidate but only one update lands.
//!
//! Timestamps are epoch millis (INTEGER), payloads are JSON TEXT.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    names, Backoff, Clock, EnqueueOptions, JobDescriptor, JobQueue, LeaseToken, RepeatableJob,
    RetentionPolicy, SystemClock,
};
use crate::types::{JenguError, JobState};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id           TEXT PRIMARY KEY,
    queue            TEXT NOT NULL,
    name             TEXT NOT NULL,
    payload          TEXT NOT NULL,
    priority         INTEGER NOT NULL,
    attempts_made    INTEGER NOT NULL,
    max_attempts     INTEGER NOT NULL,
    backoff_base_ms  INTEGER NOT NULL,
    scheduled_at     INTEGER NOT NULL,
    state            TEXT NOT NULL,
    progress         INTEGER NOT NULL,
    return_value     TEXT,
    last_error       TEXT,
    created_at       INTEGER NOT NULL,
    processed_on     INTEGER,
    finished_on      INTEGER,
    lease_token      TEXT,
    lease_expires_at INTEGER,
    seq              INTEGER NOT NULL,
    roc_age_secs     INTEGER NOT NULL,
    rof_age_secs     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_queue_state
    ON jobs(queue, state, priority, seq);
CREATE TABLE IF NOT EXISTS repeatable_jobs (
    id        TEXT PRIMARY KEY,
    queue     TEXT NOT NULL,
    name      TEXT NOT NULL,
    cron_expr TEXT NOT NULL,
    payload   TEXT NOT NULL
);
"#;

/// Durable `JobQueue` backed by sqlite.
pub struct SqliteQueue {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    lease_secs: i64,
    /// Queue-level count caps applied by the retention sweep (per-job age
    /// limits are stored on the rows themselves).
    completed_cap: usize,
    failed_cap: usize,
}

impl SqliteQueue {
    /// Open (or create) the queue tables at `path`. `":memory:"` gives an
    /// ephemeral database.
    pub async fn open(
        path: &str,
        lease_secs: u64,
        remove_on_complete: RetentionPolicy,
        remove_on_fail: RetentionPolicy,
    ) -> anyhow::Result<Self> {
        Self::open_with_clock(
            path,
            lease_secs,
            remove_on_complete,
            remove_on_fail,
            Arc::new(SystemClock),
        )
        .await
    }

    pub async fn open_with_clock(
        path: &str,
        lease_secs: u64,
        remove_on_complete: RetentionPolicy,
        remove_on_fail: RetentionPolicy,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}?mode=rwc")
        };
        // sqlite serialises writes anyway; a single connection also keeps
        // an in-memory database coherent across calls.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            clock,
            lease_secs: lease_secs as i64,
            completed_cap: remove_on_complete.max_count,
            failed_cap: remove_on_fail.max_count,
        })
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn promote_due(&self, now_ms: i64) -> Result<(), JenguError> {
        sqlx::query("UPDATE jobs SET state = 'waiting' WHERE state = 'delayed' AND scheduled_at <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    fn row_to_descriptor(row: &sqlx::sqlite::SqliteRow) -> Result<JobDescriptor, JenguError> {
        let payload: String = row.try_get("payload").map_err(db_err)?;
        let return_value: Option<String> = row.try_get("return_value").map_err(db_err)?;
        let state: String = row.try_get("state").map_err(db_err)?;
        Ok(JobDescriptor {
            job_id: row.try_get("job_id").map_err(db_err)?,
            queue: row.try_get("queue").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            payload: serde_json::from_str(&payload)
                .map_err(|e| JenguError::Internal(format!("corrupt payload: {e}")))?,
            priority: row.try_get("priority").map_err(db_err)?,
            attempts_made: row.try_get::<i64, _>("attempts_made").map_err(db_err)? as u32,
            max_attempts: row.try_get::<i64, _>("max_attempts").map_err(db_err)? as u32,
            backoff: Backoff::new(row.try_get::<i64, _>("backoff_base_ms").map_err(db_err)? as u64),
            scheduled_at: ms_to_utc(row.try_get("scheduled_at").map_err(db_err)?),
            state: JobState::parse(&state)
                .ok_or_else(|| JenguError::Internal(format!("corrupt job state {state:?}")))?,
            progress: row.try_get::<i64, _>("progress").map_err(db_err)? as u8,
            return_value: return_value
                .map(|v| serde_json::from_str(&v))
                .transpose()
                .map_err(|e| JenguError::Internal(format!("corrupt return value: {e}")))?,
            last_error: row.try_get("last_error").map_err(db_err)?,
            created_at: ms_to_utc(row.try_get("created_at").map_err(db_err)?),
            processed_on: row
                .try_get::<Option<i64>, _>("processed_on")
                .map_err(db_err)?
                .map(ms_to_utc),
            finished_on: row
                .try_get::<Option<i64>, _>("finished_on")
                .map_err(db_err)?
                .map(ms_to_utc),
        })
    }
}

fn db_err(e: impl std::fmt::Display) -> JenguError {
    JenguError::Internal(format!("queue storage error: {e}"))
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[async_trait::async_trait]
impl JobQueue for SqliteQueue {
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

        let job_id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| format!("{name}-{}", Uuid::new_v4()));
        let now_ms = self.now_ms();
        let delay = opts.delay_ms.unwrap_or(0) as i64;
        let state = if delay > 0 { "delayed" } else { "waiting" };

        // INSERT OR IGNORE collapses duplicate client ids onto the
        // existing job.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO jobs (
                job_id, queue, name, payload, priority, attempts_made,
                max_attempts, backoff_base_ms, scheduled_at, state, progress,
                created_at, seq, roc_age_secs, rof_age_secs
             ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 0, ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs), ?, ?)",
        )
        .bind(&job_id)
        .bind(queue)
        .bind(name)
        .bind(payload.to_string())
        .bind(opts.priority)
        .bind(opts.max_attempts as i64)
        .bind(opts.backoff.base_ms as i64)
        .bind(now_ms + delay)
        .bind(state)
        .bind(now_ms)
        .bind(opts.remove_on_complete.age_secs as i64)
        .bind(opts.remove_on_fail.age_secs as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            debug!(job_id, "Enqueue collapsed onto existing job");
        } else {
            debug!(job_id, queue, name, "Job enqueued");
        }
        Ok(job_id)
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobDescriptor>, JenguError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_descriptor).transpose()
    }

    async fn schedule_repeatable(&self, repeatable: RepeatableJob) -> Result<(), JenguError> {
        if !names::is_valid(&repeatable.queue) {
            return Err(JenguError::Validation(format!(
                "unknown queue {:?}",
                repeatable.queue
            )));
        }
        sqlx::query(
            "INSERT INTO repeatable_jobs (id, queue, name, cron_expr, payload)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                queue = excluded.queue,
                name = excluded.name,
                cron_expr = excluded.cron_expr,
                payload = excluded.payload",
        )
        .bind(&repeatable.id)
        .bind(&repeatable.queue)
        .bind(&repeatable.name)
        .bind(&repeatable.cron_expr)
        .bind(repeatable.payload.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>, JenguError> {
        let rows = sqlx::query("SELECT * FROM repeatable_jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload").map_err(db_err)?;
                Ok(RepeatableJob {
                    id: row.try_get("id").map_err(db_err)?,
                    queue: row.try_get("queue").map_err(db_err)?,
                    name: row.try_get("name").map_err(db_err)?,
                    cron_expr: row.try_get("cron_expr").map_err(db_err)?,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| JenguError::Internal(format!("corrupt payload: {e}")))?,
                })
            })
            .collect()
    }

    async fn dequeue(
        &self,
        queue: &str,
        consumer_id: &str,
    ) -> Result<Option<(JobDescriptor, LeaseToken)>, JenguError> {
        let now_ms = self.now_ms();
        self.promote_due(now_ms).await?;

        // Claim loop: the conditional update only lands for one caller;
        // a lost race just tries the next candidate.
        loop {
            let candidate = sqlx::query(
                "SELECT job_id FROM jobs
                 WHERE queue = ? AND state = 'waiting' AND scheduled_at <= ?
                 ORDER BY priority ASC, seq ASC LIMIT 1",
            )
            .bind(queue)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let job_id: String = candidate.try_get("job_id").map_err(db_err)?;
            let token = Uuid::new_v4().to_string();

            let claimed = sqlx::query(
                "UPDATE jobs SET
                    state = 'active',
                    attempts_made = attempts_made + 1,
                    processed_on = ?,
                    lease_token = ?,
                    lease_expires_at = ?
                 WHERE job_id = ? AND state = 'waiting'",
            )
            .bind(now_ms)
            .bind(&token)
            .bind(now_ms + self.lease_secs * 1000)
            .bind(&job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if claimed.rows_affected() == 1 {
                let descriptor = self
                    .get(&job_id)
                    .await?
                    .ok_or_else(|| JenguError::Internal("claimed job vanished".into()))?;
                debug!(job_id, consumer_id, "Job leased");
                return Ok(Some((descriptor, LeaseToken { job_id, token })));
            }
            // Someone else claimed it between select and update.
        }
    }

    async fn complete(
        &self,
        lease: &LeaseToken,
        return_value: serde_json::Value,
    ) -> Result<(), JenguError> {
        let result = sqlx::query(
            "UPDATE jobs SET
                state = 'completed', progress = 100, return_value = ?,
                finished_on = ?, lease_token = NULL, lease_expires_at = NULL
             WHERE job_id = ? AND lease_token = ? AND state = 'active'",
        )
        .bind(return_value.to_string())
        .bind(self.now_ms())
        .bind(&lease.job_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(JenguError::Conflict(format!(
                "lease not held for job {}",
                lease.job_id
            )));
        }
        Ok(())
    }

    async fn fail(
        &self,
        lease: &LeaseToken,
        error: &str,
        retryable: bool,
    ) -> Result<(), JenguError> {
        let job = self
            .get(&lease.job_id)
            .await?
            .ok_or_else(|| JenguError::NotFound(format!("job {}", lease.job_id)))?;
        let now_ms = self.now_ms();

        let (state, scheduled_at, finished_on) =
            if retryable && job.attempts_made < job.max_attempts {
                let delay = job.backoff.delay_ms(job.attempts_made) as i64;
                ("delayed", now_ms + delay, None)
            } else {
                ("failed", job.scheduled_at.timestamp_millis(), Some(now_ms))
            };

        let result = sqlx::query(
            "UPDATE jobs SET
                state = ?, scheduled_at = ?, finished_on = ?, last_error = ?,
                lease_token = NULL, lease_expires_at = NULL
             WHERE job_id = ? AND lease_token = ? AND state = 'active'",
        )
        .bind(state)
        .bind(scheduled_at)
        .bind(finished_on)
        .bind(error)
        .bind(&lease.job_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(JenguError::Conflict(format!(
                "lease not held for job {}",
                lease.job_id
            )));
        }
        if state == "failed" {
            warn!(job_id = %lease.job_id, error, "Job terminally failed");
        }
        Ok(())
    }

    async fn update_progress(&self, lease: &LeaseToken, progress: u8) -> Result<(), JenguError> {
        let result = sqlx::query(
            "UPDATE jobs SET progress = ?
             WHERE job_id = ? AND lease_token = ? AND state = 'active'",
        )
        .bind(progress.min(100) as i64)
        .bind(&lease.job_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(JenguError::Conflict(format!(
                "lease not held for job {}",
                lease.job_id
            )));
        }
        Ok(())
    }

    async fn recover_leases(&self) -> Result<usize, JenguError> {
        let now_ms = self.now_ms();
        self.promote_due(now_ms).await?;

        let recovered = sqlx::query(
            "UPDATE jobs SET
                state = 'waiting',
                lease_token = NULL,
                lease_expires_at = NULL,
                attempts_made = MAX(attempts_made - 1, 0)
             WHERE state = 'active'
               AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // Per-row age limits.
        sqlx::query(
            "DELETE FROM jobs
             WHERE state = 'completed' AND finished_on + roc_age_secs * 1000 <= ?",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "DELETE FROM jobs
             WHERE state = 'failed' AND finished_on + rof_age_secs * 1000 <= ?",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // Queue-level count caps.
        for queue in names::ALL {
            for (state, cap) in [("completed", self.completed_cap), ("failed", self.failed_cap)] {
                sqlx::query(
                    "DELETE FROM jobs WHERE job_id IN (
                        SELECT job_id FROM jobs
                        WHERE queue = ? AND state = ?
                        ORDER BY finished_on DESC, seq DESC
                        LIMIT -1 OFFSET ?
                    )",
                )
                .bind(queue)
                .bind(state)
                .bind(cap as i64)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            }
        }

        Ok(recovered.rows_affected() as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::priority;
    use serde_json::json;

    async fn open_queue() -> SqliteQueue {
        SqliteQueue::open(
            ":memory:",
            120,
            RetentionPolicy::default(),
            RetentionPolicy::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_get_roundtrip() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({"property_id": "prop-1"}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload, json!({"property_id": "prop-1"}));
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.backoff.base_ms, 1000);
    }

    #[tokio::test]
    async fn test_dequeue_claims_and_excludes() {
        let queue = open_queue().await;
        queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let (job, _lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 1);
        assert!(job.processed_on.is_some());

        assert!(queue.dequeue(names::ENRICHMENT, "w-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_respected() {
        let queue = open_queue().await;
        queue
            .enqueue(
                names::ANALYTICS,
                "summary",
                json!({"which": "low"}),
                EnqueueOptions {
                    priority: priority::LOW,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        queue
            .enqueue(
                names::ANALYTICS,
                "summary",
                json!({"which": "high"}),
                EnqueueOptions {
                    priority: priority::HIGH,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (job, _) = queue.dequeue(names::ANALYTICS, "w-1").await.unwrap().unwrap();
        assert_eq!(job.payload["which"], "high");
    }

    #[tokio::test]
    async fn test_complete_and_conflict_on_stale_lease() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.complete(&lease, json!({"ok": true})).await.unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value, Some(json!({"ok": true})));

        // Completing twice is a conflict — the lease is gone.
        let err = queue.complete(&lease, json!(null)).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_retryable_failure_delays_then_requeues() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(
                names::ENRICHMENT,
                "enrich",
                json!({}),
                EnqueueOptions {
                    backoff: Backoff::new(1), // 1 ms so the test can wait it out
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.fail(&lease, "503", true).await.unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.last_error.as_deref(), Some("503"));

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let (job, _) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_terminal() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.fail(&lease, "400 bad request", false).await.unwrap();

        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.finished_on.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_id_collapses() {
        let queue = open_queue().await;
        let opts = EnqueueOptions {
            job_id: Some("index-prop-1-2024-06-01".to_string()),
            ..Default::default()
        };
        let a = queue
            .enqueue(names::ANALYTICS, "neighborhood-index", json!({"run": 1}), opts.clone())
            .await
            .unwrap();
        let b = queue
            .enqueue(names::ANALYTICS, "neighborhood-index", json!({"run": 2}), opts)
            .await
            .unwrap();
        assert_eq!(a, b);
        let job = queue.get(&a).await.unwrap().unwrap();
        assert_eq!(job.payload, json!({"run": 1}));
    }

    #[tokio::test]
    async fn test_repeatable_upsert() {
        let queue = open_queue().await;
        let mut repeatable = RepeatableJob {
            id: "index-daily".to_string(),
            queue: names::ANALYTICS.to_string(),
            name: "index-sweep".to_string(),
            cron_expr: "0 3 * * *".to_string(),
            payload: json!({}),
        };
        queue.schedule_repeatable(repeatable.clone()).await.unwrap();
        repeatable.cron_expr = "30 3 * * *".to_string();
        queue.schedule_repeatable(repeatable).await.unwrap();

        let list = queue.repeatables().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].cron_expr, "30 3 * * *");
    }

    #[tokio::test]
    async fn test_progress_roundtrip() {
        let queue = open_queue().await;
        let id = queue
            .enqueue(names::ENRICHMENT, "enrich", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let (_, lease) = queue.dequeue(names::ENRICHMENT, "w-1").await.unwrap().unwrap();
        queue.update_progress(&lease, 55).await.unwrap();
        assert_eq!(queue.get(&id).await.unwrap().unwrap().progress, 55);
    }
}
