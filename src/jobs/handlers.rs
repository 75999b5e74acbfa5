//! Job handlers.
//!
//! The dispatcher decodes a dequeued job back into its typed spec and
//! runs the matching handler. Handlers receive everything through the
//! `JobContext` — store, queue, pipeline, index engine, scraper seam —
//! and never reach for global state. Their error classification
//! (transient vs permanent) is what the queue consults for retries.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    enqueue_job, BuildGraphPayload, CompetitorScraper, EnrichPayload, IndexPayload, JobSpec,
    ScrapeLocation, ScrapePayload, SummaryPayload,
};
use crate::config::AppConfig;
use crate::enrichment::{EnrichmentPipeline, ProgressSink};
use crate::index::{IndexEngine, IndexOutcome};
use crate::queue::{priority, EnqueueOptions, JobDescriptor, JobQueue};
use crate::store::Store;
use crate::types::JenguError;

/// Cap on competitors kept per property graph.
const MAX_COMPETITORS: usize = 30;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a handler may touch. Cloned per worker, shared via Arcs.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub pipeline: Arc<EnrichmentPipeline>,
    pub index: Arc<IndexEngine>,
    pub scraper: Arc<dyn CompetitorScraper>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// What the worker pool needs from a job executor. `Dispatcher` is the
/// real implementation; tests substitute stubs.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        job: &JobDescriptor,
        progress: &ProgressSink,
    ) -> Result<serde_json::Value, JenguError>;
}

/// Decodes and runs jobs. One instance serves every worker pool.
pub struct Dispatcher {
    ctx: JobContext,
}

#[async_trait::async_trait]
impl JobRunner for Dispatcher {
    async fn run(
        &self,
        job: &JobDescriptor,
        progress: &ProgressSink,
    ) -> Result<serde_json::Value, JenguError> {
        Dispatcher::run(self, job, progress).await
    }
}

impl Dispatcher {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    /// Run one job to completion. The returned value becomes the job's
    /// `return_value`.
    pub async fn run(
        &self,
        job: &JobDescriptor,
        progress: &ProgressSink,
    ) -> Result<serde_json::Value, JenguError> {
        let spec = JobSpec::parse(&job.queue, &job.name, &job.payload)?;
        debug!(job_id = %job.job_id, name = %job.name, "Dispatching job");
        match spec {
            JobSpec::Enrich(p) => self.enrich(p, progress).await,
            JobSpec::Scrape(p) => self.scrape(p).await,
            JobSpec::BuildGraph(p) => self.build_graph(p).await,
            JobSpec::ScrapeSweep => self.scrape_sweep().await,
            JobSpec::GraphBuildSweep => self.graph_build_sweep().await,
            JobSpec::Summary(p) => self.summary(p).await,
            JobSpec::NeighborhoodIndex(p) => self.neighborhood_index(p).await,
            JobSpec::IndexSweep => self.index_sweep().await,
        }
    }

    // -- Enrichment -------------------------------------------------------

    async fn enrich(
        &self,
        payload: EnrichPayload,
        progress: &ProgressSink,
    ) -> Result<serde_json::Value, JenguError> {
        let outcome = self
            .ctx
            .pipeline
            .enrich_property(self.ctx.store.as_ref(), &payload.property_id, progress)
            .await?;

        // Completed enrichment chains a low-priority analytics summary
        // unless the deployment turned that off.
        if self.ctx.config.enrichment.auto_analytics && outcome.rows_total >= 1 {
            let spec = JobSpec::Summary(SummaryPayload {
                property_id: payload.property_id.clone(),
            });
            let opts = EnqueueOptions {
                priority: priority::LOW,
                ..Default::default()
            };
            let job_id = enqueue_job(self.ctx.queue.as_ref(), &spec, opts).await?;
            debug!(property_id = %payload.property_id, job_id, "Auto-enqueued analytics summary");
        }

        Ok(serde_json::to_value(&outcome)
            .map_err(|e| JenguError::Internal(format!("outcome serialisation: {e}")))?)
    }

    // -- Competitor queue -------------------------------------------------

    async fn scrape(&self, payload: ScrapePayload) -> Result<serde_json::Value, JenguError> {
        // Validation guarantees coordinates; keep the check close to use.
        let ScrapeLocation::Coordinates { .. } = payload.location else {
            return Err(JenguError::Validation(
                "scrape location must be coordinates".to_string(),
            ));
        };

        let property = self
            .ctx
            .store
            .get_property(&payload.property_id)
            .await?
            .ok_or_else(|| JenguError::NotFound(format!("property {}", payload.property_id)))?;

        let competitors = self.ctx.store.competitors_for(&payload.property_id).await?;
        if competitors.is_empty() {
            debug!(property_id = %payload.property_id, "No competitor graph, nothing to scrape");
            return Ok(json!({"competitors": 0, "snapshots": 0}));
        }

        let snapshots = self
            .ctx
            .scraper
            .scrape_prices(&property, &competitors)
            .await?;
        for snapshot in &snapshots {
            self.ctx
                .store
                .record_competitor_price(
                    &snapshot.competitor_id,
                    snapshot.price,
                    snapshot.observed_at,
                )
                .await?;
        }
        info!(
            property_id = %payload.property_id,
            competitors = competitors.len(),
            snapshots = snapshots.len(),
            "Competitor prices refreshed"
        );
        Ok(json!({
            "competitors": competitors.len(),
            "snapshots": snapshots.len(),
        }))
    }

    async fn build_graph(
        &self,
        payload: BuildGraphPayload,
    ) -> Result<serde_json::Value, JenguError> {
        let property = self
            .ctx
            .store
            .get_property(&payload.property_id)
            .await?
            .ok_or_else(|| JenguError::NotFound(format!("property {}", payload.property_id)))?;
        if !property.location.has_coordinates() {
            return Err(JenguError::Validation(format!(
                "property {} has no coordinates for graph build",
                payload.property_id
            )));
        }

        let mut competitors = self
            .ctx
            .scraper
            .discover(&property, MAX_COMPETITORS)
            .await?;
        competitors.truncate(MAX_COMPETITORS);
        self.ctx
            .store
            .replace_competitors(&payload.property_id, &competitors)
            .await?;
        // A fresh graph is due for its first scrape right away.
        self.ctx
            .store
            .set_next_scrape_at(&payload.property_id, Utc::now())
            .await?;

        info!(
            property_id = %payload.property_id,
            competitors = competitors.len(),
            "Competitor graph built"
        );
        Ok(json!({"competitors": competitors.len()}))
    }

    async fn scrape_sweep(&self) -> Result<serde_json::Value, JenguError> {
        let now = Utc::now();
        let due = self.ctx.store.properties_due_scrape(now).await?;
        let mut enqueued = 0;

        for property in &due {
            let (Some(latitude), Some(longitude)) =
                (property.location.latitude, property.location.longitude)
            else {
                warn!(property_id = %property.property_id, "Scrape due but no coordinates, skipping");
                continue;
            };
            let spec = JobSpec::Scrape(ScrapePayload {
                property_id: property.property_id.clone(),
                location: ScrapeLocation::Coordinates {
                    latitude,
                    longitude,
                },
            });
            enqueue_job(self.ctx.queue.as_ref(), &spec, EnqueueOptions::default()).await?;
            self.ctx
                .store
                .set_next_scrape_at(&property.property_id, now + Duration::hours(24))
                .await?;
            enqueued += 1;
        }

        info!(due = due.len(), enqueued, "Scrape sweep done");
        Ok(json!({"due": due.len(), "enqueued": enqueued}))
    }

    async fn graph_build_sweep(&self) -> Result<serde_json::Value, JenguError> {
        let batch = self.ctx.config.scheduler.graph_build_batch;
        let candidates = self.ctx.store.properties_without_graph(batch).await?;
        let mut enqueued = 0;

        for property in &candidates {
            let spec = JobSpec::BuildGraph(BuildGraphPayload {
                property_id: property.property_id.clone(),
            });
            enqueue_job(self.ctx.queue.as_ref(), &spec, EnqueueOptions::default()).await?;
            enqueued += 1;
        }

        info!(enqueued, "Graph-build sweep done");
        Ok(json!({"enqueued": enqueued}))
    }

    // -- Analytics queue --------------------------------------------------

    async fn index_sweep(&self) -> Result<serde_json::Value, JenguError> {
        let today = Utc::now().date_naive();
        let property_ids = self.ctx.store.properties_with_graph().await?;
        let mut enqueued = 0;

        for property_id in &property_ids {
            let spec = JobSpec::NeighborhoodIndex(IndexPayload {
                property_id: property_id.clone(),
                date: today,
            });
            // The date-stable job id collapses duplicate sweeps per day.
            enqueue_job(self.ctx.queue.as_ref(), &spec, EnqueueOptions::default()).await?;
            enqueued += 1;
        }

        info!(enqueued, "Index sweep done");
        Ok(json!({"enqueued": enqueued}))
    }

    async fn neighborhood_index(
        &self,
        payload: IndexPayload,
    ) -> Result<serde_json::Value, JenguError> {
        let outcome = self
            .ctx
            .index
            .compute(self.ctx.store.as_ref(), &payload.property_id, payload.date)
            .await?;
        Ok(match outcome {
            IndexOutcome::Computed(row) => json!({
                "outcome": "computed",
                "overall_index": row.overall_index,
                "market_position": row.market_position,
                "competitors_analyzed": row.competitors_analyzed,
            }),
            IndexOutcome::InsufficientData { competitors_found } => json!({
                "outcome": "insufficient_data",
                "competitors_found": competitors_found,
            }),
        })
    }

    async fn summary(&self, payload: SummaryPayload) -> Result<serde_json::Value, JenguError> {
        let rows = self.ctx.store.rows_for_property(&payload.property_id).await?;
        if rows.is_empty() {
            return Ok(json!({"property_id": payload.property_id, "rows_total": 0}));
        }

        let rows_total = rows.len();
        let rows_enriched = rows.iter().filter(|r| r.has_weather()).count();
        let price_sum: Decimal = rows.iter().map(|r| r.price).sum();
        let avg_price = price_sum / Decimal::from(rows_total as u64);

        let occupancies: Vec<f64> = rows.iter().filter_map(|r| r.occupancy_fraction()).collect();
        let avg_occupancy = if occupancies.is_empty() {
            None
        } else {
            Some(occupancies.iter().sum::<f64>() / occupancies.len() as f64)
        };

        let weekend_rows = rows.iter().filter(|r| r.is_weekend == Some(true)).count();
        let holiday_rows = rows.iter().filter(|r| r.is_holiday == Some(true)).count();
        let temperatures: Vec<f64> = rows.iter().filter_map(|r| r.temperature).collect();
        let avg_temperature = if temperatures.is_empty() {
            None
        } else {
            Some(temperatures.iter().sum::<f64>() / temperatures.len() as f64)
        };
        let severities: Vec<f64> = rows
            .iter()
            .filter_map(|r| r.weather_code)
            .map(|code| crate::enrichment::weather_codes::severity(code) as f64)
            .collect();
        let avg_weather_severity = if severities.is_empty() {
            None
        } else {
            Some(severities.iter().sum::<f64>() / severities.len() as f64)
        };

        Ok(json!({
            "property_id": payload.property_id,
            "rows_total": rows_total,
            "rows_enriched": rows_enriched,
            "avg_price": avg_price.round_dp(2).to_f64(),
            "avg_occupancy": avg_occupancy,
            "weekend_rows": weekend_rows,
            "holiday_rows": holiday_rows,
            "avg_temperature": avg_temperature,
            "avg_weather_severity": avg_weather_severity,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
