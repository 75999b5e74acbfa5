//! Job definitions.
//!
//! Each queue has a finite set of job names; payloads are a sum type
//! (`JobSpec`) dispatched by name. Unknown job names and malformed
//! payloads fail validation at enqueue, never at dispatch. The helpers
//! here also assign the canonical family-prefixed job ids.

pub mod handlers;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::queue::{job_id, names, EnqueueOptions, JobQueue};
use crate::types::{CompetitorRecord, JenguError, Property};

// ---------------------------------------------------------------------------
// Job names
// ---------------------------------------------------------------------------

pub mod job_names {
    // enrichment queue
    pub const ENRICH: &str = "enrich";
    // competitor queue
    pub const SCRAPE: &str = "scrape";
    pub const BUILD_GRAPH: &str = "build-graph";
    pub const SCRAPE_SWEEP: &str = "scrape-sweep";
    pub const GRAPH_BUILD_SWEEP: &str = "graph-build-sweep";
    // analytics queue
    pub const SUMMARY: &str = "summary";
    pub const NEIGHBORHOOD_INDEX: &str = "neighborhood-index";
    pub const INDEX_SWEEP: &str = "index-sweep";
}

/// Whether (queue, name) names a real job.
pub fn is_known(queue: &str, name: &str) -> bool {
    use job_names::*;
    match queue {
        names::ENRICHMENT => name == ENRICH,
        names::COMPETITOR => {
            matches!(name, SCRAPE | BUILD_GRAPH | SCRAPE_SWEEP | GRAPH_BUILD_SWEEP)
        }
        names::ANALYTICS => matches!(name, SUMMARY | NEIGHBORHOOD_INDEX | INDEX_SWEEP),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Scrape input location. The upstream contract historically allowed a
/// bare string here; that form is rejected at validation until the
/// scrape path grows geocoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScrapeLocation {
    Coordinates { latitude: f64, longitude: f64 },
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichPayload {
    pub property_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapePayload {
    pub property_id: String,
    pub location: ScrapeLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildGraphPayload {
    pub property_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub property_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexPayload {
    pub property_id: String,
    pub date: NaiveDate,
}

/// The sum of every job the workers know how to run.
#[derive(Debug, Clone)]
pub enum JobSpec {
    Enrich(EnrichPayload),
    Scrape(ScrapePayload),
    BuildGraph(BuildGraphPayload),
    ScrapeSweep,
    GraphBuildSweep,
    Summary(SummaryPayload),
    NeighborhoodIndex(IndexPayload),
    IndexSweep,
}

impl JobSpec {
    pub fn queue(&self) -> &'static str {
        match self {
            JobSpec::Enrich(_) => names::ENRICHMENT,
            JobSpec::Scrape(_)
            | JobSpec::BuildGraph(_)
            | JobSpec::ScrapeSweep
            | JobSpec::GraphBuildSweep => names::COMPETITOR,
            JobSpec::Summary(_) | JobSpec::NeighborhoodIndex(_) | JobSpec::IndexSweep => {
                names::ANALYTICS
            }
        }
    }

    pub fn name(&self) -> &'static str {
        use job_names::*;
        match self {
            JobSpec::Enrich(_) => ENRICH,
            JobSpec::Scrape(_) => SCRAPE,
            JobSpec::BuildGraph(_) => BUILD_GRAPH,
            JobSpec::ScrapeSweep => SCRAPE_SWEEP,
            JobSpec::GraphBuildSweep => GRAPH_BUILD_SWEEP,
            JobSpec::Summary(_) => SUMMARY,
            JobSpec::NeighborhoodIndex(_) => NEIGHBORHOOD_INDEX,
            JobSpec::IndexSweep => INDEX_SWEEP,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            JobSpec::Enrich(p) => serde_json::to_value(p).unwrap_or_default(),
            JobSpec::Scrape(p) => serde_json::to_value(p).unwrap_or_default(),
            JobSpec::BuildGraph(p) => serde_json::to_value(p).unwrap_or_default(),
            JobSpec::Summary(p) => serde_json::to_value(p).unwrap_or_default(),
            JobSpec::NeighborhoodIndex(p) => serde_json::to_value(p).unwrap_or_default(),
            JobSpec::ScrapeSweep | JobSpec::GraphBuildSweep | JobSpec::IndexSweep => {
                serde_json::json!({})
            }
        }
    }

    /// The canonical family-prefixed id for this job instance.
    pub fn default_job_id(&self, now: DateTime<Utc>) -> String {
        match self {
            JobSpec::Enrich(p) => job_id::enrichment(&p.property_id, now),
            JobSpec::Scrape(p) => job_id::competitor(&p.property_id, now),
            JobSpec::BuildGraph(p) => {
                format!("competitor-graph-{}-{}", p.property_id, now.timestamp_millis())
            }
            JobSpec::Summary(_) => job_id::analytics(),
            JobSpec::NeighborhoodIndex(p) => job_id::index(&p.property_id, p.date),
            // Sweeps are enqueued by the scheduler with bucket-stable ids;
            // a manual trigger still gets a valid family prefix.
            JobSpec::ScrapeSweep => format!("competitor-daily:{}", now.timestamp()),
            JobSpec::GraphBuildSweep => format!("competitor-graph-build:{}", now.timestamp()),
            JobSpec::IndexSweep => format!("index-daily:{}", now.timestamp()),
        }
    }

    /// Decode a (queue, name, payload) triple into a typed spec.
    /// This is enqueue-time validation; dispatch re-uses it and cannot
    /// see names this function rejects.
    pub fn parse(
        queue: &str,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<JobSpec, JenguError> {
        use job_names::*;
        if !is_known(queue, name) {
            return Err(JenguError::Validation(format!(
                "unknown job {name:?} for queue {queue:?}"
            )));
        }
        let bad = |e: serde_json::Error| {
            JenguError::Validation(format!("invalid {name} payload: {e}"))
        };
        let spec = match name {
            ENRICH => JobSpec::Enrich(serde_json::from_value(payload.clone()).map_err(bad)?),
            SCRAPE => {
                let p: ScrapePayload = serde_json::from_value(payload.clone()).map_err(bad)?;
                if let ScrapeLocation::Text(_) = p.location {
                    return Err(JenguError::Validation(
                        "scrape location must be coordinates; string locations are not \
                         geocoded yet"
                            .to_string(),
                    ));
                }
                JobSpec::Scrape(p)
            }
            BUILD_GRAPH => {
                JobSpec::BuildGraph(serde_json::from_value(payload.clone()).map_err(bad)?)
            }
            SCRAPE_SWEEP => JobSpec::ScrapeSweep,
            GRAPH_BUILD_SWEEP => JobSpec::GraphBuildSweep,
            SUMMARY => JobSpec::Summary(serde_json::from_value(payload.clone()).map_err(bad)?),
            NEIGHBORHOOD_INDEX => {
                JobSpec::NeighborhoodIndex(serde_json::from_value(payload.clone()).map_err(bad)?)
            }
            INDEX_SWEEP => JobSpec::IndexSweep,
            _ => unreachable!("is_known covers every name"),
        };
        Ok(spec)
    }
}

/// Validate and enqueue a typed job, assigning the canonical id unless
/// the caller supplies one.
pub async fn enqueue_job(
    queue: &dyn JobQueue,
    spec: &JobSpec,
    mut opts: EnqueueOptions,
) -> Result<String, JenguError> {
    if opts.job_id.is_none() {
        opts.job_id = Some(spec.default_job_id(Utc::now()));
    }
    queue
        .enqueue(spec.queue(), spec.name(), spec.payload(), opts)
        .await
}

// ---------------------------------------------------------------------------
// External scraper seam
// ---------------------------------------------------------------------------

/// One observed competitor price.
#[derive(Debug, Clone)]
pub struct CompetitorPriceSnapshot {
    pub competitor_id: String,
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// The competitor web-scraper is an external collaborator: the core only
/// enqueues scrape work and consumes its results through this seam.
#[async_trait::async_trait]
pub trait CompetitorScraper: Send + Sync {
    /// Current prices for an existing competitor set.
    async fn scrape_prices(
        &self,
        property: &Property,
        competitors: &[CompetitorRecord],
    ) -> Result<Vec<CompetitorPriceSnapshot>, JenguError>;

    /// Candidate competitors near a property, with distance and rating
    /// metadata precomputed, capped at `limit`.
    async fn discover(
        &self,
        property: &Property,
        limit: usize,
    ) -> Result<Vec<CompetitorRecord>, JenguError>;
}

/// Placeholder wired in deployments that haven't connected the scraper
/// service: scrape jobs fail permanently instead of silently no-opping.
pub struct UnconfiguredScraper;

#[async_trait::async_trait]
impl CompetitorScraper for UnconfiguredScraper {
    async fn scrape_prices(
        &self,
        _property: &Property,
        _competitors: &[CompetitorRecord],
    ) -> Result<Vec<CompetitorPriceSnapshot>, JenguError> {
        Err(JenguError::PermanentUpstream(
            "competitor scraper is not configured".to_string(),
        ))
    }

    async fn discover(
        &self,
        _property: &Property,
        _limit: usize,
    ) -> Result<Vec<CompetitorRecord>, JenguError> {
        Err(JenguError::PermanentUpstream(
            "competitor scraper is not configured".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
