//! Persistence layer.
//!
//! The `Store` trait covers exactly what the core consumes: pricing-row
//! reads and null-preserving enrichment writes, property lifecycle,
//! competitor graphs, neighborhood index rows, API keys, and usage
//! records. The production database (Postgres with row-level security)
//! lives behind the same seam in the external layer; this crate ships a
//! durable sqlite implementation and an in-memory one for tests.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::types::{
    ApiKeyRecord, CompetitorRecord, EnrichmentStatus, Location, NeighborhoodIndexRow,
    PricingRow, Property, JenguError, UsageRecord,
};

/// Persistence operations used by the core.
///
/// All methods are crash-safe single operations; the queue provides the
/// coordination, the store just has to be atomic per call.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Properties -------------------------------------------------------

    async fn put_property(&self, property: &Property) -> Result<(), JenguError>;

    async fn get_property(&self, property_id: &str) -> Result<Option<Property>, JenguError>;

    /// Transition a property's enrichment status, recording error and
    /// warning strings and stamping `enriched_at` on completion.
    async fn set_enrichment_status(
        &self,
        property_id: &str,
        status: EnrichmentStatus,
        error: Option<String>,
        warning: Option<String>,
    ) -> Result<(), JenguError>;

    /// Update coordinates/timezone after geocoding.
    async fn update_location(
        &self,
        property_id: &str,
        location: &Location,
    ) -> Result<(), JenguError>;

    /// Properties whose next competitor scrape is due at or before `now`.
    async fn properties_due_scrape(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Property>, JenguError>;

    async fn set_next_scrape_at(
        &self,
        property_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), JenguError>;

    /// Property ids that currently have a competitor graph.
    async fn properties_with_graph(&self) -> Result<Vec<String>, JenguError>;

    /// Properties lacking a graph but holding coordinates, capped at
    /// `limit` (graph-build candidates).
    async fn properties_without_graph(
        &self,
        limit: usize,
    ) -> Result<Vec<Property>, JenguError>;

    // -- Pricing rows -----------------------------------------------------

    /// Insert rows, or update price/occupancy on (property_id, stay_date)
    /// conflict. Enrichment fields of existing rows are left untouched —
    /// they belong to the pipeline.
    async fn upsert_rows(&self, rows: &[PricingRow]) -> Result<(), JenguError>;

    async fn rows_for_property(
        &self,
        property_id: &str,
    ) -> Result<Vec<PricingRow>, JenguError>;

    /// Write back one row's enrichment block (keyed by row_id).
    async fn update_row(&self, row: &PricingRow) -> Result<(), JenguError>;

    // -- Competitor graph -------------------------------------------------

    /// Replace a property's competitor set wholesale (graph build /
    /// scrape refresh).
    async fn replace_competitors(
        &self,
        property_id: &str,
        competitors: &[CompetitorRecord],
    ) -> Result<(), JenguError>;

    async fn competitors_for(
        &self,
        property_id: &str,
    ) -> Result<Vec<CompetitorRecord>, JenguError>;

    /// Record a freshly scraped price for one competitor.
    async fn record_competitor_price(
        &self,
        competitor_id: &str,
        price: Decimal,
        seen_at: DateTime<Utc>,
    ) -> Result<(), JenguError>;

    // -- Neighborhood index -----------------------------------------------

    async fn put_index_row(&self, row: &NeighborhoodIndexRow) -> Result<(), JenguError>;

    async fn latest_index(
        &self,
        property_id: &str,
    ) -> Result<Option<NeighborhoodIndexRow>, JenguError>;

    async fn index_on(
        &self,
        property_id: &str,
        date: NaiveDate,
    ) -> Result<Option<NeighborhoodIndexRow>, JenguError>;

    /// Index rows for the trailing `days` days, newest first.
    async fn index_trend(
        &self,
        property_id: &str,
        days: u32,
    ) -> Result<Vec<NeighborhoodIndexRow>, JenguError>;

    // -- API keys & usage -------------------------------------------------

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), JenguError>;

    async fn api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, JenguError>;

    async fn record_usage(&self, record: &UsageRecord) -> Result<(), JenguError>;

    // -- Job bookkeeping --------------------------------------------------

    /// Remember the most recent enrichment job id for a property, so the
    /// status endpoint can resolve a property id to a job.
    async fn set_latest_enrichment_job(
        &self,
        property_id: &str,
        job_id: &str,
    ) -> Result<(), JenguError>;

    async fn latest_enrichment_job(
        &self,
        property_id: &str,
    ) -> Result<Option<String>, JenguError>;
}
