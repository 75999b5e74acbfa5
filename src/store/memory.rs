//! In-memory store.
//!
//! Backs unit and integration tests with the exact `Store` contract the
//! sqlite implementation honours. All state lives behind a single mutex —
//! contention is irrelevant at test scale.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

use super::Store;
use crate::types::{
    ApiKeyRecord, CompetitorRecord, EnrichmentStatus, JenguError, Location,
    NeighborhoodIndexRow, PricingRow, Property, UsageRecord,
};

#[derive(Default)]
struct Inner {
    properties: HashMap<String, Property>,
    /// row_id → row
    rows: HashMap<String, PricingRow>,
    /// (property_id, stay_date) → row_id
    row_index: HashMap<(String, NaiveDate), String>,
    competitors: HashMap<String, Vec<CompetitorRecord>>,
    index_rows: HashMap<String, Vec<NeighborhoodIndexRow>>,
    api_keys: HashMap<String, ApiKeyRecord>,
    usage: Vec<UsageRecord>,
    latest_enrichment_jobs: HashMap<String, String>,
}

/// A fully in-memory `Store`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All usage records seen so far (test inspection).
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.inner.lock().unwrap().usage.clone()
    }

    /// Total stored rows (test inspection).
    pub fn row_count(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    // -- Properties -------------------------------------------------------

    async fn put_property(&self, property: &Property) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .properties
            .insert(property.property_id.clone(), property.clone());
        Ok(())
    }

    async fn get_property(&self, property_id: &str) -> Result<Option<Property>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.properties.get(property_id).cloned())
    }

    async fn set_enrichment_status(
        &self,
        property_id: &str,
        status: EnrichmentStatus,
        error: Option<String>,
        warning: Option<String>,
    ) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        let property = inner
            .properties
            .get_mut(property_id)
            .ok_or_else(|| JenguError::NotFound(format!("property {property_id}")))?;
        property.enrichment_status = status;
        property.enrichment_error = error;
        property.enrichment_warning = warning;
        if status == EnrichmentStatus::Completed {
            property.enriched_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_location(
        &self,
        property_id: &str,
        location: &Location,
    ) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        let property = inner
            .properties
            .get_mut(property_id)
            .ok_or_else(|| JenguError::NotFound(format!("property {property_id}")))?;
        property.location = location.clone();
        Ok(())
    }

    async fn properties_due_scrape(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Property>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .properties
            .values()
            .filter(|p| p.next_scrape_at.map_or(false, |at| at <= now))
            .cloned()
            .collect())
    }

    async fn set_next_scrape_at(
        &self,
        property_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        let property = inner
            .properties
            .get_mut(property_id)
            .ok_or_else(|| JenguError::NotFound(format!("property {property_id}")))?;
        property.next_scrape_at = Some(at);
        Ok(())
    }

    async fn properties_with_graph(&self) -> Result<Vec<String>, JenguError> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner
            .competitors
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn properties_without_graph(
        &self,
        limit: usize,
    ) -> Result<Vec<Property>, JenguError> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<Property> = inner
            .properties
            .values()
            .filter(|p| {
                p.location.has_coordinates()
                    && inner
                        .competitors
                        .get(&p.property_id)
                        .map_or(true, |v| v.is_empty())
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.property_id.cmp(&b.property_id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    // -- Pricing rows -----------------------------------------------------

    async fn upsert_rows(&self, rows: &[PricingRow]) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        for row in rows {
            let key = (row.property_id.clone(), row.stay_date);
            match inner.row_index.get(&key) {
                Some(existing_id) => {
                    let existing_id = existing_id.clone();
                    let existing = inner.rows.get_mut(&existing_id).expect("index in sync");
                    // Upload path only touches the commercial fields.
                    existing.price = row.price;
                    existing.occupancy = row.occupancy;
                    existing.bookings = row.bookings;
                    existing.availability = row.availability;
                }
                None => {
                    inner.row_index.insert(key, row.row_id.clone());
                    inner.rows.insert(row.row_id.clone(), row.clone());
                }
            }
        }
        Ok(())
    }

    async fn rows_for_property(
        &self,
        property_id: &str,
    ) -> Result<Vec<PricingRow>, JenguError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<PricingRow> = inner
            .rows
            .values()
            .filter(|r| r.property_id == property_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.stay_date);
        Ok(rows)
    }

    async fn update_row(&self, row: &PricingRow) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.rows.contains_key(&row.row_id) {
            return Err(JenguError::NotFound(format!("row {}", row.row_id)));
        }
        inner.rows.insert(row.row_id.clone(), row.clone());
        Ok(())
    }

    // -- Competitor graph -------------------------------------------------

    async fn replace_competitors(
        &self,
        property_id: &str,
        competitors: &[CompetitorRecord],
    ) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .competitors
            .insert(property_id.to_string(), competitors.to_vec());
        Ok(())
    }

    async fn competitors_for(
        &self,
        property_id: &str,
    ) -> Result<Vec<CompetitorRecord>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.competitors.get(property_id).cloned().unwrap_or_default())
    }

    async fn record_competitor_price(
        &self,
        competitor_id: &str,
        price: Decimal,
        seen_at: DateTime<Utc>,
    ) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        for records in inner.competitors.values_mut() {
            for r in records.iter_mut() {
                if r.competitor_id == competitor_id {
                    r.last_price = Some(price);
                    r.last_seen_at = Some(seen_at);
                }
            }
        }
        Ok(())
    }

    // -- Neighborhood index -----------------------------------------------

    async fn put_index_row(&self, row: &NeighborhoodIndexRow) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        let rows = inner
            .index_rows
            .entry(row.property_id.clone())
            .or_default();
        rows.retain(|r| r.index_date != row.index_date);
        rows.push(row.clone());
        rows.sort_by_key(|r| r.index_date);
        Ok(())
    }

    async fn latest_index(
        &self,
        property_id: &str,
    ) -> Result<Option<NeighborhoodIndexRow>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .index_rows
            .get(property_id)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn index_on(
        &self,
        property_id: &str,
        date: NaiveDate,
    ) -> Result<Option<NeighborhoodIndexRow>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .index_rows
            .get(property_id)
            .and_then(|rows| rows.iter().find(|r| r.index_date == date).cloned()))
    }

    async fn index_trend(
        &self,
        property_id: &str,
        days: u32,
    ) -> Result<Vec<NeighborhoodIndexRow>, JenguError> {
        let inner = self.inner.lock().unwrap();
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(days as i64);
        let mut rows: Vec<NeighborhoodIndexRow> = inner
            .index_rows
            .get(property_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.index_date >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| b.index_date.cmp(&a.index_date));
        Ok(rows)
    }

    // -- API keys & usage -------------------------------------------------

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        inner.api_keys.insert(record.key_hash.clone(), record.clone());
        Ok(())
    }

    async fn api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.api_keys.get(key_hash).cloned())
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        inner.usage.push(record.clone());
        Ok(())
    }

    // -- Job bookkeeping --------------------------------------------------

    async fn set_latest_enrichment_job(
        &self,
        property_id: &str,
        job_id: &str,
    ) -> Result<(), JenguError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .latest_enrichment_jobs
            .insert(property_id.to_string(), job_id.to_string());
        Ok(())
    }

    async fn latest_enrichment_job(
        &self,
        property_id: &str,
    ) -> Result<Option<String>, JenguError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.latest_enrichment_jobs.get(property_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
