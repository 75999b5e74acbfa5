//! Data enrichment pipeline.
//!
//! Attaches weather, holiday, and temporal features to a property's
//! pricing rows. Weather and holidays come from the external fetchers
//! through the content-addressed cache; temporal features are derived
//! locally. Upserts are null-preserving so a repeat run with identical
//! inputs changes nothing.

pub mod temporal;
pub mod weather_codes;

use chrono::{Datelike, NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
    CachedWeather, CoordinateKey, EnrichmentCache, GeocodeKey, HolidayEntry, HolidayKey,
    WeatherKey,
};
use crate::fetchers::{GeocodeFetch, HolidayFetch, WeatherFetch};
use crate::store::Store;
use crate::types::{EnrichmentStatus, JenguError, Location};

/// Progress sink: receives 0…100 milestones during a run.
pub type ProgressSink = Arc<dyn Fn(u8) + Send + Sync>;

/// A sink that ignores progress — for callers that don't track it.
pub fn no_progress() -> ProgressSink {
    Arc::new(|_| {})
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Summary of one enrichment run, returned as the job's result payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnrichmentOutcome {
    pub rows_total: usize,
    pub rows_enriched: usize,
    pub weather_fetches: u32,
    pub holiday_fetches: u32,
    pub geocode_fetches: u32,
    /// Present when the run completed on degraded inputs.
    pub warning: Option<String>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Orchestrates enrichment for one property at a time.
///
/// Failure semantics: weather errors propagate (the queue retries
/// transient ones); holiday errors degrade to a warning since the
/// remaining features are still usable.
pub struct EnrichmentPipeline {
    cache: Arc<EnrichmentCache>,
    weather: Arc<dyn WeatherFetch>,
    holidays: Arc<dyn HolidayFetch>,
    geocode: Arc<dyn GeocodeFetch>,
    holidays_enabled: bool,
}

impl EnrichmentPipeline {
    pub fn new(
        cache: Arc<EnrichmentCache>,
        weather: Arc<dyn WeatherFetch>,
        holidays: Arc<dyn HolidayFetch>,
        geocode: Arc<dyn GeocodeFetch>,
        holidays_enabled: bool,
    ) -> Self {
        Self {
            cache,
            weather,
            holidays,
            geocode,
            holidays_enabled,
        }
    }

    /// Run enrichment for a property, transitioning its status
    /// `pending → processing → completed | failed`.
    pub async fn enrich_property(
        &self,
        store: &dyn Store,
        property_id: &str,
        progress: &ProgressSink,
    ) -> Result<EnrichmentOutcome, JenguError> {
        match self.run(store, property_id, progress).await {
            Ok(outcome) => {
                store
                    .set_enrichment_status(
                        property_id,
                        EnrichmentStatus::Completed,
                        None,
                        outcome.warning.clone(),
                    )
                    .await?;
                progress(100);
                info!(
                    property_id,
                    rows = outcome.rows_total,
                    enriched = outcome.rows_enriched,
                    weather_fetches = outcome.weather_fetches,
                    holiday_fetches = outcome.holiday_fetches,
                    warning = outcome.warning.as_deref().unwrap_or(""),
                    "Enrichment complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                // Best effort: the original error is what matters.
                if let Err(status_err) = store
                    .set_enrichment_status(
                        property_id,
                        EnrichmentStatus::Failed,
                        Some(e.to_string()),
                        None,
                    )
                    .await
                {
                    warn!(property_id, error = %status_err, "Failed to mark property failed");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        store: &dyn Store,
        property_id: &str,
        progress: &ProgressSink,
    ) -> Result<EnrichmentOutcome, JenguError> {
        let property = store
            .get_property(property_id)
            .await?
            .ok_or_else(|| JenguError::NotFound(format!("property {property_id}")))?;

        // Bring the state machine to Processing, taking the Pending step
        // when the caller enqueued without it (direct invocation, retry).
        let mut status = property.enrichment_status;
        if status.can_transition_to(EnrichmentStatus::Pending) {
            store
                .set_enrichment_status(property_id, EnrichmentStatus::Pending, None, None)
                .await?;
            status = EnrichmentStatus::Pending;
        }
        if status.can_transition_to(EnrichmentStatus::Processing) {
            store
                .set_enrichment_status(property_id, EnrichmentStatus::Processing, None, None)
                .await?;
        }
        progress(5);

        let mut outcome = EnrichmentOutcome {
            rows_total: 0,
            rows_enriched: 0,
            weather_fetches: 0,
            holiday_fetches: 0,
            geocode_fetches: 0,
            warning: None,
        };

        let location = self
            .resolve_coordinates(store, &property.location, property_id, &mut outcome)
            .await?;
        let (Some(latitude), Some(longitude)) = (location.latitude, location.longitude) else {
            return Err(JenguError::Internal(
                "geocoding returned no coordinates".to_string(),
            ));
        };
        progress(10);

        let mut rows = store.rows_for_property(property_id).await?;
        outcome.rows_total = rows.len();
        if rows.is_empty() {
            debug!(property_id, "No rows to enrich");
            return Ok(outcome);
        }

        let weather_map = self
            .gather_weather(latitude, longitude, &rows, &mut outcome)
            .await?;
        progress(40);

        let holiday_map = self
            .gather_holidays(&location, &rows, &mut outcome)
            .await;
        progress(60);

        // Null-preserving merge, row by row.
        let total = rows.len();
        for (i, row) in rows.iter_mut().enumerate() {
            let mut changed = false;

            let key = WeatherKey::new(latitude, longitude, row.stay_date);
            if let Some(day) = weather_map.get(&key) {
                if row.temperature.is_none() {
                    row.temperature = Some(day.temperature);
                    changed = true;
                }
                if row.precipitation.is_none() {
                    row.precipitation = Some(day.precipitation);
                    changed = true;
                }
                if row.weather_code.is_none() {
                    row.weather_code = Some(day.weather_code);
                    changed = true;
                }
                if row.weather_description.is_none() {
                    row.weather_description =
                        Some(weather_codes::describe(day.weather_code).to_string());
                    changed = true;
                }
                if row.sunshine_hours.is_none() {
                    row.sunshine_hours = Some(day.sunshine_hours);
                    changed = true;
                }
            }

            let year_holidays = holiday_map
                .as_ref()
                .and_then(|m| m.get(&row.stay_date.year()));
            let features = temporal::derive(
                row.stay_date,
                year_holidays.map(|v| v.as_slice()).unwrap_or(&[]),
            );
            if row.day_of_week.is_none() {
                row.day_of_week = Some(features.day_of_week);
                changed = true;
            }
            if row.month.is_none() {
                row.month = Some(features.month);
                changed = true;
            }
            if row.season.is_none() {
                row.season = Some(features.season);
                changed = true;
            }
            if row.is_weekend.is_none() {
                row.is_weekend = Some(features.is_weekend);
                changed = true;
            }
            // Holiday flags are only authoritative when we actually have
            // the year's list — otherwise they stay null for a later run.
            if year_holidays.is_some() {
                if row.is_holiday.is_none() {
                    row.is_holiday = Some(features.is_holiday);
                    changed = true;
                }
                if row.holiday_name.is_none() && features.holiday_name.is_some() {
                    row.holiday_name = features.holiday_name.clone();
                    changed = true;
                }
            }

            if changed {
                store.update_row(row).await?;
                outcome.rows_enriched += 1;
            }

            progress(60 + ((i + 1) * 35 / total) as u8);
        }

        Ok(outcome)
    }

    /// Ensure the property has coordinates, geocoding by city when
    /// necessary. Persists resolved coordinates back to the store.
    async fn resolve_coordinates(
        &self,
        store: &dyn Store,
        location: &Location,
        property_id: &str,
        outcome: &mut EnrichmentOutcome,
    ) -> Result<Location, JenguError> {
        if location.has_coordinates() {
            return Ok(location.clone());
        }

        let (city, country) = match (&location.city, &location.country_code) {
            (Some(city), Some(country)) => (city.clone(), country.clone()),
            _ => {
                return Err(JenguError::Validation(
                    "property has neither coordinates nor a (city, country) pair".to_string(),
                ))
            }
        };

        let key = GeocodeKey::new(&city, &country);
        let hit = match self.cache.get_geocode(&key) {
            Some(hit) => hit,
            None => {
                let _lease = self.cache.lease_geocode(&key).await;
                match self.cache.get_geocode(&key) {
                    Some(hit) => hit,
                    None => {
                        let hit = self.geocode.geocode(&city, &country).await?;
                        outcome.geocode_fetches += 1;
                        self.cache.put_geocode(key, hit.clone());
                        hit
                    }
                }
            }
        };

        let mut resolved = location.clone();
        resolved.latitude = Some(hit.latitude);
        resolved.longitude = Some(hit.longitude);
        if resolved.timezone.is_none() {
            resolved.timezone = hit.timezone.clone();
        }
        store.update_location(property_id, &resolved).await?;
        debug!(property_id, city = %city, "Geocoded property");
        Ok(resolved)
    }

    /// Collect weather for every row date that still lacks it: cache
    /// first, then one batched range request per contiguous gap, all
    /// under the coordinate lease.
    async fn gather_weather(
        &self,
        latitude: f64,
        longitude: f64,
        rows: &[crate::types::PricingRow],
        outcome: &mut EnrichmentOutcome,
    ) -> Result<HashMap<WeatherKey, CachedWeather>, JenguError> {
        let today = Utc::now().date_naive();
        let needed: BTreeSet<NaiveDate> = rows
            .iter()
            .filter(|r| r.temperature.is_none() && r.stay_date <= today)
            .map(|r| r.stay_date)
            .collect();

        let mut found: HashMap<WeatherKey, CachedWeather> = HashMap::new();
        let mut missing: Vec<NaiveDate> = Vec::new();
        for date in &needed {
            let key = WeatherKey::new(latitude, longitude, *date);
            match self.cache.get_weather(&key) {
                Some(day) => {
                    found.insert(key, day);
                }
                None => missing.push(*date),
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        // One fetch per fingerprint: everyone else racing on this
        // coordinate waits here, then finds the cache warm.
        let coord = CoordinateKey::new(latitude, longitude);
        let _lease = self.cache.lease_weather(coord).await;

        missing.retain(|date| {
            let key = WeatherKey::new(latitude, longitude, *date);
            match self.cache.get_weather(&key) {
                Some(day) => {
                    found.insert(key, day);
                    false
                }
                None => true,
            }
        });

        for (start, end) in contiguous_ranges(&missing) {
            let days = self
                .weather
                .fetch_range(latitude, longitude, start, end)
                .await?;
            outcome.weather_fetches += 1;
            for day in days {
                let key = WeatherKey::new(latitude, longitude, day.date);
                let cached = CachedWeather {
                    temperature: day.temperature,
                    precipitation: day.precipitation,
                    weather_code: day.weather_code,
                    sunshine_hours: day.sunshine_hours,
                };
                self.cache.put_weather(key, cached.clone());
                found.insert(key, cached);
            }
        }

        Ok(found)
    }

    /// Collect holiday lists per year spanned by the rows. Failures
    /// degrade to a warning — the weather and temporal features remain
    /// usable without them.
    async fn gather_holidays(
        &self,
        location: &Location,
        rows: &[crate::types::PricingRow],
        outcome: &mut EnrichmentOutcome,
    ) -> Option<HashMap<i32, Vec<HolidayEntry>>> {
        if !self.holidays_enabled {
            return None;
        }
        let Some(country) = location.country_code.clone() else {
            outcome.warning = Some("no country code; holiday features skipped".to_string());
            return None;
        };

        let years: BTreeSet<i32> = rows.iter().map(|r| r.stay_date.year()).collect();
        let mut map: HashMap<i32, Vec<HolidayEntry>> = HashMap::new();

        for year in years {
            let key = HolidayKey::new(&country, year);
            if let Some(list) = self.cache.get_holidays(&key) {
                map.insert(year, list);
                continue;
            }
            let _lease = self.cache.lease_holidays(&key).await;
            if let Some(list) = self.cache.get_holidays(&key) {
                map.insert(year, list);
                continue;
            }
            match self.holidays.fetch_year(&country, year).await {
                Ok(list) => {
                    outcome.holiday_fetches += 1;
                    self.cache.put_holidays(key, list.clone());
                    map.insert(year, list);
                }
                Err(e) => {
                    warn!(country = %country, year, error = %e, "Holiday fetch failed, continuing");
                    outcome.warning =
                        Some(format!("holidays unavailable for {country} {year}: {e}"));
                }
            }
        }

        Some(map)
    }
}

/// Coalesce a sorted list of dates into inclusive contiguous ranges.
fn contiguous_ranges(dates: &[NaiveDate]) -> Vec<(NaiveDate, NaiveDate)> {
    let mut ranges = Vec::new();
    let mut iter = dates.iter();
    let Some(&first) = iter.next() else {
        return ranges;
    };
    let mut start = first;
    let mut prev = first;
    for &date in iter {
        if (date - prev).num_days() > 1 {
            ranges.push((start, prev));
            start = date;
        }
        prev = date;
    }
    ranges.push((start, prev));
    ranges
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
