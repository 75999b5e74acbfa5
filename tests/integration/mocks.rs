//! Deterministic mocks for integration testing.
//!
//! Provides counting fake fetchers, a controllable competitor scraper,
//! and a `TestRig` that wires the full dispatch stack (store, queue,
//! cache, pipeline, index engine) the way `main.rs` does — all
//! in-memory with no external dependencies.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use jengu::cache::{CachedGeocode, EnrichmentCache, HolidayEntry};
use jengu::config::AppConfig;
use jengu::enrichment::EnrichmentPipeline;
use jengu::fetchers::{DailyWeather, FetchError, GeocodeFetch, HolidayFetch, WeatherFetch};
use jengu::index::IndexEngine;
use jengu::jobs::handlers::{Dispatcher, JobContext};
use jengu::jobs::{CompetitorPriceSnapshot, CompetitorScraper};
use jengu::progress::ProgressBus;
use jengu::queue::memory::MemoryQueue;
use jengu::store::memory::MemoryStore;
use jengu::store::Store;
use jengu::types::{
    ApiKeyRecord, ApiKeyRole, CompetitorRecord, JenguError, Location, PricingRow, Property,
};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// A Paris property owned by `user-001`.
pub fn paris_property(property_id: &str) -> Property {
    let mut location = Location::at(48.8566, 2.3522);
    location.country_code = Some("FR".to_string());
    location.city = Some("Paris".to_string());
    Property::new(property_id, "user-001", "Test Hotel", location)
}

/// An active read-write API key with the given scopes and roomy quotas.
/// `key_hash` starts empty; callers hash their chosen secret into it.
pub fn api_key(key_id: &str, scopes: &[&str]) -> ApiKeyRecord {
    ApiKeyRecord {
        key_id: key_id.to_string(),
        key_hash: String::new(),
        user_id: "user-001".to_string(),
        role: ApiKeyRole::ReadWrite,
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        allowed_ips: Vec::new(),
        quota_per_minute: 60,
        quota_per_hour: 1000,
        quota_per_day: 10_000,
        is_active: true,
        expires_at: None,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Counting fetchers
// ---------------------------------------------------------------------------

/// Weather fake: every day 6.5 °C, light rain, code 61. Counts calls.
pub struct CountingWeather {
    calls: AtomicU32,
}

impl CountingWeather {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WeatherFetch for CountingWeather {
    async fn fetch_range(
        &self,
        _latitude: f64,
        _longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyWeather>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut days = Vec::new();
        let mut d = start;
        while d <= end {
            days.push(DailyWeather {
                date: d,
                temperature: 6.5,
                precipitation: 1.2,
                weather_code: 61,
                sunshine_hours: 3.0,
            });
            d += chrono::Duration::days(1);
        }
        Ok(days)
    }
}

/// Holiday fake: every year has New Year's Day. Counts calls.
pub struct CountingHolidays {
    calls: AtomicU32,
}

impl CountingHolidays {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HolidayFetch for CountingHolidays {
    async fn fetch_year(
        &self,
        _country_code: &str,
        year: i32,
    ) -> Result<Vec<HolidayEntry>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![HolidayEntry {
            date: date(year, 1, 1),
            name: "Jour de l'an".to_string(),
        }])
    }
}

pub struct CountingGeocode {
    calls: AtomicU32,
}

impl CountingGeocode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    #[allow(dead_code)]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeocodeFetch for CountingGeocode {
    async fn geocode(
        &self,
        _city: &str,
        _country_code: &str,
    ) -> Result<CachedGeocode, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CachedGeocode {
            latitude: 48.8566,
            longitude: 2.3522,
            timezone: Some("Europe/Paris".to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Mock scraper
// ---------------------------------------------------------------------------

/// A deterministic `CompetitorScraper`: discovery returns a fixed set of
/// competitors around the property, scraping prices them all at 101.
/// All operations can be forced to fail from test code.
pub struct MockScraper {
    competitors_per_property: usize,
    force_error: Mutex<Option<String>>,
    scrapes: AtomicU32,
}

impl MockScraper {
    pub fn new(competitors_per_property: usize) -> Arc<Self> {
        Arc::new(Self {
            competitors_per_property,
            force_error: Mutex::new(None),
            scrapes: AtomicU32::new(0),
        })
    }

    #[allow(dead_code)]
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn scrapes(&self) -> u32 {
        self.scrapes.load(Ordering::SeqCst)
    }

    fn check_error(&self) -> Result<(), JenguError> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(JenguError::TransientUpstream(msg));
        }
        Ok(())
    }
}

#[async_trait]
impl CompetitorScraper for MockScraper {
    async fn scrape_prices(
        &self,
        _property: &Property,
        competitors: &[CompetitorRecord],
    ) -> Result<Vec<CompetitorPriceSnapshot>, JenguError> {
        self.check_error()?;
        self.scrapes.fetch_add(1, Ordering::SeqCst);
        Ok(competitors
            .iter()
            .enumerate()
            .map(|(i, c)| CompetitorPriceSnapshot {
                competitor_id: c.competitor_id.clone(),
                price: dec!(90) + rust_decimal::Decimal::from(i as u32 * 15),
                observed_at: Utc::now(),
            })
            .collect())
    }

    async fn discover(
        &self,
        property: &Property,
        limit: usize,
    ) -> Result<Vec<CompetitorRecord>, JenguError> {
        self.check_error()?;
        Ok((0..self.competitors_per_property.min(limit))
            .map(|i| CompetitorRecord {
                competitor_id: format!("{}-comp-{i}", property.property_id),
                property_id: property.property_id.clone(),
                name: format!("Rival {i}"),
                latitude: 48.85 + 0.001 * i as f64,
                longitude: 2.35,
                distance_km: 0.2 * (i + 1) as f64,
                star_rating: Some(3.0 + 0.5 * (i % 4) as f64),
                review_score: Some(7.0 + 0.5 * (i % 5) as f64),
                last_price: None,
                last_seen_at: None,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Test rig
// ---------------------------------------------------------------------------

/// The full dispatch stack, wired like production but in-memory.
pub struct TestRig {
    pub config: Arc<AppConfig>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub cache: Arc<EnrichmentCache>,
    pub bus: Arc<ProgressBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub weather: Arc<CountingWeather>,
    pub holidays: Arc<CountingHolidays>,
    pub scraper: Arc<MockScraper>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_config(AppConfig::for_tests())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(120));
        let cache = Arc::new(EnrichmentCache::new());
        let weather = CountingWeather::new();
        let holidays = CountingHolidays::new();
        let scraper = MockScraper::new(5);

        let pipeline = Arc::new(EnrichmentPipeline::new(
            cache.clone(),
            weather.clone(),
            holidays.clone(),
            CountingGeocode::new(),
            config.enrichment.holidays_enabled,
        ));
        let dispatcher = Arc::new(Dispatcher::new(JobContext {
            config: config.clone(),
            store: store.clone(),
            queue: queue.clone(),
            pipeline,
            index: Arc::new(IndexEngine::new()),
            scraper: scraper.clone(),
        }));

        Self {
            config,
            store,
            queue,
            cache,
            bus: Arc::new(ProgressBus::new()),
            dispatcher,
            weather,
            holidays,
            scraper,
        }
    }

    /// Seed a Paris property with `days` January-2024 rows.
    pub async fn seed_property(&self, property_id: &str, days: u32) {
        self.store
            .put_property(&paris_property(property_id))
            .await
            .unwrap();

        let rows: Vec<PricingRow> = (1..=days)
            .map(|day| {
                PricingRow::new(property_id, "user-001", date(2024, 1, day), dec!(120.00))
            })
            .collect();
        self.store.upsert_rows(&rows).await.unwrap();
    }
}
