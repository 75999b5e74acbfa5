//! Content-addressed memoization of third-party API results.
//!
//! Three keyed caches back the enrichment pipeline: weather by
//! (rounded-lat, rounded-lon, date), public holidays by (country, year),
//! and geocoding by (city, country). TTL varies by key class — historical
//! weather never changes so it is kept indefinitely, today's weather and
//! holiday lists expire.
//!
//! Concurrency: reads are cheap and concurrent; a read that misses takes
//! a per-key lease so that concurrent enrichment of the same fingerprint
//! performs at most one upstream fetch.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Weather fingerprint: coordinates rounded to 4 decimal places + date.
///
/// Rounding is stored as integer micro-degrees ×10⁴ so the key is `Eq`
/// and `Hash` without float comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeatherKey {
    pub lat_e4: i64,
    pub lon_e4: i64,
    pub date: NaiveDate,
}

impl WeatherKey {
    pub fn new(latitude: f64, longitude: f64, date: NaiveDate) -> Self {
        Self {
            lat_e4: round_e4(latitude),
            lon_e4: round_e4(longitude),
            date,
        }
    }

    /// The rounded latitude as a float (for upstream requests).
    pub fn latitude(&self) -> f64 {
        self.lat_e4 as f64 / 10_000.0
    }

    pub fn longitude(&self) -> f64 {
        self.lon_e4 as f64 / 10_000.0
    }
}

/// Coordinate pair without the date — the lease granularity for batched
/// range fetches (one lease covers every date at that coordinate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoordinateKey {
    pub lat_e4: i64,
    pub lon_e4: i64,
}

impl CoordinateKey {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            lat_e4: round_e4(latitude),
            lon_e4: round_e4(longitude),
        }
    }
}

fn round_e4(v: f64) -> i64 {
    (v * 10_000.0).round() as i64
}

/// Holiday cache key: ISO country code + calendar year.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolidayKey {
    pub country_code: String,
    pub year: i32,
}

impl HolidayKey {
    pub fn new(country_code: &str, year: i32) -> Self {
        Self {
            country_code: country_code.to_uppercase(),
            year,
        }
    }
}

/// Geocode cache key: lowercased city + country code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeocodeKey {
    pub city: String,
    pub country_code: String,
}

impl GeocodeKey {
    pub fn new(city: &str, country_code: &str) -> Self {
        Self {
            city: city.trim().to_lowercase(),
            country_code: country_code.to_uppercase(),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// One day of cached weather observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedWeather {
    pub temperature: f64,
    pub precipitation: f64,
    pub weather_code: i32,
    pub sunshine_hours: f64,
}

/// A public holiday (date + local name).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolidayEntry {
    pub date: NaiveDate,
    pub name: String,
}

/// Cached geocoding result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedGeocode {
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: Option<String>,
}

// ---------------------------------------------------------------------------
// TTL store
// ---------------------------------------------------------------------------

struct Entry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    /// None = kept indefinitely.
    ttl: Option<Duration>,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => now - self.inserted_at < ttl,
            None => true,
        }
    }
}

/// A small TTL map shared by the three key classes.
struct TtlStore<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> TtlStore<K, V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).and_then(|e| {
            if e.is_fresh(Utc::now()) {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    fn insert(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Utc::now(),
                ttl,
            },
        );
    }

    fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Keyed leases (single flight)
// ---------------------------------------------------------------------------

/// Per-key async locks. Holding the guard for a key means "I am the one
/// fetch in flight for this fingerprint"; later arrivals block on the
/// same lease, then re-check the cache and find a hit.
struct KeyedLeases<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: std::hash::Hash + Eq + Clone> KeyedLeases<K> {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop lease entries nobody is waiting on.
    fn prune(&self) {
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, l| Arc::strong_count(l) > 1);
    }
}

// ---------------------------------------------------------------------------
// Enrichment cache
// ---------------------------------------------------------------------------

/// TTL for today's (still-changing) weather.
const TODAY_WEATHER_TTL_HOURS: i64 = 24;

/// TTL for holiday lists.
const HOLIDAY_TTL_DAYS: i64 = 365;

/// TTL for geocode results.
const GEOCODE_TTL_DAYS: i64 = 90;

/// The shared cache consulted by the enrichment pipeline before any
/// upstream fetch.
pub struct EnrichmentCache {
    weather: TtlStore<WeatherKey, CachedWeather>,
    holidays: TtlStore<HolidayKey, Vec<HolidayEntry>>,
    geocode: TtlStore<GeocodeKey, CachedGeocode>,
    weather_leases: KeyedLeases<CoordinateKey>,
    holiday_leases: KeyedLeases<HolidayKey>,
    geocode_leases: KeyedLeases<GeocodeKey>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EnrichmentCache {
    pub fn new() -> Self {
        Self {
            weather: TtlStore::new(),
            holidays: TtlStore::new(),
            geocode: TtlStore::new(),
            weather_leases: KeyedLeases::new(),
            holiday_leases: KeyedLeases::new(),
            geocode_leases: KeyedLeases::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    // -- Weather ----------------------------------------------------------

    pub fn get_weather(&self, key: &WeatherKey) -> Option<CachedWeather> {
        let found = self.weather.get(key);
        self.count(found.is_some());
        found
    }

    /// Store one day of weather. Historical dates never expire; today and
    /// later get a short TTL since the archive is still settling.
    pub fn put_weather(&self, key: WeatherKey, value: CachedWeather) {
        let ttl = if key.date < Utc::now().date_naive() {
            None
        } else {
            Some(Duration::hours(TODAY_WEATHER_TTL_HOURS))
        };
        self.weather.insert(key, value, ttl);
    }

    /// Exclusive lease over a coordinate pair — one batched range fetch
    /// per fingerprint, however many workers race for it.
    pub async fn lease_weather(&self, key: CoordinateKey) -> OwnedMutexGuard<()> {
        self.weather_leases.acquire(&key).await
    }

    // -- Holidays ---------------------------------------------------------

    pub fn get_holidays(&self, key: &HolidayKey) -> Option<Vec<HolidayEntry>> {
        let found = self.holidays.get(key);
        self.count(found.is_some());
        found
    }

    pub fn put_holidays(&self, key: HolidayKey, value: Vec<HolidayEntry>) {
        self.holidays
            .insert(key, value, Some(Duration::days(HOLIDAY_TTL_DAYS)));
    }

    pub async fn lease_holidays(&self, key: &HolidayKey) -> OwnedMutexGuard<()> {
        self.holiday_leases.acquire(key).await
    }

    // -- Geocode ----------------------------------------------------------

    pub fn get_geocode(&self, key: &GeocodeKey) -> Option<CachedGeocode> {
        let found = self.geocode.get(key);
        self.count(found.is_some());
        found
    }

    pub fn put_geocode(&self, key: GeocodeKey, value: CachedGeocode) {
        self.geocode
            .insert(key, value, Some(Duration::days(GEOCODE_TTL_DAYS)));
    }

    pub async fn lease_geocode(&self, key: &GeocodeKey) -> OwnedMutexGuard<()> {
        self.geocode_leases.acquire(key).await
    }

    // -- Maintenance & stats ----------------------------------------------

    /// Remove expired entries and idle leases. Returns evicted count.
    pub fn sweep(&self) -> usize {
        let evicted = self.weather.evict_expired()
            + self.holidays.evict_expired()
            + self.geocode.evict_expired();
        self.weather_leases.prune();
        self.holiday_leases.prune();
        self.geocode_leases.prune();
        evicted
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Cache hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn weather_entries(&self) -> usize {
        self.weather.len()
    }

    fn count(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for EnrichmentCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
