//! External data fetchers.
//!
//! Bounded, retrying clients for the weather, public-holiday, and
//! geocoding APIs. Each client imposes a request timeout, retries
//! transient failures with exponential backoff, bounds in-flight
//! requests with a semaphore, and surfaces a typed error that the job
//! layer uses to decide between retry and hard failure.

pub mod geocode;
pub mod holidays;
pub mod weather;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::cache::{CachedGeocode, HolidayEntry};
use crate::types::JenguError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Typed fetch failure.
///
/// `Transient` is retry-eligible, `Permanent` means the request itself is
/// bad and will never succeed, `QuotaExceeded` is retry-eligible but
/// deserves a long backoff.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error("Permanent upstream failure: {0}")]
    Permanent(String),

    #[error("Upstream quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::QuotaExceeded(_))
    }

    /// Backoff multiplier applied on retry — quota errors wait much
    /// longer than ordinary transient failures.
    pub fn backoff_multiplier(&self) -> u64 {
        match self {
            FetchError::QuotaExceeded(_) => 8,
            _ => 1,
        }
    }

    /// Classify an HTTP status from an upstream API.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {status}: {body}");
        if status.as_u16() == 429 {
            FetchError::QuotaExceeded(detail)
        } else if status.is_client_error() {
            FetchError::Permanent(detail)
        } else {
            FetchError::Transient(detail)
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        // Network-level failures (connect, timeout, dns) are all worth a
        // retry; body-decode failures are not.
        if e.is_decode() {
            FetchError::Permanent(format!("Response decode failed: {e}"))
        } else {
            FetchError::Transient(format!("Request failed: {e}"))
        }
    }
}

impl From<FetchError> for JenguError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Transient(msg) => JenguError::TransientUpstream(msg),
            FetchError::Permanent(msg) => JenguError::PermanentUpstream(msg),
            FetchError::QuotaExceeded(msg) => JenguError::QuotaExceeded(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch traits
// ---------------------------------------------------------------------------

/// One day of weather from the archive API.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyWeather {
    pub date: NaiveDate,
    pub temperature: f64,
    pub precipitation: f64,
    pub weather_code: i32,
    pub sunshine_hours: f64,
}

/// Abstraction over the historical weather source.
///
/// A single call covers a contiguous date range — the upstream API is
/// batched, so callers should coalesce per-day gaps into ranges.
#[async_trait]
pub trait WeatherFetch: Send + Sync {
    async fn fetch_range(
        &self,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyWeather>, FetchError>;
}

/// Abstraction over the public-holiday source.
#[async_trait]
pub trait HolidayFetch: Send + Sync {
    async fn fetch_year(
        &self,
        country_code: &str,
        year: i32,
    ) -> Result<Vec<HolidayEntry>, FetchError>;
}

/// Abstraction over the geocoding source.
#[async_trait]
pub trait GeocodeFetch: Send + Sync {
    async fn geocode(
        &self,
        city: &str,
        country_code: &str,
    ) -> Result<CachedGeocode, FetchError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
