//! Geocoding fetcher.
//!
//! Resolves a (city, country) pair to coordinates and a timezone using
//! the free Open-Meteo geocoding API. Used when a property is uploaded
//! with a city name but no coordinates.
//!
//! API: `https://geocoding-api.open-meteo.com/v1/search`
//! Auth: None required.

use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{FetchError, GeocodeFetch};
use crate::cache::CachedGeocode;
use crate::config::FetchersConfig;

// ---------------------------------------------------------------------------
// Open-Meteo geocoding response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GeocodeClient {
    http: Client,
    base_url: String,
    max_retries: u32,
    backoff_base_ms: u64,
    in_flight: Arc<Semaphore>,
}

impl GeocodeClient {
    pub fn new(cfg: &FetchersConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent("JENGU/0.1.0")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build geocode HTTP client: {e}"))?;
        Ok(Self {
            http,
            base_url: cfg.geocode_base_url.clone(),
            max_retries: cfg.max_retries,
            backoff_base_ms: cfg.backoff_base_ms,
            in_flight: Arc::new(Semaphore::new(cfg.max_in_flight)),
        })
    }

    /// Pick the first result matching the requested country, falling back
    /// to the top-ranked result when the API omits country codes.
    fn pick_match(results: Vec<GeocodeResult>, country_code: &str) -> Option<CachedGeocode> {
        let wanted = country_code.to_uppercase();
        let chosen = results
            .iter()
            .position(|r| {
                r.country_code
                    .as_deref()
                    .map(|cc| cc.eq_ignore_ascii_case(&wanted))
                    .unwrap_or(false)
            })
            .or(if results.is_empty() { None } else { Some(0) })?;
        let r = &results[chosen];
        Some(CachedGeocode {
            latitude: r.latitude,
            longitude: r.longitude,
            timezone: r.timezone.clone(),
        })
    }
}

#[async_trait::async_trait]
impl GeocodeFetch for GeocodeClient {
    async fn geocode(
        &self,
        city: &str,
        country_code: &str,
    ) -> Result<CachedGeocode, FetchError> {
        let city = city.trim();
        if city.is_empty() {
            return Err(FetchError::Permanent("Empty city name".into()));
        }

        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Transient("Client shutting down".into()))?;

        let url = format!(
            "{}?name={}&count=10&language=en&format=json",
            self.base_url,
            urlencoding::encode(city),
        );
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let multiplier = last_error
                    .as_ref()
                    .map(|e| e.backoff_multiplier())
                    .unwrap_or(1);
                let delay = self.backoff_base_ms * 2u64.pow(attempt - 1) * multiplier;
                debug!(attempt, delay_ms = delay, "Retrying geocode fetch");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self.http.get(&url).send().await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: GeocodeResponse = response.json().await.map_err(|e| {
                            FetchError::Permanent(format!("Failed to parse geocode response: {e}"))
                        })?;
                        return match Self::pick_match(body.results, country_code) {
                            Some(hit) => {
                                debug!(city, country_code, "Geocoded");
                                Ok(hit)
                            }
                            None => Err(FetchError::Permanent(format!(
                                "No geocode match for {city:?} [{country_code}]"
                            ))),
                        };
                    }

                    let body = response.text().await.unwrap_or_default();
                    let err = FetchError::from_status(status, &body);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(status = %status, attempt, city, "Retryable geocode API error");
                    last_error = Some(err);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Geocode request failed");
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| FetchError::Transient("Geocode fetch exhausted retries".into())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
