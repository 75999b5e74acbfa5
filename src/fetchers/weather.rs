//! Historical weather fetcher.
//!
//! Uses the free Open-Meteo archive API (no key required) for daily
//! historical weather by coordinate. One request covers a whole
//! contiguous date range, so the enrichment pipeline batches its gaps
//! into ranges before calling this client.
//!
//! API: `https://archive-api.open-meteo.com/v1/archive`
//! Auth: None required.
//! Rate limit: Generous (free tier); 429 is surfaced as quota_exceeded.

use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{DailyWeather, FetchError, WeatherFetch};
use crate::config::FetchersConfig;

// ---------------------------------------------------------------------------
// Open-Meteo response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    #[serde(default)]
    daily: Option<ArchiveDaily>,
}

#[derive(Debug, Deserialize)]
struct ArchiveDaily {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    temperature_2m_mean: Vec<Option<f64>>,
    #[serde(default)]
    precipitation_sum: Vec<Option<f64>>,
    #[serde(default)]
    weather_code: Vec<Option<i32>>,
    /// Seconds of sunshine per day.
    #[serde(default)]
    sunshine_duration: Vec<Option<f64>>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct WeatherClient {
    http: Client,
    base_url: String,
    max_retries: u32,
    backoff_base_ms: u64,
    in_flight: Arc<Semaphore>,
}

impl WeatherClient {
    pub fn new(cfg: &FetchersConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent("JENGU/0.1.0")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build weather HTTP client: {e}"))?;
        Ok(Self {
            http,
            base_url: cfg.weather_base_url.clone(),
            max_retries: cfg.max_retries,
            backoff_base_ms: cfg.backoff_base_ms,
            in_flight: Arc::new(Semaphore::new(cfg.max_in_flight)),
        })
    }

    fn build_url(&self, latitude: f64, longitude: f64, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}?latitude={latitude}&longitude={longitude}\
             &start_date={start}&end_date={end}\
             &daily=temperature_2m_mean,precipitation_sum,weather_code,sunshine_duration\
             &timezone=UTC",
            self.base_url,
        )
    }

    /// Zip the columnar response into per-day structs. Days with no
    /// temperature reading are skipped — the archive occasionally has
    /// holes and a missing day is handled upstream as a cache miss.
    fn into_days(daily: ArchiveDaily) -> Vec<DailyWeather> {
        let mut days = Vec::with_capacity(daily.time.len());
        for (i, time) in daily.time.iter().enumerate() {
            let Ok(date) = time.parse::<NaiveDate>() else {
                continue;
            };
            let Some(temperature) = daily.temperature_2m_mean.get(i).copied().flatten() else {
                continue;
            };
            days.push(DailyWeather {
                date,
                temperature,
                precipitation: daily.precipitation_sum.get(i).copied().flatten().unwrap_or(0.0),
                weather_code: daily.weather_code.get(i).copied().flatten().unwrap_or(-1),
                sunshine_hours: daily
                    .sunshine_duration
                    .get(i)
                    .copied()
                    .flatten()
                    .map(|secs| secs / 3600.0)
                    .unwrap_or(0.0),
            });
        }
        days
    }
}

#[async_trait::async_trait]
impl WeatherFetch for WeatherClient {
    async fn fetch_range(
        &self,
        latitude: f64,
        longitude: f64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyWeather>, FetchError> {
        if end < start {
            return Err(FetchError::Permanent(format!(
                "Invalid date range: {start}..{end}"
            )));
        }

        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Transient("Client shutting down".into()))?;

        let url = self.build_url(latitude, longitude, start, end);
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let multiplier = last_error
                    .as_ref()
                    .map(|e| e.backoff_multiplier())
                    .unwrap_or(1);
                let delay = self.backoff_base_ms * 2u64.pow(attempt - 1) * multiplier;
                debug!(attempt, delay_ms = delay, "Retrying weather fetch");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self.http.get(&url).send().await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: ArchiveResponse = response.json().await.map_err(|e| {
                            FetchError::Permanent(format!("Failed to parse archive response: {e}"))
                        })?;
                        let days = body.daily.map(Self::into_days).unwrap_or_default();
                        debug!(
                            days = days.len(),
                            %start,
                            %end,
                            "Weather range fetched"
                        );
                        return Ok(days);
                    }

                    let body = response.text().await.unwrap_or_default();
                    let err = FetchError::from_status(status, &body);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(status = %status, attempt, "Retryable weather API error");
                    last_error = Some(err);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Weather request failed");
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| FetchError::Transient("Weather fetch exhausted retries".into())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
