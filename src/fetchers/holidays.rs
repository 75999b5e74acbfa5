//! Public-holiday fetcher.
//!
//! Uses the free Nager.Date API (no key required) for national public
//! holidays by country and year.
//!
//! API: `https://date.nager.at/api/v3/PublicHolidays/{year}/{country}`
//! Auth: None required.

use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{FetchError, HolidayFetch};
use crate::cache::HolidayEntry;
use crate::config::FetchersConfig;

// ---------------------------------------------------------------------------
// Nager.Date response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NagerHoliday {
    date: String,
    /// Holiday name in the local language — what ends up on the row.
    #[serde(rename = "localName")]
    local_name: String,
    #[serde(default)]
    name: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HolidayClient {
    http: Client,
    base_url: String,
    max_retries: u32,
    backoff_base_ms: u64,
    in_flight: Arc<Semaphore>,
}

impl HolidayClient {
    pub fn new(cfg: &FetchersConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent("JENGU/0.1.0")
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build holiday HTTP client: {e}"))?;
        Ok(Self {
            http,
            base_url: cfg.holidays_base_url.clone(),
            max_retries: cfg.max_retries,
            backoff_base_ms: cfg.backoff_base_ms,
            in_flight: Arc::new(Semaphore::new(cfg.max_in_flight)),
        })
    }

    fn parse_entries(raw: Vec<NagerHoliday>) -> Vec<HolidayEntry> {
        raw.into_iter()
            .filter_map(|h| {
                let date = h.date.parse::<NaiveDate>().ok()?;
                let name = if h.local_name.is_empty() {
                    h.name.unwrap_or_default()
                } else {
                    h.local_name
                };
                Some(HolidayEntry { date, name })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl HolidayFetch for HolidayClient {
    async fn fetch_year(
        &self,
        country_code: &str,
        year: i32,
    ) -> Result<Vec<HolidayEntry>, FetchError> {
        if country_code.len() != 2 || !country_code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(FetchError::Permanent(format!(
                "Invalid country code: {country_code:?}"
            )));
        }

        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Transient("Client shutting down".into()))?;

        let url = format!(
            "{}/PublicHolidays/{year}/{}",
            self.base_url,
            country_code.to_uppercase()
        );
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let multiplier = last_error
                    .as_ref()
                    .map(|e| e.backoff_multiplier())
                    .unwrap_or(1);
                let delay = self.backoff_base_ms * 2u64.pow(attempt - 1) * multiplier;
                debug!(attempt, delay_ms = delay, "Retrying holiday fetch");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self.http.get(&url).send().await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let raw: Vec<NagerHoliday> = response.json().await.map_err(|e| {
                            FetchError::Permanent(format!("Failed to parse holiday response: {e}"))
                        })?;
                        let entries = Self::parse_entries(raw);
                        debug!(country_code, year, count = entries.len(), "Holidays fetched");
                        return Ok(entries);
                    }

                    // 404 = country unknown to the API; not worth retrying.
                    let body = response.text().await.unwrap_or_default();
                    let err = FetchError::from_status(status, &body);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(status = %status, attempt, country_code, "Retryable holiday API error");
                    last_error = Some(err);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Holiday request failed");
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| FetchError::Transient("Holiday fetch exhausted retries".into())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn client() -> HolidayClient {
        HolidayClient::new(&AppConfig::for_tests().fetchers).unwrap()
    }

    #[test]
    fn test_parse_entries_prefers_local_name() {
        let raw = vec![NagerHoliday {
            date: "2024-07-14".into(),
            local_name: "Fête nationale".into(),
            name: Some("Bastille Day".into()),
        }];
        let entries = HolidayClient::parse_entries(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Fête nationale");
        assert_eq!(
            entries[0].date,
            NaiveDate::from_ymd_opt(2024, 7, 14).unwrap()
        );
    }

    #[test]
    fn test_parse_entries_falls_back_to_english() {
        let raw = vec![NagerHoliday {
            date: "2024-01-01".into(),
            local_name: String::new(),
            name: Some("New Year's Day".into()),
        }];
        let entries = HolidayClient::parse_entries(raw);
        assert_eq!(entries[0].name, "New Year's Day");
    }

    #[test]
    fn test_parse_entries_drops_bad_dates() {
        let raw = vec![NagerHoliday {
            date: "not-a-date".into(),
            local_name: "Broken".into(),
            name: None,
        }];
        assert!(HolidayClient::parse_entries(raw).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_country_code_is_permanent() {
        for bad in ["", "F", "FRA", "12"] {
            let err = client().fetch_year(bad, 2024).await.unwrap_err();
            assert!(matches!(err, FetchError::Permanent(_)), "{bad:?}");
        }
    }
}
