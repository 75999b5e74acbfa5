//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Deployment-level knobs (worker concurrency, feature toggles, CORS
//! origin) can be overridden through well-known environment variables
//! resolved at load time.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    pub enrichment: EnrichmentConfig,
    pub fetchers: FetchersConfig,
    pub auth: AuthConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub port: u16,
    /// CORS origin allowed for the progress bus. Overridden by FRONTEND_URL.
    #[serde(default)]
    pub frontend_url: Option<String>,
    /// Path to the sqlite database; ":memory:" for ephemeral runs.
    pub database_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Default retry budget per job.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff (ms).
    pub backoff_base_ms: u64,
    /// Lease duration before a crashed worker's job is recoverable (secs).
    pub lease_secs: u64,
    /// Hard deadline for a single handler invocation (secs).
    pub job_timeout_secs: u64,
    /// Completed jobs older than this are pruned (secs).
    pub remove_on_complete_age_secs: u64,
    /// At most this many completed jobs retained per queue.
    pub remove_on_complete_max_count: usize,
    /// Failed jobs older than this are pruned (secs).
    pub remove_on_fail_age_secs: u64,
    pub remove_on_fail_max_count: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    /// Concurrency of the enrichment pool. Overridden by
    /// ENRICHMENT_WORKER_CONCURRENCY.
    pub enrichment_concurrency: usize,
    /// Overridden by COMPETITOR_WORKER_CONCURRENCY.
    pub competitor_concurrency: usize,
    /// Overridden by ANALYTICS_WORKER_CONCURRENCY.
    pub analytics_concurrency: usize,
    /// At most this many enrichment jobs may start per minute.
    pub enrichment_starts_per_minute: u32,
    /// Grace period for in-flight jobs on shutdown (secs).
    pub shutdown_grace_secs: u64,
    /// Polling interval when a queue is empty (ms).
    pub idle_poll_ms: u64,
    /// Interval between lease-recovery sweeps (secs).
    pub lease_sweep_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    /// When true, enrichment completion auto-enqueues an analytics
    /// summary at low priority. Overridden by ENABLE_AUTO_ANALYTICS.
    pub auto_analytics: bool,
    /// Disables the holiday-fetch path when false. Overridden by
    /// HOLIDAYS_ENABLED.
    pub holidays_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchersConfig {
    /// Request timeout for upstream APIs (secs).
    pub timeout_secs: u64,
    /// Max attempts per upstream request.
    pub max_retries: u32,
    /// Base delay for fetcher backoff (ms).
    pub backoff_base_ms: u64,
    /// Max in-flight requests per client.
    pub max_in_flight: usize,
    /// Open-Meteo historical weather endpoint.
    pub weather_base_url: String,
    /// Nager.Date public holidays endpoint.
    pub holidays_base_url: String,
    /// Open-Meteo geocoding endpoint.
    pub geocode_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Stable prefix distinguishing API keys from session tokens.
    pub key_prefix: String,
    /// Fallback per-IP requests/minute for unauthenticated paths.
    /// Overridden by MAX_REQUESTS_PER_MINUTE.
    pub ip_requests_per_minute: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Cap on graph-build jobs emitted per daily run.
    pub graph_build_batch: usize,
}

impl AppConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let mut config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// A self-contained configuration for tests — no file access, sqlite
    /// in memory, external endpoints pointed at localhost.
    pub fn for_tests() -> Self {
        let mut config: AppConfig =
            toml::from_str(DEFAULT_CONFIG).expect("default config must parse");
        config.service.database_path = ":memory:".to_string();
        config
    }

    /// Apply the deployment environment variables recognised by the
    /// service. Unparsable values are ignored with a warning rather than
    /// failing startup.
    pub fn apply_env_overrides(&mut self) {
        if let Some(n) = read_env_usize("ENRICHMENT_WORKER_CONCURRENCY") {
            self.workers.enrichment_concurrency = n;
        }
        if let Some(n) = read_env_usize("COMPETITOR_WORKER_CONCURRENCY") {
            self.workers.competitor_concurrency = n;
        }
        if let Some(n) = read_env_usize("ANALYTICS_WORKER_CONCURRENCY") {
            self.workers.analytics_concurrency = n;
        }
        // Anything other than the literal "false" leaves auto-analytics on.
        if let Ok(v) = std::env::var("ENABLE_AUTO_ANALYTICS") {
            self.enrichment.auto_analytics = v != "false";
        }
        if let Ok(v) = std::env::var("HOLIDAYS_ENABLED") {
            self.enrichment.holidays_enabled = v != "false";
        }
        if let Some(n) = read_env_usize("MAX_REQUESTS_PER_MINUTE") {
            self.auth.ip_requests_per_minute = n as u32;
        }
        if let Ok(v) = std::env::var("FRONTEND_URL") {
            if !v.is_empty() {
                self.service.frontend_url = Some(v);
            }
        }
    }
}

fn read_env_usize(name: &str) -> Option<usize> {
    match std::env::var(name) {
        Ok(v) => match v.parse::<usize>() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(var = name, value = %v, "Ignoring unparsable env override");
                None
            }
        },
        Err(_) => None,
    }
}

/// Built-in defaults, also used by `AppConfig::for_tests`.
const DEFAULT_CONFIG: &str = r#"
[service]
name = "jengu"
port = 8090
database_path = "jengu.db"

[queue]
max_attempts = 3
backoff_base_ms = 1000
lease_secs = 120
job_timeout_secs = 600
remove_on_complete_age_secs = 86400
remove_on_complete_max_count = 1000
remove_on_fail_age_secs = 604800
remove_on_fail_max_count = 5000

[workers]
enrichment_concurrency = 3
competitor_concurrency = 2
analytics_concurrency = 2
enrichment_starts_per_minute = 10
shutdown_grace_secs = 30
idle_poll_ms = 250
lease_sweep_secs = 30

[enrichment]
auto_analytics = true
holidays_enabled = true

[fetchers]
timeout_secs = 15
max_retries = 3
backoff_base_ms = 500
max_in_flight = 4
weather_base_url = "https://archive-api.open-meteo.com/v1/archive"
holidays_base_url = "https://date.nager.at/api/v3"
geocode_base_url = "https://geocoding-api.open-meteo.com/v1/search"

[auth]
key_prefix = "jen_"
ip_requests_per_minute = 120

[scheduler]
enabled = true
graph_build_batch = 100
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
