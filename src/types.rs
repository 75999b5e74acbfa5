//! Shared types for the JENGU service.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that queue, enrichment, auth,
//! and server modules can depend on them without circular references.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Convert an f64 to Decimal at API boundaries.
/// Returns Decimal::ZERO for NaN/Infinity.
pub fn d(val: f64) -> Decimal {
    Decimal::from_f64_retain(val).unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Geographic location of a property.
///
/// Coordinates are optional at ingestion time — a property uploaded with
/// only a city name is geocoded on first enrichment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Location {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// ISO 3166-1 alpha-2, e.g. "FR"
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub timezone: Option<String>,
}

impl Location {
    /// Location with explicit coordinates.
    pub fn at(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            ..Default::default()
        }
    }

    /// Whether the location carries usable coordinates.
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => write!(f, "({lat:.4}, {lon:.4})")?,
            _ => write!(f, "(no coordinates)")?,
        }
        if let Some(city) = &self.city {
            write!(f, " {city}")?;
        }
        if let Some(cc) = &self.country_code {
            write!(f, " [{cc}]")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pricing rows
// ---------------------------------------------------------------------------

/// One pricing observation: a (property, stay date) pair with price and
/// occupancy, plus the enrichment block attached by the pipeline.
///
/// All enrichment fields are nullable until the row is enriched. The
/// pipeline only fills fields that are currently null, so re-running
/// enrichment with identical inputs changes nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRow {
    pub row_id: String,
    pub property_id: String,
    pub user_id: String,
    /// Calendar date of the stay (partition key upstream).
    pub stay_date: NaiveDate,
    /// Nightly price, non-negative.
    pub price: Decimal,
    /// Occupancy fraction 0…1 if reported directly.
    pub occupancy: Option<f64>,
    pub bookings: Option<u32>,
    pub availability: Option<u32>,

    // -- Enrichment block -------------------------------------------------
    pub temperature: Option<f64>,
    pub precipitation: Option<f64>,
    pub weather_code: Option<i32>,
    pub weather_description: Option<String>,
    pub sunshine_hours: Option<f64>,
    /// 0 = Monday … 6 = Sunday
    pub day_of_week: Option<u8>,
    /// 1…12
    pub month: Option<u8>,
    pub season: Option<Season>,
    pub is_weekend: Option<bool>,
    pub is_holiday: Option<bool>,
    pub holiday_name: Option<String>,
}

impl PricingRow {
    /// A bare, un-enriched row.
    pub fn new(
        property_id: &str,
        user_id: &str,
        stay_date: NaiveDate,
        price: Decimal,
    ) -> Self {
        Self {
            row_id: uuid::Uuid::new_v4().to_string(),
            property_id: property_id.to_string(),
            user_id: user_id.to_string(),
            stay_date,
            price,
            occupancy: None,
            bookings: None,
            availability: None,
            temperature: None,
            precipitation: None,
            weather_code: None,
            weather_description: None,
            sunshine_hours: None,
            day_of_week: None,
            month: None,
            season: None,
            is_weekend: None,
            is_holiday: None,
            holiday_name: None,
        }
    }

    /// Occupancy fraction, either as reported or derived from
    /// bookings/availability. None when neither is available.
    pub fn occupancy_fraction(&self) -> Option<f64> {
        if let Some(occ) = self.occupancy {
            return Some(occ.clamp(0.0, 1.0));
        }
        match (self.bookings, self.availability) {
            (Some(b), Some(a)) if a > 0 => Some((b as f64 / a as f64).clamp(0.0, 1.0)),
            _ => None,
        }
    }

    /// Whether the weather portion of the enrichment block is populated.
    pub fn has_weather(&self) -> bool {
        self.temperature.is_some()
    }

    /// Whether the temporal portion of the enrichment block is populated.
    pub fn has_temporal_features(&self) -> bool {
        self.day_of_week.is_some() && self.month.is_some() && self.season.is_some()
    }

    /// Helper to build a test/sample row with sensible defaults.
    #[cfg(test)]
    pub fn sample(property_id: &str, stay_date: NaiveDate) -> Self {
        Self::new(
            property_id,
            "user-001",
            stay_date,
            rust_decimal_macros::dec!(120.00),
        )
    }
}

impl fmt::Display for PricingRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} @ {} ({})",
            self.property_id,
            self.stay_date,
            self.price.round_dp(2),
            if self.has_weather() { "enriched" } else { "bare" },
        )
    }
}

/// Season for Northern-hemisphere temporal features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Winter => "Winter",
            Season::Spring => "Spring",
            Season::Summer => "Summer",
            Season::Fall => "Fall",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Winter" => Some(Season::Winter),
            "Spring" => Some(Season::Spring),
            "Summer" => Some(Season::Summer),
            "Fall" => Some(Season::Fall),
            _ => None,
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// Enrichment lifecycle of a property.
///
/// Transitions form a state machine:
/// `None → Pending → Processing → Completed | Failed`, with `Failed`
/// re-enterable via a fresh `Pending` (user retry) and `Completed`
/// re-enterable the same way (re-enrichment after new uploads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    None,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::None => "none",
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Processing => "processing",
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(EnrichmentStatus::None),
            "pending" => Some(EnrichmentStatus::Pending),
            "processing" => Some(EnrichmentStatus::Processing),
            "completed" => Some(EnrichmentStatus::Completed),
            "failed" => Some(EnrichmentStatus::Failed),
            _ => None,
        }
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: EnrichmentStatus) -> bool {
        use EnrichmentStatus::*;
        matches!(
            (self, next),
            (None, Pending)
                | (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Pending)
                | (Failed, Pending)
        )
    }

    /// Whether the status is terminal for the current enrichment run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnrichmentStatus::Completed | EnrichmentStatus::Failed)
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A hospitality property (hotel, B&B, rental).
///
/// Owner is immutable after creation. `enrichment_status` is only
/// mutated through the state machine above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub property_id: String,
    pub user_id: String,
    pub name: String,
    pub location: Location,
    pub star_rating: Option<f64>,
    pub review_score: Option<f64>,
    pub enrichment_status: EnrichmentStatus,
    pub enriched_at: Option<DateTime<Utc>>,
    pub enrichment_error: Option<String>,
    /// Set when a run completed with degraded inputs (e.g. holidays
    /// unavailable).
    pub enrichment_warning: Option<String>,
    /// Next scheduled competitor scrape, None until a graph exists.
    pub next_scrape_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Property {
    pub fn new(property_id: &str, user_id: &str, name: &str, location: Location) -> Self {
        Self {
            property_id: property_id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            location,
            star_rating: None,
            review_score: None,
            enrichment_status: EnrichmentStatus::None,
            enriched_at: None,
            enrichment_error: None,
            enrichment_warning: None,
            next_scrape_at: None,
            created_at: Utc::now(),
        }
    }

    /// Helper to build a test/sample property in central Paris.
    #[cfg(test)]
    pub fn sample(property_id: &str) -> Self {
        let mut location = Location::at(48.8566, 2.3522);
        location.country_code = Some("FR".to_string());
        location.city = Some("Paris".to_string());
        Self::new(property_id, "user-001", "Hôtel Sample", location)
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// Role attached to an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyRole {
    ReadOnly,
    ReadWrite,
    Admin,
}

impl ApiKeyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyRole::ReadOnly => "read_only",
            ApiKeyRole::ReadWrite => "read_write",
            ApiKeyRole::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read_only" => Some(ApiKeyRole::ReadOnly),
            "read_write" => Some(ApiKeyRole::ReadWrite),
            "admin" => Some(ApiKeyRole::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for ApiKeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A workspace-scoped API key, stored hashed (SHA-256 of the presented
/// secret). The plaintext is only ever seen once, at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub key_hash: String,
    pub user_id: String,
    pub role: ApiKeyRole,
    /// Tokens of the form `resource:action`, `resource:*`, or `admin:*`.
    pub scopes: Vec<String>,
    /// Empty = all IPs allowed.
    pub allowed_ips: Vec<String>,
    pub quota_per_minute: u32,
    pub quota_per_hour: u32,
    pub quota_per_day: u32,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Scope decision: `required` is granted iff the key holds the exact
    /// scope, the `resource:*` wildcard, or `admin:*`.
    pub fn has_scope(&self, required: &str) -> bool {
        if self.scopes.iter().any(|s| s == required) {
            return true;
        }
        if let Some(resource) = required.split(':').next() {
            let wildcard = format!("{resource}:*");
            if self.scopes.iter().any(|s| *s == wildcard) {
                return true;
            }
        }
        self.scopes.iter().any(|s| s == "admin:*")
    }

    /// Whether the key is usable right now (active and unexpired).
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |exp| exp > now)
    }

    /// Whether `ip` passes the allowlist (empty list = all allowed).
    pub fn ip_allowed(&self, ip: &str) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|a| a == ip)
    }

    /// Helper to build a test key with wide-open defaults.
    #[cfg(test)]
    pub fn sample(key_id: &str, scopes: &[&str]) -> Self {
        Self {
            key_id: key_id.to_string(),
            key_hash: "0".repeat(64),
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
}

/// One usage observation, recorded asynchronously per authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub key_id: String,
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub latency_ms: u64,
    pub ip: String,
    pub error_type: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Competitor graph & neighborhood index
// ---------------------------------------------------------------------------

/// One competitor edge in a property's graph, with precomputed metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetitorRecord {
    pub competitor_id: String,
    pub property_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
    pub star_rating: Option<f64>,
    pub review_score: Option<f64>,
    /// Most recent scraped nightly price.
    pub last_price: Option<Decimal>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Market position derived from the property's price percentile within
/// its competitor distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketPosition {
    Budget,
    MidMarket,
    Premium,
    UltraPremium,
}

impl MarketPosition {
    /// Percentile thresholds: <0.25 budget, <0.50 mid-market,
    /// <0.75 premium, else ultra-premium.
    pub fn from_percentile(percentile: f64) -> Self {
        if percentile < 0.25 {
            MarketPosition::Budget
        } else if percentile < 0.50 {
            MarketPosition::MidMarket
        } else if percentile < 0.75 {
            MarketPosition::Premium
        } else {
            MarketPosition::UltraPremium
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPosition::Budget => "budget",
            MarketPosition::MidMarket => "mid-market",
            MarketPosition::Premium => "premium",
            MarketPosition::UltraPremium => "ultra-premium",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "budget" => Some(MarketPosition::Budget),
            "mid-market" => Some(MarketPosition::MidMarket),
            "premium" => Some(MarketPosition::Premium),
            "ultra-premium" => Some(MarketPosition::UltraPremium),
            _ => None,
        }
    }
}

impl fmt::Display for MarketPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One daily neighborhood index row for a property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodIndexRow {
    pub property_id: String,
    pub index_date: NaiveDate,
    /// 0…100 weighted summary score.
    pub overall_index: f64,
    pub price_competitiveness: f64,
    pub value_score: f64,
    pub positioning: f64,
    pub market_position: MarketPosition,
    pub competitors_analyzed: usize,
    pub price_p10: Decimal,
    pub price_p50: Decimal,
    pub price_p90: Decimal,
    /// Rank of the property's price in the competitor distribution (0…1).
    pub price_percentile: f64,
    pub delta_1d: Option<f64>,
    pub delta_7d: Option<f64>,
    pub delta_30d: Option<f64>,
    pub advantages: Vec<String>,
    pub weaknesses: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl fmt::Display for NeighborhoodIndexRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} index={:.1} ({}) n={}",
            self.property_id,
            self.index_date,
            self.overall_index,
            self.market_position,
            self.competitors_analyzed,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error taxonomy for JENGU.
///
/// The `transient_upstream` / `permanent_upstream` split is what the job
/// queue consults when deciding whether to retry a failed handler.
#[derive(Debug, thiserror::Error)]
pub enum JenguError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Rate limit exceeded for {window} window, retry after {retry_after_secs}s")]
    RateLimit {
        window: String,
        retry_after_secs: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("Permanent upstream error: {0}")]
    PermanentUpstream(String),

    #[error("Upstream quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JenguError {
    /// Stable snake_case kind code used in JSON error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            JenguError::Validation(_) => "validation",
            JenguError::Authentication(_) => "authentication",
            JenguError::Authorization(_) => "authorization",
            JenguError::RateLimit { .. } => "rate_limit",
            JenguError::NotFound(_) => "not_found",
            JenguError::Conflict(_) => "conflict",
            JenguError::TransientUpstream(_) => "transient_upstream",
            JenguError::PermanentUpstream(_) => "permanent_upstream",
            JenguError::QuotaExceeded(_) => "quota_exceeded",
            JenguError::Timeout(_) => "timeout",
            JenguError::Internal(_) => "internal",
        }
    }

    /// Whether a job failing with this error is eligible for queue retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JenguError::TransientUpstream(_)
                | JenguError::QuotaExceeded(_)
                | JenguError::Timeout(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
