//! Sqlite store.
//!
//! Durable `Store` implementation over sqlx with runtime-checked
//! queries. Conventions: dates are ISO-8601 TEXT, timestamps epoch
//! millis INTEGER, decimals TEXT (exact), string lists JSON TEXT.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use super::Store;
use crate::types::{
    ApiKeyRecord, ApiKeyRole, CompetitorRecord, EnrichmentStatus, JenguError, Location,
    MarketPosition, NeighborhoodIndexRow, PricingRow, Property, UsageRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    property_id       TEXT PRIMARY KEY,
    user_id           TEXT NOT NULL,
    name              TEXT NOT NULL,
    latitude          REAL,
    longitude         REAL,
    country_code      TEXT,
    city              TEXT,
    timezone          TEXT,
    star_rating       REAL,
    review_score      REAL,
    enrichment_status TEXT NOT NULL,
    enriched_at       INTEGER,
    enrichment_error  TEXT,
    enrichment_warning TEXT,
    next_scrape_at    INTEGER,
    created_at        INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pricing_rows (
    row_id              TEXT PRIMARY KEY,
    property_id         TEXT NOT NULL,
    user_id             TEXT NOT NULL,
    stay_date           TEXT NOT NULL,
    price               TEXT NOT NULL,
    occupancy           REAL,
    bookings            INTEGER,
    availability        INTEGER,
    temperature         REAL,
    precipitation       REAL,
    weather_code        INTEGER,
    weather_description TEXT,
    sunshine_hours      REAL,
    day_of_week         INTEGER,
    month               INTEGER,
    season              TEXT,
    is_weekend          INTEGER,
    is_holiday          INTEGER,
    holiday_name        TEXT,
    UNIQUE(property_id, stay_date)
);
CREATE INDEX IF NOT EXISTS idx_rows_property ON pricing_rows(property_id, stay_date);
CREATE TABLE IF NOT EXISTS competitors (
    competitor_id TEXT NOT NULL,
    property_id   TEXT NOT NULL,
    name          TEXT NOT NULL,
    latitude      REAL NOT NULL,
    longitude     REAL NOT NULL,
    distance_km   REAL NOT NULL,
    star_rating   REAL,
    review_score  REAL,
    last_price    TEXT,
    last_seen_at  INTEGER,
    PRIMARY KEY (property_id, competitor_id)
);
CREATE TABLE IF NOT EXISTS index_rows (
    property_id           TEXT NOT NULL,
    index_date            TEXT NOT NULL,
    overall_index         REAL NOT NULL,
    price_competitiveness REAL NOT NULL,
    value_score           REAL NOT NULL,
    positioning           REAL NOT NULL,
    market_position       TEXT NOT NULL,
    competitors_analyzed  INTEGER NOT NULL,
    price_p10             TEXT NOT NULL,
    price_p50             TEXT NOT NULL,
    price_p90             TEXT NOT NULL,
    price_percentile      REAL NOT NULL,
    delta_1d              REAL,
    delta_7d              REAL,
    delta_30d             REAL,
    advantages            TEXT NOT NULL,
    weaknesses            TEXT NOT NULL,
    computed_at           INTEGER NOT NULL,
    PRIMARY KEY (property_id, index_date)
);
CREATE TABLE IF NOT EXISTS api_keys (
    key_id           TEXT PRIMARY KEY,
    key_hash         TEXT NOT NULL UNIQUE,
    user_id          TEXT NOT NULL,
    role             TEXT NOT NULL,
    scopes           TEXT NOT NULL,
    allowed_ips      TEXT NOT NULL,
    quota_per_minute INTEGER NOT NULL,
    quota_per_hour   INTEGER NOT NULL,
    quota_per_day    INTEGER NOT NULL,
    is_active        INTEGER NOT NULL,
    expires_at       INTEGER,
    created_at       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS usage_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    key_id      TEXT NOT NULL,
    endpoint    TEXT NOT NULL,
    method      TEXT NOT NULL,
    status      INTEGER NOT NULL,
    latency_ms  INTEGER NOT NULL,
    ip          TEXT NOT NULL,
    error_type  TEXT,
    recorded_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS latest_enrichment_jobs (
    property_id TEXT PRIMARY KEY,
    job_id      TEXT NOT NULL
);
"#;

/// Durable `Store` backed by sqlite.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn db_err(e: impl std::fmt::Display) -> JenguError {
    JenguError::Internal(format!("storage error: {e}"))
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_date(s: &str) -> Result<NaiveDate, JenguError> {
    s.parse::<NaiveDate>()
        .map_err(|e| JenguError::Internal(format!("corrupt date {s:?}: {e}")))
}

fn parse_decimal(s: &str) -> Result<Decimal, JenguError> {
    Decimal::from_str(s).map_err(|e| JenguError::Internal(format!("corrupt decimal {s:?}: {e}")))
}

fn parse_string_list(s: &str) -> Result<Vec<String>, JenguError> {
    serde_json::from_str(s).map_err(|e| JenguError::Internal(format!("corrupt list: {e}")))
}

fn row_to_property(row: &SqliteRow) -> Result<Property, JenguError> {
    let status: String = row.try_get("enrichment_status").map_err(db_err)?;
    Ok(Property {
        property_id: row.try_get("property_id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        location: Location {
            latitude: row.try_get("latitude").map_err(db_err)?,
            longitude: row.try_get("longitude").map_err(db_err)?,
            country_code: row.try_get("country_code").map_err(db_err)?,
            city: row.try_get("city").map_err(db_err)?,
            timezone: row.try_get("timezone").map_err(db_err)?,
        },
        star_rating: row.try_get("star_rating").map_err(db_err)?,
        review_score: row.try_get("review_score").map_err(db_err)?,
        enrichment_status: EnrichmentStatus::parse(&status)
            .ok_or_else(|| JenguError::Internal(format!("corrupt status {status:?}")))?,
        enriched_at: row
            .try_get::<Option<i64>, _>("enriched_at")
            .map_err(db_err)?
            .map(ms_to_utc),
        enrichment_error: row.try_get("enrichment_error").map_err(db_err)?,
        enrichment_warning: row.try_get("enrichment_warning").map_err(db_err)?,
        next_scrape_at: row
            .try_get::<Option<i64>, _>("next_scrape_at")
            .map_err(db_err)?
            .map(ms_to_utc),
        created_at: ms_to_utc(row.try_get("created_at").map_err(db_err)?),
    })
}

fn row_to_pricing_row(row: &SqliteRow) -> Result<PricingRow, JenguError> {
    let stay_date: String = row.try_get("stay_date").map_err(db_err)?;
    let price: String = row.try_get("price").map_err(db_err)?;
    let season: Option<String> = row.try_get("season").map_err(db_err)?;
    Ok(PricingRow {
        row_id: row.try_get("row_id").map_err(db_err)?,
        property_id: row.try_get("property_id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        stay_date: parse_date(&stay_date)?,
        price: parse_decimal(&price)?,
        occupancy: row.try_get("occupancy").map_err(db_err)?,
        bookings: row
            .try_get::<Option<i64>, _>("bookings")
            .map_err(db_err)?
            .map(|v| v as u32),
        availability: row
            .try_get::<Option<i64>, _>("availability")
            .map_err(db_err)?
            .map(|v| v as u32),
        temperature: row.try_get("temperature").map_err(db_err)?,
        precipitation: row.try_get("precipitation").map_err(db_err)?,
        weather_code: row
            .try_get::<Option<i64>, _>("weather_code")
            .map_err(db_err)?
            .map(|v| v as i32),
        weather_description: row.try_get("weather_description").map_err(db_err)?,
        sunshine_hours: row.try_get("sunshine_hours").map_err(db_err)?,
        day_of_week: row
            .try_get::<Option<i64>, _>("day_of_week")
            .map_err(db_err)?
            .map(|v| v as u8),
        month: row
            .try_get::<Option<i64>, _>("month")
            .map_err(db_err)?
            .map(|v| v as u8),
        season: season.as_deref().and_then(crate::types::Season::parse),
        is_weekend: row
            .try_get::<Option<i64>, _>("is_weekend")
            .map_err(db_err)?
            .map(|v| v != 0),
        is_holiday: row
            .try_get::<Option<i64>, _>("is_holiday")
            .map_err(db_err)?
            .map(|v| v != 0),
        holiday_name: row.try_get("holiday_name").map_err(db_err)?,
    })
}

fn row_to_competitor(row: &SqliteRow) -> Result<CompetitorRecord, JenguError> {
    let last_price: Option<String> = row.try_get("last_price").map_err(db_err)?;
    Ok(CompetitorRecord {
        competitor_id: row.try_get("competitor_id").map_err(db_err)?,
        property_id: row.try_get("property_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        latitude: row.try_get("latitude").map_err(db_err)?,
        longitude: row.try_get("longitude").map_err(db_err)?,
        distance_km: row.try_get("distance_km").map_err(db_err)?,
        star_rating: row.try_get("star_rating").map_err(db_err)?,
        review_score: row.try_get("review_score").map_err(db_err)?,
        last_price: last_price.as_deref().map(parse_decimal).transpose()?,
        last_seen_at: row
            .try_get::<Option<i64>, _>("last_seen_at")
            .map_err(db_err)?
            .map(ms_to_utc),
    })
}

fn row_to_index_row(row: &SqliteRow) -> Result<NeighborhoodIndexRow, JenguError> {
    let index_date: String = row.try_get("index_date").map_err(db_err)?;
    let market_position: String = row.try_get("market_position").map_err(db_err)?;
    let p10: String = row.try_get("price_p10").map_err(db_err)?;
    let p50: String = row.try_get("price_p50").map_err(db_err)?;
    let p90: String = row.try_get("price_p90").map_err(db_err)?;
    let advantages: String = row.try_get("advantages").map_err(db_err)?;
    let weaknesses: String = row.try_get("weaknesses").map_err(db_err)?;
    Ok(NeighborhoodIndexRow {
        property_id: row.try_get("property_id").map_err(db_err)?,
        index_date: parse_date(&index_date)?,
        overall_index: row.try_get("overall_index").map_err(db_err)?,
        price_competitiveness: row.try_get("price_competitiveness").map_err(db_err)?,
        value_score: row.try_get("value_score").map_err(db_err)?,
        positioning: row.try_get("positioning").map_err(db_err)?,
        market_position: MarketPosition::parse(&market_position).ok_or_else(|| {
            JenguError::Internal(format!("corrupt market position {market_position:?}"))
        })?,
        competitors_analyzed: row.try_get::<i64, _>("competitors_analyzed").map_err(db_err)?
            as usize,
        price_p10: parse_decimal(&p10)?,
        price_p50: parse_decimal(&p50)?,
        price_p90: parse_decimal(&p90)?,
        price_percentile: row.try_get("price_percentile").map_err(db_err)?,
        delta_1d: row.try_get("delta_1d").map_err(db_err)?,
        delta_7d: row.try_get("delta_7d").map_err(db_err)?,
        delta_30d: row.try_get("delta_30d").map_err(db_err)?,
        advantages: parse_string_list(&advantages)?,
        weaknesses: parse_string_list(&weaknesses)?,
        computed_at: ms_to_utc(row.try_get("computed_at").map_err(db_err)?),
    })
}

fn row_to_api_key(row: &SqliteRow) -> Result<ApiKeyRecord, JenguError> {
    let role: String = row.try_get("role").map_err(db_err)?;
    let scopes: String = row.try_get("scopes").map_err(db_err)?;
    let allowed_ips: String = row.try_get("allowed_ips").map_err(db_err)?;
    Ok(ApiKeyRecord {
        key_id: row.try_get("key_id").map_err(db_err)?,
        key_hash: row.try_get("key_hash").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        role: ApiKeyRole::parse(&role)
            .ok_or_else(|| JenguError::Internal(format!("corrupt role {role:?}")))?,
        scopes: parse_string_list(&scopes)?,
        allowed_ips: parse_string_list(&allowed_ips)?,
        quota_per_minute: row.try_get::<i64, _>("quota_per_minute").map_err(db_err)? as u32,
        quota_per_hour: row.try_get::<i64, _>("quota_per_hour").map_err(db_err)? as u32,
        quota_per_day: row.try_get::<i64, _>("quota_per_day").map_err(db_err)? as u32,
        is_active: row.try_get::<i64, _>("is_active").map_err(db_err)? != 0,
        expires_at: row
            .try_get::<Option<i64>, _>("expires_at")
            .map_err(db_err)?
            .map(ms_to_utc),
        created_at: ms_to_utc(row.try_get("created_at").map_err(db_err)?),
    })
}

#[async_trait]
impl Store for SqliteStore {
    // -- Properties -------------------------------------------------------

    async fn put_property(&self, property: &Property) -> Result<(), JenguError> {
        sqlx::query(
            "INSERT INTO properties (
                property_id, user_id, name, latitude, longitude, country_code,
                city, timezone, star_rating, review_score, enrichment_status,
                enriched_at, enrichment_error, enrichment_warning, next_scrape_at,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(property_id) DO UPDATE SET
                name = excluded.name,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                country_code = excluded.country_code,
                city = excluded.city,
                timezone = excluded.timezone,
                star_rating = excluded.star_rating,
                review_score = excluded.review_score,
                enrichment_status = excluded.enrichment_status,
                enriched_at = excluded.enriched_at,
                enrichment_error = excluded.enrichment_error,
                enrichment_warning = excluded.enrichment_warning,
                next_scrape_at = excluded.next_scrape_at",
        )
        .bind(&property.property_id)
        .bind(&property.user_id)
        .bind(&property.name)
        .bind(property.location.latitude)
        .bind(property.location.longitude)
        .bind(&property.location.country_code)
        .bind(&property.location.city)
        .bind(&property.location.timezone)
        .bind(property.star_rating)
        .bind(property.review_score)
        .bind(property.enrichment_status.as_str())
        .bind(property.enriched_at.map(|t| t.timestamp_millis()))
        .bind(&property.enrichment_error)
        .bind(&property.enrichment_warning)
        .bind(property.next_scrape_at.map(|t| t.timestamp_millis()))
        .bind(property.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_property(&self, property_id: &str) -> Result<Option<Property>, JenguError> {
        let row = sqlx::query("SELECT * FROM properties WHERE property_id = ?")
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_property).transpose()
    }

    async fn set_enrichment_status(
        &self,
        property_id: &str,
        status: EnrichmentStatus,
        error: Option<String>,
        warning: Option<String>,
    ) -> Result<(), JenguError> {
        let enriched_at = if status == EnrichmentStatus::Completed {
            Some(Utc::now().timestamp_millis())
        } else {
            None
        };
        let result = sqlx::query(
            "UPDATE properties SET
                enrichment_status = ?,
                enrichment_error = ?,
                enrichment_warning = ?,
                enriched_at = COALESCE(?, enriched_at)
             WHERE property_id = ?",
        )
        .bind(status.as_str())
        .bind(&error)
        .bind(&warning)
        .bind(enriched_at)
        .bind(property_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(JenguError::NotFound(format!("property {property_id}")));
        }
        Ok(())
    }

    async fn update_location(
        &self,
        property_id: &str,
        location: &Location,
    ) -> Result<(), JenguError> {
        let result = sqlx::query(
            "UPDATE properties SET
                latitude = ?, longitude = ?, country_code = ?, city = ?, timezone = ?
             WHERE property_id = ?",
        )
        .bind(location.latitude)
        .bind(location.longitude)
        .bind(&location.country_code)
        .bind(&location.city)
        .bind(&location.timezone)
        .bind(property_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(JenguError::NotFound(format!("property {property_id}")));
        }
        Ok(())
    }

    async fn properties_due_scrape(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Property>, JenguError> {
        let rows = sqlx::query(
            "SELECT * FROM properties
             WHERE next_scrape_at IS NOT NULL AND next_scrape_at <= ?
             ORDER BY property_id",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_property).collect()
    }

    async fn set_next_scrape_at(
        &self,
        property_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), JenguError> {
        let result = sqlx::query("UPDATE properties SET next_scrape_at = ? WHERE property_id = ?")
            .bind(at.timestamp_millis())
            .bind(property_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(JenguError::NotFound(format!("property {property_id}")));
        }
        Ok(())
    }

    async fn properties_with_graph(&self) -> Result<Vec<String>, JenguError> {
        let rows = sqlx::query("SELECT DISTINCT property_id FROM competitors ORDER BY property_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|r| r.try_get("property_id").map_err(db_err))
            .collect()
    }

    async fn properties_without_graph(
        &self,
        limit: usize,
    ) -> Result<Vec<Property>, JenguError> {
        let rows = sqlx::query(
            "SELECT p.* FROM properties p
             WHERE p.latitude IS NOT NULL AND p.longitude IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM competitors c WHERE c.property_id = p.property_id
               )
             ORDER BY p.property_id
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_property).collect()
    }

    // -- Pricing rows -----------------------------------------------------

    async fn upsert_rows(&self, rows: &[PricingRow]) -> Result<(), JenguError> {
        for row in rows {
            sqlx::query(
                "INSERT INTO pricing_rows (
                    row_id, property_id, user_id, stay_date, price, occupancy,
                    bookings, availability
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(property_id, stay_date) DO UPDATE SET
                    price = excluded.price,
                    occupancy = excluded.occupancy,
                    bookings = excluded.bookings,
                    availability = excluded.availability",
            )
            .bind(&row.row_id)
            .bind(&row.property_id)
            .bind(&row.user_id)
            .bind(row.stay_date.to_string())
            .bind(row.price.to_string())
            .bind(row.occupancy)
            .bind(row.bookings.map(|v| v as i64))
            .bind(row.availability.map(|v| v as i64))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn rows_for_property(
        &self,
        property_id: &str,
    ) -> Result<Vec<PricingRow>, JenguError> {
        let rows = sqlx::query(
            "SELECT * FROM pricing_rows WHERE property_id = ? ORDER BY stay_date",
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_pricing_row).collect()
    }

    async fn update_row(&self, row: &PricingRow) -> Result<(), JenguError> {
        let result = sqlx::query(
            "UPDATE pricing_rows SET
                price = ?, occupancy = ?, bookings = ?, availability = ?,
                temperature = ?, precipitation = ?, weather_code = ?,
                weather_description = ?, sunshine_hours = ?, day_of_week = ?,
                month = ?, season = ?, is_weekend = ?, is_holiday = ?,
                holiday_name = ?
             WHERE row_id = ?",
        )
        .bind(row.price.to_string())
        .bind(row.occupancy)
        .bind(row.bookings.map(|v| v as i64))
        .bind(row.availability.map(|v| v as i64))
        .bind(row.temperature)
        .bind(row.precipitation)
        .bind(row.weather_code.map(|v| v as i64))
        .bind(&row.weather_description)
        .bind(row.sunshine_hours)
        .bind(row.day_of_week.map(|v| v as i64))
        .bind(row.month.map(|v| v as i64))
        .bind(row.season.map(|s| s.as_str()))
        .bind(row.is_weekend.map(|v| v as i64))
        .bind(row.is_holiday.map(|v| v as i64))
        .bind(&row.holiday_name)
        .bind(&row.row_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(JenguError::NotFound(format!("row {}", row.row_id)));
        }
        Ok(())
    }

    // -- Competitor graph -------------------------------------------------

    async fn replace_competitors(
        &self,
        property_id: &str,
        competitors: &[CompetitorRecord],
    ) -> Result<(), JenguError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM competitors WHERE property_id = ?")
            .bind(property_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for c in competitors {
            sqlx::query(
                "INSERT INTO competitors (
                    competitor_id, property_id, name, latitude, longitude,
                    distance_km, star_rating, review_score, last_price, last_seen_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&c.competitor_id)
            .bind(property_id)
            .bind(&c.name)
            .bind(c.latitude)
            .bind(c.longitude)
            .bind(c.distance_km)
            .bind(c.star_rating)
            .bind(c.review_score)
            .bind(c.last_price.map(|p| p.to_string()))
            .bind(c.last_seen_at.map(|t| t.timestamp_millis()))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn competitors_for(
        &self,
        property_id: &str,
    ) -> Result<Vec<CompetitorRecord>, JenguError> {
        let rows = sqlx::query(
            "SELECT * FROM competitors WHERE property_id = ? ORDER BY distance_km",
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_competitor).collect()
    }

    async fn record_competitor_price(
        &self,
        competitor_id: &str,
        price: Decimal,
        seen_at: DateTime<Utc>,
    ) -> Result<(), JenguError> {
        sqlx::query(
            "UPDATE competitors SET last_price = ?, last_seen_at = ? WHERE competitor_id = ?",
        )
        .bind(price.to_string())
        .bind(seen_at.timestamp_millis())
        .bind(competitor_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    // -- Neighborhood index -----------------------------------------------

    async fn put_index_row(&self, row: &NeighborhoodIndexRow) -> Result<(), JenguError> {
        sqlx::query(
            "INSERT INTO index_rows (
                property_id, index_date, overall_index, price_competitiveness,
                value_score, positioning, market_position, competitors_analyzed,
                price_p10, price_p50, price_p90, price_percentile,
                delta_1d, delta_7d, delta_30d, advantages, weaknesses, computed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(property_id, index_date) DO UPDATE SET
                overall_index = excluded.overall_index,
                price_competitiveness = excluded.price_competitiveness,
                value_score = excluded.value_score,
                positioning = excluded.positioning,
                market_position = excluded.market_position,
                competitors_analyzed = excluded.competitors_analyzed,
                price_p10 = excluded.price_p10,
                price_p50 = excluded.price_p50,
                price_p90 = excluded.price_p90,
                price_percentile = excluded.price_percentile,
                delta_1d = excluded.delta_1d,
                delta_7d = excluded.delta_7d,
                delta_30d = excluded.delta_30d,
                advantages = excluded.advantages,
                weaknesses = excluded.weaknesses,
                computed_at = excluded.computed_at",
        )
        .bind(&row.property_id)
        .bind(row.index_date.to_string())
        .bind(row.overall_index)
        .bind(row.price_competitiveness)
        .bind(row.value_score)
        .bind(row.positioning)
        .bind(row.market_position.as_str())
        .bind(row.competitors_analyzed as i64)
        .bind(row.price_p10.to_string())
        .bind(row.price_p50.to_string())
        .bind(row.price_p90.to_string())
        .bind(row.price_percentile)
        .bind(row.delta_1d)
        .bind(row.delta_7d)
        .bind(row.delta_30d)
        .bind(serde_json::to_string(&row.advantages).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&row.weaknesses).unwrap_or_else(|_| "[]".into()))
        .bind(row.computed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn latest_index(
        &self,
        property_id: &str,
    ) -> Result<Option<NeighborhoodIndexRow>, JenguError> {
        let row = sqlx::query(
            "SELECT * FROM index_rows WHERE property_id = ?
             ORDER BY index_date DESC LIMIT 1",
        )
        .bind(property_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_index_row).transpose()
    }

    async fn index_on(
        &self,
        property_id: &str,
        date: NaiveDate,
    ) -> Result<Option<NeighborhoodIndexRow>, JenguError> {
        let row = sqlx::query(
            "SELECT * FROM index_rows WHERE property_id = ? AND index_date = ?",
        )
        .bind(property_id)
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_index_row).transpose()
    }

    async fn index_trend(
        &self,
        property_id: &str,
        days: u32,
    ) -> Result<Vec<NeighborhoodIndexRow>, JenguError> {
        let cutoff = (Utc::now().date_naive() - chrono::Duration::days(days as i64)).to_string();
        let rows = sqlx::query(
            "SELECT * FROM index_rows
             WHERE property_id = ? AND index_date >= ?
             ORDER BY index_date DESC",
        )
        .bind(property_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_index_row).collect()
    }

    // -- API keys & usage -------------------------------------------------

    async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), JenguError> {
        sqlx::query(
            "INSERT INTO api_keys (
                key_id, key_hash, user_id, role, scopes, allowed_ips,
                quota_per_minute, quota_per_hour, quota_per_day, is_active,
                expires_at, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(key_id) DO UPDATE SET
                key_hash = excluded.key_hash,
                role = excluded.role,
                scopes = excluded.scopes,
                allowed_ips = excluded.allowed_ips,
                quota_per_minute = excluded.quota_per_minute,
                quota_per_hour = excluded.quota_per_hour,
                quota_per_day = excluded.quota_per_day,
                is_active = excluded.is_active,
                expires_at = excluded.expires_at",
        )
        .bind(&record.key_id)
        .bind(&record.key_hash)
        .bind(&record.user_id)
        .bind(record.role.as_str())
        .bind(serde_json::to_string(&record.scopes).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&record.allowed_ips).unwrap_or_else(|_| "[]".into()))
        .bind(record.quota_per_minute as i64)
        .bind(record.quota_per_hour as i64)
        .bind(record.quota_per_day as i64)
        .bind(record.is_active as i64)
        .bind(record.expires_at.map(|t| t.timestamp_millis()))
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, JenguError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = ?")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_api_key).transpose()
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<(), JenguError> {
        sqlx::query(
            "INSERT INTO usage_records (
                key_id, endpoint, method, status, latency_ms, ip, error_type,
                recorded_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.key_id)
        .bind(&record.endpoint)
        .bind(&record.method)
        .bind(record.status as i64)
        .bind(record.latency_ms as i64)
        .bind(&record.ip)
        .bind(&record.error_type)
        .bind(record.recorded_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    // -- Job bookkeeping --------------------------------------------------

    async fn set_latest_enrichment_job(
        &self,
        property_id: &str,
        job_id: &str,
    ) -> Result<(), JenguError> {
        sqlx::query(
            "INSERT INTO latest_enrichment_jobs (property_id, job_id) VALUES (?, ?)
             ON CONFLICT(property_id) DO UPDATE SET job_id = excluded.job_id",
        )
        .bind(property_id)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn latest_enrichment_job(
        &self,
        property_id: &str,
    ) -> Result<Option<String>, JenguError> {
        let row = sqlx::query("SELECT job_id FROM latest_enrichment_jobs WHERE property_id = ?")
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get("job_id").map_err(db_err)).transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn open_store() -> SqliteStore {
        SqliteStore::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_property_roundtrip_with_location() {
        let store = open_store().await;
        let mut property = Property::sample("prop-1");
        property.star_rating = Some(4.0);
        store.put_property(&property).await.unwrap();

        let got = store.get_property("prop-1").await.unwrap().unwrap();
        assert_eq!(got.name, "Hôtel Sample");
        assert_eq!(got.location.country_code.as_deref(), Some("FR"));
        assert_eq!(got.star_rating, Some(4.0));
        assert_eq!(got.enrichment_status, EnrichmentStatus::None);
    }

    #[tokio::test]
    async fn test_status_update_and_missing_property() {
        let store = open_store().await;
        store.put_property(&Property::sample("prop-1")).await.unwrap();

        store
            .set_enrichment_status(
                "prop-1",
                EnrichmentStatus::Completed,
                None,
                Some("holidays skipped".into()),
            )
            .await
            .unwrap();
        let got = store.get_property("prop-1").await.unwrap().unwrap();
        assert_eq!(got.enrichment_status, EnrichmentStatus::Completed);
        assert!(got.enriched_at.is_some());
        assert_eq!(got.enrichment_warning.as_deref(), Some("holidays skipped"));

        let err = store
            .set_enrichment_status("ghost", EnrichmentStatus::Pending, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_rows_upsert_preserves_enrichment() {
        let store = open_store().await;
        let row = PricingRow::sample("prop-1", date(2024, 1, 1));
        store.upsert_rows(&[row.clone()]).await.unwrap();

        // Enrich it.
        let mut enriched = store.rows_for_property("prop-1").await.unwrap().remove(0);
        enriched.temperature = Some(5.5);
        enriched.season = Some(crate::types::Season::Winter);
        enriched.is_weekend = Some(false);
        store.update_row(&enriched).await.unwrap();

        // Re-upload with a changed price.
        let mut reupload = PricingRow::sample("prop-1", date(2024, 1, 1));
        reupload.price = dec!(99.50);
        store.upsert_rows(&[reupload]).await.unwrap();

        let rows = store.rows_for_property("prop-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price, dec!(99.50));
        assert_eq!(rows[0].temperature, Some(5.5));
        assert_eq!(rows[0].season, Some(crate::types::Season::Winter));
        assert_eq!(rows[0].is_weekend, Some(false));
    }

    #[tokio::test]
    async fn test_competitor_graph_roundtrip() {
        let store = open_store().await;
        store.put_property(&Property::sample("prop-1")).await.unwrap();
        let competitors = vec![CompetitorRecord {
            competitor_id: "comp-1".into(),
            property_id: "prop-1".into(),
            name: "Rival Inn".into(),
            latitude: 48.85,
            longitude: 2.35,
            distance_km: 0.4,
            star_rating: Some(4.0),
            review_score: Some(8.6),
            last_price: None,
            last_seen_at: None,
        }];
        store.replace_competitors("prop-1", &competitors).await.unwrap();

        store
            .record_competitor_price("comp-1", dec!(101.00), Utc::now())
            .await
            .unwrap();
        let got = store.competitors_for("prop-1").await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].last_price, Some(dec!(101.00)));

        assert_eq!(store.properties_with_graph().await.unwrap(), vec!["prop-1"]);
        assert!(store.properties_without_graph(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_row_roundtrip() {
        let store = open_store().await;
        let row = NeighborhoodIndexRow {
            property_id: "prop-1".into(),
            index_date: date(2024, 6, 1),
            overall_index: 72.5,
            price_competitiveness: 80.0,
            value_score: 65.0,
            positioning: 70.0,
            market_position: MarketPosition::Premium,
            competitors_analyzed: 12,
            price_p10: dec!(80),
            price_p50: dec!(120),
            price_p90: dec!(210),
            price_percentile: 0.6,
            delta_1d: Some(1.5),
            delta_7d: None,
            delta_30d: None,
            advantages: vec!["price_competitiveness".into()],
            weaknesses: vec![],
            computed_at: Utc::now(),
        };
        store.put_index_row(&row).await.unwrap();

        let got = store.latest_index("prop-1").await.unwrap().unwrap();
        assert_eq!(got.market_position, MarketPosition::Premium);
        assert_eq!(got.price_p50, dec!(120));
        assert_eq!(got.advantages, vec!["price_competitiveness"]);
        assert_eq!(got.delta_1d, Some(1.5));

        let trend = store.index_trend("prop-1", 3000).await.unwrap();
        assert_eq!(trend.len(), 1);
    }

    #[tokio::test]
    async fn test_api_key_roundtrip() {
        let store = open_store().await;
        let mut key = ApiKeyRecord::sample("key-1", &["pricing:*"]);
        key.key_hash = "deadbeef".into();
        key.allowed_ips = vec!["10.0.0.1".into()];
        store.insert_api_key(&key).await.unwrap();

        let got = store.api_key_by_hash("deadbeef").await.unwrap().unwrap();
        assert_eq!(got.key_id, "key-1");
        assert_eq!(got.scopes, vec!["pricing:*"]);
        assert_eq!(got.allowed_ips, vec!["10.0.0.1"]);
        assert!(got.is_active);
    }

    #[tokio::test]
    async fn test_usage_and_latest_job() {
        let store = open_store().await;
        store
            .record_usage(&UsageRecord {
                key_id: "key-1".into(),
                endpoint: "/enrichment/start".into(),
                method: "POST".into(),
                status: 200,
                latency_ms: 9,
                ip: "1.2.3.4".into(),
                error_type: None,
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .set_latest_enrichment_job("prop-1", "enrich-prop-1-1")
            .await
            .unwrap();
        store
            .set_latest_enrichment_job("prop-1", "enrich-prop-1-2")
            .await
            .unwrap();
        assert_eq!(
            store.latest_enrichment_job("prop-1").await.unwrap().as_deref(),
            Some("enrich-prop-1-2")
        );
    }
}
