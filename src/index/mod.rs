//! Neighborhood index engine.
//!
//! Scores a property's competitive standing against its competitor
//! graph on a given day: price percentiles across the group, three
//! component scores, a weighted overall index, a market-position label,
//! and day-over-day deltas from previously stored rows.

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use tracing::debug;

use crate::store::Store;
use crate::types::{
    CompetitorRecord, JenguError, MarketPosition, NeighborhoodIndexRow, PricingRow,
};

/// Fewer priced competitors than this and no index is produced.
const MIN_COMPETITORS: usize = 3;

/// Component weights: price competitiveness / value / positioning.
const WEIGHT_PRICE: f64 = 0.4;
const WEIGHT_VALUE: f64 = 0.3;
const WEIGHT_POSITIONING: f64 = 0.3;

/// Component scores at or above this are competitive advantages,
/// at or below (100 - this) weaknesses — the quartile boundaries.
const ADVANTAGE_THRESHOLD: f64 = 75.0;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of an index computation.
#[derive(Debug)]
pub enum IndexOutcome {
    Computed(NeighborhoodIndexRow),
    /// Not enough priced competitors to say anything meaningful.
    InsufficientData { competitors_found: usize },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct IndexEngine;

impl IndexEngine {
    pub fn new() -> Self {
        Self
    }

    /// Compute (and persist) the index for a property on a date.
    pub async fn compute(
        &self,
        store: &dyn Store,
        property_id: &str,
        date: NaiveDate,
    ) -> Result<IndexOutcome, JenguError> {
        let property = store
            .get_property(property_id)
            .await?
            .ok_or_else(|| JenguError::NotFound(format!("property {property_id}")))?;

        let competitors = store.competitors_for(property_id).await?;
        let priced: Vec<&CompetitorRecord> = competitors
            .iter()
            .filter(|c| c.last_price.is_some())
            .collect();
        if priced.len() < MIN_COMPETITORS {
            debug!(
                property_id,
                found = priced.len(),
                "Insufficient competitor data for index"
            );
            return Ok(IndexOutcome::InsufficientData {
                competitors_found: priced.len(),
            });
        }

        let rows = store.rows_for_property(property_id).await?;
        let own_price = own_price_for(&rows, date).ok_or_else(|| {
            JenguError::NotFound(format!("no pricing rows for property {property_id}"))
        })?;
        let own_price_f = own_price.to_f64().unwrap_or(0.0);

        let mut prices: Vec<f64> = priced
            .iter()
            .filter_map(|c| c.last_price.and_then(|p| p.to_f64()))
            .collect();
        prices.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let p10 = percentile(&prices, 0.10);
        let p50 = percentile(&prices, 0.50);
        let p90 = percentile(&prices, 0.90);
        let price_percentile = percentile_rank(&prices, own_price_f);

        let price_competitiveness = price_competitiveness(own_price_f, p50, p90);
        let value_score = value_score(&property, own_price_f, &priced);
        let positioning = positioning_score(&property, &priced);

        let overall_index = WEIGHT_PRICE * price_competitiveness
            + WEIGHT_VALUE * value_score
            + WEIGHT_POSITIONING * positioning;

        let components = [
            ("price_competitiveness", price_competitiveness),
            ("value", value_score),
            ("positioning", positioning),
        ];
        let advantages: Vec<String> = components
            .iter()
            .filter(|(_, score)| *score >= ADVANTAGE_THRESHOLD)
            .map(|(name, _)| name.to_string())
            .collect();
        let weaknesses: Vec<String> = components
            .iter()
            .filter(|(_, score)| *score <= 100.0 - ADVANTAGE_THRESHOLD)
            .map(|(name, _)| name.to_string())
            .collect();

        let row = NeighborhoodIndexRow {
            property_id: property_id.to_string(),
            index_date: date,
            overall_index,
            price_competitiveness,
            value_score,
            positioning,
            market_position: MarketPosition::from_percentile(price_percentile),
            competitors_analyzed: priced.len(),
            price_p10: crate::types::d(p10),
            price_p50: crate::types::d(p50),
            price_p90: crate::types::d(p90),
            price_percentile,
            delta_1d: delta_against(store, property_id, date, 1, overall_index).await?,
            delta_7d: delta_against(store, property_id, date, 7, overall_index).await?,
            delta_30d: delta_against(store, property_id, date, 30, overall_index).await?,
            advantages,
            weaknesses,
            computed_at: Utc::now(),
        };

        store.put_index_row(&row).await?;
        debug!(property_id, %date, index = row.overall_index, "Index computed");
        Ok(IndexOutcome::Computed(row))
    }
}

impl Default for IndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Scoring pieces
// ---------------------------------------------------------------------------

/// The property's price on `date`, or the most recent earlier row as a
/// fallback (yesterday's rate is the best stand-in for a missing day).
fn own_price_for(rows: &[PricingRow], date: NaiveDate) -> Option<Decimal> {
    rows.iter()
        .find(|r| r.stay_date == date)
        .or_else(|| rows.iter().rev().find(|r| r.stay_date < date))
        .or_else(|| rows.first())
        .map(|r| r.price)
}

/// Linear-interpolated percentile of a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = pos - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Rank of `value` within the distribution (0…1), counting equal values
/// as half to keep ties symmetric.
fn percentile_rank(sorted: &[f64], value: f64) -> f64 {
    if sorted.is_empty() {
        return 0.5;
    }
    let below = sorted.iter().filter(|p| **p < value).count() as f64;
    let equal = sorted.iter().filter(|p| **p == value).count() as f64;
    ((below + 0.5 * equal) / sorted.len() as f64).clamp(0.0, 1.0)
}

/// Highest when priced at the market median and still below the p90
/// ceiling; distance from the median costs linearly, and pricing above
/// p90 halves the score.
fn price_competitiveness(own: f64, p50: f64, p90: f64) -> f64 {
    if p50 <= 0.0 {
        return 50.0;
    }
    let distance = ((own - p50).abs() / p50).min(1.0);
    let mut score = (1.0 - distance) * 100.0;
    if own > p90 {
        score *= 0.5;
    }
    score.clamp(0.0, 100.0)
}

/// Quality per unit of price, relative to the neighborhood mean ratio.
/// 50 = at the mean, 100 = twice the mean or better.
fn value_score(
    property: &crate::types::Property,
    own_price: f64,
    competitors: &[&CompetitorRecord],
) -> f64 {
    let Some(own_quality) = quality_of(property.star_rating, property.review_score) else {
        return 50.0;
    };
    if own_price <= 0.0 {
        return 50.0;
    }
    let own_ratio = own_quality / own_price;

    let mut ratios: Vec<f64> = Vec::new();
    for c in competitors {
        let Some(q) = quality_of(c.star_rating, c.review_score) else {
            continue;
        };
        let Some(p) = c.last_price.and_then(|p| p.to_f64()) else {
            continue;
        };
        if p > 0.0 {
            ratios.push(q / p);
        }
    }
    if ratios.is_empty() {
        return 50.0;
    }
    let mean: f64 = ratios.iter().sum::<f64>() / ratios.len() as f64;
    if mean <= 0.0 {
        return 50.0;
    }
    ((own_ratio / mean) * 50.0).clamp(0.0, 100.0)
}

/// Star/review percentile within the group.
fn positioning_score(
    property: &crate::types::Property,
    competitors: &[&CompetitorRecord],
) -> f64 {
    let Some(own_quality) = quality_of(property.star_rating, property.review_score) else {
        return 50.0;
    };
    let mut qualities: Vec<f64> = competitors
        .iter()
        .filter_map(|c| quality_of(c.star_rating, c.review_score))
        .collect();
    if qualities.is_empty() {
        return 50.0;
    }
    qualities.sort_by(|a, b| a.partial_cmp(b).unwrap());
    percentile_rank(&qualities, own_quality) * 100.0
}

/// Collapse star rating (0…5) and review score (0…10) onto one 0…10
/// quality scale, preferring the review score when both exist.
fn quality_of(star_rating: Option<f64>, review_score: Option<f64>) -> Option<f64> {
    review_score.or(star_rating.map(|s| s * 2.0))
}

async fn delta_against(
    store: &dyn Store,
    property_id: &str,
    date: NaiveDate,
    days_back: i64,
    current: f64,
) -> Result<Option<f64>, JenguError> {
    let prior = store
        .index_on(property_id, date - Duration::days(days_back))
        .await?;
    Ok(prior.map(|p| current - p.overall_index))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
