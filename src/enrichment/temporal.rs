//! Temporal feature derivation.
//!
//! Everything here is computed locally from the calendar — no upstream
//! calls. Day-of-week is 0 = Monday … 6 = Sunday, weekends are Saturday
//! and Sunday (dow 5 and 6), seasons follow the Northern-hemisphere
//! mapping.

use chrono::{Datelike, NaiveDate};

use crate::cache::HolidayEntry;
use crate::types::Season;

/// The locally-derived slice of the enrichment block.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalFeatures {
    pub day_of_week: u8,
    pub month: u8,
    pub season: Season,
    pub is_weekend: bool,
    pub is_holiday: bool,
    pub holiday_name: Option<String>,
}

/// 0 = Monday … 6 = Sunday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

/// Northern-hemisphere season: Dec–Feb Winter, Mar–May Spring,
/// Jun–Aug Summer, Sep–Nov Fall.
pub fn season_for(date: NaiveDate) -> Season {
    match date.month() {
        12 | 1 | 2 => Season::Winter,
        3 | 4 | 5 => Season::Spring,
        6 | 7 | 8 => Season::Summer,
        _ => Season::Fall,
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    day_of_week(date) >= 5
}

/// Derive all temporal features for one date, matching against the
/// holiday list for the date's country/year.
pub fn derive(date: NaiveDate, holidays: &[HolidayEntry]) -> TemporalFeatures {
    let holiday = holidays.iter().find(|h| h.date == date);
    TemporalFeatures {
        day_of_week: day_of_week(date),
        month: date.month() as u8,
        season: season_for(date),
        is_weekend: is_weekend(date),
        is_holiday: holiday.is_some(),
        holiday_name: holiday.map(|h| h.name.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
