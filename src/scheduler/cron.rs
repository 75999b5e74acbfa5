//! Minimal 5-field cron expression matching.
//!
//! Supports the subset the standing schedules need: `*`, step values
//! (`*/15`), lists (`8,20`), ranges (`9-17`), and combinations
//! (`1-5/2`). Day-of-week is 0 or 7 = Sunday. When both day-of-month
//! and day-of-week are restricted, either matching suffices (standard
//! cron semantics).

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::types::JenguError;

/// One parsed field: the set of accepted values.
#[derive(Debug, Clone, PartialEq)]
struct Field {
    /// True when the field was `*` (unrestricted, no step).
    any: bool,
    values: Vec<u32>,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.any || self.values.contains(&value)
    }
}

/// A parsed cron expression: minute, hour, day-of-month, month,
/// day-of-week.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

impl CronExpr {
    /// Whether the expression fires at `t` (seconds ignored).
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        if !self.minute.matches(t.minute()) || !self.hour.matches(t.hour()) {
            return false;
        }
        if !self.month.matches(t.month()) {
            return false;
        }
        let dom_ok = self.dom.matches(t.day());
        let dow_ok = self.dow.matches(t.weekday().num_days_from_sunday());
        // Standard cron: if both day fields are restricted, either one
        // matching is enough; otherwise both must pass.
        match (self.dom.any, self.dow.any) {
            (false, false) => dom_ok || dow_ok,
            _ => dom_ok && dow_ok,
        }
    }
}

/// Parse a 5-field cron expression.
pub fn parse(expr: &str) -> Result<CronExpr, JenguError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(JenguError::Validation(format!(
            "cron expression must have 5 fields, got {}: {expr:?}",
            fields.len()
        )));
    }
    Ok(CronExpr {
        minute: parse_field(fields[0], 0, 59, expr)?,
        hour: parse_field(fields[1], 0, 23, expr)?,
        dom: parse_field(fields[2], 1, 31, expr)?,
        month: parse_field(fields[3], 1, 12, expr)?,
        dow: parse_dow(fields[4], expr)?,
    })
}

fn parse_field(spec: &str, min: u32, max: u32, expr: &str) -> Result<Field, JenguError> {
    if spec == "*" {
        return Ok(Field {
            any: true,
            values: Vec::new(),
        });
    }

    let bad = || JenguError::Validation(format!("invalid cron field {spec:?} in {expr:?}"));
    let mut values = Vec::new();

    for part in spec.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => (r, s.parse::<u32>().map_err(|_| bad())?),
            None => (part, 1),
        };
        if step == 0 {
            return Err(bad());
        }

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (
                a.parse::<u32>().map_err(|_| bad())?,
                b.parse::<u32>().map_err(|_| bad())?,
            )
        } else {
            let v = range_part.parse::<u32>().map_err(|_| bad())?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            return Err(bad());
        }
        let mut v = lo;
        while v <= hi {
            values.push(v);
            v += step;
        }
    }

    values.sort_unstable();
    values.dedup();
    Ok(Field { any: false, values })
}

/// Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday.
fn parse_dow(spec: &str, expr: &str) -> Result<Field, JenguError> {
    let mut field = parse_field(spec, 0, 7, expr)?;
    if field.values.contains(&7) {
        field.values.retain(|v| *v != 7);
        if !field.values.contains(&0) {
            field.values.insert(0, 0);
        }
        field.values.sort_unstable();
    }
    Ok(field)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
