//! Cron expression parsing and zone-aware evaluation.
//!
//! Standard five-field format: `minute hour day month weekday`. Expressions
//! are evaluated in a named time zone so "daily at 09:00" means 09:00 where
//! the project lives, not UTC.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

/// One field of a cron expression.
#[derive(Debug, Clone)]
enum CronField {
    /// `*`
    Any,
    /// `n`
    Value(u32),
    /// `a,b,c`
    List(Vec<u32>),
    /// `a-b`
    Range(u32, u32),
    /// `*/n`
    Step(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Value(v) => *v == value,
            Self::List(values) => values.contains(&value),
            Self::Range(start, end) => value >= *start && value <= *end,
            Self::Step(step) => value % step == 0,
        }
    }
}

impl CronExpression {
    /// Parse a five-field cron expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            anyhow::bail!("cron expression must have 5 fields: {expr}");
        }
        Ok(Self {
            minute: parse_field(parts[0], 0, 59).context("invalid minute field")?,
            hour: parse_field(parts[1], 0, 23).context("invalid hour field")?,
            day: parse_field(parts[2], 1, 31).context("invalid day field")?,
            month: parse_field(parts[3], 1, 12).context("invalid month field")?,
            weekday: parse_field(parts[4], 0, 6).context("invalid weekday field")?,
        })
    }

    /// Whether the expression matches the given local time.
    fn matches_local(&self, time: &DateTime<Tz>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.day.matches(time.day())
            && self.month.matches(time.month())
            && self.weekday.matches(time.weekday().num_days_from_sunday())
    }

    /// Next execution instant strictly after `after`, evaluated in `tz`.
    ///
    /// Scans minute by minute up to a year out; a pattern with no match in
    /// a year yields None.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let mut current = (after + chrono::Duration::minutes(1))
            .with_timezone(&tz)
            .with_second(0)?
            .with_nanosecond(0)?;
        for _ in 0..(366 * 24 * 60) {
            if self.matches_local(&current) {
                return Some(current.with_timezone(&Utc));
            }
            current += chrono::Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<CronField> {
    if field == "*" {
        return Ok(CronField::Any);
    }
    if let Some(step_str) = field.strip_prefix("*/") {
        let step: u32 = step_str.parse().context("invalid step value")?;
        if step == 0 || step > max {
            anyhow::bail!("step value must be 1-{max}");
        }
        return Ok(CronField::Step(step));
    }
    if field.contains('-') {
        let parts: Vec<&str> = field.split('-').collect();
        if parts.len() != 2 {
            anyhow::bail!("invalid range format: {field}");
        }
        let start: u32 = parts[0].parse().context("invalid range start")?;
        let end: u32 = parts[1].parse().context("invalid range end")?;
        if start < min || end > max || start > end {
            anyhow::bail!("range values must be {min}-{max} with start <= end");
        }
        return Ok(CronField::Range(start, end));
    }
    if field.contains(',') {
        let values: Result<Vec<u32>> = field
            .split(',')
            .map(|v| {
                let num: u32 = v.parse().context("invalid list value")?;
                if num < min || num > max {
                    anyhow::bail!("value must be {min}-{max}");
                }
                Ok(num)
            })
            .collect();
        return Ok(CronField::List(values?));
    }
    let value: u32 = field.parse().context("invalid numeric value")?;
    if value < min || value > max {
        anyhow::bail!("value must be {min}-{max}");
    }
    Ok(CronField::Value(value))
}

/// Resolve a timezone name, e.g. `America/New_York`.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| anyhow::anyhow!("unknown timezone: {name}"))
}
