//! When `watch` mode fires the next run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

const MIN_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub enum WatchSchedule {
    /// Fixed pause between runs.
    Interval(Duration),
    /// Cron expression, evaluated in UTC.
    Cron(Box<Schedule>),
}

impl WatchSchedule {
    pub fn interval_secs(secs: u64) -> Self {
        Self::Interval(Duration::from_secs(secs.max(MIN_INTERVAL_SECS)))
    }

    pub fn cron(expression: &str) -> Result<Self> {
        let normalized = normalize_expression(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .with_context(|| format!("Invalid cron expression: {expression}"))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Time to wait from `now` until the next run should start.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Interval(period) => Some(*period),
            Self::Cron(schedule) => {
                let next = schedule.after(&now).next()?;
                Some((next - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        // standard crontab syntax: minute hour day month weekday
        5 => Ok(format!("0 {expression}")),
        // crate-native syntax includes seconds (+ optional year)
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}
