use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::runtime::expression;

/// Timer event definition, kept in its textual form so `${..}` expressions can
/// be resolved against the variables at the moment the timer is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TimerDefinition {
    /// ISO-8601 duration, e.g. `PT5M`.
    Duration(String),
    /// RFC 3339 date-time.
    Date(String),
    /// `R[n]/[start/]duration`
    Cycle(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Repeat {
    pub interval_ms: i64,
    /// Further firings after the current one; `None` repeats forever.
    pub remaining: Option<u32>,
}

impl Repeat {
    /// Schedule of the following firing, if any is left.
    pub fn next(&self) -> Option<Repeat> {
        match self.remaining {
            None => Some(*self),
            Some(0) => None,
            Some(n) => Some(Repeat { remaining: Some(n - 1), ..*self }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimerSchedule {
    pub due: DateTime<Utc>,
    pub repeat: Option<Repeat>,
}

impl TimerDefinition {
    pub fn text(&self) -> &str {
        match self {
            TimerDefinition::Duration(s) | TimerDefinition::Date(s) | TimerDefinition::Cycle(s) => s,
        }
    }

    /// Parses literal definitions; expressions are only checked at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.text().contains("${") {
            return Ok(());
        }
        self.schedule(Utc::now(), &HashMap::new()).map(|_| ())
    }

    pub fn schedule(&self, now: DateTime<Utc>, variables: &HashMap<String, Value>) -> Result<TimerSchedule> {
        let text = resolve_text(self.text(), variables)?;
        match self {
            TimerDefinition::Duration(_) => {
                let duration = match &text {
                    Value::Number(n) => n
                        .as_i64()
                        .and_then(Duration::try_milliseconds)
                        .ok_or_else(|| EngineError::InvalidTimer(n.to_string()))?,
                    other => parse_duration(&as_text(other))?,
                };
                Ok(TimerSchedule {
                    due: add_duration(now, duration, &as_text(&text))?,
                    repeat: None,
                })
            }
            TimerDefinition::Date(_) => Ok(TimerSchedule {
                due: parse_date(&as_text(&text))?,
                repeat: None,
            }),
            TimerDefinition::Cycle(_) => {
                let (due, repeat) = parse_cycle(&as_text(&text), now)?;
                Ok(TimerSchedule { due, repeat })
            }
        }
    }
}

/// `at + duration`, or `InvalidTimer` when the result leaves chrono's range.
pub fn add_duration(at: DateTime<Utc>, duration: Duration, text: &str) -> Result<DateTime<Utc>> {
    at.checked_add_signed(duration)
        .ok_or_else(|| EngineError::InvalidTimer(text.to_string()))
}

fn resolve_text(text: &str, variables: &HashMap<String, Value>) -> Result<Value> {
    if text.contains("${") {
        expression::evaluate(text, variables)
    } else {
        Ok(Value::String(text.to_string()))
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn parse_date(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|_| EngineError::InvalidTimer(text.to_string()))
}

/// ISO-8601 duration. Years count as 365 days and months as 30 days.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || EngineError::InvalidTimer(text.to_string());
    let body = text.trim().strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let mut total_ms = 0f64;
    let mut number = String::new();
    let mut in_time = false;
    let mut seen_unit = false;

    for c in body.chars() {
        match c {
            '0'..='9' | '.' | ',' => number.push(if c == ',' { '.' } else { c }),
            'T' if !in_time && number.is_empty() => in_time = true,
            unit => {
                let value: f64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let unit_ms = match (unit, in_time) {
                    ('Y', false) => 365.0 * 86_400_000.0,
                    ('M', false) => 30.0 * 86_400_000.0,
                    ('W', false) => 7.0 * 86_400_000.0,
                    ('D', false) => 86_400_000.0,
                    ('H', true) => 3_600_000.0,
                    ('M', true) => 60_000.0,
                    ('S', true) => 1_000.0,
                    _ => return Err(invalid()),
                };
                total_ms += value * unit_ms;
                seen_unit = true;
            }
        }
    }

    if !number.is_empty() || !seen_unit {
        return Err(invalid());
    }
    let total_ms = total_ms.round();
    if !total_ms.is_finite() || total_ms >= i64::MAX as f64 {
        return Err(invalid());
    }
    Duration::try_milliseconds(total_ms as i64).ok_or_else(invalid)
}

/// `R[n]/[start/]duration`; returns the first due date and the repeat that follows it.
pub fn parse_cycle(text: &str, now: DateTime<Utc>) -> Result<(DateTime<Utc>, Option<Repeat>)> {
    let invalid = || EngineError::InvalidTimer(text.to_string());
    let parts: Vec<&str> = text.trim().split('/').collect();

    let count = parts
        .first()
        .and_then(|p| p.strip_prefix('R'))
        .ok_or_else(invalid)?;
    let count: Option<u32> = if count.is_empty() {
        None
    } else {
        Some(count.parse().map_err(|_| invalid())?)
    };
    if count == Some(0) {
        return Err(invalid());
    }

    let (start, interval) = match parts.as_slice() {
        [_, duration] => (None, parse_duration(duration)?),
        [_, start, duration] => (Some(parse_date(start)?), parse_duration(duration)?),
        _ => return Err(invalid()),
    };
    if interval <= Duration::zero() {
        return Err(invalid());
    }

    let due = match start {
        Some(start) => start,
        None => add_duration(now, interval, text)?,
    };
    let repeat = Repeat {
        interval_ms: interval.num_milliseconds(),
        remaining: count.map(|n| n - 1),
    };
    let repeat = if repeat.remaining == Some(0) { None } else { Some(repeat) };
    Ok((due, repeat))
}
