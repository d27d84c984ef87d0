use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ServiceGraphError};

static RELATIVE_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^now\s*(?:-\s*(\d+)\s*([smhd]))?$").expect("valid relative time regex"));

/// A resolved query window. `now` is only set when the window was expressed relative to now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(skip)]
    pub now: Option<DateTime<Utc>>,
}

enum ParsedTime {
    Relative(Duration),
    Absolute(DateTime<Utc>),
}

fn parse_time(field: &str, value: &str) -> Result<ParsedTime> {
    let trimmed = value.trim();
    if let Some(caps) = RELATIVE_TIME.captures(trimmed) {
        let offset = match (caps.get(1), caps.get(2)) {
            (Some(num), Some(unit)) => {
                let n: i64 = num.as_str().parse().map_err(|_| invalid_time(field, value))?;
                match unit.as_str() {
                    "s" => Duration::try_seconds(n),
                    "m" => Duration::try_minutes(n),
                    "h" => Duration::try_hours(n),
                    _ => Duration::try_days(n),
                }
                .ok_or_else(|| invalid_time(field, value))?
            }
            _ => Duration::zero(),
        };
        return Ok(ParsedTime::Relative(offset));
    }

    DateTime::parse_from_rfc3339(trimmed)
        .map(|t| ParsedTime::Absolute(t.with_timezone(&Utc)))
        .map_err(|_| invalid_time(field, value))
}

fn invalid_time(field: &str, value: &str) -> ServiceGraphError {
    ServiceGraphError::invalid_request(format!("invalid value for the time range '{}' field: {}", field, value))
}

impl TimeRange {
    pub fn absolute(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to, now: None }
    }

    /// A window ending at `now` and starting `window` earlier.
    pub fn relative(now: DateTime<Utc>, window: Duration) -> Self {
        Self { from: now - window, to: now, now: Some(now) }
    }

    /// Parses a `from`/`to` pair. Both values are either RFC 3339 timestamps or both relative to now
    /// (`now`, `now-15m`, `now-2h`, ...).
    pub fn parse(from: &str, to: &str, now: DateTime<Utc>) -> Result<Self> {
        let range = match (parse_time("from", from)?, parse_time("to", to)?) {
            (ParsedTime::Relative(f), ParsedTime::Relative(t)) => Self {
                from: now.checked_sub_signed(f).ok_or_else(|| invalid_time("from", from))?,
                to: now.checked_sub_signed(t).ok_or_else(|| invalid_time("to", to))?,
                now: Some(now),
            },
            (ParsedTime::Absolute(f), ParsedTime::Absolute(t)) => Self::absolute(f, t),
            _ => {
                return Err(ServiceGraphError::invalid_request(
                    "values must either both be explicit times or both be relative to now",
                ))
            }
        };

        if range.from > range.to {
            return Err(ServiceGraphError::invalid_request(format!("from ({}) is after to ({})", from, to)));
        }
        Ok(range)
    }

    pub fn is_relative(&self) -> bool {
        self.now.is_some()
    }

    pub fn duration(&self) -> Duration {
        self.to - self.from
    }
}
