use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt;

use crate::graph::TimeRange;

/// Identifies a cached time window for a cluster.
///
/// Relative windows key on their offsets from now, so `now-15m -> now` maps to the same entry whenever it is
/// requested. Absolute windows key on Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub relative: bool,
    pub start: i64,
    pub end: i64,
    pub cluster: String,
}

impl CacheKey {
    pub fn new(cluster: &str, time_range: &TimeRange) -> Self {
        match time_range.now {
            Some(now) => Self {
                relative: true,
                start: (now - time_range.from).num_seconds(),
                end: (now - time_range.to).num_seconds(),
                cluster: cluster.to_string(),
            },
            None => Self {
                relative: false,
                start: time_range.from.timestamp(),
                end: time_range.to.timestamp(),
                cluster: cluster.to_string(),
            },
        }
    }

    /// A window of `secs` seconds ending now.
    pub fn relative_window(cluster: &str, secs: i64) -> Self {
        Self { relative: true, start: secs, end: 0, cluster: cluster.to_string() }
    }

    /// The concrete window for data created at `created`.
    pub fn time_range(&self, created: DateTime<Utc>) -> TimeRange {
        if self.relative {
            TimeRange {
                from: created - Duration::seconds(self.start),
                to: created - Duration::seconds(self.end),
                now: Some(created),
            }
        } else {
            TimeRange::absolute(unix(self.start), unix(self.end))
        }
    }

    /// End of an absolute window.
    pub fn end_time(&self) -> DateTime<Utc> {
        unix(self.end)
    }
}

fn unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relative {
            write!(f, "{}(now-{}s->now-{}s)", self.cluster, self.start, self.end)
        } else {
            write!(f, "{}({}->{})", self.cluster, unix(self.start).to_rfc3339(), unix(self.end).to_rfc3339())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_keys_ignore_now() {
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t2 = t1 + Duration::minutes(7);
        let k1 = CacheKey::new("c", &TimeRange::parse("now-15m", "now", t1).unwrap());
        let k2 = CacheKey::new("c", &TimeRange::parse("now-15m", "now", t2).unwrap());
        assert_eq!(k1, k2);
        assert_eq!(k1, CacheKey::relative_window("c", 900));
        assert_eq!(k1.to_string(), "c(now-900s->now-0s)");
        assert_ne!(k1, CacheKey::new("other", &TimeRange::parse("now-15m", "now", t1).unwrap()));

        let tr = k1.time_range(t2);
        assert_eq!(tr.to, t2);
        assert_eq!(tr.duration(), Duration::minutes(15));
    }

    #[test]
    fn test_absolute_keys() {
        let from = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let key = CacheKey::new("c", &TimeRange::absolute(from, to));
        assert!(!key.relative);
        assert_eq!(key.time_range(Utc::now()), TimeRange::absolute(from, to));
        assert_eq!(key.end_time(), to);
    }
}
