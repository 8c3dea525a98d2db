//! Maintenance windows for automatic updates.
//!
//! A window is a UTC time-of-day range, optionally restricted to a set of
//! weekdays. An empty window list allows updates at any time.
//!
//! ```yaml
//! windows:
//!   - from: "08:00"
//!     to: "10:00"
//!     days: ["Mon", "Wed"]
//! ```

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Window parse errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid time {0:?}, expected HH:MM")]
    InvalidTime(String),

    #[error("invalid day {0:?}")]
    InvalidDay(String),
}

/// A single maintenance window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<String>,
}

/// Parsed form of a window.
struct Span {
    from: NaiveTime,
    /// `None` means end of day ("24:00").
    to: Option<NaiveTime>,
    days: Vec<Weekday>,
}

impl Window {
    fn parse(&self) -> Result<Span, WindowError> {
        let from = parse_time(&self.from)?
            .ok_or_else(|| WindowError::InvalidTime(self.from.clone()))?;
        let to = parse_time(&self.to)?;
        let days = self
            .days
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| WindowError::InvalidDay(d.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Span { from, to, days })
    }
}

impl Span {
    fn runs_on(&self, day: Weekday) -> bool {
        self.days.is_empty() || self.days.contains(&day)
    }

    fn contains(&self, t: DateTime<Utc>) -> bool {
        if !self.runs_on(t.weekday()) {
            return false;
        }

        let tod = t.time();
        match self.to {
            None => tod >= self.from,
            Some(to) if self.from < to => tod >= self.from && tod < to,
            // Wraps past midnight
            Some(to) => tod >= self.from || tod < to,
        }
    }
}

/// Returns `Ok(None)` for "24:00".
fn parse_time(s: &str) -> Result<Option<NaiveTime>, WindowError> {
    if s == "24:00" {
        return Ok(None);
    }
    NaiveTime::parse_from_str(s, "%H:%M")
        .map(Some)
        .map_err(|_| WindowError::InvalidTime(s.to_string()))
}

/// An ordered set of maintenance windows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Windows(pub Vec<Window>);

impl Windows {
    /// Check every window parses.
    pub fn validate(&self) -> Result<(), WindowError> {
        self.0.iter().try_for_each(|w| w.parse().map(|_| ()))
    }

    /// Returns true if an update may start at `t`.
    ///
    /// Windows that fail to parse never match.
    pub fn is_allowed(&self, t: DateTime<Utc>) -> bool {
        if self.0.is_empty() {
            return true;
        }
        self.spans().any(|span| span.contains(t))
    }

    /// Earliest instant at or after `t` at which an update is allowed.
    ///
    /// Returns `t` itself when updates are allowed now or when no window
    /// can ever open.
    pub fn next_allowed_time(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_allowed(t) {
            return t;
        }

        let spans: Vec<Span> = self.spans().collect();
        let mut best: Option<DateTime<Utc>> = None;

        for offset in 0..=7 {
            let date = t.date_naive() + Duration::days(offset);
            for span in &spans {
                if !span.runs_on(date.weekday()) {
                    continue;
                }
                let start = Utc.from_utc_datetime(&date.and_time(span.from));
                if start > t && best.map_or(true, |b| start < b) {
                    best = Some(start);
                }
            }
        }

        best.unwrap_or(t)
    }

    fn spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.0.iter().filter_map(|w| w.parse().ok())
    }
}
