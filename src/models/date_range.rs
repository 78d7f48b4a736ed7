use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `days` days ending at `end`, clipped to the start of the calendar.
    pub fn trailing(end: DateTime<Utc>, days: i64) -> Self {
        let start = TimeDelta::try_days(days)
            .and_then(|d| end.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Extend the start backwards by `factor` of the current span (at least one
    /// day), never past `max_days` in total. `None` when the range is already
    /// at the cap or the new start falls outside the representable calendar.
    pub fn widened(&self, factor: f64, max_days: i64) -> Option<Self> {
        let days = self.days();
        if days >= max_days {
            return None;
        }
        // float-to-int casts saturate; NaN becomes 0
        let extra = (((days as f64) * factor).round() as i64)
            .max(1)
            .min(max_days - days);
        let start = TimeDelta::try_days(extra).and_then(|d| self.start.checked_sub_signed(d))?;
        Some(Self { start, end: self.end })
    }
}
