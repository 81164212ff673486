use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Text shown when an item has no meaningful countdown.
pub const PLACEHOLDER: &str = "-";

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Average month length (365.25 / 12 days). Calendar month lengths are deliberately
/// not used, so every month carries the same weight.
pub const AVERAGE_MONTH_SECONDS: i64 = 2_629_800;

const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_MINUTE: i64 = 60;

/// Processing time allowed for a requirement item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum DurationSpec {
    #[default]
    NoDuration,
    Days(u32),
    Months(u32),
}

impl DurationSpec {
    /// Builds a duration from the optional day and month fields of a business record.
    ///
    /// A non-zero day count wins over a month count. Missing or zero values on both
    /// sides mean there is nothing to count down.
    #[must_use]
    pub const fn from_fields(days: Option<u32>, months: Option<u32>) -> Self {
        match (days, months) {
            (Some(d), _) if d > 0 => Self::Days(d),
            (_, Some(m)) if m > 0 => Self::Months(m),
            _ => Self::NoDuration,
        }
    }

    #[must_use]
    pub const fn is_applicable(self) -> bool {
        match self {
            Self::NoDuration => false,
            Self::Days(n) | Self::Months(n) => n > 0,
        }
    }

    /// Total length, or `None` when there is no duration.
    #[must_use]
    pub fn length(self) -> Option<Duration> {
        match self {
            Self::NoDuration | Self::Days(0) | Self::Months(0) => None,
            Self::Days(n) => Some(Duration::seconds(i64::from(n) * SECONDS_PER_DAY)),
            Self::Months(n) => Some(Duration::seconds(i64::from(n) * AVERAGE_MONTH_SECONDS)),
        }
    }
}

/// Lifecycle statuses for which a countdown is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownPolicy {
    pub active_statuses: BTreeSet<String>,
}

impl Default for CountdownPolicy {
    fn default() -> Self {
        Self::with_statuses(["in_progress", "dispatched"])
    }
}

impl CountdownPolicy {
    pub fn with_statuses<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            active_statuses: statuses.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_active(&self, status: &str) -> bool {
        self.active_statuses.contains(status)
    }
}

/// What a caller knows about a business item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownInput {
    pub reference_time: DateTime<Utc>,
    pub duration: DurationSpec,
    pub status: String,
}

/// What a caller renders. The text changes with real time even when the input does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownView {
    pub text: String,
    pub is_counting_down: bool,
    pub is_overdue: bool,
}

impl CountdownView {
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            text: PLACEHOLDER.to_string(),
            is_counting_down: false,
            is_overdue: false,
        }
    }
}

/// Absolute deadline of an item: `reference_time + duration`.
///
/// Returns `None` when there is no duration or the sum does not fit in a timestamp.
#[must_use]
pub fn compute_deadline(reference_time: DateTime<Utc>, duration: DurationSpec) -> Option<DateTime<Utc>> {
    duration
        .length()
        .and_then(|length| reference_time.checked_add_signed(length))
}

/// Human-readable distance between `now` and `deadline`.
///
/// Reaching the deadline exactly already counts as overdue. Overdue text uses the
/// single largest non-zero unit; remaining text uses at most two adjacent units.
#[must_use]
pub fn format_remaining(deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if now >= deadline {
        let parts = Breakdown::from_seconds((now - deadline).num_seconds());
        let amount = if parts.days > 0 {
            plural(parts.days, "day")
        } else if parts.hours > 0 {
            plural(parts.hours, "hour")
        } else if parts.minutes > 0 {
            plural(parts.minutes, "minute")
        } else {
            String::from("less than 1 minute")
        };
        format!("already overdue by {amount}")
    } else {
        let parts = Breakdown::from_seconds((deadline - now).num_seconds());
        let amount = if parts.days > 0 {
            pair(parts.days, "day", parts.hours, "hour")
        } else if parts.hours > 0 {
            pair(parts.hours, "hour", parts.minutes, "minute")
        } else if parts.minutes > 0 {
            plural(parts.minutes, "minute")
        } else {
            String::from("less than 1 minute")
        };
        format!("remaining {amount}")
    }
}

/// Full countdown for one item at `now`, short-circuiting to the placeholder when
/// the item's status is not active or it has no duration.
#[must_use]
pub fn evaluate(policy: &CountdownPolicy, input: &CountdownInput, now: DateTime<Utc>) -> CountdownView {
    if !policy.is_active(&input.status) || !input.duration.is_applicable() {
        return CountdownView::placeholder();
    }
    let Some(deadline) = compute_deadline(input.reference_time, input.duration) else {
        return CountdownView::placeholder();
    };

    CountdownView {
        text: format_remaining(deadline, now),
        is_counting_down: true,
        is_overdue: now >= deadline,
    }
}

#[derive(Debug, Clone, Copy)]
struct Breakdown {
    days: i64,
    hours: i64,
    minutes: i64,
}

impl Breakdown {
    const fn from_seconds(seconds: i64) -> Self {
        let seconds = if seconds < 0 { 0 } else { seconds };
        Self {
            days: seconds / SECONDS_PER_DAY,
            hours: (seconds % SECONDS_PER_DAY) / SECONDS_PER_HOUR,
            minutes: (seconds % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE,
        }
    }
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

fn pair(major: i64, major_unit: &str, minor: i64, minor_unit: &str) -> String {
    if minor == 0 {
        plural(major, major_unit)
    } else {
        format!("{} {}", plural(major, major_unit), plural(minor, minor_unit))
    }
}
