//! Relative time expressions.
//!
//! Recorded timestamps are stored as offsets from the moment fixtures are
//! loaded, e.g. `<%= Time.zone.now - 2.days + 3.hours %>`, so a fixture
//! recorded today still describes "two days ago" when the suite runs next
//! year. Offsets are decomposed greedily into calendar units, largest first.

use chrono::{Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Week => "week",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        match word.strip_suffix('s').unwrap_or(word) {
            "year" => Some(Self::Year),
            "month" => Some(Self::Month),
            "week" => Some(Self::Week),
            "day" => Some(Self::Day),
            "hour" => Some(Self::Hour),
            "minute" => Some(Self::Minute),
            _ => None,
        }
    }
}

pub const DATETIME_UNITS: [TimeUnit; 6] = [
    TimeUnit::Year,
    TimeUnit::Month,
    TimeUnit::Week,
    TimeUnit::Day,
    TimeUnit::Hour,
    TimeUnit::Minute,
];

pub const DATE_UNITS: [TimeUnit; 4] = [TimeUnit::Year, TimeUnit::Month, TimeUnit::Week, TimeUnit::Day];

/// A point on the calendar that can be moved by whole units.
pub trait CalendarPoint: Copy + Ord {
    fn shift(self, unit: TimeUnit, amount: i64) -> Option<Self>;
}

impl CalendarPoint for NaiveDateTime {
    fn shift(self, unit: TimeUnit, amount: i64) -> Option<Self> {
        match unit {
            TimeUnit::Year => shift_months(self, amount.checked_mul(12)?),
            TimeUnit::Month => shift_months(self, amount),
            TimeUnit::Week => self.checked_add_signed(Duration::try_weeks(amount)?),
            TimeUnit::Day => self.checked_add_signed(Duration::try_days(amount)?),
            TimeUnit::Hour => self.checked_add_signed(Duration::try_hours(amount)?),
            TimeUnit::Minute => self.checked_add_signed(Duration::try_minutes(amount)?),
        }
    }
}

impl CalendarPoint for NaiveDate {
    fn shift(self, unit: TimeUnit, amount: i64) -> Option<Self> {
        match unit {
            TimeUnit::Year => shift_months(self, amount.checked_mul(12)?),
            TimeUnit::Month => shift_months(self, amount),
            TimeUnit::Week => self.checked_add_signed(Duration::try_weeks(amount)?),
            TimeUnit::Day => self.checked_add_signed(Duration::try_days(amount)?),
            TimeUnit::Hour | TimeUnit::Minute => Some(self),
        }
    }
}

trait MonthShift: Sized {
    fn add_months(self, months: Months) -> Option<Self>;
    fn sub_months(self, months: Months) -> Option<Self>;
}

impl MonthShift for NaiveDateTime {
    fn add_months(self, months: Months) -> Option<Self> {
        self.checked_add_months(months)
    }

    fn sub_months(self, months: Months) -> Option<Self> {
        self.checked_sub_months(months)
    }
}

impl MonthShift for NaiveDate {
    fn add_months(self, months: Months) -> Option<Self> {
        self.checked_add_months(months)
    }

    fn sub_months(self, months: Months) -> Option<Self> {
        self.checked_sub_months(months)
    }
}

// Month arithmetic clamps to the last day of the target month.
fn shift_months<T: MonthShift>(point: T, months: i64) -> Option<T> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        point.add_months(magnitude)
    } else {
        point.sub_months(magnitude)
    }
}

/// `left - right` as signed unit counts, consuming the largest unit first.
///
/// Moving from `left` towards `right` one unit at a time, a unit is taken
/// while it does not overshoot `right`. The remainder below the smallest unit
/// is discarded. Units a point type cannot move by count as zero.
fn calendar_diff<T: CalendarPoint>(left: T, right: T, units: &[TimeUnit]) -> Vec<(TimeUnit, i64)> {
    let forward = left > right;
    let step = if forward { -1 } else { 1 };
    let mut rest = left;
    let mut parts = Vec::with_capacity(units.len());
    for unit in units {
        let mut count = 0_i64;
        while let Some(next) = rest.shift(*unit, step) {
            let within = if forward { next >= right } else { next <= right };
            if !within || next == rest {
                break;
            }
            rest = next;
            count -= step;
        }
        parts.push((*unit, count));
    }
    parts
}

pub fn apply_parts<T: CalendarPoint>(point: T, parts: &[(TimeUnit, i64)]) -> T {
    parts.iter().fold(point, |acc, (unit, amount)| {
        acc.shift(*unit, *amount).unwrap_or(acc)
    })
}

pub fn beginning_of_hour(value: NaiveDateTime) -> NaiveDateTime {
    value.date().and_time(NaiveTime::MIN) + Duration::hours(i64::from(value.hour()))
}

pub fn beginning_of_day(value: NaiveDateTime) -> NaiveDateTime {
    value.date().and_time(NaiveTime::MIN)
}

/// Snap to the hour when within a minute of it: minute 59 rounds up, minutes
/// 0 and 1 round down, anything else is left alone.
pub fn round_time(value: NaiveDateTime) -> NaiveDateTime {
    match value.minute() {
        59 => beginning_of_hour(value + Duration::minutes(1)),
        0 | 1 => beginning_of_hour(value),
        _ => value,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Now,
    BeginningOfDay,
    Today,
}

impl Anchor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Now => "Time.zone.now",
            Self::BeginningOfDay => "Time.zone.now.beginning_of_day",
            Self::Today => "Date.today",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "Time.zone.now" => Some(Self::Now),
            "Time.zone.now.beginning_of_day" => Some(Self::BeginningOfDay),
            "Date.today" => Some(Self::Today),
            _ => None,
        }
    }
}

/// The value a [`RelativeTime`] evaluates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluated {
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeTime {
    pub anchor: Anchor,
    /// Non-zero offsets in descending unit order.
    pub parts: Vec<(TimeUnit, i64)>,
}

impl RelativeTime {
    pub fn now() -> Self {
        Self {
            anchor: Anchor::Now,
            parts: Vec::new(),
        }
    }

    /// Template form written to fixture files.
    pub fn to_template(&self) -> String {
        format!("<%= {self} %>")
    }

    /// Parse `<%= Time.zone.now + 1.day %>` (with or without the template
    /// delimiters).
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        let inner = match trimmed.strip_prefix("<%=") {
            Some(rest) => rest.strip_suffix("%>")?.trim(),
            None => trimmed,
        };
        let mut tokens = inner.split_whitespace();
        let anchor = Anchor::parse(tokens.next()?)?;
        let mut parts = Vec::new();
        while let Some(sign) = tokens.next() {
            let negative = match sign {
                "+" => false,
                "-" => true,
                _ => return None,
            };
            let (amount, unit) = tokens.next()?.split_once('.')?;
            let amount = amount.parse::<i64>().ok()?;
            let unit = TimeUnit::parse(unit)?;
            parts.push((unit, if negative { -amount } else { amount }));
        }
        Some(Self { anchor, parts })
    }

    pub fn evaluate(&self, now: NaiveDateTime) -> Evaluated {
        match self.anchor {
            Anchor::Now => Evaluated::Timestamp(apply_parts(now, &self.parts)),
            Anchor::BeginningOfDay => {
                Evaluated::Timestamp(apply_parts(beginning_of_day(now), &self.parts))
            }
            Anchor::Today => Evaluated::Date(apply_parts(now.date(), &self.parts)),
        }
    }
}

impl fmt::Display for RelativeTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.anchor.as_str())?;
        for (unit, amount) in &self.parts {
            let sign = if *amount > 0 { '+' } else { '-' };
            let magnitude = amount.unsigned_abs();
            let plural = if magnitude == 1 { "" } else { "s" };
            write!(f, " {sign} {magnitude}.{}{plural}", unit.as_str())?;
        }
        Ok(())
    }
}

fn non_zero(parts: Vec<(TimeUnit, i64)>) -> Vec<(TimeUnit, i64)> {
    parts.into_iter().filter(|(_, amount)| *amount != 0).collect()
}

/// Express `value` relative to the load-time clock.
///
/// `initial_now` is when the recording pass began and `now` is when the value
/// is serialized. The drift between them is applied to the value before
/// differencing against `initial_now`, so a late write still describes the
/// value's distance from the moment of serialization.
pub fn timestamp_expression(
    value: NaiveDateTime,
    initial_now: NaiveDateTime,
    now: NaiveDateTime,
) -> RelativeTime {
    let midnight = value.time() == NaiveTime::MIN;
    let mut initial = round_time(initial_now);
    let mut current = round_time(now);
    if midnight {
        initial = beginning_of_day(initial);
        current = beginning_of_day(current);
    }

    let drift = calendar_diff(initial, current, &DATETIME_UNITS);
    let shifted = round_time(apply_parts(value, &drift));
    let parts = calendar_diff(shifted, initial, &DATETIME_UNITS);

    RelativeTime {
        anchor: if midnight {
            Anchor::BeginningOfDay
        } else {
            Anchor::Now
        },
        parts: non_zero(parts),
    }
}

pub fn date_expression(value: NaiveDate, initial_now: NaiveDateTime, now: NaiveDateTime) -> RelativeTime {
    let initial = round_time(initial_now).date();
    let current = round_time(now).date();

    let drift = calendar_diff(initial, current, &DATE_UNITS);
    let shifted = apply_parts(value, &drift);
    let parts = calendar_diff(shifted, initial, &DATE_UNITS);

    RelativeTime {
        anchor: Anchor::Today,
        parts: non_zero(parts),
    }
}
