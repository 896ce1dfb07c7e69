//! Timeframe grammar and the shortening ladder used on empty responses.
//!
//! Upstream literals are `today N-y`, `today N-m`, `now N-d` and `now N-H`,
//! plus `all` and explicit `YYYY-MM-DD YYYY-MM-DD` ranges.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;
use thiserror::Error;

/// Ordered from longest to shortest.
pub const TIMEFRAME_LADDER: [&str; 7] = [
    "today 5-y",
    "today 3-y",
    "today 1-y",
    "today 3-m",
    "today 1-m",
    "now 7-d",
    "now 1-d",
];

/// First month Google Trends has data for; the origin of `all`.
const ALL_TIME_START: (i32, u32) = (2004, 1);
/// Explicit ranges up to this many days are sampled daily.
const DAILY_RANGE_LIMIT_DAYS: i64 = 270;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Hours,
    Days,
    Months,
    Years,
}

/// Sampling frequency for generated series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Hourly,
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Relative { amount: u32, unit: TimeUnit },
    Range { start: NaiveDate, end: NaiveDate },
    All,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeframeError {
    #[error("unrecognised timeframe literal '{0}'")]
    Unrecognised(String),
    #[error("timeframe amount must be positive in '{0}'")]
    ZeroAmount(String),
    #[error("timeframe range ends before it starts: '{0}'")]
    InvertedRange(String),
    #[error("timeframe '{0}' reaches outside the representable date range")]
    OutOfRange(String),
}

static RELATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(today|now)\s+(\d+)-([ymdH])$").expect("invalid timeframe regex")
});

static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})\s+(\d{4}-\d{2}-\d{2})$").expect("invalid range regex")
});

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let literal = raw.trim();
        if literal.eq_ignore_ascii_case("all") {
            return Ok(Timeframe::All);
        }

        if let Some(caps) = RELATIVE_RE.captures(literal) {
            let amount: u32 = caps[2]
                .parse()
                .map_err(|_| TimeframeError::Unrecognised(raw.to_string()))?;
            if amount == 0 {
                return Err(TimeframeError::ZeroAmount(raw.to_string()));
            }
            let unit = match (&caps[1], &caps[3]) {
                ("today", "y") => TimeUnit::Years,
                ("today", "m") => TimeUnit::Months,
                ("now", "d") => TimeUnit::Days,
                ("now", "H") => TimeUnit::Hours,
                _ => return Err(TimeframeError::Unrecognised(raw.to_string())),
            };
            return Ok(Timeframe::Relative { amount, unit });
        }

        if let Some(caps) = RANGE_RE.captures(literal) {
            let parse = |s: &str| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|_| TimeframeError::Unrecognised(raw.to_string()))
            };
            let start = parse(&caps[1])?;
            let end = parse(&caps[2])?;
            if end < start {
                return Err(TimeframeError::InvertedRange(raw.to_string()));
            }
            return Ok(Timeframe::Range { start, end });
        }

        Err(TimeframeError::Unrecognised(raw.to_string()))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Relative { amount, unit } => {
                let (anchor, suffix) = match unit {
                    TimeUnit::Years => ("today", "y"),
                    TimeUnit::Months => ("today", "m"),
                    TimeUnit::Days => ("now", "d"),
                    TimeUnit::Hours => ("now", "H"),
                };
                write!(f, "{anchor} {amount}-{suffix}")
            }
            Timeframe::Range { start, end } => {
                write!(f, "{} {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
            }
            Timeframe::All => f.write_str("all"),
        }
    }
}

impl Timeframe {
    pub fn frequency(&self) -> Frequency {
        match self {
            Timeframe::Relative {
                unit: TimeUnit::Hours,
                ..
            } => Frequency::Hourly,
            Timeframe::Relative {
                unit: TimeUnit::Days,
                ..
            } => Frequency::Daily,
            Timeframe::Range { start, end } if (*end - *start).num_days() <= DAILY_RANGE_LIMIT_DAYS => {
                Frequency::Daily
            }
            _ => Frequency::Monthly,
        }
    }

    /// Approximate length, used to order timeframes when shortening.
    pub fn approximate_span(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Timeframe::Relative { amount, unit } => {
                let amount = i64::from(*amount);
                let span = match unit {
                    TimeUnit::Hours => Duration::try_hours(amount),
                    TimeUnit::Days => Duration::try_days(amount),
                    TimeUnit::Months => Duration::try_days(30 * amount),
                    TimeUnit::Years => Duration::try_days(365 * amount),
                };
                span.unwrap_or(Duration::MAX)
            }
            Timeframe::Range { start, end } => *end - *start + Duration::days(1),
            Timeframe::All => {
                let origin = Utc
                    .with_ymd_and_hms(ALL_TIME_START.0, ALL_TIME_START.1, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(now);
                now - origin
            }
        }
    }

    /// Sample instants covering the timeframe, oldest first. Relative
    /// timeframes never reach back past the start of `all`.
    pub fn sample_dates(&self, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, TimeframeError> {
        let count = self.sample_count(now);
        let out_of_range = || TimeframeError::OutOfRange(self.to_string());
        match self.frequency() {
            Frequency::Hourly => {
                let anchor = truncate_to_hour(now);
                (0..count)
                    .rev()
                    .map(|back| {
                        Duration::try_hours(back as i64)
                            .and_then(|delta| anchor.checked_sub_signed(delta))
                            .ok_or_else(out_of_range)
                    })
                    .collect()
            }
            Frequency::Daily => {
                let anchor = match self {
                    Timeframe::Range { end, .. } => midnight(*end),
                    _ => midnight(now.date_naive()),
                };
                (0..count)
                    .rev()
                    .map(|back| {
                        Duration::try_days(back as i64)
                            .and_then(|delta| anchor.checked_sub_signed(delta))
                            .ok_or_else(out_of_range)
                    })
                    .collect()
            }
            Frequency::Monthly => {
                let last = match self {
                    Timeframe::Range { end, .. } => first_of_month(*end),
                    _ => first_of_month(now.date_naive()),
                };
                (0..count)
                    .rev()
                    .map(|back| {
                        u32::try_from(back)
                            .ok()
                            .and_then(|months| last.checked_sub_months(Months::new(months)))
                            .map(midnight)
                            .ok_or_else(out_of_range)
                    })
                    .collect()
            }
        }
    }

    fn sample_count(&self, now: DateTime<Utc>) -> usize {
        let count = match self {
            Timeframe::Relative { amount, unit } => {
                let requested = match unit {
                    TimeUnit::Years => amount.saturating_mul(12) as usize,
                    _ => *amount as usize,
                };
                requested.min(self.samples_since_origin(now))
            }
            Timeframe::Range { start, end } => match self.frequency() {
                Frequency::Daily => ((*end - *start).num_days() + 1) as usize,
                _ => months_between(*start, *end) + 1,
            },
            Timeframe::All => self.samples_since_origin(now),
        };
        count.max(1)
    }

    /// Samples between the `all` origin and `now` at this frequency.
    fn samples_since_origin(&self, now: DateTime<Utc>) -> usize {
        let today = now.date_naive();
        let origin =
            NaiveDate::from_ymd_opt(ALL_TIME_START.0, ALL_TIME_START.1, 1).unwrap_or(today);
        let samples = match self.frequency() {
            Frequency::Hourly => (now - midnight(origin)).num_hours() + 1,
            Frequency::Daily => (today - origin).num_days() + 1,
            Frequency::Monthly => months_between(origin, today) as i64 + 1,
        };
        samples.max(1) as usize
    }
}

/// Pick a strictly shorter ladder entry at random. Returns `None` when the
/// timeframe is already the shortest the ladder knows.
pub fn shorter_timeframe<R: Rng + ?Sized>(current: &str, rng: &mut R) -> Option<String> {
    let candidates: Vec<&str> = match TIMEFRAME_LADDER.iter().position(|tf| *tf == current.trim()) {
        Some(idx) => TIMEFRAME_LADDER[idx + 1..].to_vec(),
        None => {
            let now = Utc::now();
            let span = current.parse::<Timeframe>().ok()?.approximate_span(now);
            TIMEFRAME_LADDER
                .iter()
                .copied()
                .filter(|tf| {
                    tf.parse::<Timeframe>()
                        .map(|parsed| parsed.approximate_span(now) < span)
                        .unwrap_or(false)
                })
                .collect()
        }
    };

    candidates.choose(rng).map(|tf| tf.to_string())
}

fn months_between(start: NaiveDate, end: NaiveDate) -> usize {
    let months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    months.max(0) as usize
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

fn truncate_to_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn parses_grammar() {
        assert_eq!(
            "today 5-y".parse::<Timeframe>().unwrap(),
            Timeframe::Relative {
                amount: 5,
                unit: TimeUnit::Years
            }
        );
        assert_eq!(
            "now 7-d".parse::<Timeframe>().unwrap().frequency(),
            Frequency::Daily
        );
        assert_eq!("now 4-H".parse::<Timeframe>().unwrap().frequency(), Frequency::Hourly);
        assert_eq!("all".parse::<Timeframe>().unwrap(), Timeframe::All);
        assert!("2024-01-01 2024-02-01".parse::<Timeframe>().is_ok());
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!("today 0-y".parse::<Timeframe>().is_err());
        assert!("now 5-y".parse::<Timeframe>().is_err());
        assert!("yesterday".parse::<Timeframe>().is_err());
        assert!("2024-02-01 2024-01-01".parse::<Timeframe>().is_err());
    }

    #[test]
    fn round_trips_display() {
        for literal in TIMEFRAME_LADDER {
            assert_eq!(literal.parse::<Timeframe>().unwrap().to_string(), literal);
        }
    }

    #[test]
    fn one_year_samples_twelve_months() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let dates = "today 1-y".parse::<Timeframe>().unwrap().sample_dates(now).unwrap();
        assert_eq!(dates.len(), 12);
        assert_eq!(dates.last().unwrap().date_naive(), NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert!(dates.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn days_sample_daily() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let dates = "now 7-d".parse::<Timeframe>().unwrap().sample_dates(now).unwrap();
        assert_eq!(dates.len(), 7);
        assert_eq!(dates[6] - dates[5], Duration::days(1));
    }

    #[test]
    fn huge_amounts_stop_at_the_all_time_origin() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let origin = NaiveDate::from_ymd_opt(2004, 1, 1).unwrap();

        let days = "now 100000000-d".parse::<Timeframe>().unwrap();
        let dates = days.sample_dates(now).unwrap();
        assert_eq!(dates.first().unwrap().date_naive(), origin);
        assert_eq!(dates.last().unwrap().date_naive(), now.date_naive());

        let years = "today 4000000000-y".parse::<Timeframe>().unwrap();
        let dates = years.sample_dates(now).unwrap();
        assert_eq!(dates.len(), 246);
        assert_eq!(dates[0].date_naive(), origin);

        assert_eq!(years.approximate_span(now), Duration::MAX);
    }

    #[test]
    fn shortening_only_moves_down_the_ladder() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let next = shorter_timeframe("today 3-m", &mut rng).unwrap();
            assert!(["today 1-m", "now 7-d", "now 1-d"].contains(&next.as_str()));
        }
        assert_eq!(shorter_timeframe("now 1-d", &mut rng), None);
    }

    #[test]
    fn shortening_off_ladder_uses_span() {
        let mut rng = StdRng::seed_from_u64(11);
        let next = shorter_timeframe("today 2-y", &mut rng).unwrap();
        assert_ne!(next, "today 5-y");
        assert_ne!(next, "today 3-y");
        assert_eq!(shorter_timeframe("garbage", &mut rng), None);
    }
}
