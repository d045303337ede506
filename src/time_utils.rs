use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const NS_PER_SEC: i64 = 1_000_000_000;
const NS_PER_DAY: i64 = 86_400 * NS_PER_SEC;

/// Cumulative day counts at the start of each month in a 365-day year.
const NOLEAP_CUM_DAYS: [i64; 13] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334, 365];

const MONTH_ABBRS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Errors raised while interpreting time metadata
#[derive(Error, Debug)]
pub enum TimeError {
    #[error("Invalid time units '{0}': expected '<unit> since <date>'")]
    InvalidUnits(String),

    #[error("Unsupported calendar: {0}")]
    UnsupportedCalendar(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Date out of representable range: {0}")]
    OutOfRange(String),

    #[error("Invalid month selection: {0}")]
    InvalidMonths(String),
}

/// Check if a year is a leap year
pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// Calendars understood by the time decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Calendar {
    /// Proleptic Gregorian
    #[default]
    Standard,
    /// 365-day years
    NoLeap,
}

impl FromStr for Calendar {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "gregorian" | "proleptic_gregorian" => Ok(Calendar::Standard),
            "noleap" | "365_day" => Ok(Calendar::NoLeap),
            other => Err(TimeError::UnsupportedCalendar(other.to_string())),
        }
    }
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Calendar::Standard => write!(f, "standard"),
            Calendar::NoLeap => write!(f, "noleap"),
        }
    }
}

impl Calendar {
    pub fn days_in_month(&self, year: i32, month: u32) -> u32 {
        match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 if *self == Calendar::Standard && is_leap_year(year) => 29,
            2 => 28,
            _ => 0,
        }
    }

    /// Advance `dt` by a signed number of nanoseconds.
    ///
    /// Standard-calendar instants are carried as nanoseconds since 1970, so
    /// both `dt` and the result must lie within roughly 1677-2262.
    pub fn add_nanos(&self, dt: NaiveDateTime, nanos: i64) -> Result<NaiveDateTime, TimeError> {
        match self {
            Calendar::Standard => {
                let base = dt
                    .and_utc()
                    .timestamp_nanos_opt()
                    .ok_or_else(|| TimeError::OutOfRange(dt.to_string()))?;
                let total = base
                    .checked_add(nanos)
                    .ok_or_else(|| TimeError::OutOfRange(dt.to_string()))?;
                Ok(DateTime::from_timestamp_nanos(total).naive_utc())
            }
            Calendar::NoLeap => {
                let day = noleap_day_number(dt.date())?;
                let time = dt.time();
                let since_midnight = time.num_seconds_from_midnight() as i64 * NS_PER_SEC
                    + time.nanosecond() as i64;
                let total = since_midnight
                    .checked_add(nanos)
                    .ok_or_else(|| TimeError::OutOfRange(dt.to_string()))?;
                let date = noleap_date(day + total.div_euclid(NS_PER_DAY))?;
                let rem = total.rem_euclid(NS_PER_DAY);
                let time = NaiveTime::from_num_seconds_from_midnight_opt(
                    (rem / NS_PER_SEC) as u32,
                    (rem % NS_PER_SEC) as u32,
                )
                .ok_or_else(|| TimeError::OutOfRange(dt.to_string()))?;
                Ok(date.and_time(time))
            }
        }
    }

    /// Shift a timestamp by whole hours, respecting the calendar.
    pub fn add_hours(&self, dt: NaiveDateTime, hours: i64) -> Result<NaiveDateTime, TimeError> {
        match self {
            Calendar::Standard => dt
                .checked_add_signed(Duration::hours(hours))
                .ok_or_else(|| TimeError::OutOfRange(dt.to_string())),
            Calendar::NoLeap => self.add_nanos(dt, hours * 3600 * NS_PER_SEC),
        }
    }

    /// Seconds elapsed from `a` to `b`.
    pub fn seconds_between(&self, a: NaiveDateTime, b: NaiveDateTime) -> Result<f64, TimeError> {
        match self {
            Calendar::Standard => {
                let d = b.signed_duration_since(a);
                Ok(d.num_milliseconds() as f64 / 1000.0)
            }
            Calendar::NoLeap => {
                let days = noleap_day_number(b.date())? - noleap_day_number(a.date())?;
                let secs = b.time().num_seconds_from_midnight() as f64
                    - a.time().num_seconds_from_midnight() as f64;
                Ok(days as f64 * 86_400.0 + secs)
            }
        }
    }
}

fn noleap_day_number(date: NaiveDate) -> Result<i64, TimeError> {
    if date.month() == 2 && date.day() == 29 {
        return Err(TimeError::InvalidDate(format!("{} does not exist in a noleap calendar", date)));
    }
    Ok(date.year() as i64 * 365 + NOLEAP_CUM_DAYS[date.month0() as usize] + date.day0() as i64)
}

fn noleap_date(day_number: i64) -> Result<NaiveDate, TimeError> {
    let year = day_number.div_euclid(365);
    let doy = day_number.rem_euclid(365);
    let month0 = NOLEAP_CUM_DAYS
        .iter()
        .rposition(|&start| start <= doy)
        .unwrap_or(0)
        .min(11);
    let day = doy - NOLEAP_CUM_DAYS[month0] + 1;
    i32::try_from(year)
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, month0 as u32 + 1, day as u32))
        .ok_or_else(|| TimeError::OutOfRange(format!("noleap day {}", day_number)))
}

/// Unit of an encoded time or duration value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl TimeUnit {
    pub fn nanos(&self) -> i64 {
        match self {
            TimeUnit::Days => NS_PER_DAY,
            TimeUnit::Hours => 3600 * NS_PER_SEC,
            TimeUnit::Minutes => 60 * NS_PER_SEC,
            TimeUnit::Seconds => NS_PER_SEC,
        }
    }

    pub fn seconds(&self) -> f64 {
        self.nanos() as f64 / NS_PER_SEC as f64
    }
}

impl FromStr for TimeUnit {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "days" | "day" | "d" => Ok(TimeUnit::Days),
            "hours" | "hour" | "hr" | "h" => Ok(TimeUnit::Hours),
            "minutes" | "minute" | "min" => Ok(TimeUnit::Minutes),
            "seconds" | "second" | "sec" | "s" => Ok(TimeUnit::Seconds),
            other => Err(TimeError::InvalidUnits(other.to_string())),
        }
    }
}

/// Parsed `"<unit> since <reference date>"` units string
#[derive(Debug, Clone, PartialEq)]
pub struct TimeUnits {
    pub unit: TimeUnit,
    pub epoch: NaiveDateTime,
}

impl FromStr for TimeUnits {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (unit, reference) = s
            .split_once(" since ")
            .ok_or_else(|| TimeError::InvalidUnits(s.to_string()))?;
        let unit = unit
            .parse()
            .map_err(|_| TimeError::InvalidUnits(s.to_string()))?;
        let epoch = parse_datetime(reference)?;
        Ok(TimeUnits { unit, epoch })
    }
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DDTHH:MM:SS`.
///
/// Years need not be zero padded (`1-1-1 00:00:00` is accepted), fractional
/// seconds and a trailing UTC designator are tolerated.
pub fn parse_datetime(time_str: &str) -> Result<NaiveDateTime, TimeError> {
    let invalid = || TimeError::InvalidDate(time_str.to_string());
    let trimmed = time_str.trim().trim_end_matches('Z').trim_end_matches(" UTC");
    let mut parts = trimmed.splitn(2, &['T', ' '][..]);
    let date_part = parts.next().ok_or_else(invalid)?;
    let time_part = parts.next().unwrap_or("00:00:00").trim();

    let date_parts: Vec<&str> = date_part.split('-').collect();
    if date_parts.len() != 3 {
        return Err(invalid());
    }
    let year: i32 = date_parts[0].parse().map_err(|_| invalid())?;
    let month: u32 = date_parts[1].parse().map_err(|_| invalid())?;
    let day: u32 = date_parts[2].parse().map_err(|_| invalid())?;

    let time_parts: Vec<&str> = time_part.split(':').collect();
    let hour: u32 = time_parts.first().unwrap_or(&"0").parse().map_err(|_| invalid())?;
    let minute: u32 = time_parts.get(1).unwrap_or(&"0").parse().map_err(|_| invalid())?;
    let second: f64 = time_parts.get(2).unwrap_or(&"0").parse().map_err(|_| invalid())?;
    let nanos = ((second.fract()) * 1e9).round() as u32;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_nano_opt(hour, minute, second.trunc() as u32, nanos))
        .ok_or_else(invalid)
}

fn shift_years(dt: NaiveDateTime, years: i32) -> Result<NaiveDateTime, TimeError> {
    if years == 0 {
        return Ok(dt);
    }
    dt.with_year(dt.year() + years)
        .ok_or_else(|| TimeError::OutOfRange(dt.to_string()))
}

/// Decode encoded time values into timestamps.
///
/// Reference epochs earlier than `min_safe_year` are moved forward by whole
/// 400-year cycles before decoding and the result is moved back, so the
/// nanosecond arithmetic never leaves its representable window.
///
/// Offsets from the epoch are held as i64 nanoseconds, so a single file can
/// span at most about 292 years past its epoch; values beyond that return
/// [`TimeError::OutOfRange`].
pub fn decode_times(
    values: &[f64],
    units: &TimeUnits,
    calendar: Calendar,
    min_safe_year: i32,
) -> Result<Vec<NaiveDateTime>, TimeError> {
    let epoch_year = units.epoch.year();
    let shift = if epoch_year < min_safe_year {
        let cycles = (min_safe_year - epoch_year + 399) / 400;
        cycles * 400
    } else {
        0
    };
    let epoch = shift_years(units.epoch, shift)?;
    let unit_nanos = units.unit.nanos() as f64;

    values
        .iter()
        .map(|value| {
            if !value.is_finite() {
                return Err(TimeError::OutOfRange(value.to_string()));
            }
            let offset = (value * unit_nanos).round();
            if offset.abs() >= i64::MAX as f64 {
                return Err(TimeError::OutOfRange(value.to_string()));
            }
            let decoded = calendar.add_nanos(epoch, offset as i64)?;
            shift_years(decoded, -shift)
        })
        .collect()
}

/// Shift every timestamp by `hours` on the given calendar.
pub fn apply_time_offset(
    dates: &[NaiveDateTime],
    hours: i64,
    calendar: Calendar,
) -> Result<Vec<NaiveDateTime>, TimeError> {
    dates.iter().map(|d| calendar.add_hours(*d, hours)).collect()
}

/// Month numbers (1-12) selected by an output-interval string.
///
/// Accepts `ann`, a month number, a three-letter month abbreviation, or a
/// season spelled with consecutive month initials (`djf`, `jja`, `son`).
pub fn month_indices(spec: &str) -> Result<Vec<u32>, TimeError> {
    let lower = spec.trim().to_lowercase();
    if lower == "ann" {
        return Ok((1..=12).collect());
    }
    if let Ok(month) = lower.parse::<u32>() {
        return if (1..=12).contains(&month) {
            Ok(vec![month])
        } else {
            Err(TimeError::InvalidMonths(spec.to_string()))
        };
    }
    if let Some(pos) = MONTH_ABBRS.iter().position(|abbr| *abbr == lower) {
        return Ok(vec![pos as u32 + 1]);
    }

    let letters = "jfmamjjasond".repeat(2);
    let count = if lower.is_empty() { 0 } else { letters.matches(lower.as_str()).count() };
    if count == 0 || count > 2 {
        return Err(TimeError::InvalidMonths(spec.to_string()));
    }
    let start = letters
        .find(lower.as_str())
        .ok_or_else(|| TimeError::InvalidMonths(spec.to_string()))?;
    Ok((start..start + lower.len()).map(|i| (i % 12) as u32 + 1).collect())
}

/// Label used for an output interval in file names.
pub fn interval_label(spec: &str) -> String {
    match spec.trim().parse::<usize>() {
        Ok(month @ 1..=12) => MONTH_ABBRS[month - 1].to_string(),
        _ => spec.trim().to_lowercase(),
    }
}

/// `YYYY` for a single year, `YYYY-YYYY` for a span.
pub fn year_label(start_year: i32, end_year: i32) -> String {
    if start_year == end_year {
        format!("{:04}", start_year)
    } else {
        format!("{:04}-{:04}", start_year, end_year)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn test_leap_year() {
        assert!(is_leap_year(2000));
        assert!(!is_leap_year(1900));
        assert!(is_leap_year(2004));
        assert!(!is_leap_year(2001));
    }

    #[test]
    fn test_parse_units() {
        let units: TimeUnits = "days since 1-1-1 00:00:00".parse().unwrap();
        assert_eq!(units.unit, TimeUnit::Days);
        assert_eq!(units.epoch, dt(1, 1, 1, 0));

        let units: TimeUnits = "hours since 2000-01-01T06:00:00".parse().unwrap();
        assert_eq!(units.unit, TimeUnit::Hours);
        assert_eq!(units.epoch, dt(2000, 1, 1, 6));

        assert!("fortnights since 2000-01-01".parse::<TimeUnits>().is_err());
        assert!("days after 2000-01-01".parse::<TimeUnits>().is_err());
    }

    #[test]
    fn test_decode_standard() {
        let units: TimeUnits = "hours since 2000-01-01 00:00:00".parse().unwrap();
        let dates = decode_times(&[0.0, 36.0, 0.5], &units, Calendar::Standard, 1678).unwrap();
        assert_eq!(dates[0], dt(2000, 1, 1, 0));
        assert_eq!(dates[1], dt(2000, 1, 2, 12));
        assert_eq!(dates[2], dt(2000, 1, 1, 0) + Duration::minutes(30));
    }

    #[test]
    fn test_decode_early_epoch() {
        let units: TimeUnits = "days since 0001-01-01 00:00:00".parse().unwrap();
        let dates = decode_times(&[0.0, 31.0, 365.0], &units, Calendar::NoLeap, 1678).unwrap();
        assert_eq!(dates, vec![dt(1, 1, 1, 0), dt(1, 2, 1, 0), dt(2, 1, 1, 0)]);

        let dates = decode_times(&[59.0], &units, Calendar::Standard, 1678).unwrap();
        assert_eq!(dates, vec![dt(1, 3, 1, 0)]);
    }

    #[test]
    fn test_decode_beyond_nanosecond_span() {
        let units: TimeUnits = "days since 0001-01-01 00:00:00".parse().unwrap();
        let dates = decode_times(&[290.0 * 365.0], &units, Calendar::NoLeap, 1678).unwrap();
        assert_eq!(dates, vec![dt(291, 1, 1, 0)]);
        assert!(matches!(
            decode_times(&[300.0 * 365.0], &units, Calendar::NoLeap, 1678),
            Err(TimeError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_noleap_skips_feb_29() {
        let units: TimeUnits = "days since 2000-02-28 00:00:00".parse().unwrap();
        let dates = decode_times(&[1.0], &units, Calendar::NoLeap, 1678).unwrap();
        assert_eq!(dates, vec![dt(2000, 3, 1, 0)]);
        let dates = decode_times(&[1.0], &units, Calendar::Standard, 1678).unwrap();
        assert_eq!(dates, vec![dt(2000, 2, 29, 0)]);
    }

    #[test]
    fn test_apply_time_offset() {
        let dates = vec![dt(2000, 1, 1, 3), dt(2000, 1, 1, 6), dt(2000, 1, 1, 9)];
        let shifted = apply_time_offset(&dates, -3, Calendar::Standard).unwrap();
        assert_eq!(shifted, vec![dt(2000, 1, 1, 0), dt(2000, 1, 1, 3), dt(2000, 1, 1, 6)]);

        let shifted = apply_time_offset(&[dt(2001, 3, 1, 1)], -3, Calendar::NoLeap).unwrap();
        assert_eq!(shifted, vec![dt(2001, 2, 28, 22)]);
    }

    #[test]
    fn test_month_indices() {
        assert_eq!(month_indices("ann").unwrap(), (1..=12).collect::<Vec<_>>());
        assert_eq!(month_indices("djf").unwrap(), vec![12, 1, 2]);
        assert_eq!(month_indices("JJA").unwrap(), vec![6, 7, 8]);
        assert_eq!(month_indices("jul").unwrap(), vec![7]);
        assert_eq!(month_indices("3").unwrap(), vec![3]);
        assert!(month_indices("13").is_err());
        assert!(month_indices("j").is_err());
        assert!(month_indices("xyz").is_err());
    }

    #[test]
    fn test_labels() {
        assert_eq!(interval_label("ann"), "ann");
        assert_eq!(interval_label("1"), "jan");
        assert_eq!(year_label(4, 4), "0004");
        assert_eq!(year_label(1990, 1999), "1990-1999");
    }

    #[test]
    fn test_seconds_between() {
        let a = dt(2000, 2, 28, 0);
        let b = dt(2000, 3, 1, 0);
        assert_eq!(Calendar::Standard.seconds_between(a, b).unwrap(), 2.0 * 86_400.0);
        assert_eq!(Calendar::NoLeap.seconds_between(a, b).unwrap(), 86_400.0);
    }
}
