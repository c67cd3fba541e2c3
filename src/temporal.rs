//! Birth moment resolution: local civil date/time and zone to a UTC instant
//! and a Julian Day.
//!
//! Every date is read on the proleptic Gregorian calendar, including dates
//! before the 1582-10-15 reform. Callers holding a Julian-calendar date must
//! convert it first; no calendar switch happens here.

use chrono::{
    DateTime, Datelike, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{ChartError, JulianDay, Result};

/// Julian Day of 1970-01-01T00:00:00Z.
pub const UNIX_EPOCH_JULIAN_DAY: JulianDay = 2_440_587.5;

/// Julian Day of 2000-01-01T12:00:00Z (J2000.0).
pub const J2000: JulianDay = 2_451_545.0;

const SECONDS_PER_DAY: f64 = 86_400.0;
const MAX_OFFSET_MINUTES: i32 = 14 * 60;
const MIN_YEAR: i32 = 1;
const MAX_YEAR: i32 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BirthZone {
    /// Signed offset from UTC in minutes, east positive.
    Offset { minutes: i32 },
    /// IANA zone identifier such as `Europe/Berlin`.
    Named(String),
}

/// Local civil birth data. A missing time is treated as local noon and flagged as estimated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthMoment {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub zone: BirthZone,
}

impl BirthMoment {
    pub fn utc(date: NaiveDate, time: NaiveTime) -> Self {
        BirthMoment {
            date,
            time: Some(time),
            zone: BirthZone::Offset { minutes: 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedInstant {
    pub utc: DateTime<Utc>,
    pub julian_day: JulianDay,
    pub time_estimated: bool,
}

/// Resolves a local birth moment into a whole-second UTC instant and its Julian Day.
pub fn resolve(moment: &BirthMoment) -> Result<ResolvedInstant> {
    let time_estimated = moment.time.is_none();
    let time = moment
        .time
        .unwrap_or_else(|| NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default());
    let local = NaiveDateTime::new(moment.date, time);

    let utc = match &moment.zone {
        BirthZone::Offset { minutes } => {
            let offset = fixed_offset(*minutes)?;
            offset
                .from_local_datetime(&local)
                .single()
                .ok_or_else(|| invalid(format!("cannot apply offset to {}", local)))?
                .with_timezone(&Utc)
        }
        BirthZone::Named(name) => {
            let zone: Tz = name
                .parse()
                .map_err(|_| invalid(format!("unknown time zone '{}'", name)))?;
            match zone.from_local_datetime(&local) {
                LocalResult::Single(dt) => dt.with_timezone(&Utc),
                // a repeated wall-clock hour resolves to its first occurrence
                LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
                LocalResult::None => {
                    return Err(invalid(format!("{} does not exist in {}", local, name)))
                }
            }
        }
    };

    let utc = truncate_to_second(utc);
    check_year(utc)?;

    Ok(ResolvedInstant {
        utc,
        julian_day: date_to_julian_day(utc),
        time_estimated,
    })
}

pub fn validate_offset_minutes(minutes: i32) -> Result<()> {
    if minutes.abs() > MAX_OFFSET_MINUTES {
        return Err(invalid(format!(
            "UTC offset {} minutes is outside ±14:00",
            minutes
        )));
    }
    Ok(())
}

fn fixed_offset(minutes: i32) -> Result<FixedOffset> {
    validate_offset_minutes(minutes)?;
    FixedOffset::east_opt(minutes * 60)
        .ok_or_else(|| invalid(format!("invalid UTC offset {} minutes", minutes)))
}

fn check_year(utc: DateTime<Utc>) -> Result<()> {
    if (MIN_YEAR..=MAX_YEAR).contains(&utc.year()) {
        Ok(())
    } else {
        Err(invalid(format!(
            "year {} is outside the supported range {}..={}",
            utc.year(),
            MIN_YEAR,
            MAX_YEAR
        )))
    }
}

fn truncate_to_second(utc: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(utc.timestamp(), 0).unwrap_or(utc)
}

fn invalid(message: String) -> ChartError {
    ChartError::InvalidTemporalInput(message)
}

// ---------------------------
// ## Julian Day conversion
// ---------------------------

/// Julian Day (UT) of a UTC instant. Civil noon UTC falls on an integer day,
/// midnight on the half day.
pub fn date_to_julian_day(date_time: DateTime<Utc>) -> JulianDay {
    let seconds = date_time.timestamp();
    let days = seconds.div_euclid(86_400);
    let second_of_day = seconds.rem_euclid(86_400) as f64
        + f64::from(date_time.timestamp_subsec_nanos()) / 1_000_000_000.0;
    UNIX_EPOCH_JULIAN_DAY + days as f64 + second_of_day / SECONDS_PER_DAY
}

/// Inverse of [`date_to_julian_day`], rounded to the nearest second.
pub fn julian_day_to_date(jd: JulianDay) -> Result<DateTime<Utc>> {
    if !jd.is_finite() {
        return Err(invalid(format!("Julian Day {} is not finite", jd)));
    }
    let seconds = ((jd - UNIX_EPOCH_JULIAN_DAY) * SECONDS_PER_DAY).round();
    if seconds.abs() > i64::MAX as f64 / 2.0 {
        return Err(invalid(format!("Julian Day {} is out of range", jd)));
    }
    DateTime::from_timestamp(seconds as i64, 0)
        .ok_or_else(|| invalid(format!("Julian Day {} is out of range", jd)))
}

/// Julian centuries elapsed since J2000.0.
pub fn julian_centuries(jd: JulianDay) -> f64 {
    (jd - J2000) / 36_525.0
}
