/*! Numeric time axes described as `"<unit> since <epoch>"`. */

use crate::error::ReshuffleError;
use chrono::{NaiveDate, NaiveDateTime};
use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// The unit of a numeric time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl TimeUnit {
    pub fn name(&self) -> &'static str {
        match self {
            TimeUnit::Days => "days",
            TimeUnit::Hours => "hours",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Seconds => "seconds",
        }
    }

    fn seconds(&self) -> f64 {
        match self {
            TimeUnit::Days => 86_400.0,
            TimeUnit::Hours => 3_600.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Seconds => 1.0,
        }
    }
}

/// Units of a time axis, e.g. `days since 1858-11-17 00:00:00`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUnits {
    unit: TimeUnit,
    epoch: NaiveDateTime,
}

impl Default for TimeUnits {
    /// Modified julian date.
    fn default() -> Self {
        TimeUnits {
            unit: TimeUnit::Days,
            epoch: NaiveDate::from_ymd(1858, 11, 17).and_hms(0, 0, 0),
        }
    }
}

impl TimeUnits {
    pub fn new(unit: TimeUnit, epoch: NaiveDateTime) -> Self {
        TimeUnits { unit, epoch }
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    pub fn epoch(&self) -> NaiveDateTime {
        self.epoch
    }

    /// Convert a timestamp to a number on this axis.
    pub fn encode(&self, timestamp: NaiveDateTime) -> f64 {
        let delta = timestamp - self.epoch;
        let seconds = delta.num_milliseconds() as f64 / 1000.0;
        seconds / self.unit.seconds()
    }

    /// Convert a number on this axis back to a timestamp, rounded to the millisecond.
    pub fn decode(&self, value: f64) -> NaiveDateTime {
        let millis = (value * self.unit.seconds() * 1000.0).round() as i64;
        self.epoch + chrono::Duration::milliseconds(millis)
    }
}

impl Display for TimeUnits {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{} since {}",
            self.unit.name(),
            self.epoch.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

impl FromStr for TimeUnits {
    type Err = ReshuffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ReshuffleError::Config(format!("invalid time units: {}", s));

        let (unit, epoch) = s.trim().split_once(" since ").ok_or_else(bad)?;

        let unit = match unit.trim().to_ascii_lowercase().as_str() {
            "days" | "day" | "d" => TimeUnit::Days,
            "hours" | "hour" | "h" => TimeUnit::Hours,
            "minutes" | "minute" | "min" => TimeUnit::Minutes,
            "seconds" | "second" | "s" | "sec" => TimeUnit::Seconds,
            _ => return Err(bad()),
        };

        let epoch = epoch.trim();
        let epoch = NaiveDateTime::parse_from_str(epoch, "%Y-%m-%d %H:%M:%S")
            .or_else(|_| NaiveDateTime::parse_from_str(epoch, "%Y-%m-%dT%H:%M:%S"))
            .or_else(|_| NaiveDate::parse_from_str(epoch, "%Y-%m-%d").map(|d| d.and_hms(0, 0, 0)))
            .map_err(|_| bad())?;

        Ok(TimeUnits { unit, epoch })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let units: TimeUnits = "seconds since 2000-01-01 12:00:00".parse().unwrap();
        assert_eq!(units.unit(), TimeUnit::Seconds);
        assert_eq!(units.epoch(), NaiveDate::from_ymd(2000, 1, 1).and_hms(12, 0, 0));
        assert_eq!(units.to_string(), "seconds since 2000-01-01 12:00:00");

        let units: TimeUnits = "days since 1970-01-01".parse().unwrap();
        assert_eq!(units.unit(), TimeUnit::Days);

        assert!("fortnights since 2000-01-01".parse::<TimeUnits>().is_err());
        assert!("seconds after 2000-01-01".parse::<TimeUnits>().is_err());
    }

    #[test]
    fn test_encode_decode() {
        let mjd = TimeUnits::default();
        let ts = NaiveDate::from_ymd(2000, 1, 1).and_hms(12, 0, 0);
        assert_eq!(mjd.encode(ts), 51_544.5);
        assert_eq!(mjd.decode(51_544.5), ts);

        let secs: TimeUnits = "seconds since 2000-01-01 12:00:00".parse().unwrap();
        assert_eq!(secs.encode(NaiveDate::from_ymd(2000, 1, 2).and_hms(12, 0, 0)), 86_400.0);
    }
}
