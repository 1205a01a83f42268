//! Time types and calendar arithmetic for the simulated clock.

use crate::error::EnvError;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// A simulated instant.
pub type SimTime = NaiveDateTime;

/// The duration of one time step.
pub type StepSize = chrono::Duration;

/// Days per year used when annualized rates are rescaled to a step.
pub const DAYS_PER_YEAR: f64 = 365.0;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Builds midnight on the given calendar date.
pub fn date(year: i32, month: u32, day: u32) -> Result<SimTime, EnvError> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or(EnvError::InvalidDate { year, month, day })
}

/// Converts a (possibly fractional) number of days into a step size.
pub fn duration_from_days(days: f64) -> Result<StepSize, EnvError> {
    if !days.is_finite() || days <= 0.0 {
        return Err(EnvError::step_size(days));
    }
    Ok(chrono::Duration::milliseconds((days * MILLIS_PER_DAY).round() as i64))
}

/// Returns the length of a duration in fractional days.
pub fn days(duration: StepSize) -> f64 {
    duration.num_milliseconds() as f64 / MILLIS_PER_DAY
}

/// Returns the length of a duration in years of `DAYS_PER_YEAR` days.
pub fn years(duration: StepSize) -> f64 {
    days(duration) / DAYS_PER_YEAR
}

/// Returns the instant as a fractional calendar year.
///
/// 2000-07-02 00:00 is roughly 2000.5; the fraction accounts for leap years.
pub fn fractional_year(time: SimTime) -> f64 {
    let year = time.year();
    let days_in_year = if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366.0
    } else {
        365.0
    };
    let seconds = time.num_seconds_from_midnight() as f64;
    let elapsed = time.ordinal0() as f64 + seconds / 86_400.0;
    year as f64 + elapsed / days_in_year
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_duration_from_days_round_trip() {
        let step = duration_from_days(30.5).unwrap();
        assert_relative_eq!(days(step), 30.5);
        assert_relative_eq!(years(step), 30.5 / 365.0);
    }

    #[test]
    fn test_invalid_step_size() {
        assert!(duration_from_days(0.0).is_err());
        assert!(duration_from_days(-1.0).is_err());
        assert!(duration_from_days(f64::NAN).is_err());
    }

    #[test]
    fn test_fractional_year() {
        let start = date(2001, 1, 1).unwrap();
        assert_relative_eq!(fractional_year(start), 2001.0);

        let mid = date(2001, 7, 2).unwrap() + chrono::Duration::hours(12);
        assert_relative_eq!(fractional_year(mid), 2001.0 + 182.5 / 365.0);

        // 2000 is a leap year
        let leap = date(2000, 12, 31).unwrap();
        assert_relative_eq!(fractional_year(leap), 2000.0 + 365.0 / 366.0);
    }

    #[test]
    fn test_invalid_date() {
        assert!(date(2001, 2, 29).is_err());
        assert!(date(2000, 2, 29).is_ok());
    }
}
