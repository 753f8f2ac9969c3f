use chrono::Duration;

use crate::types::LocalTime;

pub const DAYS_PER_YEAR: u64 = 365;

/// Energy in Wh for a number of heating seconds at the nominal element power.
pub fn consumption_wh(heating_secs: f64, power_watts: u32) -> u64 {
    if heating_secs <= 0.0 {
        return 0;
    }
    (heating_secs / 3600.0 * f64::from(power_watts)) as u64
}

/// Extrapolates a year from per-day consumption, indexed from the first day
/// of the year up to today. Days before the first recorded day do not count
/// as elapsed.
pub fn estimate_year(daily_wh: &[u64]) -> u64 {
    let Some(first) = daily_wh.iter().position(|wh| *wh > 0) else {
        return 0;
    };
    let elapsed = &daily_wh[first..];
    let total: u64 = elapsed.iter().sum();
    total * DAYS_PER_YEAR / elapsed.len() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionReport {
    pub today_wh: u64,
    pub current_year_wh: u64,
    pub estimated_year_wh: u64,
}

impl ConsumptionReport {
    pub fn from_daily(daily_wh: &[u64]) -> Self {
        Self {
            today_wh: daily_wh.last().copied().unwrap_or(0),
            current_year_wh: daily_wh.iter().sum(),
            estimated_year_wh: estimate_year(daily_wh),
        }
    }
}

pub fn kwh(wh: u64) -> f64 {
    (wh as f64 / 100.0).round() / 10.0
}

/// Lets a report through at most once per interval.
#[derive(Debug, Clone)]
pub struct ReportGate {
    interval: Duration,
    last_report: Option<LocalTime>,
}

impl ReportGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_report: None,
        }
    }

    pub fn should_report(&mut self, now: LocalTime) -> bool {
        let due = self
            .last_report
            .map(|last| now < last || now - last >= self.interval)
            .unwrap_or(true);
        if due {
            self.last_report = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use pretty_assertions::assert_eq;

    fn at(hour: u32, minute: u32) -> LocalTime {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 5, 4, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn converts_heating_seconds_to_watt_hours() {
        assert_eq!(consumption_wh(3600.0, 500), 500);
        assert_eq!(consumption_wh(1800.0, 500), 250);
        assert_eq!(consumption_wh(-1.0, 500), 0);
    }

    #[test]
    fn estimate_without_data_is_zero() {
        assert_eq!(estimate_year(&[]), 0);
        assert_eq!(estimate_year(&[0, 0, 0]), 0);
    }

    #[test]
    fn single_recorded_day_extrapolates_to_full_year() {
        assert_eq!(estimate_year(&[1000]), 365_000);
        assert_eq!(estimate_year(&[0, 0, 1000]), 365_000);
    }

    #[test]
    fn days_without_heating_after_first_record_count_as_elapsed() {
        assert_eq!(estimate_year(&[0, 1000, 0, 0, 1000]), 2000 * 365 / 4);
    }

    #[test]
    fn report_sums_year_and_takes_today_last() {
        let report = ConsumptionReport::from_daily(&[0, 500, 1500]);
        assert_eq!(
            report,
            ConsumptionReport {
                today_wh: 1500,
                current_year_wh: 2000,
                estimated_year_wh: 2000 * 365 / 2,
            }
        );
    }

    #[test]
    fn kwh_rounds_to_one_decimal() {
        assert_eq!(kwh(1234), 1.2);
        assert_eq!(kwh(1250), 1.3);
        assert_eq!(kwh(0), 0.0);
    }

    #[test]
    fn gate_reports_once_per_interval() {
        let mut gate = ReportGate::new(Duration::hours(3));

        assert!(gate.should_report(at(6, 0)));
        assert!(!gate.should_report(at(6, 10)));
        assert!(!gate.should_report(at(8, 59)));
        assert!(gate.should_report(at(9, 0)));
        assert!(!gate.should_report(at(9, 10)));
    }

    #[test]
    fn gate_reports_after_clock_jumps_back() {
        let mut gate = ReportGate::new(Duration::hours(3));

        assert!(gate.should_report(at(12, 0)));
        assert!(gate.should_report(at(11, 0)));
    }
}
