use std::{fmt, sync::Arc};

use chrono::{Datelike, Duration, NaiveDate, Timelike};
use tracing::{info, warn};

use crate::{
    error::RelayError,
    relay::RelayClient,
    store::{day_counter_key, DayCounterStore},
    types::LocalTime,
};

const MINUTES_PER_DAY: usize = 24 * 60;

/// Which minutes of the current day an element was seen active.
#[derive(Debug, Clone)]
struct ActivityRecord {
    date: Option<NaiveDate>,
    minutes: Vec<bool>,
}

impl ActivityRecord {
    fn new() -> Self {
        Self {
            date: None,
            minutes: vec![false; MINUTES_PER_DAY],
        }
    }

    fn sample(&mut self, active: bool, now: LocalTime) {
        if self.date != Some(now.date_naive()) {
            self.date = Some(now.date_naive());
            self.minutes.iter_mut().for_each(|minute| *minute = false);
        }
        self.minutes[minute_of_day(now)] |= active;
    }

    fn active_minutes(&self, window_minutes: usize, now: LocalTime) -> Option<usize> {
        if self.date != Some(now.date_naive()) {
            return None;
        }
        let end = minute_of_day(now);
        let start = end.checked_sub(window_minutes)?;
        Some(self.minutes[start..end].iter().filter(|active| **active).count())
    }
}

fn minute_of_day(now: LocalTime) -> usize {
    now.hour() as usize * 60 + now.minute() as usize
}

pub struct HeatingElement {
    id: usize,
    is_activated: bool,
    last_activation_time: LocalTime,
    last_deactivation_time: LocalTime,
    relay: Arc<dyn RelayClient>,
    counters: Arc<dyn DayCounterStore>,
    counter_ttl: Duration,
    activity: ActivityRecord,
}

impl HeatingElement {
    /// Creates the element and switches its channel off, whatever state the
    /// device or the counter store remember.
    pub async fn new(
        id: usize,
        relay: Arc<dyn RelayClient>,
        counters: Arc<dyn DayCounterStore>,
        counter_ttl: Duration,
        now: LocalTime,
    ) -> Self {
        let mut element = Self {
            id,
            is_activated: false,
            last_activation_time: now,
            last_deactivation_time: now,
            relay,
            counters,
            counter_ttl,
            activity: ActivityRecord::new(),
        };
        element.deactivate(Some("startup"), now).await;
        element
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_activated(&self) -> bool {
        self.is_activated
    }

    pub fn last_activation_time(&self) -> LocalTime {
        self.last_activation_time
    }

    pub fn last_deactivation_time(&self) -> LocalTime {
        self.last_deactivation_time
    }

    /// Switches the channel on. The command is sent even when the element is
    /// already active; only a real transition restarts the activation clock.
    pub async fn activate(
        &mut self,
        reason: Option<&str>,
        now: LocalTime,
    ) -> Result<(), RelayError> {
        if let Err(err) = self.relay.set_state(self.id, true).await {
            warn!("{self} could not be activated: {err}");
            return Err(err);
        }

        if !self.is_activated {
            self.last_activation_time = now;
            match reason {
                Some(reason) => info!("{self} activated ({reason})"),
                None => info!("{self} activated"),
            }
        }
        self.is_activated = true;
        Ok(())
    }

    /// Switches the channel off and books the just-ended activation interval
    /// onto today's counter. Relay failures are logged, never returned.
    pub async fn deactivate(&mut self, reason: Option<&str>, now: LocalTime) {
        if self.is_activated {
            self.last_deactivation_time = now;
            let heating_secs =
                (now - self.last_activation_time).num_milliseconds().max(0) as f64 / 1000.0;
            let key = day_counter_key(self.id, now.ordinal());
            let total = self.counters.get(&key, 0.0).max(0.0) + heating_secs;
            self.counters.put(&key, total, self.counter_ttl);

            let heating_time = format!("heating time {}", format_duration(heating_secs));
            match reason {
                Some(reason) => info!("{self} deactivated ({reason}; {heating_time})"),
                None => info!("{self} deactivated ({heating_time})"),
            }
        }

        if let Err(err) = self.relay.set_state(self.id, false).await {
            warn!("error occurred deactivating {self}: {err}");
        }
        self.is_activated = false;
    }

    /// Pulls the local flag back in line with the relay. A failed query
    /// leaves the local state untouched.
    pub async fn sync(&mut self, now: LocalTime) {
        let physical = match self.relay.query_state(self.id).await {
            Ok(physical) => physical,
            Err(err) => {
                warn!("sync of {self} failed: {err}");
                return;
            }
        };

        if !physical && self.is_activated {
            self.deactivate(Some("due to sync"), now).await;
        } else if physical && !self.is_activated {
            // Errors are already logged by activate; the next pass retries.
            let _ = self.activate(Some("due to sync"), now).await;
        }
    }

    /// Accumulated active seconds of a day, `None` when nothing positive was
    /// recorded for it.
    pub fn heating_secs_of_day(&self, day_of_year: u32) -> Option<f64> {
        let secs = self.counters.get(&day_counter_key(self.id, day_of_year), -1.0);
        (secs > 0.0).then_some(secs)
    }

    pub fn sample_activity(&mut self, now: LocalTime) {
        self.activity.sample(self.is_activated, now);
    }

    /// Duty-cycle estimate of the average power over the trailing window.
    /// Zero when the window reaches back before midnight or no active minute
    /// was sampled in it.
    pub fn consumed_power_estimate(
        &self,
        window_minutes: usize,
        power_watts: u32,
        now: LocalTime,
    ) -> u32 {
        if window_minutes == 0 {
            return 0;
        }
        match self.activity.active_minutes(window_minutes, now) {
            Some(active) if active > 0 => {
                (u64::from(power_watts) * active as u64 / window_minutes as u64) as u32
            }
            _ => 0,
        }
    }
}

impl fmt::Display for HeatingElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heating rod {}", self.id)
    }
}

impl fmt::Debug for HeatingElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeatingElement")
            .field("id", &self.id)
            .field("is_activated", &self.is_activated)
            .field("last_activation_time", &self.last_activation_time)
            .field("last_deactivation_time", &self.last_deactivation_time)
            .finish_non_exhaustive()
    }
}

fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.1} sec")
    } else if secs < 60.0 * 60.0 {
        format!("{:.1} min", secs / 60.0)
    } else {
        format!("{:.1} h", secs / (60.0 * 60.0))
    }
}
