use std::sync::Arc;

use chrono::{Datelike, Duration};
use tracing::{debug, info};

use crate::{
    config::HeaterConfig,
    element::HeatingElement,
    error::HeaterError,
    relay::RelayClient,
    statistics::{consumption_wh, ConsumptionReport},
    store::DayCounterStore,
    types::{ElementStatus, HeaterStatus, LocalTime, StepOutcome, TIMESTAMP_FORMAT},
};

pub type StatusListener = Box<dyn Fn(&HeaterStatus) + Send + Sync>;

/// Trailing window used for the status power estimate.
pub const POWER_ESTIMATE_WINDOW_MINUTES: usize = 10;

/// Element indices left-rotated by the day of month, so a different element
/// is preferred first on consecutive days.
pub fn wear_leveling_order(element_count: usize, day_of_month: u32) -> Vec<usize> {
    if element_count == 0 {
        return Vec::new();
    }
    let offset = day_of_month as usize % element_count;
    (0..element_count)
        .map(|index| (index + offset) % element_count)
        .collect()
}

pub struct HeaterController {
    config: HeaterConfig,
    elements: Vec<HeatingElement>,
    last_increase_time: LocalTime,
    last_decrease_time: LocalTime,
    last_power_change: LocalTime,
    listener: Option<StatusListener>,
}

impl HeaterController {
    /// Builds one element per channel; every channel is switched off first.
    /// Out-of-range settings are clamped before use.
    pub async fn new(
        mut config: HeaterConfig,
        relay: Arc<dyn RelayClient>,
        counters: Arc<dyn DayCounterStore>,
        now: LocalTime,
    ) -> Self {
        config.sanitize();
        let counter_ttl = Duration::days(i64::from(config.counter_ttl_days));
        let mut elements = Vec::with_capacity(config.element_count);
        for id in 0..config.element_count {
            elements.push(
                HeatingElement::new(id, relay.clone(), counters.clone(), counter_ttl, now).await,
            );
        }

        Self {
            config,
            elements,
            last_increase_time: now - Duration::minutes(10),
            last_decrease_time: now - Duration::minutes(10),
            last_power_change: now,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: impl Fn(&HeaterStatus) + Send + Sync + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn element(&self, id: usize) -> Option<&HeatingElement> {
        self.elements.iter().find(|element| element.id() == id)
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn active_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|element| element.is_activated())
            .count()
    }

    pub fn power(&self) -> u32 {
        self.active_count() as u32 * self.config.element_power_watts
    }

    pub fn max_power(&self) -> u32 {
        self.config.max_power()
    }

    pub fn last_increase_time(&self) -> LocalTime {
        self.last_increase_time
    }

    pub fn last_decrease_time(&self) -> LocalTime {
        self.last_decrease_time
    }

    pub fn last_power_change(&self) -> LocalTime {
        self.last_power_change
    }

    pub fn last_time_heating(&self, now: LocalTime) -> LocalTime {
        if self.active_count() > 0 {
            return now;
        }
        self.elements
            .iter()
            .map(HeatingElement::last_deactivation_time)
            .max()
            .unwrap_or(self.last_power_change)
    }

    pub fn validate_active_count(&self, requested: i64) -> Result<usize, HeaterError> {
        usize::try_from(requested)
            .ok()
            .filter(|count| *count <= self.element_count())
            .ok_or(HeaterError::InvalidTarget {
                requested,
                max: self.element_count(),
            })
    }

    fn increase_cooldown(&self) -> Duration {
        Duration::minutes(
            (1 + self.active_count() as i64) * i64::from(self.config.increase_cooldown_step_mins),
        )
    }

    /// Switches on one more element. The cooldown grows with the number of
    /// elements already active.
    pub async fn increase(&mut self, now: LocalTime) -> StepOutcome {
        let since_last = now - self.last_increase_time;
        if since_last < self.increase_cooldown() {
            debug!(
                "reject increase (last increase={}; {} sec ago)",
                self.last_increase_time.format("%H:%M:%S"),
                since_last.num_seconds()
            );
            return StepOutcome::RateLimited;
        }
        self.last_increase_time = now;

        let order = wear_leveling_order(self.elements.len(), now.day());
        let Some(index) = order
            .into_iter()
            .find(|index| !self.elements[*index].is_activated())
        else {
            debug!("increase ignored, all heating rods are active");
            return StepOutcome::NoChange;
        };

        let element = &mut self.elements[index];
        match element.activate(None, now).await {
            Ok(()) => {
                self.last_power_change = now;
                StepOutcome::Activated(element.id())
            }
            Err(_) => StepOutcome::RelayFailed(element.id()),
        }
    }

    /// Switches off one active element, picked from the same rotated order
    /// as `increase`.
    pub async fn decrease(&mut self, reason: Option<&str>, now: LocalTime) -> StepOutcome {
        self.last_decrease_time = now;

        let order = wear_leveling_order(self.elements.len(), now.day());
        let Some(index) = order
            .into_iter()
            .find(|index| self.elements[*index].is_activated())
        else {
            debug!("decrease ignored, no heating rod is active");
            return StepOutcome::NoChange;
        };

        let element = &mut self.elements[index];
        element.deactivate(reason, now).await;
        self.last_power_change = now;
        StepOutcome::Deactivated(element.id())
    }

    /// Moves the active count one step towards `target`. Targets beyond the
    /// element count are clamped.
    pub async fn set_active_count(&mut self, target: usize, now: LocalTime) -> StepOutcome {
        let target = target.min(self.element_count());
        let active = self.active_count();

        if target > active {
            self.increase(now).await
        } else if target < active {
            self.decrease(Some("requested"), now).await
        } else {
            debug!("{active} heating rods already active");
            StepOutcome::NoChange
        }
    }

    pub async fn set_power(&mut self, watts: i64, now: LocalTime) -> StepOutcome {
        let target = if watts <= 0 {
            0
        } else {
            watts
                .checked_div(i64::from(self.config.element_power_watts))
                .unwrap_or(0) as usize
        };
        self.set_active_count(target, now).await
    }

    /// Steps down once when no decrease happened for the configured period.
    pub async fn auto_decrease(&mut self, now: LocalTime) -> StepOutcome {
        let after = Duration::minutes(i64::from(self.config.auto_decrease_after_mins));
        if self.active_count() == 0 || now - self.last_decrease_time <= after {
            return StepOutcome::NoChange;
        }

        let reason = format!(
            "due to auto decrease each {} min",
            self.config.auto_decrease_after_mins
        );
        self.decrease(Some(&reason), now).await
    }

    /// Syncs every element with the relay, then notifies the listener.
    pub async fn reconcile(&mut self, now: LocalTime) -> HeaterStatus {
        let before: Vec<bool> = self.elements.iter().map(HeatingElement::is_activated).collect();
        for element in &mut self.elements {
            element.sync(now).await;
        }
        let changed = self
            .elements
            .iter()
            .zip(before)
            .any(|(element, was_active)| element.is_activated() != was_active);
        if changed {
            self.last_power_change = now;
            info!("heater power is {} W after sync", self.power());
        }

        let status = self.status(now);
        if let Some(listener) = &self.listener {
            listener(&status);
        }
        status
    }

    pub fn sample_activity(&mut self, now: LocalTime) {
        for element in &mut self.elements {
            element.sample_activity(now);
        }
    }

    pub fn consumed_power_estimate(&self, window_minutes: usize, now: LocalTime) -> u32 {
        self.elements
            .iter()
            .map(|element| {
                element.consumed_power_estimate(
                    window_minutes,
                    self.config.element_power_watts,
                    now,
                )
            })
            .sum()
    }

    pub fn consumption_of_day(&self, day_of_year: u32) -> u64 {
        let heating_secs: f64 = self
            .elements
            .iter()
            .filter_map(|element| element.heating_secs_of_day(day_of_year))
            .sum();
        consumption_wh(heating_secs, self.config.element_power_watts)
    }

    /// Wh per day from the first day of the year up to today.
    pub fn daily_consumption(&self, now: LocalTime) -> Vec<u64> {
        (1..=now.ordinal())
            .map(|day| self.consumption_of_day(day))
            .collect()
    }

    pub fn consumption_today(&self, now: LocalTime) -> u64 {
        self.consumption_of_day(now.ordinal())
    }

    pub fn consumption_current_year(&self, now: LocalTime) -> u64 {
        self.consumption_report(now).current_year_wh
    }

    pub fn consumption_estimated_year(&self, now: LocalTime) -> u64 {
        self.consumption_report(now).estimated_year_wh
    }

    pub fn consumption_report(&self, now: LocalTime) -> ConsumptionReport {
        ConsumptionReport::from_daily(&self.daily_consumption(now))
    }

    pub fn status(&self, now: LocalTime) -> HeaterStatus {
        let report = self.consumption_report(now);
        HeaterStatus {
            power: self.power(),
            max_power: self.max_power(),
            element_power_watts: self.config.element_power_watts,
            element_count: self.element_count(),
            active_count: self.active_count(),
            elements: self
                .elements
                .iter()
                .map(|element| ElementStatus {
                    id: element.id(),
                    activated: element.is_activated(),
                    last_activation: element
                        .last_activation_time()
                        .format(TIMESTAMP_FORMAT)
                        .to_string(),
                    last_deactivation: element
                        .last_deactivation_time()
                        .format(TIMESTAMP_FORMAT)
                        .to_string(),
                })
                .collect(),
            consumption_today: report.today_wh,
            consumption_current_year: report.current_year_wh,
            consumption_estimated_year: report.estimated_year_wh,
            consumed_power_estimate: self
                .consumed_power_estimate(POWER_ESTIMATE_WINDOW_MINUTES, now),
            last_power_change: self.last_power_change.format(TIMESTAMP_FORMAT).to_string(),
            last_time_heating: self.last_time_heating(now).format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl std::fmt::Debug for HeaterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaterController")
            .field("config", &self.config)
            .field("elements", &self.elements)
            .field("last_increase_time", &self.last_increase_time)
            .field("last_decrease_time", &self.last_decrease_time)
            .finish_non_exhaustive()
    }
}
