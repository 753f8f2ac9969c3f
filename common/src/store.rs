use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Durable day-of-year counters with per-entry expiry.
pub trait DayCounterStore: Send + Sync {
    fn get(&self, key: &str, default: f64) -> f64;

    fn put(&self, key: &str, value: f64, ttl: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterEntry {
    pub value: f64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<BTreeMap<String, CounterEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, CounterEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn get_at(&self, key: &str, default: f64, now: DateTime<Utc>) -> f64 {
        self.entries()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value)
            .unwrap_or(default)
    }

    pub fn put_at(&self, key: &str, value: f64, ttl: Duration, now: DateTime<Utc>) {
        self.entries().insert(
            key.to_string(),
            CounterEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CounterEntry> {
        self.entries().clone()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, CounterEntry>> {
        // A panic while holding the guard cannot leave a half-written entry.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DayCounterStore for MemoryCounterStore {
    fn get(&self, key: &str, default: f64) -> f64 {
        self.get_at(key, default, Utc::now())
    }

    fn put(&self, key: &str, value: f64, ttl: Duration) {
        self.put_at(key, value, ttl, Utc::now());
    }
}

pub fn day_counter_key(element_id: usize, day_of_year: u32) -> String {
    format!("heater_{element_id}:{day_of_year}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn missing_key_returns_default() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.get_at("heater_0:12", -1.0, at(1)), -1.0);
    }

    #[test]
    fn expired_entries_are_invisible_and_purged() {
        let store = MemoryCounterStore::new();
        store.put_at("heater_0:1", 120.0, Duration::days(2), at(1));
        store.put_at("heater_1:1", 60.0, Duration::days(10), at(1));

        assert_eq!(store.get_at("heater_0:1", -1.0, at(2)), 120.0);
        assert_eq!(store.get_at("heater_0:1", -1.0, at(3)), -1.0);

        assert_eq!(store.purge_expired(at(3)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_renews_expiry() {
        let store = MemoryCounterStore::new();
        store.put_at("heater_2:40", 10.0, Duration::days(1), at(1));
        store.put_at("heater_2:40", 25.0, Duration::days(5), at(2));

        assert_eq!(store.get_at("heater_2:40", 0.0, at(5)), 25.0);
    }

    #[test]
    fn keys_are_unpadded_day_numbers() {
        assert_eq!(day_counter_key(1, 7), "heater_1:7");
        assert_eq!(day_counter_key(0, 365), "heater_0:365");
    }
}
