use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf};

use anyhow::Context;
use chrono::{Duration, Utc};
use heater_common::{CounterEntry, DayCounterStore, MemoryCounterStore};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Day counters kept in memory and written to a JSON file on flush.
#[derive(Debug)]
pub struct FileCounterStore {
    path: PathBuf,
    entries: MemoryCounterStore,
    write_lock: Mutex<()>,
}

impl FileCounterStore {
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<BTreeMap<String, CounterEntry>>(&raw)
                .with_context(|| format!("failed to parse counters at {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        let store = Self {
            path,
            entries: MemoryCounterStore::from_entries(entries),
            write_lock: Mutex::new(()),
        };
        let purged = store.entries.purge_expired(Utc::now());
        debug!(
            "loaded {} day counters ({purged} expired)",
            store.entries.len()
        );
        Ok(store)
    }

    /// Loads the counters; an unreadable file is moved aside so the next
    /// flush cannot overwrite it, and the store starts empty.
    pub async fn open(path: PathBuf) -> Self {
        let err = match Self::load(path.clone()).await {
            Ok(store) => return store,
            Err(err) => err,
        };

        let aside = path.with_extension("json.corrupt");
        match tokio::fs::rename(&path, &aside).await {
            Ok(()) => warn!(
                "failed to load day counters ({err:#}), moved to {} and starting empty",
                aside.display()
            ),
            Err(rename_err) => warn!(
                "failed to load day counters ({err:#}) and to move them aside \
                 ({rename_err}), starting empty"
            ),
        }
        Self::empty(path)
    }

    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            entries: MemoryCounterStore::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Drops expired entries and replaces the file with the current set.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        self.entries.purge_expired(Utc::now());
        let payload = serde_json::to_vec_pretty(&self.entries.snapshot())?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl DayCounterStore for FileCounterStore {
    fn get(&self, key: &str, default: f64) -> f64 {
        self.entries.get(key, default)
    }

    fn put(&self, key: &str, value: f64, ttl: Duration) {
        self.entries.put(key, value, ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCounterStore::load(dir.path().join("counters.json"))
            .await
            .unwrap();

        assert_eq!(store.get("heater_0:1", -1.0), -1.0);
    }

    #[tokio::test]
    async fn flushed_counters_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("counters.json");

        let store = FileCounterStore::load(path.clone()).await.unwrap();
        store.put("heater_1:77", 5400.0, Duration::days(366));
        store.put("heater_2:77", 60.0, Duration::days(366));
        store.flush().await.unwrap();

        let reloaded = FileCounterStore::load(path).await.unwrap();
        assert_eq!(reloaded.get("heater_1:77", -1.0), 5400.0);
        assert_eq!(reloaded.get("heater_2:77", -1.0), 60.0);
    }

    #[tokio::test]
    async fn expired_counters_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");

        let store = FileCounterStore::empty(path.clone());
        store.put("heater_0:10", 100.0, Duration::seconds(-1));
        store.put("heater_0:11", 200.0, Duration::days(1));
        store.flush().await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!raw.contains("heater_0:10"));
        assert!(raw.contains("heater_0:11"));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(FileCounterStore::load(path).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_file_is_kept_aside_when_opening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FileCounterStore::open(path.clone()).await;
        assert_eq!(store.get("heater_0:1", -1.0), -1.0);
        store.put("heater_0:1", 30.0, Duration::days(1));
        store.flush().await.unwrap();

        let aside = tokio::fs::read(dir.path().join("counters.json.corrupt"))
            .await
            .unwrap();
        assert_eq!(aside, b"{not json");
        let reloaded = FileCounterStore::load(path).await.unwrap();
        assert_eq!(reloaded.get("heater_0:1", -1.0), 30.0);
    }
}
