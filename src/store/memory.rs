//! In-memory [`BackendStore`] fake used by tests (spec §10.5: exercise the
//! S1–S6 scenarios and §8 invariants without a live database).

use super::condition::{Condition, PROBLEM_LAG_THRESHOLD_SECONDS};
use super::{BackendStore, HostnameResolveStore};
use crate::error::Result;
use crate::instance::Instance;
use crate::key::InstanceKey;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<InstanceKey, Instance>>,
    hostname_mappings: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a row directly, bypassing the upsert semantics.
    pub fn seed(&self, instance: Instance) {
        let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        rows.insert(instance.key.clone(), instance);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackendStore for MemoryStore {
    fn upsert<'a>(
        &'a self,
        instance: &'a Instance,
        actually_found: bool,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

            if !actually_found {
                // insert-ignore: never overwrite an existing row, and never
                // stamp a freshly-injected skeletal row as checked — it
                // hasn't been probed yet (spec §3 Lifecycles).
                rows.entry(instance.key.clone())
                    .or_insert_with(|| instance.clone());
                return Ok(());
            }

            let mut stored = instance.clone();
            stored.last_checked = Some(now);
            stored.last_attempted_check = Some(now);

            let no_error = instance.last_sql_error.is_empty() && instance.last_io_error.is_empty();
            stored.last_seen = if no_error {
                Some(now)
            } else {
                rows.get(&instance.key).and_then(|existing| existing.last_seen)
            };

            rows.insert(instance.key.clone(), stored);
            Ok(())
        })
    }

    fn mark_attempt<'a>(&'a self, key: &'a InstanceKey, now: DateTime<Utc>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            rows.entry(key.clone())
                .or_insert_with(|| Instance::new(key.clone()))
                .last_attempted_check = Some(now);
            Ok(())
        })
    }

    fn mark_checked<'a>(&'a self, key: &'a InstanceKey, now: DateTime<Utc>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            rows.entry(key.clone())
                .or_insert_with(|| Instance::new(key.clone()))
                .last_checked = Some(now);
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a InstanceKey) -> BoxFuture<'a, Result<Option<Instance>>> {
        Box::pin(async move {
            let rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            Ok(rows.get(key).cloned())
        })
    }

    fn read_by_condition<'a>(
        &'a self,
        condition: &'a Condition,
    ) -> BoxFuture<'a, Result<Vec<Instance>>> {
        Box::pin(async move {
            let rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let matched = rows
                .values()
                .filter(|instance| matches_condition(instance, condition))
                .cloned()
                .collect();
            Ok(matched)
        })
    }

    fn forget<'a>(&'a self, key: &'a InstanceKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            rows.remove(key);
            Ok(())
        })
    }

    fn forget_unseen<'a>(
        &'a self,
        older_than_hours: i64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let threshold = now - chrono::Duration::hours(older_than_hours);
            let before = rows.len();
            rows.retain(|_, instance| instance.last_seen.is_none_or(|seen| seen >= threshold));
            Ok(u64::try_from(before - rows.len()).unwrap_or_default())
        })
    }
}

impl HostnameResolveStore for MemoryStore {
    fn persist_hostname_mapping<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.hostname_mappings
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(from.to_string(), to.to_string());
            Ok(())
        })
    }

    fn load_hostname_mappings(&self) -> BoxFuture<'_, Result<Vec<(String, String)>>> {
        Box::pin(async move {
            Ok(self
                .hostname_mappings
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect())
        })
    }
}

fn matches_condition(instance: &Instance, condition: &Condition) -> bool {
    match condition {
        Condition::All => true,
        Condition::ByCluster(name) => &instance.cluster_name == name,
        Condition::ByMaster(key) => &instance.master_key == key,
        Condition::Unseen => is_unseen(instance),
        Condition::Problem { poll_interval_seconds } => {
            is_unseen(instance)
                || is_stale(instance, *poll_interval_seconds)
                || (instance.is_slave() && !instance.slave_io_running)
                || (instance.is_slave() && !instance.slave_sql_running)
                || instance
                    .slave_lag_seconds
                    .is_some_and(|lag| lag > PROBLEM_LAG_THRESHOLD_SECONDS)
        }
        Condition::Search(term) => {
            let term = term.to_ascii_lowercase();
            instance.key.hostname.to_ascii_lowercase().contains(&term)
                || instance.cluster_name.to_ascii_lowercase().contains(&term)
        }
        Condition::HostnameRegex(pattern) => regex::Regex::new(pattern)
            .is_ok_and(|re| re.is_match(&instance.key.hostname)),
    }
}

fn is_unseen(instance: &Instance) -> bool {
    match (instance.last_seen, instance.last_checked) {
        (Some(seen), Some(checked)) => seen < checked,
        (None, Some(_)) => true,
        _ => false,
    }
}

fn is_stale(instance: &Instance, poll_interval_seconds: i64) -> bool {
    instance.last_checked.is_none_or(|checked| {
        (Utc::now() - checked).num_seconds() > poll_interval_seconds
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates::{BinlogCoordinates, LogType};

    #[tokio::test]
    async fn upsert_insert_ignore_does_not_overwrite() {
        let store = MemoryStore::new();
        let key = InstanceKey::new("db1", 3306);

        let mut first = Instance::new(key.clone());
        first.version = "10.6.0".to_string();
        store.upsert(&first, true, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

        let second = Instance::injected_unseen(key.clone());
        store.upsert(&second, false, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

        let read = store.read(&key).await.unwrap_or_else(|e| panic!("{e}")).unwrap_or_else(|| panic!("row exists"));
        assert_eq!(read.version, "10.6.0");
    }

    #[tokio::test]
    async fn upsert_bumps_last_seen_only_without_error() {
        let store = MemoryStore::new();
        let key = InstanceKey::new("db1", 3306);
        let now = Utc::now();

        let mut errored = Instance::new(key.clone());
        errored.last_sql_error = "replication failure".to_string();
        store.upsert(&errored, true, now).await.unwrap_or_else(|e| panic!("{e}"));

        let read = store.read(&key).await.unwrap_or_else(|e| panic!("{e}")).unwrap_or_else(|| panic!("row exists"));
        assert_eq!(read.last_checked, Some(now));
        assert_eq!(read.last_seen, None);
    }

    #[tokio::test]
    async fn problem_condition_flags_lagging_replica() {
        let store = MemoryStore::new();
        let key = InstanceKey::new("db1", 3306);
        let mut instance = Instance::new(key.clone());
        instance.master_key = InstanceKey::new("master", 3306);
        instance.slave_io_running = true;
        instance.slave_sql_running = true;
        instance.slave_lag_seconds = Some(30);
        instance.last_seen = Some(Utc::now());
        instance.last_checked = Some(Utc::now());
        store.upsert(&instance, true, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

        let results = store
            .read_by_condition(&Condition::Problem { poll_interval_seconds: 60 })
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn forget_unseen_removes_stale_rows() {
        let store = MemoryStore::new();
        let key = InstanceKey::new("db1", 3306);
        let mut instance = Instance::new(key.clone());
        instance.last_seen = Some(Utc::now() - chrono::Duration::hours(100));
        store.upsert(&instance, true, Utc::now() - chrono::Duration::hours(100)).await.unwrap_or_else(|e| panic!("{e}"));
        // upsert always bumps last_seen to `now` passed in, so re-seed directly to
        // simulate an old row precisely.
        store.seed({
            let mut i = Instance::new(key.clone());
            i.last_seen = Some(Utc::now() - chrono::Duration::hours(100));
            i.exec_binlog_coordinates = BinlogCoordinates::empty(LogType::Binary);
            i
        });

        let removed = store
            .forget_unseen(48, Utc::now())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn hostname_mappings_round_trip() {
        let store = MemoryStore::new();
        store
            .persist_hostname_mapping("10.0.0.5", "db1a")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        store
            .persist_hostname_mapping("10.0.0.6", "db2a")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let mut mappings = store.load_hostname_mappings().await.unwrap_or_else(|e| panic!("{e}"));
        mappings.sort();
        assert_eq!(
            mappings,
            vec![
                ("10.0.0.5".to_string(), "db1a".to_string()),
                ("10.0.0.6".to_string(), "db2a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn hostname_mapping_last_write_wins() {
        let store = MemoryStore::new();
        store
            .persist_hostname_mapping("10.0.0.5", "db1a")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        store
            .persist_hostname_mapping("10.0.0.5", "db1b")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let mappings = store.load_hostname_mappings().await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(mappings, vec![("10.0.0.5".to_string(), "db1b".to_string())]);
    }
}
