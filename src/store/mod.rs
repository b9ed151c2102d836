//! Backend store gateway (spec §4.D).
//!
//! `BackendStore` is the "any relational store supporting upsert and
//! second-granularity timestamps" collaborator the spec keeps abstract.
//! [`mysql::MySqlStore`] is the concrete `sqlx`-backed implementation;
//! [`memory::MemoryStore`] is an in-memory fake used by tests so the S1–S6
//! scenarios and the §8 invariants can run without a live database, leaving
//! only `tests/testcontainers.rs` to touch a real server.
//!
//! [`StoreGateway`] wraps any `BackendStore` with the two 20-permit
//! semaphores the spec mandates and is the only thing the rest of the crate
//! talks to.

pub mod condition;
pub mod memory;
pub mod mysql;

pub use condition::Condition;

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::key::InstanceKey;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

/// Enrichment hook invoked after a read batch (spec §4.D), e.g. the
/// optional `host_agent.count_mysql_snapshots` lookup. A no-op
/// implementation is used when `ServeAgentsHttp` is disabled (spec §6).
pub trait SnapshotEnrichment: Send + Sync {
    fn count_mysql_snapshots<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, i64>;
}

/// Persistence for the `hostname_resolve` mapping table (spec §3 invariant
/// 6, §4.C, §6): the resolver's cache is append-only and last-writer-wins
/// in memory, but a canonicalisation learned by one process run must still
/// be visible to the next one, so it is backed by a row per `(resolved_from,
/// resolved_to)` pair.
pub trait HostnameResolveStore: Send + Sync {
    fn persist_hostname_mapping<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<()>>;

    fn load_hostname_mappings(&self) -> BoxFuture<'_, Result<Vec<(String, String)>>>;
}

/// Enrichment that always reports zero snapshots — the default when agent
/// enrichment is disabled.
pub struct NoSnapshotEnrichment;

impl SnapshotEnrichment for NoSnapshotEnrichment {
    fn count_mysql_snapshots<'a>(&'a self, _hostname: &'a str) -> BoxFuture<'a, i64> {
        Box::pin(async { 0 })
    }
}

/// The storage contract every backend (MySQL-backed or in-memory) must
/// satisfy. Methods are deliberately narrow — no general-purpose SQL
/// abstraction (spec Non-goals).
pub trait BackendStore: Send + Sync {
    /// Insert or update a row. When `actually_found` is `true`, every field
    /// is overwritten except `last_seen`, which is additionally bumped to
    /// `now` only when `instance.last_sql_error`/`last_io_error` carry no
    /// error (spec: "when actuallyFound ∧ lastError == nil"). `last_checked`
    /// and `last_attempted_check` are always set to `now`. When
    /// `actually_found` is `false`, this is an insert-ignore: an existing
    /// row is left untouched (spec §4.D, §8 invariant 4).
    fn upsert<'a>(
        &'a self,
        instance: &'a Instance,
        actually_found: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> BoxFuture<'a, Result<()>>;

    fn mark_attempt<'a>(
        &'a self,
        key: &'a InstanceKey,
        now: chrono::DateTime<chrono::Utc>,
    ) -> BoxFuture<'a, Result<()>>;

    fn mark_checked<'a>(
        &'a self,
        key: &'a InstanceKey,
        now: chrono::DateTime<chrono::Utc>,
    ) -> BoxFuture<'a, Result<()>>;

    fn read<'a>(&'a self, key: &'a InstanceKey) -> BoxFuture<'a, Result<Option<Instance>>>;

    fn read_by_condition<'a>(&'a self, condition: &'a Condition)
    -> BoxFuture<'a, Result<Vec<Instance>>>;

    fn forget<'a>(&'a self, key: &'a InstanceKey) -> BoxFuture<'a, Result<()>>;

    fn forget_unseen<'a>(
        &'a self,
        older_than_hours: i64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> BoxFuture<'a, Result<u64>>;
}

/// Bounded-concurrency front for a [`BackendStore`]: at most 20 concurrent
/// reads and 20 concurrent writes against the store (spec §4.D, §4.G).
#[derive(Clone)]
pub struct StoreGateway {
    store: Arc<dyn BackendStore>,
    read_semaphore: Arc<Semaphore>,
    write_semaphore: Arc<Semaphore>,
    enrichment: Arc<dyn SnapshotEnrichment>,
    poll_interval_seconds: i64,
}

/// Default concurrency bound for store reads and writes (spec §4.D).
pub const DEFAULT_STORE_CONCURRENCY: usize = 20;

/// Default poll interval (seconds) used to judge freshness when a gateway is
/// built without an explicit one (spec §4.D, §10.3 `InstancePollSeconds`).
pub const DEFAULT_POLL_INTERVAL_SECONDS: i64 = 60;

impl StoreGateway {
    #[must_use]
    pub fn new(store: Arc<dyn BackendStore>) -> Self {
        Self::with_capacity_and_enrichment(
            store,
            DEFAULT_STORE_CONCURRENCY,
            DEFAULT_STORE_CONCURRENCY,
            Arc::new(NoSnapshotEnrichment),
        )
    }

    #[must_use]
    pub fn with_capacity_and_enrichment(
        store: Arc<dyn BackendStore>,
        read_capacity: usize,
        write_capacity: usize,
        enrichment: Arc<dyn SnapshotEnrichment>,
    ) -> Self {
        Self {
            store,
            read_semaphore: Arc::new(Semaphore::new(read_capacity)),
            write_semaphore: Arc::new(Semaphore::new(write_capacity)),
            enrichment,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
        }
    }

    /// Set the poll interval used to recompute `IsUpToDate`/`IsRecentlyChecked`
    /// on every read (spec §3 "Freshness (derived on read)", §4.D).
    #[must_use]
    pub fn with_poll_interval_seconds(mut self, poll_interval_seconds: i64) -> Self {
        self.poll_interval_seconds = poll_interval_seconds;
        self
    }

    /// Acquire a write permit, run `self.store.upsert`, release on every
    /// exit path (the `Semaphore` permit's `Drop` guarantees this even if
    /// the future is cancelled mid-await).
    ///
    /// # Errors
    ///
    /// Returns whatever the underlying store returns.
    #[instrument(skip(self, instance), level = "debug", fields(key = %instance.key))]
    pub async fn upsert(
        &self,
        instance: &Instance,
        actually_found: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let _permit = self.acquire_write().await?;
        self.store.upsert(instance, actually_found, now).await
    }

    #[instrument(skip(self), level = "debug", fields(key = %key))]
    pub async fn mark_attempt(
        &self,
        key: &InstanceKey,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let _permit = self.acquire_write().await?;
        self.store.mark_attempt(key, now).await
    }

    #[instrument(skip(self), level = "debug", fields(key = %key))]
    pub async fn mark_checked(
        &self,
        key: &InstanceKey,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let _permit = self.acquire_write().await?;
        self.store.mark_checked(key, now).await
    }

    #[instrument(skip(self), level = "debug", fields(key = %key))]
    pub async fn read(&self, key: &InstanceKey) -> Result<Option<Instance>> {
        let _permit = self.acquire_read().await?;
        let mut instance = self.store.read(key).await?;
        if let Some(instance) = instance.as_mut() {
            self.enrich(instance).await;
        }
        Ok(instance)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn read_by_condition(&self, condition: &Condition) -> Result<Vec<Instance>> {
        let _permit = self.acquire_read().await?;
        let mut instances = self.store.read_by_condition(condition).await?;
        for instance in &mut instances {
            self.enrich(instance).await;
        }
        Ok(instances)
    }

    #[instrument(skip(self), level = "info", fields(key = %key))]
    pub async fn forget(&self, key: &InstanceKey) -> Result<()> {
        let _permit = self.acquire_write().await?;
        self.store.forget(key).await
    }

    #[instrument(skip(self), level = "info")]
    pub async fn forget_unseen(
        &self,
        older_than_hours: i64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64> {
        let _permit = self.acquire_write().await?;
        self.store.forget_unseen(older_than_hours, now).await
    }

    async fn enrich(&self, instance: &mut Instance) {
        instance.refresh_freshness(chrono::Utc::now(), self.poll_interval_seconds);
        instance.count_mysql_snapshots = self
            .enrichment
            .count_mysql_snapshots(&instance.key.hostname)
            .await;
    }

    async fn acquire_read(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.read_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| {
                warn!("read semaphore closed");
                Error::InvalidInput("store read semaphore closed".to_string())
            })
    }

    async fn acquire_write(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.write_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| {
                warn!("write semaphore closed");
                Error::InvalidInput("store write semaphore closed".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn gateway() -> StoreGateway {
        StoreGateway::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn upsert_then_read_round_trips() {
        let gateway = gateway();
        let key = InstanceKey::new("db1", 3306);
        let instance = Instance::new(key.clone());
        gateway.upsert(&instance, true, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

        let read = gateway.read(&key).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(read.is_some());
    }

    #[tokio::test]
    async fn insert_ignore_never_overwrites_existing_row() {
        let gateway = gateway();
        let key = InstanceKey::new("db1", 3306);

        let mut found = Instance::new(key.clone());
        found.version = "10.6.0".to_string();
        gateway.upsert(&found, true, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

        let skeletal = Instance::injected_unseen(key.clone());
        gateway.upsert(&skeletal, false, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

        let read = gateway
            .read(&key)
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|| panic!("row should exist"));
        assert_eq!(read.version, "10.6.0");
    }

    #[tokio::test]
    async fn read_populates_freshness_fields() {
        let gateway = gateway().with_poll_interval_seconds(60);
        let key = InstanceKey::new("db1", 3306);
        let instance = Instance::new(key.clone());
        gateway.upsert(&instance, true, Utc::now()).await.unwrap_or_else(|e| panic!("{e}"));

        let read = gateway
            .read(&key)
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .unwrap_or_else(|| panic!("row should exist"));
        assert!(read.is_up_to_date);
        assert!(read.is_recently_checked);
        assert!(read.is_last_check_valid);
        assert_eq!(read.seconds_since_last_seen, Some(0));
    }
}
