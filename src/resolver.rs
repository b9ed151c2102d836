//! Hostname canonicalisation with a cached mapping (spec §4.C).
//!
//! An `Arc<RwLock<HashMap<...>>>` cache: a reader path that takes a shared
//! lock on the happy path, and a writer path that upgrades only when a new
//! mapping needs inserting. Backed, optionally, by the `hostname_resolve`
//! table (spec §3 invariant 6, §6) so a canonicalisation learned in one
//! process run is still honored in the next.

use crate::error::Result;
use crate::store::HostnameResolveStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Caches `reported host -> canonical host` mappings.
///
/// Canonicalisation itself defaults to the identity function (lowercase the
/// reported hostname); deployments that need DNS/CNAME resolution can swap
/// in their own by calling [`HostnameResolver::update_resolved_hostname`]
/// directly wherever the prober observes a different `@@hostname` than it
/// dialled (spec §4.E.4).
#[derive(Clone, Default)]
pub struct HostnameResolver {
    cache: Arc<RwLock<HashMap<String, String>>>,
    persistence: Option<Arc<dyn HostnameResolveStore>>,
}

impl HostnameResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver whose cache is pre-seeded from `store`'s persisted
    /// `hostname_resolve` rows, and whose subsequent
    /// [`Self::update_resolved_hostname`] calls are written back to it —
    /// the mapping a single process learns must still hold for the next one
    /// (spec §3 invariant 6).
    ///
    /// # Errors
    ///
    /// Returns whatever `store.load_hostname_mappings()` returns.
    pub async fn with_store(store: Arc<dyn HostnameResolveStore>) -> Result<Self> {
        let mappings = store.load_hostname_mappings().await?;
        let cache = mappings.into_iter().collect::<HashMap<_, _>>();
        Ok(Self {
            cache: Arc::new(RwLock::new(cache)),
            persistence: Some(store),
        })
    }

    /// Resolve `host` to its canonical form. Idempotent: resolving a
    /// canonical hostname returns it unchanged.
    pub async fn resolve(&self, host: &str) -> String {
        if let Some(canonical) = self.cache.read().await.get(host) {
            return canonical.clone();
        }
        Self::canonicalize(host)
    }

    /// Persist a mapping observed by the prober (its reported `@@hostname`
    /// differed from the key it was contacted on). Append-only,
    /// last-writer-wins on conflict (spec §5 shared-resource policy). When
    /// this resolver was built with [`Self::with_store`], the mapping is
    /// also written through to the backend; a write failure there is
    /// logged and does not block the prober (the in-memory cache still has
    /// it for the rest of this process's lifetime).
    pub async fn update_resolved_hostname(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.cache
            .write()
            .await
            .insert(from.to_string(), to.to_string());

        if let Some(store) = &self.persistence
            && let Err(error) = store.persist_hostname_mapping(from, to).await
        {
            warn!(from, to, %error, "failed to persist hostname mapping");
        }
    }

    fn canonicalize(host: &str) -> String {
        host.trim().to_ascii_lowercase()
    }
}
