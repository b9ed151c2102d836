//! Per-target connection pooling for the fleet (spec §4.E step 2, §9).
//!
//! A single set of replication-monitoring credentials dials a different
//! `(host, port)` per probed instance, so the prober can't reuse one
//! `MySqlPool` across a whole fleet the way it can reuse one against the
//! backend store. [`TargetConnector`] caches a tiny pool per
//! [`InstanceKey`] the way the teacher's `collectors::util` caches one tiny
//! pool per database name off a shared base DSN.

use crate::error::{Error, Result};
use crate::key::InstanceKey;
use secrecy::{ExposeSecret, SecretString};
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::instrument;

/// Pool size used for each cached per-target connection. Probes and control
/// operations against one instance rarely need more than a couple of
/// concurrent statements.
const MAX_CONNECTIONS_PER_TARGET: u32 = 2;

/// Shared credentials (user, password, default port/db) plus a cache of the
/// tiny pools dialled against each fleet member's own `(host, port)`.
#[derive(Clone)]
pub struct TargetConnector {
    base: MySqlConnectOptions,
    pools: Arc<RwLock<HashMap<InstanceKey, MySqlPool>>>,
}

impl TargetConnector {
    /// Parse shared credentials out of `dsn`; the host/port it encodes are
    /// only a placeholder — every real dial overrides them with the target
    /// [`InstanceKey`] passed to [`Self::pool_for`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `dsn` does not parse.
    pub fn from_dsn(dsn: &SecretString) -> Result<Self> {
        let base = MySqlConnectOptions::from_str(dsn.expose_secret())
            .map_err(|source| Error::InvalidInput(format!("invalid target DSN: {source}")))?;
        Ok(Self::new(base))
    }

    #[must_use]
    pub fn new(base: MySqlConnectOptions) -> Self {
        Self {
            base,
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get (or lazily create and cache) a pool dialled at `key`'s
    /// `(host, port)`, reusing this connector's shared credentials (spec
    /// §4.E step 2: "Open connection. On failure, fall through to
    /// cleanup").
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the pool could not be
    /// established.
    #[instrument(skip(self), level = "debug", fields(key = %key))]
    pub async fn pool_for(&self, key: &InstanceKey) -> Result<MySqlPool> {
        {
            let cached = self.pools.read().await;
            if let Some(pool) = cached.get(key) {
                return Ok(pool.clone());
            }
        }

        let opts = self.base.clone().host(&key.hostname).port(key.port);
        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS_PER_TARGET)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await
            .map_err(|source| Error::ConnectionFailed {
                key: key.clone(),
                source,
            })?;

        let mut cached = self.pools.write().await;
        let pool = cached.entry(key.clone()).or_insert(pool).clone();
        Ok(pool)
    }

    /// Drop a cached pool, e.g. after `Forget` so a stale connection isn't
    /// silently kept warm for an instance the store no longer tracks.
    pub async fn forget(&self, key: &InstanceKey) {
        self.pools.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_for_unreachable_host_is_connection_failed() {
        let connector = TargetConnector::new(
            MySqlConnectOptions::new()
                .host("127.0.0.1")
                .port(1)
                .username("root"),
        );
        let key = InstanceKey::new("127.0.0.1", 1);
        let result = connector.pool_for(&key).await;
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    }

    #[test]
    fn from_dsn_rejects_garbage() {
        let dsn = SecretString::from("not a dsn at all".to_string());
        assert!(TargetConnector::from_dsn(&dsn).is_err());
    }
}
