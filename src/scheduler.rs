//! Fleet scheduler (spec §4.G).
//!
//! Gates outbound probe/control traffic with a 100-permit topology
//! semaphore and fans fleet-wide operations out one task per target,
//! draining them with `FuturesUnordered` — a single target's failure is
//! logged and folded into the summary rather than aborting the rest.

use crate::control::ReplicationControl;
use crate::error::Result;
use crate::instance::Instance;
use crate::key::InstanceKey;
use crate::prober::{self, ProberConfig};
use crate::resolver::HostnameResolver;
use crate::store::StoreGateway;
use crate::target::TargetConnector;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

/// Topology-semaphore capacity (spec §4.G).
pub const DEFAULT_TOPOLOGY_CONCURRENCY: usize = 100;

/// One fleet-operation target's outcome.
pub struct TargetResult {
    pub key: InstanceKey,
    pub result: Result<Instance>,
}

pub struct FleetScheduler {
    connector: TargetConnector,
    store: StoreGateway,
    resolver: HostnameResolver,
    prober_config: ProberConfig,
    topology_semaphore: Arc<Semaphore>,
}

impl FleetScheduler {
    #[must_use]
    pub fn new(
        connector: TargetConnector,
        store: StoreGateway,
        resolver: HostnameResolver,
        prober_config: ProberConfig,
    ) -> Self {
        Self::with_topology_capacity(connector, store, resolver, prober_config, DEFAULT_TOPOLOGY_CONCURRENCY)
    }

    #[must_use]
    pub fn with_topology_capacity(
        connector: TargetConnector,
        store: StoreGateway,
        resolver: HostnameResolver,
        prober_config: ProberConfig,
        topology_capacity: usize,
    ) -> Self {
        Self {
            connector,
            store,
            resolver,
            prober_config,
            topology_semaphore: Arc::new(Semaphore::new(topology_capacity)),
        }
    }

    /// Acquire the topology semaphore, run `f`, release on every exit path
    /// (spec §4.G `ExecuteOnTopology`).
    pub async fn execute_on_topology<F, T>(&self, f: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = Arc::clone(&self.topology_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| crate::error::Error::InvalidInput("topology semaphore closed".to_string()))?;
        f.await
    }

    /// Probe one target under the topology semaphore.
    async fn probe_one(&self, key: &InstanceKey) -> Result<Instance> {
        self.execute_on_topology(prober::probe_target(
            &self.connector,
            &self.store,
            key,
            &self.resolver,
            &self.prober_config,
        ))
        .await
    }

    /// Probe every target in `keys`, fanning out one task each, and wait
    /// for all of them (barrier) before returning. A single target's
    /// failure is logged, not propagated (spec §4.G).
    #[instrument(skip(self, keys), level = "info", fields(count = keys.len()))]
    pub async fn refresh_topology_instances(&self, keys: &[InstanceKey]) -> Vec<TargetResult> {
        let mut tasks: FuturesUnordered<BoxFuture<'_, TargetResult>> = FuturesUnordered::new();
        for key in keys {
            let key = key.clone();
            tasks.push(Box::pin(async move {
                let result = self.probe_one(&key).await;
                if let Err(error) = &result {
                    warn!(key = %key, %error, "refresh failed for target");
                }
                TargetResult { key, result }
            }));
        }

        let mut results = Vec::with_capacity(keys.len());
        while let Some(outcome) = tasks.next().await {
            results.push(outcome);
        }
        results
    }

    /// Fan `StopSlaveNicely` across `keys`.
    #[instrument(skip(self, keys, control), level = "info", fields(count = keys.len()))]
    pub async fn stop_slaves_nicely(
        &self,
        control: &ReplicationControl,
        keys: &[InstanceKey],
        timeout: Duration,
    ) -> Vec<TargetResult> {
        let mut tasks: FuturesUnordered<BoxFuture<'_, TargetResult>> = FuturesUnordered::new();
        for key in keys {
            let key = key.clone();
            tasks.push(Box::pin(async move {
                let result = self
                    .execute_on_topology(control.stop_slave_nicely(&key, timeout))
                    .await;
                if let Err(error) = &result {
                    warn!(key = %key, %error, "stop_slave_nicely failed for target");
                }
                TargetResult { key, result }
            }));
        }

        let mut results = Vec::with_capacity(keys.len());
        while let Some(outcome) = tasks.next().await {
            results.push(outcome);
        }
        results
    }

    /// Fan `StartSlave` across `keys`.
    #[instrument(skip(self, keys, control), level = "info", fields(count = keys.len()))]
    pub async fn start_slaves(&self, control: &ReplicationControl, keys: &[InstanceKey]) -> Vec<TargetResult> {
        let mut tasks: FuturesUnordered<BoxFuture<'_, TargetResult>> = FuturesUnordered::new();
        for key in keys {
            let key = key.clone();
            tasks.push(Box::pin(async move {
                let result = self.execute_on_topology(control.start_slave(&key)).await;
                if let Err(error) = &result {
                    warn!(key = %key, %error, "start_slave failed for target");
                }
                TargetResult { key, result }
            }));
        }

        let mut results = Vec::with_capacity(keys.len());
        while let Some(outcome) = tasks.next().await {
            results.push(outcome);
        }
        results
    }

    /// Select keys overdue for a probe: either the last attempt completed
    /// and `last_checked` is older than `poll_interval`, or the last
    /// attempt is still outstanding and 20x `poll_interval` has elapsed —
    /// the "hung instance" back-off (spec §4.G).
    #[instrument(skip(self), level = "debug")]
    pub async fn read_outdated_instance_keys(&self, poll_interval_seconds: i64) -> Result<Vec<InstanceKey>> {
        let all = self.store.read_by_condition(&crate::store::Condition::All).await?;
        let now = Utc::now();

        let outdated = all
            .into_iter()
            .filter(|instance| is_outdated(instance, now, poll_interval_seconds))
            .map(|instance| instance.key)
            .collect();
        Ok(outdated)
    }
}

fn is_outdated(instance: &Instance, now: chrono::DateTime<Utc>, poll_interval_seconds: i64) -> bool {
    match (instance.last_attempted_check, instance.last_checked) {
        (Some(attempted), Some(checked)) if attempted <= checked => {
            (now - checked).num_seconds() > poll_interval_seconds
        }
        (Some(attempted), checked) => {
            let reference = checked.unwrap_or(attempted);
            (now - reference).num_seconds() > poll_interval_seconds * 20
        }
        (None, _) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;

    #[test]
    fn fresh_instance_is_not_outdated() {
        let now = Utc::now();
        let mut instance = Instance::new(InstanceKey::new("db1", 3306));
        instance.last_attempted_check = Some(now);
        instance.last_checked = Some(now);
        assert!(!is_outdated(&instance, now, 60));
    }

    #[test]
    fn completed_probe_past_poll_interval_is_outdated() {
        let now = Utc::now();
        let mut instance = Instance::new(InstanceKey::new("db1", 3306));
        instance.last_attempted_check = Some(now - chrono::Duration::seconds(120));
        instance.last_checked = Some(now - chrono::Duration::seconds(120));
        assert!(is_outdated(&instance, now, 60));
    }

    #[test]
    fn hung_probe_waits_twenty_times_poll_interval() {
        let now = Utc::now();
        let mut instance = Instance::new(InstanceKey::new("db1", 3306));
        // `last_attempted_check` stays after `last_checked` throughout — the
        // probe never returned — so both assertions exercise the
        // outstanding-attempt 20x back-off branch, not the completed-probe one.
        instance.last_checked = Some(now - chrono::Duration::seconds(500));
        instance.last_attempted_check = Some(now - chrono::Duration::seconds(10));
        assert!(!is_outdated(&instance, now, 60));

        instance.last_checked = Some(now - chrono::Duration::seconds(1300));
        assert!(is_outdated(&instance, now, 60));
    }

    #[test]
    fn never_attempted_instance_is_outdated() {
        let now = Utc::now();
        let instance = Instance::new(InstanceKey::new("db1", 3306));
        assert!(is_outdated(&instance, now, 60));
    }
}
