//! Cluster name derivation (spec §4.F).
//!
//! Non-recursive: each probe round adopts the name of whatever the master's
//! row currently shows. Convergence happens over successive rounds rather
//! than by walking the whole tree in one pass.

use crate::error::Result;
use crate::instance::Instance;
use crate::key::InstanceKey;
use crate::store::{Condition, StoreGateway};
use chrono::Utc;
use tracing::{debug, instrument, warn};

/// `(cluster_name, replication_depth)` for `instance`, derived from its
/// master's row in the store.
///
/// - Master row exists with a non-empty `cluster_name`: adopt it, depth =
///   `master.replication_depth + 1`.
/// - Master row exists but `cluster_name` is empty: default to
///   `master.host:master.port`, depth = `master.replication_depth + 1`.
/// - No master row (not a slave, or master not yet probed): `self.host:self.port`,
///   depth 0.
#[instrument(skip(store, instance), level = "debug", fields(key = %instance.key))]
pub async fn read_cluster_name_by_master(
    store: &StoreGateway,
    instance: &Instance,
) -> Result<(String, u32)> {
    if !instance.is_slave() {
        return Ok((instance.key.to_string(), 0));
    }

    match store.read(&instance.master_key).await? {
        Some(master) if !master.cluster_name.is_empty() => {
            Ok((master.cluster_name, master.replication_depth + 1))
        }
        Some(master) => Ok((master.key.to_string(), master.replication_depth + 1)),
        None => Ok((instance.key.to_string(), 0)),
    }
}

/// Walk rows with `last_seen < last_checked` (i.e. [`Condition::Unseen`])
/// and recompute + persist their cluster derivation (spec §4.F sweeper).
///
/// Returns the number of rows updated. A single row's failure is logged and
/// does not abort the sweep.
#[instrument(skip(store), level = "info")]
pub async fn review_unseen_instances(store: &StoreGateway) -> Result<usize> {
    let unseen = store.read_by_condition(&Condition::Unseen).await?;
    let mut updated = 0;

    for instance in unseen {
        match read_cluster_name_by_master(store, &instance).await {
            Ok((cluster_name, replication_depth)) => {
                let mut patched = instance.clone();
                patched.cluster_name = cluster_name;
                patched.replication_depth = replication_depth;
                if let Err(error) = store.upsert(&patched, true, Utc::now()).await {
                    warn!(key = %instance.key, %error, "failed to persist cluster derivation");
                    continue;
                }
                updated += 1;
            }
            Err(error) => {
                warn!(key = %instance.key, %error, "failed to derive cluster name");
            }
        }
    }

    debug!(updated, "review_unseen_instances complete");
    Ok(updated)
}

/// Find rows whose `master_key` points at no known row while the row's own
/// slave IO thread is running, and inject a skeletal row for that master so
/// the next probe cycle targets it (spec §3 Lifecycles, §4.F).
#[instrument(skip(store), level = "info")]
pub async fn inject_unseen_masters(store: &StoreGateway) -> Result<usize> {
    let all = store.read_by_condition(&Condition::All).await?;
    let mut injected = 0;

    for instance in &all {
        if !instance.slave_io_running || instance.master_key.is_empty() {
            continue;
        }
        if store.read(&instance.master_key).await?.is_some() {
            continue;
        }
        let skeletal = Instance::injected_unseen(instance.master_key.clone());
        store.upsert(&skeletal, false, Utc::now()).await?;
        injected += 1;
    }

    debug!(injected, "inject_unseen_masters complete");
    Ok(injected)
}

/// Convenience used by callers that only have a key, not a loaded
/// [`Instance`], on hand.
pub async fn read_cluster_name_by_master_key(
    store: &StoreGateway,
    key: &InstanceKey,
) -> Result<(String, u32)> {
    match store.read(key).await? {
        Some(instance) => read_cluster_name_by_master(store, &instance).await,
        None => Ok((key.to_string(), 0)),
    }
}
