//! `ReadTopologyInstance` — the topology prober (spec §4.E).
//!
//! The 12-step probe sequence, run against a live server. Panics inside the
//! probe body are trapped via `catch_unwind` and turned into a logged
//! error rather than taking the caller down — one server's misbehavior
//! must not sink the rest of a probe fan-out.

use crate::cluster;
use crate::coordinates::{BinlogCoordinates, LogType};
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::key::InstanceKey;
use crate::resolver::HostnameResolver;
use crate::store::StoreGateway;
use crate::target::TargetConnector;
use chrono::Utc;
use futures::FutureExt;
use sqlx::{MySqlPool, Row};
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, info_span, instrument, warn};
use tracing_futures::Instrument as _;

/// Operator-controlled knobs the probe needs (spec §4.E.5, §4.E.7, §10.3).
#[derive(Clone, Debug, Default)]
pub struct ProberConfig {
    pub discover_by_show_slave_hosts: bool,
    pub slave_lag_query: Option<String>,
}

/// A row out of `information_schema.processlist` that looked like
/// long-running work (spec §4.E.10).
#[derive(Clone, Debug)]
pub struct RunningProcess {
    pub id: u64,
    pub user: String,
    pub host: String,
    pub db: Option<String>,
    pub command: String,
    pub time_seconds: i64,
    pub info: Option<String>,
}

struct ProbeOutcome {
    instance: Instance,
    processes: Vec<RunningProcess>,
    instance_found: bool,
    first_error: Option<Error>,
}

/// Probe `key` over an already-open `pool`, persist the outcome, and return
/// the resulting [`Instance`].
///
/// On success (`instanceFound`), persists via `Upsert` even if a later step
/// (long-running processes, lag query, cluster derivation) failed — that
/// failure is logged, not propagated, per spec §4.E step 9. A failure
/// before `instanceFound` marks the attempt as checked-but-not-found and is
/// returned as `Err`.
///
/// Use this directly when a target's pool is already established (e.g. a
/// test harness dialling a single known container); fleet-wide callers
/// should use [`probe_target`], which resolves the pool for `key` itself
/// (spec §4.E step 2).
///
/// # Errors
///
/// Returns the first error encountered before the server identity and
/// replication state could be captured.
#[instrument(skip(pool, store, resolver, config), level = "info", fields(key = %key))]
pub async fn read_topology_instance(
    pool: &MySqlPool,
    store: &StoreGateway,
    key: &InstanceKey,
    resolver: &HostnameResolver,
    config: &ProberConfig,
) -> Result<Instance> {
    store.mark_attempt(key, Utc::now()).await?;
    run_probe(pool, store, key, resolver, config).await
}

/// As [`read_topology_instance`], but dials `key`'s own `(host, port)`
/// through `connector` rather than requiring the caller to already hold an
/// open pool — the entry point fleet-wide callers (`FleetScheduler`,
/// `ReplicationControl`) use, since a single `MySqlPool` can't be reused
/// across targets that live at different addresses (spec §4.E step 2, §9).
///
/// # Errors
///
/// Returns [`Error::ConnectionFailed`] if no connection to `key` could be
/// opened, or whatever [`read_topology_instance`] would return otherwise.
#[instrument(skip(connector, store, resolver, config), level = "info", fields(key = %key))]
pub async fn probe_target(
    connector: &TargetConnector,
    store: &StoreGateway,
    key: &InstanceKey,
    resolver: &HostnameResolver,
    config: &ProberConfig,
) -> Result<Instance> {
    store.mark_attempt(key, Utc::now()).await?;

    let pool = match connector.pool_for(key).await {
        Ok(pool) => pool,
        Err(error) => {
            store.mark_checked(key, Utc::now()).await?;
            warn!(key = %key, %error, "probe could not open a connection");
            return Err(error);
        }
    };

    run_probe(&pool, store, key, resolver, config).await
}

async fn run_probe(
    pool: &MySqlPool,
    store: &StoreGateway,
    key: &InstanceKey,
    resolver: &HostnameResolver,
    config: &ProberConfig,
) -> Result<Instance> {
    let outcome = AssertUnwindSafe(probe_body(pool, key, resolver, config))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(outcome)) => finish(store, key, outcome).await,
        Ok(Err(probe_error)) => {
            store.mark_checked(key, Utc::now()).await?;
            warn!(key = %key, error = %probe_error, "probe failed before instance was found");
            Err(probe_error)
        }
        Err(panic_payload) => {
            store.mark_checked(key, Utc::now()).await?;
            let message = panic_message(panic_payload.as_ref());
            error!(key = %key, panic = %message, "probe panicked");
            Err(Error::QueryFailed {
                key: key.clone(),
                source: sqlx::Error::Protocol(format!("probe panicked: {message}")),
            })
        }
    }
}

async fn finish(store: &StoreGateway, key: &InstanceKey, mut outcome: ProbeOutcome) -> Result<Instance> {
    if outcome.instance_found {
        // Step 12: cluster derivation, against whatever the master's row
        // currently shows in the store.
        match cluster::read_cluster_name_by_master(store, &outcome.instance).await {
            Ok((cluster_name, replication_depth)) => {
                outcome.instance.cluster_name = cluster_name;
                outcome.instance.replication_depth = replication_depth;
            }
            Err(error) => {
                outcome.first_error.get_or_insert(error);
            }
        }

        store.upsert(&outcome.instance, true, Utc::now()).await?;
        debug!(
            key = %key,
            long_running = outcome.processes.len(),
            "probe complete"
        );
        if let Some(first_error) = &outcome.first_error {
            warn!(key = %key, error = %first_error, "probe completed with a non-fatal error");
        }
        Ok(outcome.instance)
    } else {
        store.mark_checked(key, Utc::now()).await?;
        Err(outcome
            .first_error
            .unwrap_or_else(|| Error::InvalidInput("probe produced no instance".to_string())))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn probe_body(
    pool: &MySqlPool,
    key: &InstanceKey,
    resolver: &HostnameResolver,
    config: &ProberConfig,
) -> Result<ProbeOutcome> {
    let mut instance = Instance::new(key.clone());
    let mut first_error: Option<Error> = None;

    // Step 3: server identity.
    let span = info_span!("db.query", db.system = "mysql", db.operation = "SELECT", otel.kind = "client");
    let identity = sqlx::query(
        "SELECT @@hostname AS hostname, @@global.server_id AS server_id, \
         @@global.version AS version, @@global.read_only AS read_only, \
         @@global.binlog_format AS binlog_format, @@global.log_bin AS log_bin, \
         @@global.log_slave_updates AS log_slave_updates",
    )
    .fetch_one(pool)
    .instrument(span)
    .await
    .map_err(|source| Error::QueryFailed { key: key.clone(), source })?;

    instance.server_id = identity.try_get("server_id").unwrap_or_default();
    instance.version = identity.try_get("version").unwrap_or_default();
    instance.read_only = identity.try_get("read_only").unwrap_or_default();
    instance.binlog_format = identity.try_get("binlog_format").unwrap_or_default();
    instance.log_bin_enabled = identity.try_get("log_bin").unwrap_or_default();
    instance.log_slave_updates_enabled = identity.try_get("log_slave_updates").unwrap_or_default();

    // Step 4: self-identity vs. dialled key.
    let reported_hostname: String = identity.try_get("hostname").unwrap_or_default();
    if !reported_hostname.is_empty() && reported_hostname != key.hostname {
        resolver.update_resolved_hostname(&key.hostname, &reported_hostname).await;
        instance.key = InstanceKey::new(reported_hostname, key.port);
    }

    // Step 5: SHOW SLAVE STATUS.
    let span = info_span!("db.query", db.system = "mysql", db.operation = "SHOW", otel.kind = "client");
    if let Ok(Some(row)) = sqlx::query("SHOW SLAVE STATUS")
        .fetch_optional(pool)
        .instrument(span)
        .await
    {
        instance.slave_io_running = row
            .try_get::<String, _>("Slave_IO_Running")
            .is_ok_and(|v| v.eq_ignore_ascii_case("yes"));
        instance.slave_sql_running = row
            .try_get::<String, _>("Slave_SQL_Running")
            .is_ok_and(|v| v.eq_ignore_ascii_case("yes"));
        instance.last_sql_error = row.try_get("Last_SQL_Error").unwrap_or_default();
        instance.last_io_error = row.try_get("Last_IO_Error").unwrap_or_default();
        instance.seconds_behind_master = row.try_get::<Option<i64>, _>("Seconds_Behind_Master").ok().flatten();

        instance.read_binlog_coordinates = BinlogCoordinates::new(
            row.try_get::<String, _>("Master_Log_File").unwrap_or_default(),
            row.try_get("Read_Master_Log_Pos").unwrap_or_default(),
            LogType::Binary,
        );
        instance.exec_binlog_coordinates = BinlogCoordinates::new(
            row.try_get::<String, _>("Relay_Master_Log_File").unwrap_or_default(),
            row.try_get("Exec_Master_Log_Pos").unwrap_or_default(),
            LogType::Binary,
        );
        instance.relaylog_coordinates = BinlogCoordinates::new(
            row.try_get::<String, _>("Relay_Log_File").unwrap_or_default(),
            row.try_get("Relay_Log_Pos").unwrap_or_default(),
            LogType::Relay,
        );

        instance.using_oracle_gtid = row
            .try_get::<String, _>("Executed_Gtid_Set")
            .is_ok_and(|v| !v.is_empty());
        instance.using_mariadb_gtid = row
            .try_get::<String, _>("Using_Gtid")
            .is_ok_and(|v| v != "No");

        let master_host: String = row.try_get("Master_Host").unwrap_or_default();
        let master_port: i64 = row.try_get("Master_Port").unwrap_or_default();
        if !master_host.is_empty() {
            let resolved_host = resolver.resolve(&master_host).await;
            instance.master_key = InstanceKey::new(resolved_host, u16::try_from(master_port).unwrap_or_default());
        }

        instance.slave_lag_seconds = instance.seconds_behind_master;
    }

    // Step 6: SHOW MASTER STATUS.
    if instance.log_bin_enabled {
        let span = info_span!("db.query", db.system = "mysql", db.operation = "SHOW", otel.kind = "client");
        if let Ok(Some(row)) = sqlx::query("SHOW MASTER STATUS").fetch_optional(pool).instrument(span).await {
            instance.self_binlog_coordinates = BinlogCoordinates::new(
                row.try_get::<String, _>("File").unwrap_or_default(),
                row.try_get("Position").unwrap_or_default(),
                LogType::Binary,
            );
        }
    }

    // Step 7: slave discovery.
    let mut discovered = false;
    if config.discover_by_show_slave_hosts {
        let span = info_span!("db.query", db.system = "mysql", db.operation = "SHOW", otel.kind = "client");
        if let Ok(rows) = sqlx::query("SHOW SLAVE HOSTS").fetch_all(pool).instrument(span).await
            && !rows.is_empty()
        {
            for row in rows {
                let host: String = row.try_get("Host").unwrap_or_default();
                let port: i64 = row.try_get("Port").unwrap_or_default();
                if host.is_empty() {
                    continue;
                }
                let canonical = resolver.resolve(&host).await;
                instance.add_slave_key(InstanceKey::new(canonical, u16::try_from(port).unwrap_or_default()));
            }
            discovered = true;
        }
    }
    if !discovered {
        let span = info_span!("db.query", db.system = "mysql", db.operation = "SELECT", otel.kind = "client");
        if let Ok(rows) = sqlx::query(
            "SELECT host FROM information_schema.processlist WHERE command = 'Binlog Dump'",
        )
        .fetch_all(pool)
        .instrument(span)
        .await
        {
            for row in rows {
                let remote: String = row.try_get("host").unwrap_or_default();
                let remote_host = remote.split(':').next().unwrap_or(&remote);
                if remote_host.is_empty() {
                    continue;
                }
                let canonical = resolver.resolve(remote_host).await;
                instance.add_slave_key(InstanceKey::new(canonical, key.port));
            }
        }
    }

    // Step 8: SHOW BINARY LOGS.
    if instance.log_bin_enabled {
        let span = info_span!("db.query", db.system = "mysql", db.operation = "SHOW", otel.kind = "client");
        if let Ok(rows) = sqlx::query("SHOW BINARY LOGS").fetch_all(pool).instrument(span).await {
            let logs = rows
                .iter()
                .filter_map(|row| row.try_get::<String, _>("Log_name").ok())
                .collect();
            instance.set_binary_logs(logs);
        }
    }

    // Step 9: the point of no return — everything collected so far is kept
    // no matter what happens next.
    let instance_found = true;

    // Step 10: long-running processes.
    let span = info_span!("db.query", db.system = "mysql", db.operation = "SELECT", otel.kind = "client");
    let processes = match sqlx::query(
        "SELECT id, user, host, db, command, time, info FROM information_schema.processlist \
         WHERE time > 60 AND command NOT IN ('Sleep', 'Binlog Dump') \
         AND user NOT IN ('system user', 'event_scheduler')",
    )
    .fetch_all(pool)
    .instrument(span)
    .await
    {
        Ok(rows) => rows
            .into_iter()
            .map(|row| RunningProcess {
                id: u64::try_from(row.try_get::<i64, _>("id").unwrap_or_default()).unwrap_or_default(),
                user: row.try_get("user").unwrap_or_default(),
                host: row.try_get("host").unwrap_or_default(),
                db: row.try_get("db").ok(),
                command: row.try_get("command").unwrap_or_default(),
                time_seconds: row.try_get("time").unwrap_or_default(),
                info: row.try_get("info").ok(),
            })
            .collect(),
        Err(source) => {
            first_error.get_or_insert(Error::QueryFailed { key: key.clone(), source });
            Vec::new()
        }
    };

    // Step 11: operator-configured lag query.
    if let Some(lag_query) = &config.slave_lag_query {
        let span = info_span!("db.query", db.system = "mysql", db.operation = "SELECT", otel.kind = "client");
        match sqlx::query_scalar::<_, i64>(lag_query).fetch_one(pool).instrument(span).await {
            Ok(lag) => instance.slave_lag_seconds = Some(lag),
            Err(source) => {
                first_error.get_or_insert(Error::QueryFailed { key: key.clone(), source });
            }
        }
    }

    // Step 12 (cluster derivation) runs in `finish`, once the caller's
    // `StoreGateway` is back in scope.

    Ok(ProbeOutcome {
        instance,
        processes,
        instance_found,
        first_error,
    })
}
