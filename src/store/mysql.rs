//! `sqlx`-backed [`BackendStore`] against a MySQL-protocol store (spec §6:
//! `database_instance`, `hostname_resolve`, `host_agent`).
//!
//! Plain `sqlx::query`/`query_as` throughout, no query builder or ORM;
//! spans around each statement, `debug!` on best-effort failures instead of
//! surfacing every last one.

use super::condition::{Condition, PROBLEM_LAG_THRESHOLD_SECONDS};
use super::{BackendStore, HostnameResolveStore, SnapshotEnrichment};
use crate::coordinates::{BinlogCoordinates, LogType};
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::key::InstanceKey;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};
use tracing::{info_span, instrument};
use tracing_futures::Instrument as _;

/// `database_instance`-backed store. One row per `(hostname, port)`.
#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn to_connection_error(key: &InstanceKey, source: sqlx::Error) -> Error {
        Error::ConnectionFailed {
            key: key.clone(),
            source,
        }
    }

    fn to_query_error(key: &InstanceKey, source: sqlx::Error) -> Error {
        Error::QueryFailed {
            key: key.clone(),
            source,
        }
    }

    fn row_to_instance(row: &MySqlRow) -> Result<Instance> {
        let hostname: String = row.try_get("hostname").unwrap_or_default();
        let port: i64 = row.try_get("port").unwrap_or_default();
        let key = InstanceKey::new(hostname, u16::try_from(port).unwrap_or_default());

        let mut instance = Instance::new(key.clone());
        instance.server_id = row.try_get("server_id").unwrap_or_default();
        instance.version = row.try_get("version").unwrap_or_default();
        instance.read_only = row.try_get("read_only").unwrap_or_default();
        instance.binlog_format = row.try_get("binlog_format").unwrap_or_default();
        instance.log_bin_enabled = row.try_get("log_bin_enabled").unwrap_or_default();
        instance.log_slave_updates_enabled =
            row.try_get("log_slave_updates_enabled").unwrap_or_default();

        let master_host: String = row.try_get("master_host").unwrap_or_default();
        let master_port: i64 = row.try_get("master_port").unwrap_or_default();
        instance.master_key = if master_host.is_empty() {
            InstanceKey::empty()
        } else {
            InstanceKey::new(master_host, u16::try_from(master_port).unwrap_or_default())
        };

        instance.slave_io_running = row.try_get("slave_io_running").unwrap_or_default();
        instance.slave_sql_running = row.try_get("slave_sql_running").unwrap_or_default();
        instance.using_oracle_gtid = row.try_get("using_oracle_gtid").unwrap_or_default();
        instance.using_mariadb_gtid = row.try_get("using_mariadb_gtid").unwrap_or_default();
        instance.using_pseudo_gtid = row.try_get("using_pseudo_gtid").unwrap_or_default();
        instance.last_sql_error = row.try_get("last_sql_error").unwrap_or_default();
        instance.last_io_error = row.try_get("last_io_error").unwrap_or_default();
        instance.seconds_behind_master = row.try_get("seconds_behind_master").ok().flatten();
        instance.slave_lag_seconds = row.try_get("slave_lag_seconds").ok().flatten();

        instance.self_binlog_coordinates = BinlogCoordinates::new(
            row.try_get::<String, _>("self_log_file").unwrap_or_default(),
            row.try_get("self_log_pos").unwrap_or_default(),
            LogType::Binary,
        );
        instance.read_binlog_coordinates = BinlogCoordinates::new(
            row.try_get::<String, _>("read_log_file").unwrap_or_default(),
            row.try_get("read_log_pos").unwrap_or_default(),
            LogType::Binary,
        );
        instance.exec_binlog_coordinates = BinlogCoordinates::new(
            row.try_get::<String, _>("exec_log_file").unwrap_or_default(),
            row.try_get("exec_log_pos").unwrap_or_default(),
            LogType::Binary,
        );
        instance.relaylog_coordinates = BinlogCoordinates::new(
            row.try_get::<String, _>("relay_log_file").unwrap_or_default(),
            row.try_get("relay_log_pos").unwrap_or_default(),
            LogType::Relay,
        );

        let slave_hosts_json: String = row.try_get("slave_hosts").unwrap_or_default();
        if !slave_hosts_json.is_empty()
            && let Ok(keys) = serde_json::from_str::<Vec<InstanceKey>>(&slave_hosts_json)
        {
            for slave_key in keys {
                instance.add_slave_key(slave_key);
            }
        }

        instance.cluster_name = row.try_get("cluster_name").unwrap_or_default();
        instance.replication_depth =
            u32::try_from(row.try_get::<i64, _>("replication_depth").unwrap_or_default()).unwrap_or_default();

        let binary_logs_json: String = row.try_get("binary_logs").unwrap_or_default();
        if let Ok(logs) = serde_json::from_str::<Vec<String>>(&binary_logs_json) {
            instance.set_binary_logs(logs);
        }

        instance.last_checked = row.try_get("last_checked").ok();
        instance.last_attempted_check = row.try_get("last_attempted_check").ok();
        instance.last_seen = row.try_get("last_seen").ok();

        Ok(instance)
    }
}

/// Queries `host_agent.count_mysql_snapshots` for the enrichment hook (spec
/// §4.D, §6). [`StoreGateway`](super::StoreGateway) only invokes this when
/// wired in — the CLI does so exactly when `ServeAgentsHttp` is set (spec
/// §6), leaving [`super::NoSnapshotEnrichment`] as the default otherwise.
#[derive(Clone)]
pub struct HostAgentSnapshotEnrichment {
    pool: MySqlPool,
}

impl HostAgentSnapshotEnrichment {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

impl SnapshotEnrichment for HostAgentSnapshotEnrichment {
    fn count_mysql_snapshots<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "SELECT",
                db.statement = "SELECT count_mysql_snapshots FROM host_agent WHERE hostname = ?",
                otel.kind = "client"
            );
            sqlx::query_scalar::<_, i64>("SELECT count_mysql_snapshots FROM host_agent WHERE hostname = ?")
                .bind(hostname)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .map(|count| count.unwrap_or(0))
                .unwrap_or(0)
        })
    }
}

impl BackendStore for MySqlStore {
    #[instrument(skip(self, instance), level = "debug", fields(key = %instance.key, actually_found))]
    fn upsert<'a>(
        &'a self,
        instance: &'a Instance,
        actually_found: bool,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let slave_hosts = serde_json::to_string(&instance.slave_hosts).unwrap_or_default();
            let binary_logs = serde_json::to_string(&instance.binary_logs).unwrap_or_default();
            let no_error = instance.last_sql_error.is_empty() && instance.last_io_error.is_empty();
            let bump_last_seen = actually_found && no_error;

            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "INSERT",
                db.statement = "INSERT ... ON DUPLICATE KEY UPDATE database_instance",
                otel.kind = "client"
            );

            let query = if actually_found {
                UPSERT_FOUND_SQL
            } else {
                UPSERT_SKELETAL_SQL
            };

            let mut builder = sqlx::query(query)
                .bind(&instance.key.hostname)
                .bind(i64::from(instance.key.port))
                .bind(instance.server_id)
                .bind(&instance.version)
                .bind(instance.read_only)
                .bind(&instance.binlog_format)
                .bind(instance.log_bin_enabled)
                .bind(instance.log_slave_updates_enabled)
                .bind(&instance.master_key.hostname)
                .bind(i64::from(instance.master_key.port))
                .bind(instance.slave_io_running)
                .bind(instance.slave_sql_running)
                .bind(instance.using_oracle_gtid)
                .bind(instance.using_mariadb_gtid)
                .bind(instance.using_pseudo_gtid)
                .bind(&instance.last_sql_error)
                .bind(&instance.last_io_error)
                .bind(instance.seconds_behind_master)
                .bind(instance.slave_lag_seconds)
                .bind(&instance.self_binlog_coordinates.log_file)
                .bind(instance.self_binlog_coordinates.log_pos)
                .bind(&instance.read_binlog_coordinates.log_file)
                .bind(instance.read_binlog_coordinates.log_pos)
                .bind(&instance.exec_binlog_coordinates.log_file)
                .bind(instance.exec_binlog_coordinates.log_pos)
                .bind(&instance.relaylog_coordinates.log_file)
                .bind(instance.relaylog_coordinates.log_pos)
                .bind(slave_hosts)
                .bind(&instance.cluster_name)
                .bind(i64::from(instance.replication_depth))
                .bind(binary_logs);

            if actually_found {
                // `last_checked`/`last_attempted_check` only get stamped on
                // an actual probe result. The skeletal insert-ignore path
                // leaves them unset so an injected row still reads as
                // never-probed (spec §3 Lifecycles).
                builder = builder.bind(now).bind(now);

                // `last_seen` column for the INSERT branch, plus the same
                // value again for the `ON DUPLICATE KEY UPDATE ... COALESCE`
                // branch below (spec §4.D: bumped only when found and
                // error-free, otherwise the existing value is kept).
                let last_seen = bump_last_seen.then_some(now);
                builder = builder.bind(last_seen).bind(last_seen);
            }

            builder
                .execute(&self.pool)
                .instrument(span)
                .await
                .map_err(|e| Self::to_query_error(&instance.key, e))?;

            Ok(())
        })
    }

    #[instrument(skip(self), level = "debug", fields(key = %key))]
    fn mark_attempt<'a>(&'a self, key: &'a InstanceKey, now: DateTime<Utc>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO database_instance (hostname, port, last_attempted_check) VALUES (?, ?, ?)
                 ON DUPLICATE KEY UPDATE last_attempted_check = VALUES(last_attempted_check)",
            )
            .bind(&key.hostname)
            .bind(i64::from(key.port))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::to_query_error(key, e))?;
            Ok(())
        })
    }

    #[instrument(skip(self), level = "debug", fields(key = %key))]
    fn mark_checked<'a>(&'a self, key: &'a InstanceKey, now: DateTime<Utc>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO database_instance (hostname, port, last_checked) VALUES (?, ?, ?)
                 ON DUPLICATE KEY UPDATE last_checked = VALUES(last_checked)",
            )
            .bind(&key.hostname)
            .bind(i64::from(key.port))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::to_query_error(key, e))?;
            Ok(())
        })
    }

    #[instrument(skip(self), level = "debug", fields(key = %key))]
    fn read<'a>(&'a self, key: &'a InstanceKey) -> BoxFuture<'a, Result<Option<Instance>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM database_instance WHERE hostname = ? AND port = ?")
                .bind(&key.hostname)
                .bind(i64::from(key.port))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Self::to_connection_error(key, e))?;

            match row {
                Some(row) => Ok(Some(Self::row_to_instance(&row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), level = "debug")]
    fn read_by_condition<'a>(
        &'a self,
        condition: &'a Condition,
    ) -> BoxFuture<'a, Result<Vec<Instance>>> {
        Box::pin(async move {
            let (clause, bindings) = condition_sql(condition)?;
            let query = format!("SELECT * FROM database_instance WHERE {clause}");
            let mut builder = sqlx::query(&query);
            for binding in bindings {
                builder = match binding {
                    Binding::Str(value) => builder.bind(value),
                    Binding::Port(value) => builder.bind(value),
                };
            }

            let rows = builder
                .fetch_all(&self.pool)
                .await
                .map_err(|e| Self::to_query_error(&InstanceKey::empty(), e))?;

            let mut instances = Vec::with_capacity(rows.len());
            for row in rows {
                instances.push(Self::row_to_instance(&row)?);
            }
            Ok(instances)
        })
    }

    #[instrument(skip(self), level = "info", fields(key = %key))]
    fn forget<'a>(&'a self, key: &'a InstanceKey) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM database_instance WHERE hostname = ? AND port = ?")
                .bind(&key.hostname)
                .bind(i64::from(key.port))
                .execute(&self.pool)
                .await
                .map_err(|e| Self::to_query_error(key, e))?;
            Ok(())
        })
    }

    #[instrument(skip(self), level = "info")]
    fn forget_unseen<'a>(
        &'a self,
        older_than_hours: i64,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let threshold = now - chrono::Duration::hours(older_than_hours);
            let result = sqlx::query("DELETE FROM database_instance WHERE last_seen < ?")
                .bind(threshold)
                .execute(&self.pool)
                .await
                .map_err(|e| Self::to_query_error(&InstanceKey::empty(), e))?;
            Ok(result.rows_affected())
        })
    }
}

/// A single bound parameter for a [`condition_sql`] clause. `sqlx::query`
/// needs each bind typed up front, so a condition with more than one `?`
/// (e.g. [`Condition::ByMaster`]'s host and port) returns one [`Binding`]
/// per placeholder rather than folding them into a single string.
enum Binding {
    Str(String),
    Port(i64),
}

/// Translate a [`Condition`] into a `WHERE` clause plus its bound
/// parameters, in placeholder order. Kept intentionally narrow: no
/// user-composable SQL.
fn condition_sql(condition: &Condition) -> Result<(String, Vec<Binding>)> {
    match condition {
        Condition::All => Ok(("1 = 1".to_string(), vec![])),
        Condition::ByCluster(name) => Ok((
            "cluster_name = ?".to_string(),
            vec![Binding::Str(name.clone())],
        )),
        Condition::ByMaster(key) => Ok((
            "master_host = ? AND master_port = ?".to_string(),
            vec![
                Binding::Str(key.hostname.clone()),
                Binding::Port(i64::from(key.port)),
            ],
        )),
        Condition::Unseen => Ok(("last_seen < last_checked".to_string(), vec![])),
        Condition::Problem { poll_interval_seconds } => Ok((
            format!(
                "(last_seen < last_checked) \
                 OR (last_checked < NOW() - INTERVAL {poll_interval_seconds} SECOND) \
                 OR (slave_io_running = 0) OR (slave_sql_running = 0) \
                 OR (slave_lag_seconds > {PROBLEM_LAG_THRESHOLD_SECONDS})"
            ),
            vec![],
        )),
        Condition::Search(term) => Ok((
            "(hostname LIKE CONCAT('%', ?, '%') OR cluster_name LIKE CONCAT('%', ?, '%'))".to_string(),
            vec![Binding::Str(term.clone()), Binding::Str(term.clone())],
        )),
        Condition::HostnameRegex(pattern) => Ok((
            "hostname REGEXP ?".to_string(),
            vec![Binding::Str(pattern.clone())],
        )),
    }
}

const UPSERT_FOUND_SQL: &str = "\
INSERT INTO database_instance (
    hostname, port, server_id, version, read_only, binlog_format, log_bin_enabled,
    log_slave_updates_enabled, master_host, master_port, slave_io_running, slave_sql_running,
    using_oracle_gtid, using_mariadb_gtid, using_pseudo_gtid, last_sql_error, last_io_error,
    seconds_behind_master, slave_lag_seconds, self_log_file, self_log_pos, read_log_file,
    read_log_pos, exec_log_file, exec_log_pos, relay_log_file, relay_log_pos, slave_hosts,
    cluster_name, replication_depth, binary_logs, last_checked, last_attempted_check, last_seen
) VALUES (
    ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
)
ON DUPLICATE KEY UPDATE
    server_id = VALUES(server_id), version = VALUES(version), read_only = VALUES(read_only),
    binlog_format = VALUES(binlog_format), log_bin_enabled = VALUES(log_bin_enabled),
    log_slave_updates_enabled = VALUES(log_slave_updates_enabled), master_host = VALUES(master_host),
    master_port = VALUES(master_port), slave_io_running = VALUES(slave_io_running),
    slave_sql_running = VALUES(slave_sql_running), using_oracle_gtid = VALUES(using_oracle_gtid),
    using_mariadb_gtid = VALUES(using_mariadb_gtid), using_pseudo_gtid = VALUES(using_pseudo_gtid),
    last_sql_error = VALUES(last_sql_error), last_io_error = VALUES(last_io_error),
    seconds_behind_master = VALUES(seconds_behind_master), slave_lag_seconds = VALUES(slave_lag_seconds),
    self_log_file = VALUES(self_log_file), self_log_pos = VALUES(self_log_pos),
    read_log_file = VALUES(read_log_file), read_log_pos = VALUES(read_log_pos),
    exec_log_file = VALUES(exec_log_file), exec_log_pos = VALUES(exec_log_pos),
    relay_log_file = VALUES(relay_log_file), relay_log_pos = VALUES(relay_log_pos),
    slave_hosts = VALUES(slave_hosts), cluster_name = VALUES(cluster_name),
    replication_depth = VALUES(replication_depth), binary_logs = VALUES(binary_logs),
    last_checked = VALUES(last_checked), last_attempted_check = VALUES(last_attempted_check),
    last_seen = COALESCE(?, last_seen)";

impl HostnameResolveStore for MySqlStore {
    /// Persist a canonicalisation learned by the prober (spec §4.E.4) into
    /// `hostname_resolve`, keyed on `resolved_from` so a later mapping for
    /// the same reported name overwrites it (append-only, last-writer-wins
    /// per spec §5).
    #[instrument(skip(self), level = "debug", fields(from, to))]
    fn persist_hostname_mapping<'a>(&'a self, from: &'a str, to: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "INSERT",
                db.statement = "INSERT ... ON DUPLICATE KEY UPDATE hostname_resolve",
                otel.kind = "client"
            );
            sqlx::query(
                "INSERT INTO hostname_resolve (resolved_from, resolved_to) VALUES (?, ?)
                 ON DUPLICATE KEY UPDATE resolved_to = VALUES(resolved_to)",
            )
            .bind(from)
            .bind(to)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|source| Error::QueryFailed {
                key: InstanceKey::new(from.to_string(), 0),
                source,
            })?;
            Ok(())
        })
    }

    #[instrument(skip(self), level = "debug")]
    fn load_hostname_mappings(&self) -> BoxFuture<'_, Result<Vec<(String, String)>>> {
        Box::pin(async move {
            let span = info_span!("db.query", db.system = "mysql", db.operation = "SELECT", otel.kind = "client");
            let rows = sqlx::query("SELECT resolved_from, resolved_to FROM hostname_resolve")
                .fetch_all(&self.pool)
                .instrument(span)
                .await
                .map_err(|source| Error::QueryFailed {
                    key: InstanceKey::empty(),
                    source,
                })?;

            Ok(rows
                .iter()
                .map(|row| {
                    (
                        row.try_get::<String, _>("resolved_from").unwrap_or_default(),
                        row.try_get::<String, _>("resolved_to").unwrap_or_default(),
                    )
                })
                .collect())
        })
    }
}

const UPSERT_SKELETAL_SQL: &str = "\
INSERT IGNORE INTO database_instance (
    hostname, port, server_id, version, read_only, binlog_format, log_bin_enabled,
    log_slave_updates_enabled, master_host, master_port, slave_io_running, slave_sql_running,
    using_oracle_gtid, using_mariadb_gtid, using_pseudo_gtid, last_sql_error, last_io_error,
    seconds_behind_master, slave_lag_seconds, self_log_file, self_log_pos, read_log_file,
    read_log_pos, exec_log_file, exec_log_pos, relay_log_file, relay_log_pos, slave_hosts,
    cluster_name, replication_depth, binary_logs
) VALUES (
    ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
)";
