//! Replication control operations (spec §4.H).
//!
//! Every operation probes before checking its precondition and probes again
//! after to hand the caller a fresh [`Instance`]. State-changing operations
//! call into an [`AuditOperation`] sink afterwards.

use crate::audit::AuditOperation;
use crate::coordinates::BinlogCoordinates;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::key::InstanceKey;
use crate::prober::{self, ProberConfig};
use crate::resolver::HostnameResolver;
use crate::store::StoreGateway;
use crate::target::TargetConnector;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::MySqlPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// Poll cadence for `StopSlaveNicely` and `StartSlaveUntilMasterCoordinates`
/// (spec §4.H: "poll every 200ms").
const POLL_INTERVAL: Duration = Duration::from_millis(200);

static DETACH_SENTINEL_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^//([^/:]+):(\d+)$").expect("valid detach sentinel regex")
});

/// Parse the `//file:pos` detach sentinel out of a binlog log-file string
/// (spec §4.H `ReattachSlave`, §6 detach sentinel format).
#[must_use]
pub fn parse_detach_sentinel(log_file: &str) -> Option<(String, i64)> {
    let captures = DETACH_SENTINEL_RE.captures(log_file)?;
    let file = captures.get(1)?.as_str().to_string();
    let pos: i64 = captures.get(2)?.as_str().parse().ok()?;
    Some((file, pos))
}

/// Build the sentinel string this module parses back in
/// [`parse_detach_sentinel`].
fn detach_sentinel(coords: &BinlogCoordinates) -> String {
    format!("//{}:{}", coords.log_file, coords.log_pos)
}

pub struct ReplicationControl {
    connector: TargetConnector,
    store: StoreGateway,
    resolver: HostnameResolver,
    audit: Arc<dyn AuditOperation>,
    prober_config: ProberConfig,
    slave_start_post_wait: Duration,
}

impl ReplicationControl {
    #[must_use]
    pub fn new(
        connector: TargetConnector,
        store: StoreGateway,
        resolver: HostnameResolver,
        audit: Arc<dyn AuditOperation>,
        prober_config: ProberConfig,
    ) -> Self {
        Self {
            connector,
            store,
            resolver,
            audit,
            prober_config,
            slave_start_post_wait: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_start_post_wait(mut self, delay: Duration) -> Self {
        self.slave_start_post_wait = delay;
        self
    }

    async fn probe(&self, key: &InstanceKey) -> Result<Instance> {
        prober::probe_target(&self.connector, &self.store, key, &self.resolver, &self.prober_config).await
    }

    async fn pool_for(&self, key: &InstanceKey) -> Result<MySqlPool> {
        self.connector.pool_for(key).await
    }

    fn precondition(current: &Instance, ok: bool, reason: &str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(Error::PreconditionFailed {
                key: current.key.clone(),
                reason: reason.to_string(),
            })
        }
    }

    async fn exec(&self, key: &InstanceKey, sql: &str) -> Result<()> {
        let pool = self.pool_for(key).await?;
        sqlx::query(sql)
            .execute(&pool)
            .await
            .map_err(|source| Error::QueryFailed {
                key: key.clone(),
                source,
            })?;
        Ok(())
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key))]
    pub async fn stop_slave(&self, key: &InstanceKey) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(&current, current.is_slave(), "instance is not a slave")?;
        self.exec(key, "STOP SLAVE").await?;
        self.probe(key).await
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key))]
    pub async fn start_slave(&self, key: &InstanceKey) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(&current, current.is_slave(), "instance is not a slave")?;
        self.exec(key, "START SLAVE").await?;
        if self.slave_start_post_wait > Duration::ZERO {
            tokio::time::sleep(self.slave_start_post_wait).await;
        }
        self.probe(key).await
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key))]
    pub async fn stop_slave_nicely(&self, key: &InstanceKey, timeout: Duration) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(&current, current.is_slave(), "instance is not a slave")?;

        self.exec(key, "STOP SLAVE IO_THREAD").await?;
        self.exec(key, "START SLAVE SQL_THREAD").await?;

        let started = Instant::now();
        loop {
            let probed = self.probe(key).await?;
            if probed.sql_thread_up_to_date() {
                self.exec(key, "STOP SLAVE").await?;
                return self.probe(key).await;
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    key: key.clone(),
                    elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    #[instrument(skip(self, target), level = "info", err, fields(key = %key))]
    pub async fn start_slave_until_master_coordinates(
        &self,
        key: &InstanceKey,
        target: &BinlogCoordinates,
    ) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(
            &current,
            current.is_slave() && !current.slave_running(),
            "instance must be a non-running slave",
        )?;

        let pool = self.pool_for(key).await?;
        sqlx::query("START SLAVE UNTIL MASTER_LOG_FILE = ?, MASTER_LOG_POS = ?")
            .bind(&target.log_file)
            .bind(target.log_pos)
            .execute(&pool)
            .await
            .map_err(|source| Error::QueryFailed {
                key: key.clone(),
                source,
            })?;

        loop {
            let probed = self.probe(key).await?;
            match probed.exec_binlog_coordinates.compare(target)? {
                std::cmp::Ordering::Less => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                std::cmp::Ordering::Equal => {
                    self.exec(key, "STOP SLAVE").await?;
                    return self.probe(key).await;
                }
                std::cmp::Ordering::Greater => {
                    return Err(Error::Overshoot {
                        key: key.clone(),
                        target: target.clone(),
                        observed: probed.exec_binlog_coordinates,
                    });
                }
            }
        }
    }

    #[instrument(skip(self, coords), level = "info", err, fields(key = %key))]
    pub async fn change_master_to(
        &self,
        key: &InstanceKey,
        master: &InstanceKey,
        coords: &BinlogCoordinates,
    ) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(&current, !current.slave_running(), "slave threads must be stopped")?;

        let pool = self.pool_for(key).await?;
        sqlx::query("CHANGE MASTER TO MASTER_HOST = ?, MASTER_PORT = ?, MASTER_LOG_FILE = ?, MASTER_LOG_POS = ?")
            .bind(&master.hostname)
            .bind(i64::from(master.port))
            .bind(&coords.log_file)
            .bind(coords.log_pos)
            .execute(&pool)
            .await
            .map_err(|source| Error::QueryFailed { key: key.clone(), source })?;

        let probed = self.probe(key).await?;
        self.audit.audit("change_master_to", key, &format!("master={master}"));
        Ok(probed)
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key))]
    pub async fn reset_slave(&self, key: &InstanceKey) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(&current, !current.slave_running(), "slave threads must be stopped")?;

        self.exec(key, "CHANGE MASTER TO MASTER_HOST = '_'").await?;
        self.exec(key, "RESET SLAVE").await?;

        let probed = self.probe(key).await?;
        self.audit.audit("reset_slave", key, "");
        Ok(probed)
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key))]
    pub async fn detach_slave(&self, key: &InstanceKey) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(&current, !current.slave_running(), "slave threads must be stopped")?;
        Self::precondition(&current, !current.is_detached(), "instance is already detached")?;

        let sentinel = detach_sentinel(&current.exec_binlog_coordinates);
        let pool = self.pool_for(key).await?;
        sqlx::query("CHANGE MASTER TO MASTER_LOG_FILE = ?, MASTER_LOG_POS = ?")
            .bind(sentinel)
            .bind(current.exec_binlog_coordinates.log_pos)
            .execute(&pool)
            .await
            .map_err(|source| Error::QueryFailed { key: key.clone(), source })?;

        let probed = self.probe(key).await?;
        self.audit.audit("detach_slave", key, "");
        Ok(probed)
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key))]
    pub async fn reattach_slave(&self, key: &InstanceKey) -> Result<Instance> {
        let current = self.probe(key).await?;
        Self::precondition(&current, !current.slave_running(), "slave threads must be stopped")?;

        let (file, pos) = parse_detach_sentinel(&current.exec_binlog_coordinates.log_file)
            .ok_or_else(|| Error::PreconditionFailed {
                key: key.clone(),
                reason: "instance is not detached".to_string(),
            })?;

        let pool = self.pool_for(key).await?;
        sqlx::query("CHANGE MASTER TO MASTER_LOG_FILE = ?, MASTER_LOG_POS = ?")
            .bind(file)
            .bind(pos)
            .execute(&pool)
            .await
            .map_err(|source| Error::QueryFailed { key: key.clone(), source })?;

        let probed = self.probe(key).await?;
        self.audit.audit("reattach_slave", key, "");
        Ok(probed)
    }

    #[instrument(skip(self, coords), level = "info", err, fields(key = %key))]
    pub async fn master_pos_wait(&self, key: &InstanceKey, coords: &BinlogCoordinates) -> Result<Instance> {
        let pool = self.pool_for(key).await?;
        sqlx::query("SELECT MASTER_POS_WAIT(?, ?)")
            .bind(&coords.log_file)
            .bind(coords.log_pos)
            .execute(&pool)
            .await
            .map_err(|source| Error::QueryFailed { key: key.clone(), source })?;
        self.probe(key).await
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key, read_only))]
    pub async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<Instance> {
        let pool = self.pool_for(key).await?;
        sqlx::query("SET GLOBAL READ_ONLY = ?")
            .bind(read_only)
            .execute(&pool)
            .await
            .map_err(|source| Error::QueryFailed { key: key.clone(), source })?;

        let probed = self.probe(key).await?;
        self.audit
            .audit("set_read_only", key, &format!("read_only={read_only}"));
        Ok(probed)
    }

    #[instrument(skip(self), level = "info", err, fields(key = %key, pid))]
    pub async fn kill_query(&self, key: &InstanceKey, pid: u64) -> Result<Instance> {
        // MySQL's `KILL` does not accept bound placeholders; `pid` is a
        // `u64` we formatted ourselves, never interpolated user text.
        self.exec(key, &format!("KILL QUERY {pid}")).await?;
        let probed = self.probe(key).await?;
        self.audit.audit("kill_query", key, &format!("pid={pid}"));
        Ok(probed)
    }

    #[instrument(skip(self), level = "debug", err, fields(key = %key))]
    pub async fn refresh_instance_slave_hosts(&self, key: &InstanceKey) -> Result<Instance> {
        // `FLUSH ERROR LOGS` twice works around a stale `SHOW SLAVE HOSTS`
        // cache on some MariaDB builds.
        self.exec(key, "FLUSH ERROR LOGS").await?;
        self.exec(key, "FLUSH ERROR LOGS").await?;
        info!(%key, "refreshed slave hosts");
        self.probe(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_sentinel_round_trips() {
        let coords = BinlogCoordinates::new("mysql-bin.000123", 456, crate::coordinates::LogType::Binary);
        let sentinel = detach_sentinel(&coords);
        assert_eq!(sentinel, "//mysql-bin.000123:456");

        let (file, pos) = parse_detach_sentinel(&sentinel).unwrap_or_else(|| panic!("sentinel should parse"));
        assert_eq!(file, "mysql-bin.000123");
        assert_eq!(pos, 456);
    }

    #[test]
    fn non_sentinel_log_file_does_not_parse() {
        assert!(parse_detach_sentinel("mysql-bin.000123").is_none());
    }

    #[test]
    fn sentinel_requires_digits_for_position() {
        assert!(parse_detach_sentinel("//mysql-bin.000123:abc").is_none());
    }
}
