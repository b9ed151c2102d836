//! The central `Instance` record (spec §3, §4.B).

use crate::coordinates::{BinlogCoordinates, LogType};
use crate::key::InstanceKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The probed-plus-derived state of one server.
///
/// Constructed with `Instance::new(key)`, which sets every field to a safe
/// zero default — an `Instance` with no probe data is a valid, inert value,
/// not a partially-initialized one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    // Identity
    pub key: InstanceKey,
    pub server_id: i64,
    pub version: String,

    // Configuration
    pub read_only: bool,
    pub binlog_format: String,
    pub log_bin_enabled: bool,
    pub log_slave_updates_enabled: bool,

    // Replication pointers
    pub master_key: InstanceKey,
    pub slave_io_running: bool,
    pub slave_sql_running: bool,
    pub using_oracle_gtid: bool,
    pub using_mariadb_gtid: bool,
    pub using_pseudo_gtid: bool,
    pub last_sql_error: String,
    pub last_io_error: String,
    pub seconds_behind_master: Option<i64>,
    pub slave_lag_seconds: Option<i64>,

    // Positions
    pub self_binlog_coordinates: BinlogCoordinates,
    pub read_binlog_coordinates: BinlogCoordinates,
    pub exec_binlog_coordinates: BinlogCoordinates,
    pub relaylog_coordinates: BinlogCoordinates,

    // Topology
    pub slave_hosts: BTreeSet<InstanceKey>,
    pub cluster_name: String,
    pub replication_depth: u32,
    pub binary_logs: Vec<String>,

    // Freshness, derived on read (see `Instance::refresh_freshness`)
    #[serde(skip)]
    pub is_up_to_date: bool,
    #[serde(skip)]
    pub is_recently_checked: bool,
    #[serde(skip)]
    pub is_last_check_valid: bool,
    #[serde(skip)]
    pub seconds_since_last_seen: Option<i64>,

    // External enrichment
    pub count_mysql_snapshots: i64,

    // Store bookkeeping, exposed so callers can apply §8 invariants.
    pub last_checked: Option<DateTime<Utc>>,
    pub last_attempted_check: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Instance {
    /// An `Instance` with safe zero defaults for `key`.
    #[must_use]
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            server_id: 0,
            version: String::new(),
            read_only: false,
            binlog_format: String::new(),
            log_bin_enabled: false,
            log_slave_updates_enabled: false,
            master_key: InstanceKey::empty(),
            slave_io_running: false,
            slave_sql_running: false,
            using_oracle_gtid: false,
            using_mariadb_gtid: false,
            using_pseudo_gtid: false,
            last_sql_error: String::new(),
            last_io_error: String::new(),
            seconds_behind_master: None,
            slave_lag_seconds: None,
            self_binlog_coordinates: BinlogCoordinates::empty(LogType::Binary),
            read_binlog_coordinates: BinlogCoordinates::empty(LogType::Binary),
            exec_binlog_coordinates: BinlogCoordinates::empty(LogType::Binary),
            relaylog_coordinates: BinlogCoordinates::empty(LogType::Relay),
            slave_hosts: BTreeSet::new(),
            cluster_name: String::new(),
            replication_depth: 0,
            binary_logs: Vec::new(),
            is_up_to_date: false,
            is_recently_checked: false,
            is_last_check_valid: false,
            seconds_since_last_seen: None,
            count_mysql_snapshots: 0,
            last_checked: None,
            last_attempted_check: None,
            last_seen: None,
        }
    }

    /// A minimal, "injected" record for a master that was referenced but
    /// never itself probed (spec §3 Lifecycles, §4.F `InjectUnseenMasters`).
    #[must_use]
    pub fn injected_unseen(key: InstanceKey) -> Self {
        let mut instance = Self::new(key.clone());
        instance.version = "Unknown".to_string();
        instance.cluster_name = key.to_string();
        instance.last_checked = None;
        instance
    }

    /// Insert a slave key into the set (duplicate tolerant, order
    /// irrelevant — a `BTreeSet` gives us both for free plus deterministic
    /// serialisation).
    pub fn add_slave_key(&mut self, key: InstanceKey) {
        self.slave_hosts.insert(key);
    }

    /// Replace the ordered binlog file sequence.
    pub fn set_binary_logs(&mut self, logs: Vec<String>) {
        self.binary_logs = logs;
    }

    #[must_use]
    pub fn is_slave(&self) -> bool {
        !self.master_key.hostname.is_empty()
    }

    #[must_use]
    pub fn slave_running(&self) -> bool {
        self.slave_io_running && self.slave_sql_running
    }

    #[must_use]
    pub fn sql_thread_up_to_date(&self) -> bool {
        self.read_binlog_coordinates == self.exec_binlog_coordinates
    }

    /// A detached instance carries the `//host:pos` sentinel in its exec
    /// coordinates' log file (spec §3 invariant 7, §6 detach sentinel
    /// format).
    #[must_use]
    pub fn is_detached(&self) -> bool {
        crate::control::parse_detach_sentinel(&self.exec_binlog_coordinates.log_file).is_some()
    }

    /// Recompute the derived freshness predicates against `now` and the
    /// configured poll interval. Called after a store read (spec §4.D).
    pub fn refresh_freshness(&mut self, now: DateTime<Utc>, poll_interval_seconds: i64) {
        self.is_last_check_valid = matches!(
            (self.last_attempted_check, self.last_checked),
            (Some(attempted), Some(checked)) if attempted <= checked
        );

        self.is_recently_checked = self
            .last_checked
            .is_some_and(|checked| (now - checked).num_seconds() < poll_interval_seconds);

        self.is_up_to_date = self.is_last_check_valid && self.is_recently_checked;

        self.seconds_since_last_seen = self.last_seen.map(|seen| (now - seen).num_seconds());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> InstanceKey {
        InstanceKey::new("db1", 3306)
    }

    #[test]
    fn new_instance_has_safe_defaults() {
        let instance = Instance::new(key());
        assert!(!instance.is_slave());
        assert!(!instance.slave_running());
        assert!(instance.sql_thread_up_to_date());
        assert!(instance.slave_hosts.is_empty());
        assert!(instance.last_checked.is_none());
    }

    #[test]
    fn injected_unseen_has_skeletal_fields() {
        let instance = Instance::injected_unseen(InstanceKey::new("dbX", 3306));
        assert_eq!(instance.version, "Unknown");
        assert_eq!(instance.cluster_name, "dbX:3306");
        assert!(instance.last_checked.is_none());
    }

    #[test]
    fn add_slave_key_is_duplicate_tolerant() {
        let mut instance = Instance::new(key());
        instance.add_slave_key(InstanceKey::new("slave1", 3306));
        instance.add_slave_key(InstanceKey::new("slave1", 3306));
        instance.add_slave_key(InstanceKey::new("slave2", 3306));
        assert_eq!(instance.slave_hosts.len(), 2);
    }

    #[test]
    fn is_slave_tracks_master_key() {
        let mut instance = Instance::new(key());
        assert!(!instance.is_slave());
        instance.master_key = InstanceKey::new("master1", 3306);
        assert!(instance.is_slave());
    }

    #[test]
    fn slave_running_requires_both_threads() {
        let mut instance = Instance::new(key());
        instance.slave_io_running = true;
        assert!(!instance.slave_running());
        instance.slave_sql_running = true;
        assert!(instance.slave_running());
    }

    #[test]
    fn sql_thread_up_to_date_compares_read_and_exec() {
        let mut instance = Instance::new(key());
        instance.read_binlog_coordinates = BinlogCoordinates::new("bin.9", 200, LogType::Binary);
        instance.exec_binlog_coordinates = BinlogCoordinates::new("bin.9", 100, LogType::Binary);
        assert!(!instance.sql_thread_up_to_date());
        instance.exec_binlog_coordinates = BinlogCoordinates::new("bin.9", 200, LogType::Binary);
        assert!(instance.sql_thread_up_to_date());
    }
}
