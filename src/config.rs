//! Runtime configuration (spec §6, §10.3).
//!
//! A plain struct the library core consumes; `clap` only appears in
//! [`Config::parse`], so nothing below `cli/` depends on a CLI framework.

use clap::Parser;
use secrecy::SecretString;

use crate::store::DEFAULT_STORE_CONCURRENCY;

/// Topology-semaphore capacity (spec §4.G: "capacity 100").
pub const DEFAULT_TOPOLOGY_CONCURRENCY: usize = 100;

#[derive(Parser, Debug, Clone)]
#[command(name = "topo-orchestrator", about = "Topology discovery and replication control for MySQL-style fleets")]
pub struct Config {
    /// DSN for the backend store (spec §6).
    #[arg(long, env = "TOPO_STORE_DSN")]
    pub store_dsn: SecretString,

    /// Shared credentials used to dial every fleet member (spec §4.E step
    /// 2, §9). Its host/port are a placeholder; `TargetConnector` overrides
    /// them with each probed instance's own `(host, port)`.
    #[arg(long, env = "TOPO_TARGET_DSN")]
    pub target_dsn: SecretString,

    /// Whether `ReadTopologyInstance` tries `SHOW SLAVE HOSTS` before
    /// falling back to `information_schema.processlist` (spec §4.E.7).
    #[arg(long, env = "TOPO_DISCOVER_BY_SHOW_SLAVE_HOSTS", default_value_t = true)]
    pub discover_by_show_slave_hosts: bool,

    /// Operator-supplied query overriding `SecondsBehindMaster` as the slave
    /// lag measure (spec §4.E.11). When unset, `SlaveLagSeconds =
    /// SecondsBehindMaster`.
    #[arg(long, env = "TOPO_SLAVE_LAG_QUERY")]
    pub slave_lag_query: Option<String>,

    /// Poll interval used to judge instance freshness (spec §4.D, §4.G).
    #[arg(long, env = "TOPO_INSTANCE_POLL_SECONDS", default_value_t = 60)]
    pub instance_poll_seconds: i64,

    /// `ForgetUnseen` horizon (spec §4.D).
    #[arg(long, env = "TOPO_UNSEEN_INSTANCE_FORGET_HOURS", default_value_t = 48)]
    pub unseen_instance_forget_hours: i64,

    /// Delay after `START SLAVE` before re-probing (spec §4.H `StartSlave`).
    #[arg(long, env = "TOPO_SLAVE_START_POST_WAIT_MILLISECONDS", default_value_t = 0)]
    pub slave_start_post_wait_milliseconds: u64,

    /// Gates the optional host-agent snapshot-count enrichment hook
    /// (spec §4.D, §10.3). The HTTP endpoint itself is out of scope; this
    /// flag only controls whether the read path queries for it.
    #[arg(long, env = "TOPO_SERVE_AGENTS_HTTP", default_value_t = false)]
    pub serve_agents_http: bool,

    /// Topology semaphore capacity (spec §4.G).
    #[arg(long, env = "TOPO_TOPOLOGY_CONCURRENCY", default_value_t = DEFAULT_TOPOLOGY_CONCURRENCY)]
    pub topology_concurrency: usize,

    /// Backend-store read semaphore capacity (spec §4.D).
    #[arg(long, env = "TOPO_STORE_READ_CONCURRENCY", default_value_t = DEFAULT_STORE_CONCURRENCY)]
    pub store_read_concurrency: usize,

    /// Backend-store write semaphore capacity (spec §4.D).
    #[arg(long, env = "TOPO_STORE_WRITE_CONCURRENCY", default_value_t = DEFAULT_STORE_CONCURRENCY)]
    pub store_write_concurrency: usize,
}
