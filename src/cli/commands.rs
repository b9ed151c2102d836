//! Subcommand definitions (spec §10.4): one per §4.H control operation, plus
//! `probe`/`refresh`/`topology` over the core read path.

use crate::config::Config;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "topo-orchestrator", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

/// `host:port` target shared by every per-instance subcommand.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Target instance, `host:port`.
    pub instance: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run `ReadTopologyInstance` against one instance and print the result.
    Probe(Target),

    /// Run `RefreshTopologyInstances` over every outdated key in the fleet
    /// (spec §4.G `ReadOutdatedInstanceKeys` + the topology-semaphore fan-out).
    Refresh,

    /// Print the derived topology (instances sharing a cluster name).
    Topology {
        /// Cluster name to list.
        cluster: String,
    },

    /// `STOP SLAVE`.
    StopSlave(Target),

    /// `START SLAVE`.
    StartSlave(Target),

    /// Stop a slave's SQL thread only once it has caught up to the IO
    /// thread, within `--timeout-ms`.
    StopSlaveNicely {
        #[command(flatten)]
        target: Target,

        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Fan `StopSlaveNicely` across every instance in a cluster (spec §4.G).
    StopSlavesNicely {
        /// Cluster name to target.
        cluster: String,

        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Fan `StartSlave` across every instance in a cluster (spec §4.G).
    StartSlaves {
        /// Cluster name to target.
        cluster: String,
    },

    /// `CHANGE MASTER TO` a new master and binlog coordinates.
    ChangeMaster {
        #[command(flatten)]
        target: Target,

        /// New master, `host:port`.
        master: String,

        /// Master binlog file to start from.
        log_file: String,

        /// Master binlog position to start from.
        log_pos: i64,
    },

    /// `RESET SLAVE`.
    ResetSlave(Target),

    /// Detach a slave from its master (reversible).
    DetachSlave(Target),

    /// Reverse a previous `detach-slave`.
    ReattachSlave(Target),

    /// `SET GLOBAL READ_ONLY`.
    SetReadOnly {
        #[command(flatten)]
        target: Target,

        #[arg(long)]
        read_only: bool,
    },

    /// `KILL QUERY <pid>`.
    KillQuery {
        #[command(flatten)]
        target: Target,

        pid: u64,
    },

    /// `SELECT MASTER_POS_WAIT(...)`.
    MasterPosWait {
        #[command(flatten)]
        target: Target,

        log_file: String,
        log_pos: i64,
    },

    /// `FLUSH ERROR LOGS` twice, then re-probe (spec §4.H
    /// `RefreshInstanceSlaveHosts`).
    RefreshSlaveHosts(Target),

    /// Forget one instance's row (spec §4.D `Forget`).
    Forget(Target),

    /// Delete rows unseen for longer than `--hours` (spec §4.D
    /// `ForgetUnseen`).
    ForgetUnseen {
        #[arg(long, default_value_t = 48)]
        hours: i64,
    },

    /// Recompute and persist `ClusterName`/`ReplicationDepth` for every row
    /// with `last_seen < last_checked` (spec §4.F `ReviewUnseenInstances`).
    ReviewUnseenInstances,

    /// Inject a skeletal row for every referenced-but-unprobed master (spec
    /// §4.F `InjectUnseenMasters`).
    InjectUnseenMasters,
}

