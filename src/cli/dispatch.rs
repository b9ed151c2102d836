//! Routes a parsed [`Command`] to the library core and prints the result.
//! `anyhow` lives only here — the CLI boundary, keeping the library core
//! on a typed `Result<T, Error>` throughout.

use super::commands::{Cli, Command};
use crate::audit::NoopAudit;
use crate::cluster;
use crate::config::Config;
use crate::control::ReplicationControl;
use crate::key::InstanceKey;
use crate::prober::ProberConfig;
use crate::resolver::HostnameResolver;
use crate::scheduler::FleetScheduler;
use crate::store::mysql::{HostAgentSnapshotEnrichment, MySqlStore};
use crate::store::{Condition, HostnameResolveStore, NoSnapshotEnrichment, SnapshotEnrichment, StoreGateway};
use crate::target::TargetConnector;
use anyhow::{Context, Result};
use chrono::Utc;
use secrecy::ExposeSecret;
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use std::time::Duration;

/// Parse, wire up the store/resolver/control stack from `config`, and
/// dispatch `command`.
pub async fn run(cli: Cli) -> Result<()> {
    let Cli { config, command } = cli;
    let pool = connect(&config).await?;
    let connector = TargetConnector::from_dsn(&config.target_dsn).context("invalid --target-dsn")?;
    let backend = Arc::new(MySqlStore::new(pool.clone()));
    let resolver_store: Arc<dyn HostnameResolveStore> = backend.clone();
    let resolver = HostnameResolver::with_store(resolver_store)
        .await
        .context("loading hostname_resolve mappings failed")?;
    let prober_config = ProberConfig {
        discover_by_show_slave_hosts: config.discover_by_show_slave_hosts,
        slave_lag_query: config.slave_lag_query.clone(),
    };
    // Agent snapshot enrichment is only queried when the operator has an
    // agent HTTP surface running to populate `host_agent` (spec §4.D, §6).
    let enrichment: Arc<dyn SnapshotEnrichment> = if config.serve_agents_http {
        Arc::new(HostAgentSnapshotEnrichment::new(pool.clone()))
    } else {
        Arc::new(NoSnapshotEnrichment)
    };
    let store = StoreGateway::with_capacity_and_enrichment(
        backend,
        config.store_read_concurrency,
        config.store_write_concurrency,
        enrichment,
    )
    .with_poll_interval_seconds(config.instance_poll_seconds);
    let control = ReplicationControl::new(
        connector.clone(),
        store.clone(),
        resolver.clone(),
        Arc::new(NoopAudit),
        prober_config.clone(),
    )
    .with_start_post_wait(Duration::from_millis(config.slave_start_post_wait_milliseconds));
    let scheduler = FleetScheduler::with_topology_capacity(
        connector.clone(),
        store.clone(),
        resolver.clone(),
        prober_config.clone(),
        config.topology_concurrency,
    );

    match command {
        Command::Probe(target) => {
            let key = parse_target(&target.instance)?;
            let instance = crate::prober::probe_target(&connector, &store, &key, &resolver, &prober_config)
                .await
                .context("probe failed")?;
            print_instance(&instance);
        }
        Command::Refresh => {
            let keys = scheduler
                .read_outdated_instance_keys(config.instance_poll_seconds)
                .await
                .context("reading outdated keys failed")?;
            for outcome in scheduler.refresh_topology_instances(&keys).await {
                match outcome.result {
                    Ok(instance) => print_instance(&instance),
                    Err(error) => eprintln!("{}: {error}", outcome.key),
                }
            }
        }
        Command::Topology { cluster } => {
            let instances = store
                .read_by_condition(&Condition::by_cluster(cluster)?)
                .await
                .context("reading cluster members failed")?;
            for instance in &instances {
                println!(
                    "{}  depth={}  master={}",
                    instance.key, instance.replication_depth, instance.master_key
                );
            }
        }
        Command::StopSlave(target) => {
            print_instance(&control.stop_slave(&parse_target(&target.instance)?).await?);
        }
        Command::StartSlave(target) => {
            print_instance(&control.start_slave(&parse_target(&target.instance)?).await?);
        }
        Command::StopSlaveNicely { target, timeout_ms } => {
            print_instance(
                &control
                    .stop_slave_nicely(&parse_target(&target.instance)?, Duration::from_millis(timeout_ms))
                    .await?,
            );
        }
        Command::StopSlavesNicely { cluster, timeout_ms } => {
            let keys = cluster_keys(&store, &cluster).await?;
            for outcome in scheduler
                .stop_slaves_nicely(&control, &keys, Duration::from_millis(timeout_ms))
                .await
            {
                match outcome.result {
                    Ok(instance) => print_instance(&instance),
                    Err(error) => eprintln!("{}: {error}", outcome.key),
                }
            }
        }
        Command::StartSlaves { cluster } => {
            let keys = cluster_keys(&store, &cluster).await?;
            for outcome in scheduler.start_slaves(&control, &keys).await {
                match outcome.result {
                    Ok(instance) => print_instance(&instance),
                    Err(error) => eprintln!("{}: {error}", outcome.key),
                }
            }
        }
        Command::ChangeMaster { target, master, log_file, log_pos } => {
            let master_key = parse_target(&master)?;
            let coords = crate::coordinates::BinlogCoordinates::new(log_file, log_pos, crate::coordinates::LogType::Binary);
            print_instance(
                &control
                    .change_master_to(&parse_target(&target.instance)?, &master_key, &coords)
                    .await?,
            );
        }
        Command::ResetSlave(target) => {
            print_instance(&control.reset_slave(&parse_target(&target.instance)?).await?);
        }
        Command::DetachSlave(target) => {
            print_instance(&control.detach_slave(&parse_target(&target.instance)?).await?);
        }
        Command::ReattachSlave(target) => {
            print_instance(&control.reattach_slave(&parse_target(&target.instance)?).await?);
        }
        Command::SetReadOnly { target, read_only } => {
            print_instance(&control.set_read_only(&parse_target(&target.instance)?, read_only).await?);
        }
        Command::KillQuery { target, pid } => {
            print_instance(&control.kill_query(&parse_target(&target.instance)?, pid).await?);
        }
        Command::MasterPosWait { target, log_file, log_pos } => {
            let coords = crate::coordinates::BinlogCoordinates::new(log_file, log_pos, crate::coordinates::LogType::Binary);
            print_instance(&control.master_pos_wait(&parse_target(&target.instance)?, &coords).await?);
        }
        Command::RefreshSlaveHosts(target) => {
            print_instance(&control.refresh_instance_slave_hosts(&parse_target(&target.instance)?).await?);
        }
        Command::Forget(target) => {
            let key = parse_target(&target.instance)?;
            store.forget(&key).await?;
            connector.forget(&key).await;
        }
        Command::ForgetUnseen { hours } => {
            let removed = store.forget_unseen(hours, Utc::now()).await?;
            println!("forgot {removed} unseen instances");
        }
        Command::ReviewUnseenInstances => {
            let updated = cluster::review_unseen_instances(&store).await?;
            println!("updated {updated} instances");
        }
        Command::InjectUnseenMasters => {
            let injected = cluster::inject_unseen_masters(&store).await?;
            println!("injected {injected} skeletal masters");
        }
    }

    Ok(())
}

async fn cluster_keys(store: &StoreGateway, cluster: &str) -> Result<Vec<InstanceKey>> {
    let instances = store
        .read_by_condition(&Condition::by_cluster(cluster.to_string())?)
        .await
        .context("reading cluster members failed")?;
    Ok(instances.into_iter().map(|instance| instance.key).collect())
}

async fn connect(config: &Config) -> Result<sqlx::MySqlPool> {
    MySqlPoolOptions::new()
        .max_connections(u32::try_from(config.topology_concurrency).unwrap_or(u32::MAX))
        .connect(config.store_dsn.expose_secret())
        .await
        .context("failed to connect to backend store")
}

fn parse_target(raw: &str) -> Result<InstanceKey> {
    let (host, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {raw:?}"))?;
    Ok(InstanceKey::parse(host, port)?)
}

fn print_instance(instance: &crate::instance::Instance) {
    println!(
        "{}  version={}  cluster={}  depth={}  slave_running={}",
        instance.key,
        instance.version,
        instance.cluster_name,
        instance.replication_depth,
        instance.slave_running()
    );
}
