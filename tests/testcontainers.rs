#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use common::unique_suffix;
use nix::unistd::geteuid;
use sqlx::MySqlPool;
use sqlx::Row;
use sqlx::mysql::MySqlPoolOptions;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use testcontainers_modules::mariadb::Mariadb;
use testcontainers_modules::testcontainers::{
    ContainerAsync, ImageExt, core::IntoContainerPort, runners::AsyncRunner,
};
use tokio::time::sleep;
use topo_orchestrator::control::ReplicationControl;
use topo_orchestrator::key::InstanceKey;
use topo_orchestrator::prober::{self, ProberConfig};
use topo_orchestrator::resolver::HostnameResolver;
use topo_orchestrator::store::memory::MemoryStore;
use topo_orchestrator::store::StoreGateway;
use topo_orchestrator::target::TargetConnector;

const MASTER_CONF: &str = r"[mariadb]
server_id=1
log_bin=mysql-bin
binlog_format=ROW
";

const REPLICA_CONF: &str = r"[mariadb]
server_id=2
relay_log=relay-bin
read_only=ON
";

fn socket_exists(host: &str) -> bool {
    if let Some(path) = host.strip_prefix("unix://") {
        Path::new(path).exists()
    } else {
        true
    }
}

fn find_container_runtime() -> Option<String> {
    if let Ok(existing) = env::var("DOCKER_HOST")
        && !existing.is_empty()
        && socket_exists(&existing)
    {
        return Some(existing);
    }

    let uid = geteuid().as_raw();
    let candidates = [
        format!("unix:///run/user/{uid}/podman/podman.sock"),
        "unix:///run/podman/podman.sock".to_string(),
        "unix:///var/run/podman/podman.sock".to_string(),
        "unix:///var/run/docker.sock".to_string(),
    ];

    candidates.into_iter().find(|c| socket_exists(c))
}

async fn connect(host: &str, port: u16) -> anyhow::Result<MySqlPool> {
    let dsn = format!("mysql://root@{host}:{port}/mysql");
    Ok(MySqlPoolOptions::new()
        .min_connections(1)
        .max_connections(3)
        .acquire_timeout(Duration::from_secs(20))
        .connect(&dsn)
        .await?)
}

async fn start_mariadb_with_conf(network: &str, name: &str, conf: &str) -> anyhow::Result<ContainerAsync<Mariadb>> {
    Mariadb::default()
        .with_env_var("MARIADB_ALLOW_EMPTY_ROOT_PASSWORD", "1")
        .with_env_var("MARIADB_ROOT_HOST", "%")
        .with_copy_to("/etc/mysql/mariadb.conf.d/replication.cnf", conf.as_bytes().to_vec())
        .with_network(network)
        .with_container_name(name)
        .start()
        .await
        .map_err(Into::into)
}

async fn pool_for_container(container: &ContainerAsync<Mariadb>) -> anyhow::Result<MySqlPool> {
    let port = container.get_host_port_ipv4(3306.tcp()).await?;
    let host = container.get_host().await?.to_string();
    connect(&host, port).await
}

async fn master_log_position(pool: &MySqlPool) -> anyhow::Result<(String, i64)> {
    let row = sqlx::query("SHOW MASTER STATUS").fetch_one(pool).await?;
    let file: String = row.try_get("File")?;
    let pos: i64 = row.try_get("Position")?;
    Ok((file, pos))
}

async fn wait_for_slave_running(pool: &MySqlPool) -> anyhow::Result<bool> {
    for _ in 0..30 {
        if let Some(row) = sqlx::query("SHOW SLAVE STATUS").fetch_optional(pool).await? {
            let io: Option<String> = row.try_get("Slave_IO_Running").ok();
            let sql: Option<String> = row.try_get("Slave_SQL_Running").ok();
            if io.as_deref() == Some("Yes") && sql.as_deref() == Some("Yes") {
                return Ok(true);
            }
        }
        sleep(Duration::from_secs(1)).await;
    }
    Ok(false)
}

/// Smoke-tests `ReadTopologyInstance` against one live, unreplicated server.
#[tokio::test]
async fn probes_live_mariadb_container() -> anyhow::Result<()> {
    let Some(docker_host) = find_container_runtime() else {
        eprintln!("No container runtime socket found, skipping container integration test");
        return Ok(());
    };
    // Safe: we control the variable name/value and keep it ASCII for child processes.
    unsafe { env::set_var("DOCKER_HOST", &docker_host) };

    let container = match Mariadb::default()
        .with_env_var("MARIADB_ALLOW_EMPTY_ROOT_PASSWORD", "1")
        .with_env_var("MARIADB_ROOT_HOST", "%")
        .start()
        .await
    {
        Ok(container) => container,
        Err(e) => {
            eprintln!("Skipping container integration test: {e}");
            return Ok(());
        }
    };

    let port = container.get_host_port_ipv4(3306.tcp()).await?;
    let host = container.get_host().await?.to_string();
    let pool = connect(&host, port).await?;

    let store = StoreGateway::new(Arc::new(MemoryStore::new()));
    let resolver = HostnameResolver::new();
    let config = ProberConfig::default();

    let key = InstanceKey::new(host, port);
    let instance = prober::read_topology_instance(&pool, &store, &key, &resolver, &config).await?;

    assert!(!instance.version.is_empty(), "probe should capture @@global.version");
    assert!(!instance.is_slave(), "unreplicated server has no master");
    assert!(instance.last_checked.is_some());

    let stored = store.read(&instance.key).await?;
    assert!(stored.is_some(), "successful probe should upsert the row");

    Ok(())
}

/// Exercises a real master/replica pair through [`ReplicationControl`]:
/// `stop_slave`, `start_slave`, and `stop_slave_nicely` (spec §8 scenario S5).
#[tokio::test]
async fn replication_control_round_trips_against_live_containers() -> anyhow::Result<()> {
    let Some(docker_host) = find_container_runtime() else {
        eprintln!("No container runtime socket found, skipping replication control test");
        return Ok(());
    };
    unsafe { env::set_var("DOCKER_HOST", &docker_host) };

    let suffix = unique_suffix();
    let network = format!("topo-repl-{suffix}");
    let master_name = format!("topo-master-{suffix}");
    let replica_name = format!("topo-replica-{suffix}");

    let master = match start_mariadb_with_conf(&network, &master_name, MASTER_CONF).await {
        Ok(container) => container,
        Err(e) => {
            eprintln!("Skipping replication control test: {e}");
            return Ok(());
        }
    };
    let replica = match start_mariadb_with_conf(&network, &replica_name, REPLICA_CONF).await {
        Ok(container) => container,
        Err(e) => {
            eprintln!("Skipping replication control test: {e}");
            return Ok(());
        }
    };

    let master_pool = pool_for_container(&master).await?;
    sqlx::query("CREATE USER IF NOT EXISTS 'repl'@'%' IDENTIFIED BY 'repl'")
        .execute(&master_pool)
        .await?;
    sqlx::query("GRANT REPLICATION SLAVE ON *.* TO 'repl'@'%'")
        .execute(&master_pool)
        .await?;
    sqlx::query("FLUSH PRIVILEGES").execute(&master_pool).await?;
    let (binlog_file, binlog_pos) = master_log_position(&master_pool).await?;

    let replica_pool = pool_for_container(&replica).await?;
    let change_master = format!(
        "CHANGE MASTER TO MASTER_HOST = '{master_name}', MASTER_USER = 'repl', \
         MASTER_PASSWORD = 'repl', MASTER_PORT = 3306, MASTER_LOG_FILE = '{binlog_file}', \
         MASTER_LOG_POS = {binlog_pos}"
    );
    sqlx::query(&change_master).execute(&replica_pool).await?;
    sqlx::query("START SLAVE").execute(&replica_pool).await?;

    assert!(
        wait_for_slave_running(&replica_pool).await?,
        "replica should catch up to running state before control operations begin"
    );

    let replica_host = replica.get_host().await?.to_string();
    let replica_port = replica.get_host_port_ipv4(3306.tcp()).await?;
    let key = InstanceKey::new(replica_host, replica_port);

    let store = StoreGateway::new(Arc::new(MemoryStore::new()));
    let resolver = HostnameResolver::new();
    let connector = TargetConnector::new(
        sqlx::mysql::MySqlConnectOptions::new()
            .host(&replica_host)
            .port(replica_port)
            .username("root"),
    );
    let control = ReplicationControl::new(
        connector,
        store,
        resolver,
        Arc::new(topo_orchestrator::audit::NoopAudit),
        ProberConfig::default(),
    );

    let stopped = control.stop_slave(&key).await?;
    assert!(!stopped.slave_running(), "stop_slave should halt both threads");

    let started = control.start_slave(&key).await?;
    assert!(started.is_slave());

    let nicely = control.stop_slave_nicely(&key, Duration::from_secs(20)).await?;
    assert!(
        nicely.sql_thread_up_to_date(),
        "stop_slave_nicely should leave the SQL thread caught up before stopping"
    );
    assert!(!nicely.slave_running());

    Ok(())
}
