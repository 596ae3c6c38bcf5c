//! Main binary entry point for pg-keeper.

use anyhow::{Context, Result};
use pg_keeper::args::{get_args, Command};
use pg_keeper::config::KeeperConfig;
use pg_keeper::error::ExitCode;
use pg_keeper::keeper_loop::{KeeperLoop, SignalFlags};
use pg_keeper::monitor_client::MonitorClient;
use pg_keeper::pg_controller::{PgCtlController, PostgresController};
use pg_keeper::role::Role;
use pg_keeper::state::{ControlData, KeeperState, StateStore};

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn main() -> Result<()> {
    let args = get_args()?;
    init_tracing(args.verbose);

    let exit_code = match args.command {
        Command::Create {
            monitor,
            formation,
            group,
            name,
            hostname,
            pgport,
            pgdata,
            dbname,
        } => run_create(
            &args.config,
            monitor,
            formation,
            group,
            name,
            hostname,
            pgport,
            pgdata,
            dbname,
        )?,
        Command::Run => run_loop(&args.config)?,
        Command::Drop => run_drop(&args.config)?,
        Command::DisableMonitor => {
            tracing::error!(
                "--monitor-disabled is not supported once a node has been registered; \
                 run `pg-keeper create` against a fresh pgdata instead"
            );
            ExitCode::BadConfig
        }
    };

    std::process::exit(exit_code as i32);
}

#[allow(clippy::too_many_arguments)]
fn run_create(
    config_path: &std::path::Path,
    monitor: String,
    formation: String,
    group: i32,
    name: String,
    hostname: String,
    pgport: u16,
    pgdata: std::path::PathBuf,
    dbname: String,
) -> Result<ExitCode> {
    let mut retry = pg_keeper::retry::ConnectionRetryPolicy::init();
    let mut client = MonitorClient::connect(&monitor).context("failed to connect to monitor")?;

    let state_path = config_path.with_extension("state");
    let init_marker_path = config_path.with_extension("init");
    let store = StateStore::new(state_path);

    // spec.md §4.4 steps 1-5 / §8 invariant I6: BEGIN, register_node, write
    // state file + init marker, COMMIT. If the local writes fail, the
    // registration never commits and any partial file is unlinked.
    let assigned = client.register_node_with(
        &formation,
        &name,
        &hostname,
        pgport as i32,
        0,
        &dbname,
        group,
        Role::Init,
        "postgres",
        100,
        true,
        &mut retry,
        |assigned| {
            let state = KeeperState::new_init(
                assigned.node_id,
                assigned.group_id,
                assigned.role,
                ControlData::default(),
            );

            store.write(&state)?;

            if let Err(e) = std::fs::write(&init_marker_path, b"") {
                let _ = store.remove();
                return Err(e).context(format!(
                    "failed to write init marker {}",
                    init_marker_path.display()
                ));
            }

            Ok(())
        },
    )?;

    tracing::info!(
        node_id = assigned.node_id,
        group_id = assigned.group_id,
        "registered node with monitor"
    );

    let pgdata_hba_path = pgdata.join("pg_hba.conf");
    let config = KeeperConfig {
        pgdata,
        formation,
        group: assigned.group_id,
        monitor_uri: monitor,
        name,
        hostname,
        pgport,
        dbname,
        pg_superuser: "postgres".to_string(),
        replication_password: None,
        replication_slot_name: None,
        replication_user: "pgautofailover_replicator".to_string(),
        hba_path: pgdata_hba_path,
        hba_auth_method: "trust".to_string(),
        max_backup_rate: "100M".to_string(),
        backup_directory: std::path::PathBuf::from("."),
        network_partition_timeout: std::time::Duration::from_secs(20),
        postgresql_restart_failure_timeout: std::time::Duration::from_secs(20),
        postgresql_restart_failure_max_retries: 3,
        keeper_sleep_time: std::time::Duration::from_secs(5),
        postgres_ping_retry_timeout: std::time::Duration::from_secs(5),
        ssl_active: false,
        ssl_cert_file: None,
        ssl_key_file: None,
    };

    let serialized = toml::to_string_pretty(&config).context("failed to serialize config")?;
    std::fs::write(config_path, serialized)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    Ok(ExitCode::Ok)
}

fn run_loop(config_path: &std::path::Path) -> Result<ExitCode> {
    let config = KeeperConfig::load(config_path)?;
    let state_path = config_path.with_extension("state");
    let store = StateStore::new(state_path);

    let signals = SignalFlags::new();
    signals.install()?;

    let controller = PgCtlController::new(&config.pgdata, "pg_ctl");

    let mut keeper_loop = KeeperLoop::new(
        config_path.to_path_buf(),
        store,
        controller,
        signals,
        config.clone(),
        "1.6".to_string(),
    );

    let mut monitor =
        MonitorClient::connect(&config.monitor_uri).context("failed to connect to monitor")?;

    keeper_loop.run(&mut monitor)
}

fn run_drop(config_path: &std::path::Path) -> Result<ExitCode> {
    let config = KeeperConfig::load(config_path)?;
    let state_path = config_path.with_extension("state");
    let store = StateStore::new(state_path);
    let state = store.read()?;

    let mut monitor =
        MonitorClient::connect(&config.monitor_uri).context("failed to connect to monitor")?;
    monitor.remove_node(&config.hostname, config.pgport as i32)?;

    let mut controller = PgCtlController::new(&config.pgdata, "pg_ctl");
    if controller.is_running()? {
        controller.stop()?;
    }

    store.remove()?;
    tracing::info!(node_id = state.node_id, "dropped node");

    Ok(ExitCode::Ok)
}
