//! The control loop (spec.md §4.7): the eleven-step sequence run once per
//! iteration, ported from `keeper_service_run` in the original keeper's
//! `service_keeper.c`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::{ConfigReloader, KeeperConfig};
use crate::error::ExitCode;
use crate::fsm::FsmReconciler;
use crate::hba::HbaManager;
use crate::monitor_client::MonitorClient;
use crate::pg_controller::PostgresController;
use crate::role::{Role, RoleFilter};
use crate::state::{now, KeeperState, LocalPgState, NodeAddress, StateStore};

/// The three signal intents the loop honors between steps (spec.md §5).
/// Reload is checked at the top of the loop; stop/stop_fast are checked at
/// every `CHECK_FOR_FAST_SHUTDOWN` point, modeled here as every step
/// boundary.
#[derive(Clone)]
pub struct SignalFlags {
    pub reload: Arc<AtomicBool>,
    pub stop: Arc<AtomicBool>,
    pub stop_fast: Arc<AtomicBool>,
}

impl SignalFlags {
    pub fn new() -> Self {
        SignalFlags {
            reload: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            stop_fast: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.stop_fast.load(Ordering::SeqCst)
    }

    /// Installs the three `ctrlc`-driven handlers. SIGHUP maps to reload;
    /// SIGTERM to graceful stop; SIGINT (a second Ctrl-C, typically) to
    /// stop-fast. `ctrlc` only lets us hook one signal set portably, so we
    /// treat the first Ctrl-C as graceful stop and record a fast-stop
    /// request if it fires again.
    pub fn install(&self) -> Result<()> {
        let stop = self.stop.clone();
        let stop_fast = self.stop_fast.clone();
        ctrlc::set_handler(move || {
            if stop.swap(true, Ordering::SeqCst) {
                stop_fast.store(true, Ordering::SeqCst);
            }
        })?;
        Ok(())
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the loop needs to carry between iterations.
pub struct KeeperLoop<C: PostgresController> {
    pub config_path: std::path::PathBuf,
    pub state_store: StateStore,
    pub controller: C,
    pub signals: SignalFlags,
    pub config: KeeperConfig,
    pub extension_version_expected: String,
    pub loop_sleep_time: Duration,
    pub other_nodes: Vec<NodeAddress>,
    made_transition_last_iteration: bool,
    /// Restart-failure bookkeeping (spec.md §4.6), carried across iterations
    /// since a fresh `LocalPgState` is built from the probe every time.
    pg_start_retries: u32,
    pg_first_start_failure_ts: u64,
}

impl<C: PostgresController> KeeperLoop<C> {
    pub fn new(
        config_path: std::path::PathBuf,
        state_store: StateStore,
        controller: C,
        signals: SignalFlags,
        config: KeeperConfig,
        extension_version_expected: String,
    ) -> Self {
        let loop_sleep_time = config.keeper_sleep_time;
        KeeperLoop {
            config_path,
            state_store,
            controller,
            signals,
            config,
            extension_version_expected,
            loop_sleep_time,
            other_nodes: Vec::new(),
            made_transition_last_iteration: false,
            pg_start_retries: 0,
            pg_first_start_failure_ts: 0,
        }
    }

    /// Step 1 of the iteration sequence: re-read configuration when a
    /// reload was requested, rejecting illegal changes without aborting the
    /// loop (spec.md §4.8). Side effects that need the node's assigned ID
    /// (like pushing a metadata update) are applied by the caller once
    /// `KeeperState` has been re-read for this iteration.
    fn maybe_reload_config(&mut self) -> Option<crate::config::ReloadEffects> {
        if !self.signals.reload.swap(false, Ordering::SeqCst) {
            return None;
        }

        let new_config = match KeeperConfig::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to parse reloaded configuration, keeping old one");
                return None;
            }
        };

        let rejected = ConfigReloader::validate_change(&self.config, &new_config);
        if !rejected.is_empty() {
            let summary = rejected
                .iter()
                .map(|r| format!("{}: {}", r.field, r.reason))
                .collect::<Vec<_>>()
                .join("; ");
            let err = crate::error::KeeperError::ConfigRejected(summary);
            tracing::error!(error = %err, "rejected configuration reload");
            return None;
        }

        let effects = ConfigReloader::effects(&self.config, &new_config);
        self.config = new_config;
        tracing::info!("configuration reloaded");
        Some(effects)
    }

    /// Runs iterations until a stop signal is observed. Returns the process
    /// exit code that should be used (spec.md §6): non-`Ok` only when the
    /// monitor extension version check demands a relaunch.
    pub fn run(&mut self, monitor: &mut MonitorClient) -> Result<ExitCode> {
        let mut first_iteration = true;

        loop {
            if self.signals.should_stop() {
                return Ok(ExitCode::Ok);
            }

            match self.run_one_iteration(monitor, first_iteration) {
                Ok(IterationOutcome::Continue) => {}
                Ok(IterationOutcome::ExitForRelaunch) => return Ok(ExitCode::Monitor),
                Err(e) => {
                    tracing::warn!(error = %e, "keeper loop iteration failed, continuing");
                }
            }
            first_iteration = false;

            if self.signals.should_stop() {
                return Ok(ExitCode::Ok);
            }

            if !self.made_transition_last_iteration {
                std::thread::sleep(self.loop_sleep_time);
            }
        }
    }

    fn run_one_iteration(
        &mut self,
        monitor: &mut MonitorClient,
        first_iteration: bool,
    ) -> Result<IterationOutcome> {
        // Step 1: config reload, tolerated even before Postgres is up on the
        // first iteration.
        let _ = first_iteration;
        let reload_effects = self.maybe_reload_config();

        if self.signals.should_stop() {
            return Ok(IterationOutcome::Continue);
        }

        // Step 3/4: pidfile ownership check is delegated to the
        // PostgresController implementation; re-read persisted state.
        let mut state = self.state_store.read()?;

        if let Some(effects) = reload_effects {
            if effects.push_metadata_update {
                if let Err(e) = monitor.update_node_metadata(
                    state.node_id,
                    &self.config.name,
                    &self.config.hostname,
                    self.config.pgport as i32,
                ) {
                    tracing::warn!(error = %e, "failed to push metadata update to monitor");
                }
            }
            if effects.regenerate_postgres_settings {
                tracing::info!(
                    "TLS settings changed, Postgres configuration will be regenerated"
                );
            }
        }

        // Step 5: probe. A connection failure just means Postgres isn't up;
        // fall back to on-disk control data and carry on (spec.md §4.1/§7:
        // "treat pgIsRunning=false as data, not error").
        let mut local = LocalPgState::default();
        local.control = state.control;
        local.retries = self.pg_start_retries;
        local.first_failure_ts = self.pg_first_start_failure_ts;

        let mut local_client = postgres::Client::connect(&self.config.local_pg_conninfo(), postgres::NoTls).ok();

        let probe_input = crate::probe::ProbeInput {
            configured_port: self.config.pgport,
            pidfile_port: None,
            current_role: state.current_role,
            known_control: state.control,
        };

        if let Some(client) = local_client.as_mut() {
            match crate::probe::PostgresProbe::probe_running_instance(client, &probe_input, &mut local) {
                Ok(_pg_is_in_recovery) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to probe running Postgres instance");
                    local_client = None;
                }
            }
        }

        if local_client.is_none() {
            let reader = crate::probe::PgControlDataReader::new("pg_controldata", &self.config.pgdata);
            if let Err(e) =
                crate::probe::PostgresProbe::probe_stopped_instance(&reader, &state.control, &mut local)
            {
                tracing::warn!(error = %e, "failed to read on-disk control data");
            }
        }

        if let Err(e) =
            crate::probe::PostgresProbe::check_probe_result(state.current_role, &state.control, &local)
        {
            tracing::error!(error = %e, "probe result rejected");
        }

        if local.control.system_identifier != 0 {
            state.control = local.control;
        }

        if self.signals.should_stop() {
            return Ok(IterationOutcome::Continue);
        }

        // Phase A: ensure the current role's Postgres running-ness, drive
        // slot maintenance, before we even talk to the monitor (spec.md
        // §4.6). Uses the *previously* assigned role from persisted state;
        // the freshly assigned role (if any) only matters for Phase B below.
        let advance_enabled = crate::slots::advance_enabled(
            local.control.pg_control_version,
            local.server_version_num,
        );
        let ensure_result = match local_client.as_mut() {
            Some(client) => crate::fsm::FsmReconciler::ensure_current_state(
                state.current_role,
                state.assigned_role,
                &mut self.controller,
                &mut local,
                Some(client),
                &self.other_nodes,
                advance_enabled,
            ),
            None => crate::fsm::FsmReconciler::ensure_current_state(
                state.current_role,
                state.assigned_role,
                &mut self.controller,
                &mut local,
                None::<&mut postgres::Client>,
                &self.other_nodes,
                advance_enabled,
            ),
        };
        if let Err(e) = ensure_result {
            tracing::warn!(error = %e, "ensure-current-state failed, will retry next iteration");
        }
        self.pg_start_retries = local.retries;
        self.pg_first_start_failure_ts = local.first_failure_ts;

        if self.signals.should_stop() {
            return Ok(IterationOutcome::Continue);
        }

        // Step 6: version-check the monitor extension.
        match monitor.get_extension_version() {
            Ok(installed) if installed != self.extension_version_expected => {
                tracing::error!(
                    expected = %self.extension_version_expected,
                    installed = %installed,
                    "monitor extension version mismatch, exiting for relaunch"
                );
                return Ok(IterationOutcome::ExitForRelaunch);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to check monitor extension version");
            }
        }

        // Step 7: NodeActive heartbeat.
        let report_pg_is_running = self.report_pg_is_running(state.current_role, &mut local);
        let node_active_result = monitor.node_active(
            &self.config.formation,
            state.node_id,
            state.group_id,
            state.current_role,
            report_pg_is_running,
            &local.current_lsn,
            &local.sync_state,
        );

        let mut assigned_role = state.assigned_role;

        match node_active_result {
            Ok(assigned) => {
                // Step 8: refresh monitor contact + peers, diff and apply HBA.
                state.last_monitor_contact = now();
                assigned_role = assigned.role;

                if let Ok(fresh_peers) = monitor.get_other_nodes(state.node_id, RoleFilter::AnyState) {
                    let diff = HbaManager::diff(&self.other_nodes, &fresh_peers, false);
                    if !diff.is_empty() {
                        match HbaManager::ensure_host_rules_exist(
                            &self.config.hba_path,
                            &diff,
                            self.config.ssl_active,
                            &self.config.dbname,
                            &self.config.replication_user,
                            &self.config.hba_auth_method,
                        ) {
                            Ok(appended) => {
                                tracing::info!(count = appended.len(), "appended HBA rules for new peers");
                                if local.pg_is_running {
                                    if let Err(e) = self.controller.reload() {
                                        tracing::warn!(error = %e, "failed to reload Postgres after HBA update");
                                    }
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to update pg_hba.conf"),
                        }
                    }
                    self.other_nodes = fresh_peers;
                }

                if assigned.group_id != state.group_id {
                    tracing::info!(
                        old = state.group_id,
                        new = assigned.group_id,
                        "group_id changed, Postgres settings must be reapplied"
                    );
                    state.group_id = assigned.group_id;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "NodeActive failed");

                if state.current_role == Role::Primary {
                    assigned_role = self.network_partition_check(&mut state, &local);
                }
            }
        }

        // Step 9: FSM reconciliation, Phase B.
        let (new_role, action) =
            FsmReconciler::transition(state.current_role, assigned_role, &mut self.controller);
        self.made_transition_last_iteration =
            matches!(action, crate::fsm::ReconcileAction::Transitioned { .. });
        state.current_role = new_role;
        state.assigned_role = assigned_role;

        // Step 10: persist.
        self.state_store.write(&state)?;

        // Step 11: close the local Postgres connection; the monitor
        // connection is held open across iterations by the caller.
        drop(local_client);

        Ok(IterationOutcome::Continue)
    }

    /// The `pgIsRunning` report rule (spec.md §4.7, §8 I4): in `Primary`,
    /// suppress an immediate `false` report until retries or the timeout are
    /// exhausted, to avoid triggering a failover on a transient restart.
    pub fn report_pg_is_running(&self, current_role: Role, local: &mut LocalPgState) -> bool {
        if current_role != Role::Primary || local.pg_is_running {
            return local.pg_is_running;
        }

        let retries_exhausted = local.retries >= self.config.postgresql_restart_failure_max_retries;
        let timed_out = local.first_failure_ts != 0
            && now().saturating_sub(local.first_failure_ts)
                > self.config.postgresql_restart_failure_timeout.as_secs();

        !(retries_exhausted || timed_out)
    }

    /// Network-partition self-demotion check (spec.md §4.7, §8 I7). Returns
    /// the role to assign locally: `DemoteTimeout` when partitioned,
    /// otherwise `Primary` unchanged.
    pub fn network_partition_check(&self, state: &mut KeeperState, local: &LocalPgState) -> Role {
        if local.pg_is_running && !local.sync_state.is_empty() {
            state.last_secondary_contact = now();
            return Role::Primary;
        }

        let monitor_lag = now().saturating_sub(state.last_monitor_contact);
        let secondary_lag = now().saturating_sub(state.last_secondary_contact);
        let timeout = self.config.network_partition_timeout.as_secs();

        let monitor_ok = state.last_monitor_contact != 0 && monitor_lag <= timeout;
        let secondary_ok = state.last_secondary_contact != 0 && secondary_lag <= timeout;

        if monitor_ok || secondary_ok {
            return Role::Primary;
        }

        if state.last_monitor_contact != 0 && state.last_secondary_contact != 0 {
            tracing::error!("network partition detected, demoting to avoid split-brain");
            return Role::DemoteTimeout;
        }

        Role::Primary
    }
}

enum IterationOutcome {
    Continue,
    ExitForRelaunch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg_controller::fake::FakeController;
    use crate::state::ControlData;
    use tempfile::tempdir;

    fn sample_config() -> crate::config::KeeperConfig {
        crate::config::KeeperConfig {
            pgdata: std::path::PathBuf::from("/var/lib/postgresql/data"),
            formation: "default".to_string(),
            group: 0,
            monitor_uri: "postgres://monitor".to_string(),
            name: "node1".to_string(),
            hostname: "node1.local".to_string(),
            pgport: 5432,
            dbname: "postgres".to_string(),
            pg_superuser: "postgres".to_string(),
            replication_password: None,
            replication_slot_name: None,
            replication_user: "pgautofailover_replicator".to_string(),
            hba_path: std::path::PathBuf::from("/var/lib/postgresql/data/pg_hba.conf"),
            hba_auth_method: "trust".to_string(),
            max_backup_rate: "100M".to_string(),
            backup_directory: std::path::PathBuf::from("/var/backups"),
            network_partition_timeout: Duration::from_secs(20),
            postgresql_restart_failure_timeout: Duration::from_secs(20),
            postgresql_restart_failure_max_retries: 3,
            keeper_sleep_time: Duration::from_secs(5),
            postgres_ping_retry_timeout: Duration::from_secs(5),
            ssl_active: false,
            ssl_cert_file: None,
            ssl_key_file: None,
        }
    }

    fn loop_for_test() -> KeeperLoop<FakeController> {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("keeper.state"));
        KeeperLoop::new(
            dir.path().join("keeper.cfg"),
            store,
            FakeController::default(),
            SignalFlags::new(),
            sample_config(),
            "1.6".to_string(),
        )
    }

    #[test]
    fn report_rule_passes_through_non_primary_roles() {
        let keeper_loop = loop_for_test();
        let mut local = LocalPgState {
            pg_is_running: false,
            ..Default::default()
        };
        assert!(!keeper_loop.report_pg_is_running(Role::Secondary, &mut local));
    }

    #[test]
    fn report_rule_keeps_reporting_true_on_primary_until_retries_exhausted() {
        let keeper_loop = loop_for_test();
        let mut local = LocalPgState {
            pg_is_running: false,
            retries: 1,
            first_failure_ts: now(),
            ..Default::default()
        };
        assert!(keeper_loop.report_pg_is_running(Role::Primary, &mut local));
    }

    #[test]
    fn report_rule_stops_masking_once_retries_exhausted() {
        let keeper_loop = loop_for_test();
        let mut local = LocalPgState {
            pg_is_running: false,
            retries: 3,
            first_failure_ts: now(),
            ..Default::default()
        };
        assert!(!keeper_loop.report_pg_is_running(Role::Primary, &mut local));
    }

    #[test]
    fn partition_check_stays_primary_when_standby_connected() {
        let keeper_loop = loop_for_test();
        let mut state = sample_state();
        let local = LocalPgState {
            pg_is_running: true,
            sync_state: "quorum".to_string(),
            ..Default::default()
        };
        let role = keeper_loop.network_partition_check(&mut state, &local);
        assert_eq!(role, Role::Primary);
        assert!(state.last_secondary_contact > 0);
    }

    #[test]
    fn partition_check_demotes_when_both_timestamps_stale() {
        let keeper_loop = loop_for_test();
        let mut state = sample_state();
        state.last_monitor_contact = 1;
        state.last_secondary_contact = 1;
        let local = LocalPgState::default();
        let role = keeper_loop.network_partition_check(&mut state, &local);
        assert_eq!(role, Role::DemoteTimeout);
    }

    #[test]
    fn partition_check_stays_primary_when_timestamps_are_zero() {
        let keeper_loop = loop_for_test();
        let mut state = sample_state();
        state.last_monitor_contact = 0;
        state.last_secondary_contact = 0;
        let local = LocalPgState::default();
        let role = keeper_loop.network_partition_check(&mut state, &local);
        assert_eq!(role, Role::Primary);
    }

    fn sample_state() -> KeeperState {
        KeeperState {
            current_role: Role::Primary,
            assigned_role: Role::Primary,
            node_id: 1,
            group_id: 0,
            last_monitor_contact: now(),
            last_secondary_contact: now(),
            control: ControlData::default(),
        }
    }
}
