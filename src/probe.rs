//! Local Postgres probe (spec.md §4.1).
//!
//! Ported from `keeper_update_pg_state` / `pgsql_get_postgres_metadata` in the
//! original keeper's `keeper.c` / `pgsql.c`: one round trip when Postgres is
//! up, falling back to on-disk control data when it's not.

use anyhow::{Context, Result};
use postgres::GenericClient;

use crate::error::KeeperError;
use crate::role::Role;
use crate::state::{ControlData, LocalPgState};

/// Everything the probe needs to know about the configured instance before
/// it runs a single query.
pub struct ProbeInput<'a> {
    pub configured_port: u16,
    pub pidfile_port: Option<u16>,
    pub current_role: Role,
    pub known_control: ControlData,
}

/// Reads on-disk `pg_control` metadata when Postgres isn't accepting
/// connections. Implemented as a trait so tests can stub it without shelling
/// out to the real `pg_controldata` binary.
pub trait ControlDataReader {
    fn read_controldata(&self) -> Result<ControlData>;
}

/// The single combined metadata query (spec.md §4.1): recovery status, best
/// peer sync_state, current LSN, and the control-data triple, in one round
/// trip.
pub fn metadata_query() -> String {
    "select pg_is_in_recovery(), \
       coalesce(rep.sync_state, '') as sync_state, \
       case when pg_is_in_recovery() \
         then coalesce(pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn()) \
         else pg_current_wal_lsn() \
       end as current_lsn, \
       control.pg_control_version, control.catalog_version_no, control.system_identifier, \
       current_setting('server_version_num')::int as server_version_num \
     from (values (1)) as dummy \
     full outer join ( \
       select pg_control_version, catalog_version_no, system_identifier \
         from pg_control_system() \
     ) as control on true \
     full outer join ( \
       select sync_state \
         from pg_replication_slots slot \
         join pg_stat_replication rep on rep.pid = slot.active_pid \
        where slot_name ~ '^pgautofailover_standby_[0-9]+$' \
        order by case sync_state \
                   when 'quorum' then 4 \
                   when 'sync' then 3 \
                   when 'potential' then 2 \
                   when 'async' then 1 \
                   else 0 \
                 end desc \
        limit 1 \
     ) as rep on true"
        .to_string()
}

/// Shells out to `pg_controldata` and parses the three fields the probe
/// needs out of its human-readable report. Used only when Postgres isn't
/// accepting connections (spec.md §4.1).
pub struct PgControlDataReader {
    pub pg_controldata_path: std::path::PathBuf,
    pub pgdata: std::path::PathBuf,
}

impl PgControlDataReader {
    pub fn new(
        pg_controldata_path: impl Into<std::path::PathBuf>,
        pgdata: impl Into<std::path::PathBuf>,
    ) -> Self {
        PgControlDataReader {
            pg_controldata_path: pg_controldata_path.into(),
            pgdata: pgdata.into(),
        }
    }
}

impl ControlDataReader for PgControlDataReader {
    fn read_controldata(&self) -> Result<ControlData> {
        let output = std::process::Command::new(&self.pg_controldata_path)
            .arg("-D")
            .arg(&self.pgdata)
            .output()
            .context("failed to run pg_controldata")?;

        anyhow::ensure!(
            output.status.success(),
            "pg_controldata exited with {}",
            output.status
        );

        let text = String::from_utf8_lossy(&output.stdout);
        parse_controldata(&text)
    }
}

/// Parses the handful of `pg_controldata` lines the keeper needs, e.g.
/// `pg_control version number:            1300`.
fn parse_controldata(text: &str) -> Result<ControlData> {
    let mut control = ControlData::default();

    for line in text.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim();
        let value = value.trim();

        if label.eq_ignore_ascii_case("pg_control version number") {
            control.pg_control_version = value.parse().unwrap_or(0);
        } else if label.eq_ignore_ascii_case("Catalog version number") {
            control.catalog_version_no = value.parse().unwrap_or(0);
        } else if label.eq_ignore_ascii_case("Database system identifier") {
            control.system_identifier = value.parse().unwrap_or(0);
        }
    }

    anyhow::ensure!(
        control.system_identifier != 0,
        "pg_controldata output did not contain a database system identifier"
    );
    Ok(control)
}

pub struct PostgresProbe;

impl PostgresProbe {
    /// Runs the metadata query against a live connection and fills in
    /// `local` from the result. Mirrors `pgsql_get_postgres_metadata`.
    pub fn probe_running_instance(
        client: &mut impl GenericClient,
        input: &ProbeInput,
        local: &mut LocalPgState,
    ) -> Result<bool> {
        if let (Some(found), expected) = (input.pidfile_port, input.configured_port) {
            if found != expected {
                return Err(KeeperError::PortMismatch { expected, found }.into());
            }
        }

        let row = client
            .query_one(&metadata_query(), &[])
            .context("failed to query local Postgres metadata")?;

        let pg_is_in_recovery: bool = row.get(0);
        let sync_state: String = row.get(1);
        let current_lsn: Option<String> = row.get(2);
        let control = ControlData {
            pg_control_version: row.get::<_, i32>(3) as u32,
            catalog_version_no: row.get::<_, i32>(4) as u32,
            system_identifier: row.get::<_, i64>(5) as u64,
        };

        local.pg_is_running = true;
        local.sync_state = sync_state;
        local.current_lsn = current_lsn.unwrap_or_else(|| "0/0".to_string());
        local.control = control;
        local.server_version_num = row.get::<_, i32>(6) as u32;

        Ok(pg_is_in_recovery)
    }

    /// Falls back to on-disk control data when Postgres is not running,
    /// reusing the cached triple from `KeeperState` when we already know it
    /// (spec.md §4.1: "preserving any previously-cached values").
    pub fn probe_stopped_instance(
        reader: &impl ControlDataReader,
        known_control: &ControlData,
        local: &mut LocalPgState,
    ) -> Result<()> {
        local.pg_is_running = false;
        local.sync_state.clear();
        local.current_lsn = "0/0".to_string();
        local.server_version_num = 0;

        local.control = if known_control.system_identifier != 0 {
            *known_control
        } else {
            reader.read_controldata()?
        };

        Ok(())
    }

    /// Applies the identity-drift and primary-empty-syncstate checks
    /// described in spec.md §4.1 after a successful probe (running or
    /// stopped). Returns `Ok(true)` when the probe is "complete" and `Ok(false)`
    /// when it's marked incomplete but the caller should still proceed to
    /// report to the monitor.
    pub fn check_probe_result(
        current_role: Role,
        known_control: &ControlData,
        local: &LocalPgState,
    ) -> Result<bool> {
        if known_control.system_identifier != 0
            && local.control.system_identifier != 0
            && known_control.system_identifier != local.control.system_identifier
        {
            return Err(KeeperError::IdentityDrift {
                expected: known_control.system_identifier,
                found: local.control.system_identifier,
            }
            .into());
        }

        if current_role == Role::Primary && local.pg_is_running && local.sync_state.is_empty() {
            tracing::error!(
                "no standby connected in pg_stat_replication; \
                 check pg_autoctl and Postgres logs on standby nodes"
            );
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubReader(ControlData);

    impl ControlDataReader for StubReader {
        fn read_controldata(&self) -> Result<ControlData> {
            Ok(self.0)
        }
    }

    #[test]
    fn parses_pg_controldata_text_output() {
        let text = "\
pg_control version number:            1300
Catalog version number:               202201001
Database system identifier:           7123456789012345678
Database cluster state:               in production
";
        let control = parse_controldata(text).unwrap();
        assert_eq!(control.pg_control_version, 1300);
        assert_eq!(control.catalog_version_no, 202201001);
        assert_eq!(control.system_identifier, 7123456789012345678);
    }

    #[test]
    fn rejects_output_with_no_system_identifier() {
        let text = "pg_control version number:            1300\n";
        assert!(parse_controldata(text).is_err());
    }

    #[test]
    fn stopped_instance_reuses_cached_control_data_when_known() {
        let mut local = LocalPgState::default();
        let known = ControlData {
            pg_control_version: 1300,
            catalog_version_no: 202201001,
            system_identifier: 42,
        };
        let reader = StubReader(ControlData::default());

        PostgresProbe::probe_stopped_instance(&reader, &known, &mut local).unwrap();

        assert!(!local.pg_is_running);
        assert_eq!(local.control.system_identifier, 42);
    }

    #[test]
    fn stopped_instance_falls_back_to_controldata_when_unknown() {
        let mut local = LocalPgState::default();
        let known = ControlData::default();
        let reader = StubReader(ControlData {
            pg_control_version: 1300,
            catalog_version_no: 202201001,
            system_identifier: 99,
        });

        PostgresProbe::probe_stopped_instance(&reader, &known, &mut local).unwrap();

        assert_eq!(local.control.system_identifier, 99);
    }

    #[test]
    fn identity_drift_between_known_and_probed_is_an_error() {
        let known = ControlData {
            system_identifier: 1,
            ..Default::default()
        };
        let mut local = LocalPgState::default();
        local.control.system_identifier = 2;

        let result = PostgresProbe::check_probe_result(Role::Secondary, &known, &local);
        assert!(result.is_err());
    }

    #[test]
    fn primary_with_empty_sync_state_is_incomplete_not_an_error() {
        let known = ControlData::default();
        let mut local = LocalPgState::default();
        local.pg_is_running = true;
        local.sync_state.clear();

        let result = PostgresProbe::check_probe_result(Role::Primary, &known, &local);
        assert_eq!(result.unwrap(), false);
    }

    #[test]
    fn primary_with_sync_state_is_complete() {
        let known = ControlData::default();
        let mut local = LocalPgState::default();
        local.pg_is_running = true;
        local.sync_state = "quorum".to_string();

        let result = PostgresProbe::check_probe_result(Role::Primary, &known, &local);
        assert_eq!(result.unwrap(), true);
    }

    #[test]
    fn secondary_with_empty_sync_state_is_fine() {
        let known = ControlData::default();
        let local = LocalPgState::default();

        let result = PostgresProbe::check_probe_result(Role::Secondary, &known, &local);
        assert_eq!(result.unwrap(), true);
    }
}
