//! Persisted keeper state (spec.md §3, §4.5) and the peer/probe data types
//! that flow through one loop iteration.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::KeeperError;
use crate::role::Role;

/// Magic number stamped at the front of every state file, so a file from an
/// unrelated program is rejected outright rather than misparsed.
const STATE_FILE_MAGIC: u32 = 0x4b_50_47_31; // "KPG1"
const STATE_SCHEMA_VERSION: u32 = 1;

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The Postgres control-data triple. Once `system_identifier` is non-zero it
/// must never change for the lifetime of the state file (spec.md §3
/// invariant (a)); a later mismatch is `KeeperError::IdentityDrift`, not a
/// silent overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlData {
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub system_identifier: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperState {
    pub current_role: Role,
    pub assigned_role: Role,
    pub node_id: i32,
    pub group_id: i32,
    pub last_monitor_contact: u64,
    pub last_secondary_contact: u64,
    pub control: ControlData,
}

impl KeeperState {
    pub fn new_init(node_id: i32, group_id: i32, assigned_role: Role, control: ControlData) -> Self {
        KeeperState {
            current_role: Role::Init,
            assigned_role,
            node_id,
            group_id,
            last_monitor_contact: 0,
            last_secondary_contact: 0,
            control,
        }
    }

    /// Checks the system_identifier invariant (spec.md §3(a), §8 I1) against
    /// freshly-probed control data. Ported from `keeper_state_check_postgres`
    /// in the original source, minus the pg_control_version/catalog_version_no
    /// warnings which are logged by the caller instead of here.
    pub fn check_identity(&self, probed: &ControlData) -> Result<(), KeeperError> {
        if self.control.system_identifier != 0
            && self.control.system_identifier != probed.system_identifier
        {
            return Err(KeeperError::IdentityDrift {
                expected: self.control.system_identifier,
                found: probed.system_identifier,
            });
        }
        Ok(())
    }
}

/// A peer node as reported by `GetOtherNodes` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub node_id: i32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub lsn: String,
    pub is_primary: bool,
}

impl NodeAddress {
    /// `"pgautofailover_standby_" + nodeId`, spec.md §3/§6.
    pub fn slot_name(&self) -> String {
        replication_slot_name(self.node_id)
    }
}

pub fn replication_slot_name(node_id: i32) -> String {
    format!("pgautofailover_standby_{node_id}")
}

/// The regex-equivalent check for "does this slot name belong to us", tight
/// enough to avoid dropping operator-created slots (spec.md §6). We only
/// treat slots that exactly match our naming convention as ours.
pub fn is_pgautofailover_slot_name(name: &str) -> bool {
    match name.strip_prefix("pgautofailover_standby_") {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Transient, per-probe reflection of the local Postgres instance (spec.md
/// §3). Not persisted.
#[derive(Debug, Clone, Default)]
pub struct LocalPgState {
    pub pg_is_running: bool,
    pub sync_state: String,
    pub current_lsn: String,
    pub control: ControlData,
    pub first_failure_ts: u64,
    pub retries: u32,
    /// `server_version_num` (e.g. `120004` for 12.4), read live off the
    /// running instance. Zero when Postgres isn't up to ask, which
    /// `slots::advance_enabled` treats as "minor version unknown, don't
    /// advance" (spec.md §4.2).
    pub server_version_num: u32,
}

impl LocalPgState {
    pub fn record_start_failure(&mut self) {
        if self.first_failure_ts == 0 {
            self.first_failure_ts = now_epoch_secs();
        }
        self.retries += 1;
    }

    pub fn reset_start_failures(&mut self) {
        self.first_failure_ts = 0;
        self.retries = 0;
    }
}

/// The monitor's answer to `RegisterNode`/`NodeActive` (spec.md §3).
#[derive(Debug, Clone)]
pub struct MonitorAssignedState {
    pub node_id: i32,
    pub group_id: i32,
    pub role: Role,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFileEnvelope {
    magic: u32,
    schema_version: u32,
    state: KeeperState,
}

/// Durable, crash-safe store for `KeeperState` (spec.md §4.5).
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomic write: serialize to a temp file on the same filesystem, fsync,
    /// then rename over the destination (spec.md §4.5/§6).
    pub fn write(&self, state: &KeeperState) -> Result<()> {
        let envelope = StateFileEnvelope {
            magic: STATE_FILE_MAGIC,
            schema_version: STATE_SCHEMA_VERSION,
            state: state.clone(),
        };
        let serialized = serde_json::to_vec_pretty(&envelope)
            .context("failed to serialize keeper state")?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("state")
        ));

        {
            let mut tmp_file = File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            tmp_file
                .write_all(&serialized)
                .context("failed to write state file contents")?;
            tmp_file.sync_all().context("failed to fsync state file")?;
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }

    /// Reads the state file, rejecting schema versions we don't understand
    /// (spec.md §4.5).
    pub fn read(&self) -> Result<KeeperState> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let envelope: StateFileEnvelope =
            serde_json::from_slice(&bytes).context("failed to parse keeper state file")?;

        if envelope.magic != STATE_FILE_MAGIC {
            return Err(KeeperError::StateSchemaMismatch {
                expected: STATE_SCHEMA_VERSION,
                found: envelope.schema_version,
            }
            .into());
        }

        if envelope.schema_version != STATE_SCHEMA_VERSION {
            return Err(KeeperError::StateSchemaMismatch {
                expected: STATE_SCHEMA_VERSION,
                found: envelope.schema_version,
            }
            .into());
        }

        Ok(envelope.state)
    }

    /// Removes the state file; used when rolling back a failed registration
    /// (spec.md §4.4/§8 I6).
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove keeper state file"),
        }
    }
}

pub fn now() -> u64 {
    now_epoch_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> KeeperState {
        KeeperState {
            current_role: Role::Secondary,
            assigned_role: Role::Secondary,
            node_id: 2,
            group_id: 0,
            last_monitor_contact: 1234,
            last_secondary_contact: 0,
            control: ControlData {
                pg_control_version: 1300,
                catalog_version_no: 202201001,
                system_identifier: 7_000_000_000_000_000_001,
            },
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("keeper.state"));
        let state = sample_state();

        store.write(&state).unwrap();
        let read_back = store.read().unwrap();

        assert_eq!(read_back.node_id, state.node_id);
        assert_eq!(read_back.current_role, state.current_role);
        assert_eq!(
            read_back.control.system_identifier,
            state.control.system_identifier
        );
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keeper.state");

        let bad = serde_json::json!({
            "magic": STATE_FILE_MAGIC,
            "schema_version": 99,
            "state": sample_state(),
        });
        fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();

        let store = StateStore::new(path);
        assert!(store.read().is_err());
    }

    #[test]
    fn identity_drift_is_rejected() {
        let state = sample_state();
        let drifted = ControlData {
            system_identifier: state.control.system_identifier + 1,
            ..state.control
        };
        assert!(state.check_identity(&drifted).is_err());
    }

    #[test]
    fn zero_system_identifier_accepts_any_value() {
        let mut state = sample_state();
        state.control.system_identifier = 0;
        let probed = ControlData {
            system_identifier: 42,
            ..state.control
        };
        assert!(state.check_identity(&probed).is_ok());
    }

    #[test]
    fn slot_name_matcher_is_tight() {
        assert!(is_pgautofailover_slot_name("pgautofailover_standby_12"));
        assert!(!is_pgautofailover_slot_name("pgautofailover_standby_"));
        assert!(!is_pgautofailover_slot_name("pgautofailover_standby_12x"));
        assert!(!is_pgautofailover_slot_name("operator_made_this_slot"));
    }
}
