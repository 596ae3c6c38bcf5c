//! Typed keeper configuration and the runtime Config Reloader (spec.md §4.8).
//!
//! Loaded with the `config` crate layered over a TOML file plus environment
//! overrides, the way most `config`-based Rust services in this corpus do
//! it. Legal-vs-illegal change validation and the associated monitor/
//! Postgres side effects are ported from `keeper_config_accept_new` in the
//! original keeper's `keeper_config.c`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeeperConfig {
    pub pgdata: PathBuf,
    pub formation: String,
    pub group: i32,

    pub monitor_uri: String,
    pub name: String,
    pub hostname: String,
    pub pgport: u16,
    pub dbname: String,
    pub pg_superuser: String,

    pub replication_password: Option<String>,
    pub replication_slot_name: Option<String>,
    pub replication_user: String,
    pub hba_path: PathBuf,
    pub hba_auth_method: String,

    pub max_backup_rate: String,
    pub backup_directory: PathBuf,

    pub network_partition_timeout: Duration,
    pub postgresql_restart_failure_timeout: Duration,
    pub postgresql_restart_failure_max_retries: u32,
    pub keeper_sleep_time: Duration,
    pub postgres_ping_retry_timeout: Duration,

    pub ssl_active: bool,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
}

impl KeeperConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("PG_KEEPER").separator("__"))
            .build()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("failed to parse keeper configuration")
    }

    /// Connection string for the *local* Postgres instance the keeper
    /// manages, used by the probe and by slot/HBA maintenance — distinct
    /// from `monitor_uri`, which points at the remote monitor.
    pub fn local_pg_conninfo(&self) -> String {
        format!(
            "host=127.0.0.1 port={} dbname={} user={} connect_timeout=5",
            self.pgport, self.dbname, self.pg_superuser
        )
    }
}

/// One field name rejected by `validate_change`, with a human-readable
/// reason, so the caller can log and move on without stopping the loop
/// (spec.md §4.8: "logged and rejected without stopping the loop").
#[derive(Debug, Clone)]
pub struct RejectedChange {
    pub field: &'static str,
    pub reason: String,
}

/// Side effects the keeper loop must carry out after accepting a reload
/// (spec.md §4.8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadEffects {
    pub push_metadata_update: bool,
    pub regenerate_postgres_settings: bool,
    pub regenerate_standby_config: bool,
    pub restart_postgres: bool,
}

pub struct ConfigReloader;

impl ConfigReloader {
    /// Validates `new` against `old`, collecting every change to an immutable
    /// field (`pgdata`, `formation`, `group`) rather than bailing on the
    /// first one, so the caller can log each rejection individually (spec.md
    /// §4.8: "logged and rejected without stopping the loop"). An empty
    /// result means the whole reload is legal. Everything not named here is
    /// legal at runtime.
    pub fn validate_change(old: &KeeperConfig, new: &KeeperConfig) -> Vec<RejectedChange> {
        let mut rejected = Vec::new();

        if old.pgdata != new.pgdata {
            rejected.push(RejectedChange {
                field: "pgdata",
                reason: format!(
                    "pgdata cannot change at runtime (was {:?}, now {:?})",
                    old.pgdata, new.pgdata
                ),
            });
        }
        if old.formation != new.formation {
            rejected.push(RejectedChange {
                field: "formation",
                reason: format!(
                    "formation cannot change at runtime (was {:?}, now {:?})",
                    old.formation, new.formation
                ),
            });
        }
        if old.group != new.group {
            rejected.push(RejectedChange {
                field: "group",
                reason: format!(
                    "group cannot change at runtime (was {}, now {})",
                    old.group, new.group
                ),
            });
        }

        rejected
    }

    /// Computes the side effects an accepted reload must carry out. Assumes
    /// `validate_change` already succeeded.
    pub fn effects(old: &KeeperConfig, new: &KeeperConfig) -> ReloadEffects {
        let metadata_changed =
            old.name != new.name || old.hostname != new.hostname || old.pgport != new.pgport;

        let tls_changed = old.ssl_active != new.ssl_active
            || old.ssl_cert_file != new.ssl_cert_file
            || old.ssl_key_file != new.ssl_key_file;

        ReloadEffects {
            push_metadata_update: metadata_changed,
            regenerate_postgres_settings: tls_changed,
            // Whether the standby config file's *content* changed is only
            // knowable after rendering it; the caller fills this in once it
            // has rendered both old and new standby configuration.
            regenerate_standby_config: tls_changed,
            restart_postgres: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeeperConfig {
        KeeperConfig {
            pgdata: PathBuf::from("/var/lib/postgresql/data"),
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
            hba_path: PathBuf::from("/var/lib/postgresql/data/pg_hba.conf"),
            hba_auth_method: "trust".to_string(),
            max_backup_rate: "100M".to_string(),
            backup_directory: PathBuf::from("/var/backups"),
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

    #[test]
    fn pgdata_change_is_rejected() {
        let old = sample();
        let mut new = sample();
        new.pgdata = PathBuf::from("/somewhere/else");
        let rejected = ConfigReloader::validate_change(&old, &new);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].field, "pgdata");
    }

    #[test]
    fn formation_change_is_rejected() {
        let old = sample();
        let mut new = sample();
        new.formation = "other".to_string();
        let rejected = ConfigReloader::validate_change(&old, &new);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].field, "formation");
    }

    #[test]
    fn group_change_is_rejected() {
        let old = sample();
        let mut new = sample();
        new.group = 1;
        let rejected = ConfigReloader::validate_change(&old, &new);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].field, "group");
    }

    #[test]
    fn multiple_illegal_changes_are_all_reported() {
        let old = sample();
        let mut new = sample();
        new.pgdata = PathBuf::from("/somewhere/else");
        new.group = 1;
        let rejected = ConfigReloader::validate_change(&old, &new);
        assert_eq!(rejected.len(), 2);
    }

    #[test]
    fn monitor_uri_change_is_legal() {
        let old = sample();
        let mut new = sample();
        new.monitor_uri = "postgres://other-monitor".to_string();
        assert!(ConfigReloader::validate_change(&old, &new).is_empty());
    }

    #[test]
    fn hostname_change_triggers_metadata_push() {
        let old = sample();
        let mut new = sample();
        new.hostname = "node1-new.local".to_string();
        let effects = ConfigReloader::effects(&old, &new);
        assert!(effects.push_metadata_update);
        assert!(!effects.regenerate_postgres_settings);
    }

    #[test]
    fn tls_change_regenerates_postgres_settings() {
        let old = sample();
        let mut new = sample();
        new.ssl_active = true;
        let effects = ConfigReloader::effects(&old, &new);
        assert!(effects.regenerate_postgres_settings);
        assert!(effects.regenerate_standby_config);
    }

    #[test]
    fn unrelated_change_has_no_effects() {
        let old = sample();
        let mut new = sample();
        new.max_backup_rate = "200M".to_string();
        let effects = ConfigReloader::effects(&old, &new);
        assert_eq!(effects, ReloadEffects::default());
    }
}
