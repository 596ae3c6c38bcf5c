//! The closed enumeration of replication-role states and the monitor's two
//! query-filter sentinels, kept separate from `Role` so they can never leak
//! into a `KeeperState`.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::KeeperError;

/// A node's place in the monitor's replication-role FSM.
///
/// This enumeration is exhaustive and the string<->variant mapping is total:
/// an unrecognized name coming back from the monitor is an error, never
/// silently mapped to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Init,
    Single,
    WaitPrimary,
    Primary,
    PrepPromotion,
    StopReplication,
    WaitStandby,
    CatchingUp,
    Secondary,
    Maintenance,
    ApplySettings,
    Draining,
    DemoteTimeout,
    Demoted,
    ReportLsn,
    Dropped,
}

impl Role {
    pub const ALL: [Role; 16] = [
        Role::Init,
        Role::Single,
        Role::WaitPrimary,
        Role::Primary,
        Role::PrepPromotion,
        Role::StopReplication,
        Role::WaitStandby,
        Role::CatchingUp,
        Role::Secondary,
        Role::Maintenance,
        Role::ApplySettings,
        Role::Draining,
        Role::DemoteTimeout,
        Role::Demoted,
        Role::ReportLsn,
        Role::Dropped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Init => "init",
            Role::Single => "single",
            Role::WaitPrimary => "wait_primary",
            Role::Primary => "primary",
            Role::PrepPromotion => "prepare_promotion",
            Role::StopReplication => "stop_replication",
            Role::WaitStandby => "wait_standby",
            Role::CatchingUp => "catchingup",
            Role::Secondary => "secondary",
            Role::Maintenance => "maintenance",
            Role::ApplySettings => "apply_settings",
            Role::Draining => "draining",
            Role::DemoteTimeout => "demote_timeout",
            Role::Demoted => "demoted",
            Role::ReportLsn => "report_lsn",
            Role::Dropped => "dropped",
        }
    }

    /// Roles where, per spec.md §4.6 Phase A, ensure-current must be skipped:
    /// starting Postgres on the way to shutdown or stopping it on the way
    /// back up would be a split-brain hazard or a redundant restart.
    pub fn is_shutdown_bound(self) -> bool {
        matches!(self, Role::Draining | Role::DemoteTimeout | Role::Demoted)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| KeeperError::UnknownRole(s.to_string()))
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|_| D::Error::custom(format!("unknown role name: {raw:?}")))
    }
}

/// A query filter accepted by `GetOtherNodes`. `AnyState` and `NoState` are
/// monitor-side sentinels, never valid as a node's own current/assigned
/// role, so they live on a separate type rather than as extra `Role`
/// variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    Exactly(Role),
    AnyState,
    NoState,
}

impl RoleFilter {
    pub fn as_sql_str(self) -> String {
        match self {
            RoleFilter::Exactly(r) => r.as_str().to_string(),
            RoleFilter::AnyState => "any".to_string(),
            RoleFilter::NoState => "no_state".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_role() {
        for role in Role::ALL {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn unknown_role_name_is_an_error() {
        assert!("not_a_role".parse::<Role>().is_err());
    }

    #[test]
    fn shutdown_bound_roles_match_spec() {
        assert!(Role::Draining.is_shutdown_bound());
        assert!(Role::DemoteTimeout.is_shutdown_bound());
        assert!(Role::Demoted.is_shutdown_bound());
        assert!(!Role::Primary.is_shutdown_bound());
        assert!(!Role::Secondary.is_shutdown_bound());
    }
}
