//! Replication slot maintenance (spec.md §4.2).
//!
//! Each call issues exactly one SQL statement built from a `VALUES` block of
//! `(node_id, lsn)` pairs, ported from `pgsql_replication_slot_maintain` /
//! `pgsql_replication_slot_drop_removed` in the original keeper's `pgsql.c`
//! (see spec.md §9 "Slot SQL built with VALUES"). When the peer list is
//! empty we substitute the typed-empty-set form so the outer query still
//! type-checks with no peers.

use anyhow::{Context, Result};
use postgres::types::ToSql;
use postgres::GenericClient;

use crate::error::KeeperError;
use crate::state::NodeAddress;

/// Suggested upper bound on peers per spec.md §4.2; exceeding it is an
/// internal error rather than a silently-truncated query.
pub const NODE_ARRAY_MAX_COUNT: usize = 12;

const SLOT_NAME_PREFIX: &str = "pgautofailover_standby_";

/// Ties a named slot to the action performed on it, parsed back from the
/// query's `(action, slot_name, lsn)` result rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotMaintenanceReport {
    pub created: Vec<String>,
    pub dropped: Vec<String>,
    pub advanced: Vec<String>,
}

impl SlotMaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.dropped.is_empty() && self.advanced.is_empty()
    }

    fn record(&mut self, action: &str, slot_name: String) {
        match action {
            "create" => self.created.push(slot_name),
            "drop" => self.dropped.push(slot_name),
            "advance" => self.advanced.push(slot_name),
            other => tracing::warn!(action = other, "unexpected slot maintenance action"),
        }
    }
}

pub struct SlotManager;

impl SlotManager {
    /// Primary-side policy (spec.md §4.2, §4.6 Phase A "Primary"/"Single"
    /// rows): only drop slots for nodes no longer in the peer list. Creation
    /// and advance are left to Postgres's own streaming-replication slot
    /// handling when standbys connect.
    pub fn drop_removed(
        client: &mut impl GenericClient,
        peers: &[NodeAddress],
    ) -> Result<SlotMaintenanceReport> {
        check_peer_count(peers)?;

        let nodes = NodesValues::build(peers);
        let sql = format!(
            "WITH nodes(slot_name, lsn) AS ( \
               SELECT '{prefix}' || id, lsn FROM ({values}) AS sb(id, lsn) \
             ), \
             dropped AS ( \
               SELECT slot_name, pg_drop_replication_slot(slot_name) \
                 FROM pg_replication_slots pgrs LEFT JOIN nodes USING (slot_name) \
                WHERE nodes.slot_name IS NULL \
                  AND slot_name LIKE '{prefix}%' \
                  AND slot_type = 'physical' \
             ) \
             SELECT 'drop' AS action, slot_name, NULL::text AS lsn FROM dropped",
            prefix = SLOT_NAME_PREFIX,
            values = nodes.values_sql,
        );

        run_maintenance_query(client, &sql, &nodes.param_refs())
    }

    /// Standby-side policy (spec.md §4.2, §4.6 Phase A "Secondary" row):
    /// create missing slots, drop slots for removed peers, and advance
    /// existing slots toward each peer's reported LSN.
    ///
    /// `advance_enabled` implements the version-gated bypass rule (spec.md
    /// §4.2): callers compute it from `pg_control_version >= 1100` and a
    /// runtime minor-version check, or force it on in test mode.
    pub fn maintain(
        client: &mut impl GenericClient,
        peers: &[NodeAddress],
        advance_enabled: bool,
    ) -> Result<SlotMaintenanceReport> {
        check_peer_count(peers)?;

        let nodes = NodesValues::build(peers);
        let advance_clause = if advance_enabled {
            "advanced AS ( \
               SELECT a.slot_name, a.end_lsn::text AS end_lsn \
                 FROM pg_replication_slots s JOIN nodes USING (slot_name), \
                      LATERAL pg_replication_slot_advance(slot_name, nodes.lsn) a \
                WHERE nodes.lsn <> '0/0' AND nodes.lsn > s.restart_lsn \
             ), "
        } else {
            ""
        };
        let advance_select = if advance_enabled {
            " UNION ALL SELECT 'advance', slot_name, end_lsn FROM advanced"
        } else {
            ""
        };

        let sql = format!(
            "WITH nodes(slot_name, lsn) AS ( \
               SELECT '{prefix}' || id, lsn FROM ({values}) AS sb(id, lsn) \
             ), \
             dropped AS ( \
               SELECT slot_name, pg_drop_replication_slot(slot_name) \
                 FROM pg_replication_slots pgrs LEFT JOIN nodes USING (slot_name) \
                WHERE nodes.slot_name IS NULL \
                  AND slot_name LIKE '{prefix}%' \
                  AND slot_type = 'physical' \
             ), \
             created AS ( \
               SELECT c.slot_name, c.lsn::text AS lsn \
                 FROM nodes LEFT JOIN pg_replication_slots pgrs USING (slot_name), \
                      LATERAL pg_create_physical_replication_slot(slot_name, true) c \
                WHERE pgrs.slot_name IS NULL \
             ), \
             {advance_clause}\
             maintained AS ( \
               SELECT 'create' AS action, slot_name, lsn FROM created \
               UNION ALL \
               SELECT 'drop', slot_name, NULL::text FROM dropped \
               {advance_select} \
             ) \
             SELECT action, slot_name, lsn FROM maintained",
            prefix = SLOT_NAME_PREFIX,
            values = nodes.values_sql,
            advance_clause = advance_clause,
            advance_select = advance_select,
        );

        run_maintenance_query(client, &sql, &nodes.param_refs())
    }
}

/// Version-gated bypass rule (spec.md §4.2): `pg_replication_slot_advance`
/// doesn't exist before `pg_control_version 1100` (Postgres 11), and in 11
/// and 12 it shipped with a bug that prevented WAL recycling on standbys
/// until the 11.9/12.4 minor releases. Advancing is only permitted once both
/// gates pass. The `PG_KEEPER_TEST_MODE` environment variable disables the
/// whole bypass so tests against newer Postgres don't need to fake an old
/// control or minor version.
pub fn advance_enabled(pg_control_version: u32, server_version_num: u32) -> bool {
    if std::env::var_os("PG_KEEPER_TEST_MODE").is_some() {
        return true;
    }
    if pg_control_version < 1100 {
        return false;
    }
    minor_version_supports_slot_advance(server_version_num)
}

/// Runtime minor-version check: the slot-advance fix landed in 11.9 and
/// 12.4; every release series from 13 onward shipped with it from day one.
/// `server_version_num` of 0 means "unknown" (Postgres wasn't up to ask),
/// which we treat as unsupported rather than assuming the best case.
fn minor_version_supports_slot_advance(server_version_num: u32) -> bool {
    match server_version_num / 10000 {
        0 => false,
        11 => server_version_num >= 110_009,
        12 => server_version_num >= 120_004,
        _ => true,
    }
}

fn check_peer_count(peers: &[NodeAddress]) -> Result<(), KeeperError> {
    if peers.len() > NODE_ARRAY_MAX_COUNT {
        return Err(KeeperError::TooManyPeers {
            count: peers.len(),
            max: NODE_ARRAY_MAX_COUNT,
        });
    }
    Ok(())
}

fn run_maintenance_query(
    client: &mut impl GenericClient,
    sql: &str,
    params: &[&(dyn ToSql + Sync)],
) -> Result<SlotMaintenanceReport> {
    let rows = client
        .query(sql, params)
        .context("failed to run replication slot maintenance query")?;

    let mut report = SlotMaintenanceReport::default();
    for row in &rows {
        let action: String = row.get("action");
        let slot_name: String = row.get("slot_name");
        report.record(&action, slot_name);
    }
    Ok(report)
}

/// Builds the `VALUES($1, $2::pg_lsn), ($3, $4)`-shaped FROM clause described
/// in spec.md §9, substituting the typed empty set when there are no peers.
struct NodesValues {
    values_sql: String,
    node_ids: Vec<i32>,
    lsns: Vec<String>,
}

impl NodesValues {
    fn build(peers: &[NodeAddress]) -> Self {
        if peers.is_empty() {
            return NodesValues {
                values_sql: "SELECT id, lsn FROM (VALUES (NULL::int, NULL::pg_lsn)) \
                             AS t(id, lsn) WHERE false"
                    .to_string(),
                node_ids: Vec::new(),
                lsns: Vec::new(),
            };
        }

        let node_ids: Vec<i32> = peers.iter().map(|p| p.node_id).collect();
        let lsns: Vec<String> = peers.iter().map(|p| p.lsn.clone()).collect();

        let rows: Vec<String> = (0..peers.len())
            .map(|i| {
                let id_idx = i * 2 + 1;
                let lsn_idx = i * 2 + 2;
                if i == 0 {
                    format!("(${id_idx}, ${lsn_idx}::pg_lsn)")
                } else {
                    format!("(${id_idx}, ${lsn_idx})")
                }
            })
            .collect();

        NodesValues {
            values_sql: format!("VALUES {}", rows.join(", ")),
            node_ids,
            lsns,
        }
    }

    fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        let mut refs: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(self.node_ids.len() * 2);
        for i in 0..self.node_ids.len() {
            refs.push(&self.node_ids[i]);
            refs.push(&self.lsns[i]);
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(node_id: i32, lsn: &str) -> NodeAddress {
        NodeAddress {
            node_id,
            name: format!("node{node_id}"),
            host: "localhost".to_string(),
            port: 5432,
            lsn: lsn.to_string(),
            is_primary: false,
        }
    }

    #[test]
    fn slot_name_follows_convention() {
        use crate::state::replication_slot_name;
        assert_eq!(peer(3, "0/0").slot_name(), "pgautofailover_standby_3");
        assert_eq!(replication_slot_name(42), "pgautofailover_standby_42");
    }

    #[test]
    fn empty_peer_list_uses_typed_empty_set() {
        let nodes = NodesValues::build(&[]);
        assert!(nodes.values_sql.contains("WHERE false"));
        assert!(nodes.param_refs().is_empty());
    }

    #[test]
    fn values_clause_has_one_param_pair_per_peer() {
        let peers = vec![peer(3, "0/3000000"), peer(5, "0/5000000")];
        let nodes = NodesValues::build(&peers);
        assert_eq!(nodes.param_refs().len(), 4);
        assert!(nodes.values_sql.starts_with("VALUES ($1, $2::pg_lsn), ($3, $4)"));
    }

    #[test]
    fn too_many_peers_rejected_before_any_query() {
        let peers: Vec<NodeAddress> = (0..(NODE_ARRAY_MAX_COUNT as i32 + 1))
            .map(|id| peer(id, "0/0"))
            .collect();
        assert!(check_peer_count(&peers).is_err());
    }

    #[test]
    fn exact_limit_is_accepted() {
        let peers: Vec<NodeAddress> = (0..NODE_ARRAY_MAX_COUNT as i32)
            .map(|id| peer(id, "0/0"))
            .collect();
        assert!(check_peer_count(&peers).is_ok());
    }

    #[test]
    fn report_is_empty_by_default() {
        assert!(SlotMaintenanceReport::default().is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn advance_bypass_gates_on_control_version() {
        std::env::remove_var("PG_KEEPER_TEST_MODE");
        assert!(!advance_enabled(1000, 100_000));
        assert!(advance_enabled(1100, 170_000));
        assert!(advance_enabled(1700, 170_000));
    }

    #[test]
    #[serial_test::serial]
    fn advance_bypass_gates_on_minor_version_for_11_and_12() {
        std::env::remove_var("PG_KEEPER_TEST_MODE");
        assert!(!advance_enabled(1100, 110_008));
        assert!(advance_enabled(1100, 110_009));
        assert!(!advance_enabled(1200, 120_003));
        assert!(advance_enabled(1200, 120_004));
    }

    #[test]
    #[serial_test::serial]
    fn advance_bypass_treats_unknown_minor_version_as_unsupported() {
        std::env::remove_var("PG_KEEPER_TEST_MODE");
        assert!(!advance_enabled(1100, 0));
    }

    #[test]
    #[serial_test::serial]
    fn test_mode_env_var_disables_the_bypass() {
        std::env::set_var("PG_KEEPER_TEST_MODE", "1");
        assert!(advance_enabled(900, 0));
        std::env::remove_var("PG_KEEPER_TEST_MODE");
    }
}
