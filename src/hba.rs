//! Host-based access rule maintenance (spec.md §4.3).
//!
//! Ported from `diff_nodesArray` / `keeper_update_group_hba` in the original
//! keeper's `keeper.c`. We keep the file-editing side effect-free and
//! testable by splitting "compute what rules are missing" from "append them
//! to the file", matching the original's diff-then-edit split.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::state::NodeAddress;

/// One pg_hba.conf line to append, already rendered. We always add two per
/// peer (database + replication), never remove a line: rules whose peer has
/// left the group are a documented limitation (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaRule {
    pub line: String,
}

pub struct HbaManager;

impl HbaManager {
    /// Computes which peers need new HBA rules. Both slices must already be
    /// sorted by `node_id` (the monitor returns `get_other_nodes` this way;
    /// spec.md §3).
    ///
    /// - a peer present in `current` but absent from `previous` → needs rules
    /// - same `node_id`, but `host` changed → needs refreshed rules
    /// - a peer present in `previous` but absent from `current` → ignored,
    ///   its old rules are left in place
    ///
    /// `force_invalidate` bypasses the diff entirely and returns the whole
    /// `current` list, mirroring the original's `forceCacheInvalidation`.
    pub fn diff<'a>(
        previous: &[NodeAddress],
        current: &'a [NodeAddress],
        force_invalidate: bool,
    ) -> Vec<&'a NodeAddress> {
        if force_invalidate || previous.is_empty() {
            return current.iter().collect();
        }

        let mut diff = Vec::new();
        let mut prev_idx = 0usize;

        for curr in current {
            // Skip past previous entries for peers that have since left the
            // group; they must not be mistaken for a match against `curr`.
            while prev_idx < previous.len() && previous[prev_idx].node_id < curr.node_id {
                prev_idx += 1;
            }

            match previous.get(prev_idx) {
                Some(prev) if prev.node_id == curr.node_id => {
                    if curr.host != prev.host {
                        diff.push(curr);
                    }
                    prev_idx += 1;
                }
                _ => diff.push(curr),
            }
        }

        diff
    }

    /// Renders the two rules (database, replication) for one peer.
    pub fn rules_for_peer(
        peer: &NodeAddress,
        ssl_active: bool,
        dbname: &str,
        replication_user: &str,
        auth_method: &str,
    ) -> [HbaRule; 2] {
        let kind = if ssl_active { "hostssl" } else { "host" };
        [
            HbaRule {
                line: format!(
                    "{kind}\t{dbname}\t{replication_user}\t{host}/32\t{auth_method}",
                    kind = kind,
                    dbname = dbname,
                    replication_user = replication_user,
                    host = peer.host,
                    auth_method = auth_method,
                ),
            },
            HbaRule {
                line: format!(
                    "{kind}\treplication\t{replication_user}\t{host}/32\t{auth_method}",
                    kind = kind,
                    replication_user = replication_user,
                    host = peer.host,
                    auth_method = auth_method,
                ),
            },
        ]
    }

    /// Ensures rules exist for every peer in `diff_nodes`, appending any that
    /// are missing. Early-returns without touching the file when there is
    /// nothing to add (spec.md §4.3, mirrors `keeper_update_group_hba`'s
    /// "early exit when we're alone in the group").
    pub fn ensure_host_rules_exist(
        hba_path: &Path,
        diff_nodes: &[&NodeAddress],
        ssl_active: bool,
        dbname: &str,
        replication_user: &str,
        auth_method: &str,
    ) -> Result<Vec<HbaRule>> {
        if diff_nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut appended = Vec::new();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(hba_path)
            .with_context(|| format!("failed to open {} for append", hba_path.display()))?;

        for peer in diff_nodes {
            for rule in
                HbaManager::rules_for_peer(peer, ssl_active, dbname, replication_user, auth_method)
            {
                writeln!(file, "{}", rule.line).with_context(|| {
                    format!("failed to append HBA rule to {}", hba_path.display())
                })?;
                appended.push(rule);
            }
        }

        file.sync_all()
            .with_context(|| format!("failed to fsync {}", hba_path.display()))?;

        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn peer(node_id: i32, host: &str) -> NodeAddress {
        NodeAddress {
            node_id,
            name: format!("node{node_id}"),
            host: host.to_string(),
            port: 5432,
            lsn: "0/0".to_string(),
            is_primary: false,
        }
    }

    #[test]
    fn empty_previous_list_diffs_to_everything() {
        let current = vec![peer(1, "10.0.0.1"), peer(2, "10.0.0.2")];
        let diff = HbaManager::diff(&[], &current, false);
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn unchanged_peer_is_not_in_diff() {
        let previous = vec![peer(1, "10.0.0.1"), peer(2, "10.0.0.2")];
        let current = previous.clone();
        let diff = HbaManager::diff(&previous, &current, false);
        assert!(diff.is_empty());
    }

    #[test]
    fn new_peer_is_added() {
        let previous = vec![peer(1, "10.0.0.1")];
        let current = vec![peer(1, "10.0.0.1"), peer(2, "10.0.0.2")];
        let diff = HbaManager::diff(&previous, &current, false);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].node_id, 2);
    }

    #[test]
    fn changed_hostname_is_added() {
        let previous = vec![peer(1, "10.0.0.1")];
        let current = vec![peer(1, "10.0.0.99")];
        let diff = HbaManager::diff(&previous, &current, false);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].host, "10.0.0.99");
    }

    #[test]
    fn removed_peer_is_not_reported_for_deletion() {
        let previous = vec![peer(1, "10.0.0.1"), peer(2, "10.0.0.2")];
        let current = vec![peer(1, "10.0.0.1")];
        let diff = HbaManager::diff(&previous, &current, false);
        assert!(diff.is_empty());
    }

    #[test]
    fn removed_lower_id_peer_does_not_mask_unchanged_higher_id_peer() {
        // previous=[(2,h2),(3,h3)], current=[(3,h3)]: node 2 has left the
        // group and node 3 is unchanged, so the diff must be empty — not
        // `[3]`, which is what a walk that forgets to skip stale lower ids
        // would wrongly produce.
        let previous = vec![peer(2, "10.0.0.2"), peer(3, "10.0.0.3")];
        let current = vec![peer(3, "10.0.0.3")];
        let diff = HbaManager::diff(&previous, &current, false);
        assert!(diff.is_empty());
    }

    #[test]
    fn removed_lower_id_peer_does_not_mask_changed_higher_id_peer() {
        let previous = vec![peer(2, "10.0.0.2"), peer(3, "10.0.0.3")];
        let current = vec![peer(3, "10.0.0.99")];
        let diff = HbaManager::diff(&previous, &current, false);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].node_id, 3);
    }

    #[test]
    fn force_invalidate_returns_full_current_list() {
        let previous = vec![peer(1, "10.0.0.1")];
        let current = vec![peer(1, "10.0.0.1"), peer(2, "10.0.0.2")];
        let diff = HbaManager::diff(&previous, &current, true);
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn appends_two_rules_per_peer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        let peers = vec![peer(3, "10.0.0.3")];
        let refs: Vec<&NodeAddress> = peers.iter().collect();

        let appended =
            HbaManager::ensure_host_rules_exist(&path, &refs, false, "postgres", "pgautofailover_replicator", "trust")
                .unwrap();

        assert_eq!(appended.len(), 2);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("host\tpostgres\tpgautofailover_replicator\t10.0.0.3/32\ttrust"));
        assert!(contents.contains("host\treplication\tpgautofailover_replicator\t10.0.0.3/32\ttrust"));
    }

    #[test]
    fn ssl_active_uses_hostssl_prefix() {
        let rules =
            HbaManager::rules_for_peer(&peer(1, "10.0.0.1"), true, "postgres", "repl", "md5");
        assert!(rules[0].line.starts_with("hostssl"));
    }

    #[test]
    fn empty_diff_does_not_touch_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        let appended =
            HbaManager::ensure_host_rules_exist(&path, &[], false, "postgres", "repl", "trust")
                .unwrap();
        assert!(appended.is_empty());
        assert!(!path.exists());
    }
}
