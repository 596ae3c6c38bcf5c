//! Monitor Client: a typed RPC facade over the monitor's `pgautofailover`
//! extension schema (spec.md §4.4).
//!
//! Ported from `monitor_register_node` / `monitor_node_active` /
//! `monitor_get_other_nodes` and friends in the original keeper's
//! `monitor.c`. Every RPC here (beyond `node_active`, which the main-loop
//! profile retries at the outer loop instead, and `register_node`, which has
//! bespoke conflict handling) is wrapped in the client's own
//! `ConnectionRetryPolicy` and transparently retries the SQLSTATE classes
//! spec.md §4.4 calls out (classes 53/54, serialization failures, deadlocks,
//! statement-completion-unknown).

use anyhow::{Context, Result};
use postgres::{Client, NoTls};

use crate::error::KeeperError;
use crate::retry::ConnectionRetryPolicy;
use crate::role::{Role, RoleFilter};
use crate::state::{MonitorAssignedState, NodeAddress};

pub struct MonitorClient {
    client: Client,
    retry_policy: ConnectionRetryPolicy,
}

impl MonitorClient {
    pub fn connect(monitor_uri: &str) -> Result<Self> {
        let client = Client::connect(monitor_uri, NoTls)
            .with_context(|| format!("failed to connect to monitor at {monitor_uri}"))?;
        Ok(MonitorClient {
            client,
            retry_policy: ConnectionRetryPolicy::monitor_interactive(),
        })
    }

    /// Runs `f` against the underlying client, transparently retrying under
    /// `self.retry_policy` while the error's SQLSTATE is one of the classes
    /// spec.md §4.4 marks retryable. Any other error, or a retryable one once
    /// the policy is exhausted, comes back as `KeeperError::TransientRemote`
    /// (still useful to the caller for logging/taxonomy) or as `anyhow`
    /// context for everything else.
    fn call_with_retry<T>(
        &mut self,
        action: &'static str,
        mut f: impl FnMut(&mut Client) -> std::result::Result<T, postgres::Error>,
    ) -> Result<T> {
        loop {
            match f(&mut self.client) {
                Ok(value) => {
                    self.retry_policy.reset();
                    return Ok(value);
                }
                Err(e) => {
                    let sqlstate = sqlstate_of(&e);

                    if KeeperError::is_retryable_sqlstate(&sqlstate) && !self.retry_policy.expired()
                    {
                        let sleep = self.retry_policy.next_sleep();
                        tracing::warn!(
                            sqlstate = %sqlstate,
                            action,
                            ?sleep,
                            "retrying transient monitor error"
                        );
                        std::thread::sleep(sleep);
                        continue;
                    }

                    self.retry_policy.reset();
                    return Err(classify_error(e, action));
                }
            }
        }
    }

    /// Registration, run inside a real `BEGIN ... COMMIT` transaction
    /// (spec.md §4.4 steps 1-5, §8 invariant I6). `persist` is called with
    /// the monitor's answer after `register_node` succeeds but before the
    /// transaction commits; it is expected to write the local state file and
    /// init marker. If `persist` fails the transaction is rolled back and
    /// the registration never becomes visible on the monitor — `persist`
    /// itself is responsible for unlinking any partial files it already
    /// wrote. On a `55006` (object-in-use) conflict from a concurrent
    /// registration, the whole transaction is retried from `BEGIN`.
    #[allow(clippy::too_many_arguments)]
    pub fn register_node_with(
        &mut self,
        formation: &str,
        name: &str,
        host: &str,
        port: i32,
        system_identifier: i64,
        dbname: &str,
        desired_group_id: i32,
        initial_role: Role,
        node_kind: &str,
        candidate_priority: i32,
        replication_quorum: bool,
        retry_policy: &mut ConnectionRetryPolicy,
        persist: impl FnOnce(&MonitorAssignedState) -> Result<()>,
    ) -> Result<MonitorAssignedState> {
        const SQL: &str = "SELECT * FROM pgautofailover.register_node($1, $2, $3, $4, $5, $6, $7, \
             $8::pgautofailover.replication_state, $9, $10, $11)";

        let mut persist = Some(persist);

        loop {
            let mut txn = self
                .client
                .transaction()
                .context("failed to BEGIN registration transaction")?;

            let result = txn.query_one(
                SQL,
                &[
                    &formation,
                    &host,
                    &port,
                    &dbname,
                    &name,
                    &system_identifier,
                    &desired_group_id,
                    &initial_role.as_str(),
                    &node_kind,
                    &candidate_priority,
                    &replication_quorum,
                ],
            );

            match result {
                Ok(row) => {
                    let assigned = parse_assigned_state(&row)?;
                    let persist = persist
                        .take()
                        .expect("register_node_with persist called more than once");

                    match persist(&assigned) {
                        Ok(()) => {
                            txn.commit().context("failed to COMMIT node registration")?;
                            return Ok(assigned);
                        }
                        Err(persist_err) => {
                            let _ = txn.rollback();
                            return Err(persist_err).context(
                                "rolled back node registration after local persistence failure",
                            );
                        }
                    }
                }
                Err(e) => {
                    let _ = txn.rollback();
                    let sqlstate = sqlstate_of(&e);

                    if sqlstate == crate::error::STR_ERRCODE_OBJECT_IN_USE
                        && !retry_policy.expired()
                    {
                        let sleep = retry_policy.next_sleep();
                        tracing::warn!(
                            ?sleep,
                            "monitor is registering another node concurrently, retrying"
                        );
                        std::thread::sleep(sleep);
                        continue;
                    }

                    if sqlstate == crate::error::STR_ERRCODE_EXCLUSION_VIOLATION {
                        return Err(KeeperError::RegistrationConflict {
                            system_identifier: system_identifier as u64,
                            message: format!(
                                "another node already exists in group {desired_group_id} of \
                                 formation {formation:?} with a different system_identifier"
                            ),
                        }
                        .into());
                    }

                    if KeeperError::is_retryable_sqlstate(&sqlstate) && !retry_policy.expired() {
                        let sleep = retry_policy.next_sleep();
                        tracing::warn!(sqlstate = %sqlstate, ?sleep, "retrying register_node");
                        std::thread::sleep(sleep);
                        continue;
                    }

                    return Err(classify_error(e, "register_node"));
                }
            }
        }
    }

    /// The per-loop heartbeat (spec.md §4.4). `pg_is_running` here is the
    /// already-adjusted "report" value, not the raw probe value (§4.7).
    #[allow(clippy::too_many_arguments)]
    pub fn node_active(
        &mut self,
        formation: &str,
        node_id: i32,
        group_id: i32,
        current_role: Role,
        pg_is_running: bool,
        current_lsn: &str,
        sync_state: &str,
    ) -> Result<MonitorAssignedState> {
        const SQL: &str = "SELECT * FROM pgautofailover.node_active($1, $2, $3, \
             $4::pgautofailover.replication_state, $5, $6, $7)";

        let row = self
            .client
            .query_one(
                SQL,
                &[
                    &formation,
                    &node_id,
                    &group_id,
                    &current_role.as_str(),
                    &pg_is_running,
                    &current_lsn,
                    &sync_state,
                ],
            )
            .map_err(|e| classify_error(e, "node_active"))?;

        parse_assigned_state(&row)
    }

    /// Returns the peer array sorted by `nodeId` (spec.md §3/§4.4).
    pub fn get_other_nodes(&mut self, node_id: i32, filter: RoleFilter) -> Result<Vec<NodeAddress>> {
        let rows = match filter {
            RoleFilter::AnyState => self.call_with_retry("get_other_nodes", |client| {
                client.query(
                    "SELECT node_id, node_name, node_host, node_port, node_lsn, node_is_primary \
                     FROM pgautofailover.get_other_nodes($1) ORDER BY node_id",
                    &[&node_id],
                )
            })?,
            other => self.call_with_retry("get_other_nodes", |client| {
                client.query(
                    "SELECT node_id, node_name, node_host, node_port, node_lsn, node_is_primary \
                     FROM pgautofailover.get_other_nodes($1, $2::pgautofailover.replication_state) \
                     ORDER BY node_id",
                    &[&node_id, &other.as_sql_str()],
                )
            })?,
        };

        Ok(rows.iter().map(parse_node_address).collect())
    }

    pub fn get_primary(&mut self, formation: &str, group_id: i32) -> Result<NodeAddress> {
        let row = self.call_with_retry("get_primary", |client| {
            client.query_one(
                "SELECT * FROM pgautofailover.get_primary($1, $2)",
                &[&formation, &group_id],
            )
        })?;
        Ok(parse_node_address(&row))
    }

    pub fn get_most_advanced_standby(
        &mut self,
        formation: &str,
        group_id: i32,
    ) -> Result<NodeAddress> {
        let row = self.call_with_retry("get_most_advanced_standby", |client| {
            client.query_one(
                "SELECT * FROM pgautofailover.get_most_advanced_standby($1, $2)",
                &[&formation, &group_id],
            )
        })?;
        Ok(parse_node_address(&row))
    }

    pub fn remove_node(&mut self, host: &str, port: i32) -> Result<()> {
        self.call_with_retry("remove_node", |client| {
            client.execute("SELECT pgautofailover.remove_node($1, $2)", &[&host, &port])
        })?;
        Ok(())
    }

    pub fn update_node_metadata(
        &mut self,
        node_id: i32,
        name: &str,
        hostname: &str,
        port: i32,
    ) -> Result<()> {
        self.call_with_retry("update_node_metadata", |client| {
            client.execute(
                "SELECT * FROM pgautofailover.update_node_metadata($1, $2, $3, $4)",
                &[&node_id, &name, &hostname, &port],
            )
        })?;
        Ok(())
    }

    pub fn start_maintenance(&mut self, node_id: i32) -> Result<()> {
        self.call_with_retry("start_maintenance", |client| {
            client.execute("SELECT pgautofailover.start_maintenance($1)", &[&node_id])
        })?;
        Ok(())
    }

    pub fn stop_maintenance(&mut self, node_id: i32) -> Result<()> {
        self.call_with_retry("stop_maintenance", |client| {
            client.execute("SELECT pgautofailover.stop_maintenance($1)", &[&node_id])
        })?;
        Ok(())
    }

    pub fn perform_failover(&mut self, formation: &str, group_id: i32) -> Result<()> {
        self.call_with_retry("perform_failover", |client| {
            client.execute(
                "SELECT pgautofailover.perform_failover($1, $2)",
                &[&formation, &group_id],
            )
        })?;
        Ok(())
    }

    /// Version-compatibility check (spec.md §4.4): called every loop
    /// iteration. A mismatch is fatal to the process, not just this call;
    /// the caller decides what exit code to use.
    pub fn get_extension_version(&mut self) -> Result<String> {
        let row = self.call_with_retry("get_extension_version", |client| {
            client.query_one(
                "SELECT default_version FROM pg_available_extensions \
                 WHERE name = 'pgautofailover'",
                &[],
            )
        })?;
        Ok(row.get(0))
    }

    pub fn listen_state_and_log(&mut self) -> Result<()> {
        self.call_with_retry("listen_state_and_log", |client| {
            client.batch_execute("LISTEN state; LISTEN log;")
        })?;
        Ok(())
    }
}

/// Extracts the SQLSTATE code from a driver error, or the empty string for
/// errors that never reached the server (connection failures, etc.).
fn sqlstate_of(e: &postgres::Error) -> String {
    e.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// Turns a driver error into a typed `KeeperError::TransientRemote` when its
/// SQLSTATE is one of the classes spec.md §4.4 calls retryable (useful even
/// once the retry budget is spent, so the caller can tell a transient remote
/// failure apart from a hard local one), otherwise wraps it as plain
/// `anyhow` context.
fn classify_error(e: postgres::Error, action: &'static str) -> anyhow::Error {
    let sqlstate = sqlstate_of(&e);
    if KeeperError::is_retryable_sqlstate(&sqlstate) {
        KeeperError::TransientRemote {
            sqlstate,
            message: e.to_string(),
        }
        .into()
    } else {
        anyhow::Error::new(e).context(format!("{action} failed"))
    }
}

fn parse_assigned_state(row: &postgres::Row) -> Result<MonitorAssignedState> {
    let role_str: String = row.get("assigned_node_state");
    let role: Role = role_str
        .parse()
        .map_err(|_| KeeperError::UnknownRole(role_str.clone()))?;

    Ok(MonitorAssignedState {
        node_id: row.get("assigned_node_id"),
        group_id: row.get("assigned_group_id"),
        role,
        candidate_priority: row.try_get("assigned_candidate_priority").unwrap_or(0),
        replication_quorum: row.try_get("assigned_replication_quorum").unwrap_or(true),
        name: row.try_get("assigned_node_name").unwrap_or_default(),
    })
}

fn parse_node_address(row: &postgres::Row) -> NodeAddress {
    NodeAddress {
        node_id: row.get(0),
        name: row.get(1),
        host: row.get(2),
        port: row.get::<_, i32>(3) as u16,
        lsn: row.try_get(4).unwrap_or_else(|_| "0/0".to_string()),
        is_primary: row.try_get(5).unwrap_or(false),
    }
}
