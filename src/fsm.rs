//! FSM Reconciler (spec.md §4.6): pure two-phase reconciliation between the
//! keeper's current role and the role assigned by the monitor.
//!
//! Phase A mirrors `keeper_ensure_current_state` in the original keeper's
//! `keeper.c`; Phase B dispatches to the transition table the monitor's FSM
//! defines. Transition bodies are intentionally thin — the spec treats them
//! as an implementation of already-known monitor transitions, not something
//! this module invents.

use anyhow::Result;

use crate::pg_controller::PostgresController;
use crate::role::Role;
use crate::slots::SlotManager;
use crate::state::{LocalPgState, NodeAddress};

/// One action the reconciler performed, for logging/testing visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    StartedPostgres,
    StartPostgresFailed,
    StoppedPostgres,
    MaintainedSlots,
    Transitioned { from: Role, to: Role },
    TransitionFailed { from: Role, to: Role },
    NoOp,
}

pub struct FsmReconciler;

impl FsmReconciler {
    /// Phase A: ensure Postgres's running-ness matches `current_role`,
    /// skipping the exclusion set (spec.md §4.6).
    pub fn ensure_current_state(
        current_role: Role,
        assigned_role: Role,
        controller: &mut impl PostgresController,
        local: &mut LocalPgState,
        slot_client: Option<&mut impl postgres::GenericClient>,
        peers: &[NodeAddress],
        advance_enabled: bool,
    ) -> Result<Vec<ReconcileAction>> {
        let mut actions = Vec::new();

        if current_role.is_shutdown_bound() || assigned_role.is_shutdown_bound() {
            if current_role.is_shutdown_bound() && controller.is_running()? {
                controller.stop()?;
                actions.push(ReconcileAction::StoppedPostgres);
            }
            return Ok(actions);
        }

        match current_role {
            Role::Primary => {
                let track_retries = true;
                start_with_tracking(controller, local, track_retries, &mut actions)?;
                if let Some(client) = slot_client {
                    SlotManager::drop_removed(client, peers)?;
                    actions.push(ReconcileAction::MaintainedSlots);
                }
            }
            Role::Single => {
                start_with_tracking(controller, local, false, &mut actions)?;
                if let Some(client) = slot_client {
                    SlotManager::drop_removed(client, peers)?;
                    actions.push(ReconcileAction::MaintainedSlots);
                }
            }
            Role::WaitPrimary | Role::PrepPromotion | Role::StopReplication => {
                start_with_tracking(controller, local, false, &mut actions)?;
            }
            Role::Secondary => {
                start_with_tracking(controller, local, false, &mut actions)?;
                if let Some(client) = slot_client {
                    SlotManager::maintain(client, peers, advance_enabled)?;
                    actions.push(ReconcileAction::MaintainedSlots);
                }
            }
            Role::CatchingUp => {
                // No slot maintenance: advancing here could push a slot's
                // restart_lsn past a position this node hasn't caught up to.
                start_with_tracking(controller, local, false, &mut actions)?;
            }
            Role::Maintenance => {
                actions.push(ReconcileAction::NoOp);
            }
            _ => {
                actions.push(ReconcileAction::NoOp);
            }
        }

        Ok(actions)
    }

    /// Phase B: if `assigned != current`, run the transition and report
    /// whether it succeeded. Transitions are total (every pair has a
    /// defined, if sometimes no-op, body) and idempotent; a failing
    /// transition leaves `current_role` unchanged so the loop retries next
    /// iteration (spec.md §4.6).
    pub fn transition(
        current_role: Role,
        assigned_role: Role,
        controller: &mut impl PostgresController,
    ) -> (Role, ReconcileAction) {
        if current_role == assigned_role {
            return (current_role, ReconcileAction::NoOp);
        }

        match run_transition(current_role, assigned_role, controller) {
            Ok(()) => (
                assigned_role,
                ReconcileAction::Transitioned {
                    from: current_role,
                    to: assigned_role,
                },
            ),
            Err(e) => {
                tracing::warn!(
                    from = %current_role,
                    to = %assigned_role,
                    error = %e,
                    "FSM transition failed, retrying next iteration"
                );
                (
                    current_role,
                    ReconcileAction::TransitionFailed {
                        from: current_role,
                        to: assigned_role,
                    },
                )
            }
        }
    }
}

fn start_with_tracking(
    controller: &mut impl PostgresController,
    local: &mut LocalPgState,
    update_retries: bool,
    actions: &mut Vec<ReconcileAction>,
) -> Result<()> {
    if controller.is_running()? {
        return Ok(());
    }

    match controller.start() {
        Ok(()) => {
            if update_retries {
                local.reset_start_failures();
            }
            actions.push(ReconcileAction::StartedPostgres);
            Ok(())
        }
        Err(e) => {
            if update_retries {
                local.record_start_failure();
            }
            actions.push(ReconcileAction::StartPostgresFailed);
            Err(e)
        }
    }
}

/// Transition bodies. Most are Postgres-level no-ops from this module's
/// point of view: the interesting state change already happened (or will
/// happen) through Phase A's start/stop and the Slot/HBA managers; this
/// dispatch exists to drive role-specific one-time actions (promotion,
/// demotion) where Postgres needs to be told something beyond "running or
/// not".
fn run_transition(
    from: Role,
    to: Role,
    controller: &mut impl PostgresController,
) -> Result<()> {
    match (from, to) {
        // Promotion: stop replaying, then start in the new role.
        (_, Role::PrepPromotion) | (_, Role::StopReplication) => {
            if controller.is_running()? {
                controller.stop()?;
            }
            Ok(())
        }
        (_, Role::WaitPrimary) | (_, Role::Primary) | (_, Role::Single) => {
            if !controller.is_running()? {
                controller.start()?;
            }
            Ok(())
        }
        (_, Role::Draining) | (_, Role::DemoteTimeout) | (_, Role::Demoted) => {
            if controller.is_running()? {
                controller.stop()?;
            }
            Ok(())
        }
        (_, Role::Secondary) | (_, Role::CatchingUp) | (_, Role::WaitStandby) => {
            if !controller.is_running()? {
                controller.start()?;
            }
            Ok(())
        }
        (_, Role::Maintenance) => {
            if controller.is_running()? {
                controller.stop()?;
            }
            Ok(())
        }
        (_, Role::ApplySettings) => controller.reload(),
        (_, Role::Dropped) => {
            if controller.is_running()? {
                controller.stop()?;
            }
            Ok(())
        }
        (_, Role::Init) | (_, Role::ReportLsn) => Ok(()),
    }
}
