//! Library entry point for the `pg-keeper` control-loop agent.

pub mod args;
pub mod config;
pub mod error;
pub mod fsm;
pub mod hba;
pub mod keeper_loop;
pub mod monitor_client;
pub mod pg_controller;
pub mod probe;
pub mod retry;
pub mod role;
pub mod slots;
pub mod state;

pub use error::{ExitCode, KeeperError};
pub use role::{Role, RoleFilter};
pub use state::{ControlData, KeeperState, LocalPgState, MonitorAssignedState, NodeAddress, StateStore};
