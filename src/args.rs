//! CLI surface for the `pg-keeper` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the keeper configuration file.
    #[arg(long, global = true, default_value = "pg_keeper.toml")]
    pub config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register this node with the monitor and initialize local state.
    Create {
        #[arg(long)]
        monitor: String,
        #[arg(long)]
        formation: String,
        #[arg(long, default_value_t = -1)]
        group: i32,
        #[arg(long)]
        name: String,
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        pgport: u16,
        #[arg(long)]
        pgdata: PathBuf,
        #[arg(long, default_value = "postgres")]
        dbname: String,
    },

    /// Run the keeper control loop.
    Run,

    /// Remove this node from the monitor and stop Postgres.
    Drop,

    /// Disable monitor contact entirely; the node operates unsupervised.
    /// Fatal to later re-enable without a fresh `create`.
    DisableMonitor,
}

pub fn get_args() -> Result<Args, clap::Error> {
    Args::try_parse()
}
