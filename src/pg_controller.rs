//! Local control of the Postgres server process (spec.md §5: "a second
//! postgres-controller child exists only to own `pg_ctl` and is not part of
//! the core spec"). We model just the synchronous surface the FSM and the
//! keeper loop need, as a trait so tests can substitute a fake.

use anyhow::Result;

pub trait PostgresController {
    fn is_running(&self) -> Result<bool>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn reload(&mut self) -> Result<()>;
    fn checkpoint(&mut self) -> Result<()>;
}

/// Thin wrapper around `pg_ctl`, invoked as a subprocess against the
/// configured data directory.
pub struct PgCtlController {
    pub pgdata: std::path::PathBuf,
    pub pg_ctl_path: std::path::PathBuf,
}

impl PgCtlController {
    pub fn new(pgdata: impl Into<std::path::PathBuf>, pg_ctl_path: impl Into<std::path::PathBuf>) -> Self {
        PgCtlController {
            pgdata: pgdata.into(),
            pg_ctl_path: pg_ctl_path.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<std::process::ExitStatus> {
        let status = std::process::Command::new(&self.pg_ctl_path)
            .arg("-D")
            .arg(&self.pgdata)
            .args(args)
            .status()?;
        Ok(status)
    }
}

impl PostgresController for PgCtlController {
    fn is_running(&self) -> Result<bool> {
        let status = self.run(&["status"])?;
        Ok(status.success())
    }

    fn start(&mut self) -> Result<()> {
        let status = self.run(&["start", "-w"])?;
        anyhow::ensure!(status.success(), "pg_ctl start failed: {status}");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let status = self.run(&["stop", "-m", "fast", "-w"])?;
        anyhow::ensure!(status.success(), "pg_ctl stop failed: {status}");
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        let status = self.run(&["reload"])?;
        anyhow::ensure!(status.success(), "pg_ctl reload failed: {status}");
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        // CHECKPOINT runs over the SQL connection, not through pg_ctl; the
        // caller issues it via the monitor/local client. Nothing to do here.
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct FakeController {
        pub running: RefCell<bool>,
        pub start_should_fail: bool,
        pub start_calls: RefCell<u32>,
        pub stop_calls: RefCell<u32>,
        pub reload_calls: RefCell<u32>,
    }

    impl PostgresController for FakeController {
        fn is_running(&self) -> Result<bool> {
            Ok(*self.running.borrow())
        }

        fn start(&mut self) -> Result<()> {
            *self.start_calls.borrow_mut() += 1;
            if self.start_should_fail {
                anyhow::bail!("simulated start failure");
            }
            *self.running.borrow_mut() = true;
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            *self.stop_calls.borrow_mut() += 1;
            *self.running.borrow_mut() = false;
            Ok(())
        }

        fn reload(&mut self) -> Result<()> {
            *self.reload_calls.borrow_mut() += 1;
            Ok(())
        }

        fn checkpoint(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
