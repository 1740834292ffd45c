// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process spawning.
//!
//! Spawners are pure process launchers: supervision, restart and IPC are the
//! supervisor's job. A spawned worker's stdin and stdout are piped so the
//! supervisor can frame messages over them; stderr is inherited so worker logs
//! land next to the primary's.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use forkline_core::WORKER_ID_ENV;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

/// Errors from spawning a worker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// The program could not be started.
    #[error("Failed to spawn worker: {0}")]
    Io(#[from] std::io::Error),

    /// The current executable could not be determined.
    #[error("Cannot locate current executable: {0}")]
    CurrentExe(std::io::Error),
}

/// Launches worker processes.
///
/// Implementations must pipe stdin and stdout of the child; the supervisor
/// uses them as the IPC channel.
pub trait WorkerSpawner: Send + Sync {
    /// Spawner identifier for logs (e.g. "process").
    fn spawner_type(&self) -> &'static str;

    /// Start worker `id`.
    fn spawn(&self, id: u32) -> Result<Child, SpawnError>;
}

/// Spawns workers as OS processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    /// Spawn `program` for each worker.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary with the same arguments.
    ///
    /// The worker id in the environment is what tells the copy it is a worker.
    pub fn current_exe() -> Result<Self, SpawnError> {
        let program = std::env::current_exe().map_err(SpawnError::CurrentExe)?;
        Ok(Self {
            program,
            args: std::env::args_os().skip(1).collect(),
            envs: Vec::new(),
        })
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable for every worker.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawner_type(&self) -> &'static str {
        "process"
    }

    fn spawn(&self, id: u32) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        debug!(
            worker_id = id,
            pid = child.id(),
            program = %self.program.display(),
            "Worker process spawned"
        );
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_sets_worker_id_and_pipes() {
        let spawner = ProcessSpawner::new("sh")
            .arg("-c")
            .arg(format!("echo ${}", WORKER_ID_ENV));

        let child = spawner.spawn(7).unwrap();
        assert!(child.stdin.is_some());
        assert!(child.stdout.is_some());

        let output = child.wait_with_output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "7");
    }

    #[tokio::test]
    async fn test_spawn_missing_program_errors() {
        let spawner = ProcessSpawner::new("/nonexistent/forkline-worker");
        assert!(matches!(spawner.spawn(1), Err(SpawnError::Io(_))));
    }

    #[test]
    fn test_current_exe_resolves() {
        let spawner = ProcessSpawner::current_exe().unwrap();
        assert_eq!(spawner.spawner_type(), "process");
        assert!(spawner.program.exists());
    }
}
