// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forkline Cluster - Multi-Process HTTP Supervisor
//!
//! Runs one primary and N worker processes from a single binary:
//!
//! | Role | Does |
//! |------|------|
//! | primary | opens shared stores, forks and supervises workers, runs startup tasks, releases workers |
//! | worker | mirrors shared stores, waits at the start gate, serves HTTP on the shared port |
//!
//! # Startup sequence
//!
//! ```text
//! primary                                   worker N (FORKLINE_WORKER_ID=N)
//! ───────                                   ───────────────────────────────
//! open stores
//! spawn workers ──────────────────────────► open store mirrors
//! run startup tasks                         "what now" ──┐
//!   (store writes broadcast) ─────────────►              │ every poll_interval
//! mark_ready: "start" ────────────────────► ◄────────────┘
//! answer "what now" with "go ahead"         bind 0.0.0.0:port (SO_REUSEPORT)
//! wait for SIGINT/SIGTERM                   serve until signal or primary gone
//! kill workers
//! ```
//!
//! Worker count is `min(cpus, (memory - reserved) / per_worker, max_forks)`;
//! dead workers are replaced according to the [`RestartPolicy`].
//!
//! # Modules
//!
//! - [`app`]: HTTP application trait and the axum-backed implementation
//! - [`config`]: Environment configuration
//! - [`error`]: Cluster error type
//! - [`link`]: IPC store links for both sides of the pipe
//! - [`resources`]: Host resources and the worker count
//! - [`runtime`]: Primary and worker flows
//! - [`spawner`]: Worker process launching
//! - [`supervisor`]: Worker supervision and restart
//! - [`worker`]: Start gate and shared listening socket

pub mod app;
pub mod config;
pub mod error;
pub mod link;
pub mod resources;
pub mod runtime;
pub mod spawner;
pub mod supervisor;
pub mod worker;

pub use app::{Application, RouterApplication, ServeContext, ServeOptions, default_routes};
pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use link::{ParentLink, ParentState, PrimaryLink};
pub use resources::{ResourceLimits, ResourceSnapshot, worker_count};
pub use runtime::{
    ClusterContext, ClusterRuntime, ClusterRuntimeBuilder, PrimaryRuntime, StartupTask,
};
pub use spawner::{ProcessSpawner, SpawnError, WorkerSpawner};
pub use supervisor::{
    RestartPolicy, Supervisor, SupervisorConfig, SupervisorError, SupervisorEvent,
    SupervisorHandle, WorkerInfo,
};
pub use worker::{GateError, WorkerGate, bind_listener};
