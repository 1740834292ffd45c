// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for forkline-cluster.

use std::net::SocketAddr;

use thiserror::Error;

/// Cluster errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A required builder field was not set.
    #[error("{0} is required")]
    Missing(&'static str),

    /// Opening or updating a shared store failed.
    #[error("Store error: {0}")]
    Store(#[from] forkline_core::StoreError),

    /// Connecting the distributed lock failed.
    #[error("Lock error: {0}")]
    Lock(#[from] forkline_core::LockError),

    /// The supervisor stopped unexpectedly.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// Worker spawning could not be set up.
    #[error("Spawn error: {0}")]
    Spawn(#[from] crate::spawner::SpawnError),

    /// The worker was never released.
    #[error("Worker gate error: {0}")]
    Gate(#[from] crate::worker::GateError),

    /// The shared listening socket could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// A startup task failed on the primary.
    #[error("Startup task '{name}' failed: {source}")]
    StartupTask {
        name: String,
        source: anyhow::Error,
    },

    /// The application stopped with an error.
    #[error("Application error: {0}")]
    Application(anyhow::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using cluster Error.
pub type Result<T> = std::result::Result<T, Error>;
