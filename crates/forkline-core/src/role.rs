// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process role within a forkline cluster.

use serde::{Deserialize, Serialize};

/// Environment variable carrying the worker id into forked workers.
///
/// Its presence is what makes a process a worker; the primary never sets it
/// for itself.
pub const WORKER_ID_ENV: &str = "FORKLINE_WORKER_ID";

/// Role of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    /// Coordinating process: forks workers, writes shared files.
    Primary,
    /// Forked process serving requests once released by the primary.
    Worker { id: u32 },
}

impl Role {
    /// Determine the role from [`WORKER_ID_ENV`].
    ///
    /// An unparsable id is treated as absent so a misconfigured environment
    /// never produces a worker that believes it is numbered.
    pub fn from_env() -> Self {
        std::env::var(WORKER_ID_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .map(|id| Role::Worker { id })
            .unwrap_or(Role::Primary)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }

    /// Worker id, if this is a worker.
    pub fn worker_id(&self) -> Option<u32> {
        match self {
            Role::Primary => None,
            Role::Worker { id } => Some(*id),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Worker { id } => write!(f, "worker-{}", id),
        }
    }
}
