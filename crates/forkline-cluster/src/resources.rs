// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host resources and the worker count derived from them.

use sysinfo::System;

/// Host capacity at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Logical CPUs.
    pub cpus: usize,
    /// Total physical memory in bytes.
    pub total_memory_bytes: u64,
}

impl ResourceSnapshot {
    /// Read CPU count and total memory from the host.
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            cpus: num_cpus::get(),
            total_memory_bytes: system.total_memory(),
        }
    }
}

/// Budget used to turn a [`ResourceSnapshot`] into a worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Configured cap.
    pub max_forks: usize,
    /// Memory each worker is expected to use.
    pub worker_memory_bytes: u64,
    /// Memory left for the OS and the primary.
    pub reserved_memory_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_forks: 4,
            worker_memory_bytes: 512 * 1024 * 1024,
            reserved_memory_bytes: 2048 * 1024 * 1024,
        }
    }
}

/// Number of workers to fork:
/// `min(cpus, (total - reserved) / per_worker, max_forks)`, never below one.
pub fn worker_count(snapshot: ResourceSnapshot, limits: ResourceLimits) -> usize {
    let available = snapshot
        .total_memory_bytes
        .saturating_sub(limits.reserved_memory_bytes);
    let by_memory = available
        .checked_div(limits.worker_memory_bytes)
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);

    snapshot
        .cpus
        .min(by_memory)
        .min(limits.max_forks)
        .max(1)
}
