// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lock store trait definitions.
//!
//! Defines the two atomic primitives a backing store must provide for
//! [`DistributedLock`](super::DistributedLock).

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from distributed lock operations.
///
/// Contention is never an error: it is reported as `Ok(None)` / `Ok(false)`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// Redis command or connection failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backing store is unreachable or rejected the operation.
    #[error("Lock store error: {0}")]
    Store(String),

    /// Acquire options are unusable (e.g. a zero TTL).
    #[error("Invalid lock options: {0}")]
    InvalidOptions(String),
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Atomic key-value primitives backing a distributed lock.
///
/// Both operations must be atomic on the store side: a separate read followed
/// by a write would let two holders race.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Store identifier for logs (e.g. "redis", "memory").
    fn store_type(&self) -> &'static str;

    /// Set `key` to `token` with expiry `ttl` only if `key` does not exist.
    ///
    /// Returns `true` when the key was set.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `token`.
    ///
    /// Returns `true` when the key was deleted.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool>;
}
