// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed named locks.
//!
//! A lock named `n` is the key `lock:n` in a [`LockStore`], holding a random
//! token that identifies the holder. Acquire is an atomic set-if-absent with
//! a TTL, release is an atomic compare-and-delete, so a holder whose lock
//! expired can never delete a lock that has since been taken by someone else.
//!
//! Contention is not an error: [`DistributedLock::acquire`] returns `Ok(None)`
//! once its retries are exhausted, while store failures surface as
//! [`LockError`].

mod memory;
mod redis_store;
mod traits;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

pub use memory::MemoryLockStore;
pub use redis_store::RedisLockStore;
pub use traits::*;

/// Upper bound of the random jitter added to TTLs and retry delays.
pub const MAX_JITTER_MS: u64 = 30;

/// Key under which the lock `name` is stored.
pub fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

/// Options for [`DistributedLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOptions {
    /// How long the lock lives if never released.
    pub ttl: Duration,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Attempts after the first one.
    pub max_retries: u32,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(10_000),
            retry_delay: Duration::from_millis(100),
            max_retries: 30,
        }
    }
}

impl AcquireOptions {
    /// Single attempt with the given TTL.
    pub fn once(ttl: Duration) -> Self {
        Self {
            ttl,
            retry_delay: Duration::ZERO,
            max_retries: 0,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Opaque token identifying one successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Token value as stored in the lock store.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
}

/// Named mutual exclusion across processes and machines.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("store", &self.store.store_type())
            .finish()
    }
}

impl DistributedLock {
    /// Create a lock client on top of `store`.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Backing store identifier.
    pub fn store_type(&self) -> &'static str {
        self.store.store_type()
    }

    /// Try to take the lock `name`, retrying while it is held elsewhere.
    ///
    /// Makes one attempt plus up to `max_retries` retries, sleeping
    /// `retry_delay` (plus jitter) between them. Returns `Ok(None)` when every
    /// attempt found the lock taken.
    pub async fn acquire(&self, name: &str, options: AcquireOptions) -> Result<Option<LockToken>> {
        if options.ttl.is_zero() {
            return Err(LockError::InvalidOptions("ttl must be positive".to_string()));
        }

        let key = lock_key(name);
        let token = LockToken::generate();
        let ttl = options.ttl + jitter();

        for attempt in 0..=options.max_retries {
            if self.store.set_if_absent(&key, token.as_str(), ttl).await? {
                debug!(
                    lock = %name,
                    attempt = attempt,
                    ttl_ms = ttl.as_millis() as u64,
                    "Distributed lock acquired"
                );
                return Ok(Some(token));
            }

            if attempt < options.max_retries {
                tokio::time::sleep(options.retry_delay + jitter()).await;
            }
        }

        debug!(
            lock = %name,
            attempts = options.max_retries + 1,
            "Distributed lock not acquired"
        );
        Ok(None)
    }

    /// Single attempt to take the lock `name`.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        self.acquire(name, AcquireOptions::once(ttl)).await
    }

    /// Release the lock `name` if `token` still holds it.
    ///
    /// Returns `Ok(false)` when the lock expired, was taken by another
    /// holder, or was already released.
    pub async fn release(&self, name: &str, token: &LockToken) -> Result<bool> {
        let released = self
            .store
            .compare_and_delete(&lock_key(name), token.as_str())
            .await?;
        if released {
            debug!(lock = %name, "Distributed lock released");
        } else {
            debug!(lock = %name, "Distributed lock not held by token, nothing released");
        }
        Ok(released)
    }

    /// Run `f` while holding the lock `name`.
    ///
    /// Returns `Ok(None)` without running `f` when the lock could not be
    /// acquired. A failed release is logged; the output of `f` is still
    /// returned since the lock expires on its own.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        options: AcquireOptions,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.acquire(name, options).await? else {
            return Ok(None);
        };

        let output = f().await;

        match self.release(name, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %name, "Distributed lock expired before release"),
            Err(e) => warn!(lock = %name, error = %e, "Failed to release distributed lock"),
        }

        Ok(Some(output))
    }
}
