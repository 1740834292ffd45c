// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory lock store.
//!
//! Provides the same atomic semantics as the Redis store inside one process.
//! Used in tests and for single-node deployments without Redis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::traits::{LockError, LockStore, Result};

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

/// Lock store backed by a process-local map with expiry.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
    /// When set, every operation fails as if the store were unreachable.
    unavailable: AtomicBool,
}

impl MemoryLockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current holder token for `key`, ignoring expired entries.
    pub fn holder(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        prune_expired(&mut entries, Instant::now());
        entries.get(key).map(|entry| entry.token.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Store("memory lock store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        prune_expired(&mut entries, now);

        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(key) {
            Some(entry) if entry.token == token && entry.expires_at > now => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Expired keys are dropped rather than overwritten, so the map only holds
/// locks that are currently held.
fn prune_expired(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.expires_at > now);
}
