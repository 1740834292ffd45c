// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel-addressed registry of open stores.
//!
//! Incoming IPC messages carry a channel id; the registry routes them to the
//! store that owns that channel.
//!
//! A worker starts reading its pipe before its stores are open, so the last
//! broadcast for a channel nobody registered yet is parked and applied when
//! a store registers on it.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use forkline_protocol::{StoreMutation, StoreUpdate};
use serde_json::Value;
use tracing::{debug, warn};

use super::{SharedStore, StoreError};

/// Stores of this process, keyed by channel id.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<DashMap<String, SharedStore>>,
    /// Newest document per channel that had no store yet.
    parked: Arc<DashMap<String, Value>>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store` under its channel id.
    ///
    /// Two stores on one channel would receive each other's broadcasts, so a
    /// second registration for the same channel is rejected.
    pub fn register(&self, store: SharedStore) -> Result<(), StoreError> {
        let channel = store.channel_id().to_string();
        match self.stores.entry(channel.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateChannel(channel)),
            Entry::Vacant(slot) => {
                // Applied under the entry lock so a later broadcast cannot
                // be overtaken by this older one.
                if let Some((_, document)) = self.parked.remove(&channel) {
                    debug!(channel = %channel, "Applying update received before registration");
                    store.apply_remote(document);
                }
                debug!(channel = %channel, "Store registered");
                slot.insert(store);
                Ok(())
            }
        }
    }

    /// Store registered for `channel`.
    pub fn get(&self, channel: &str) -> Option<SharedStore> {
        self.stores.get(channel).map(|entry| entry.value().clone())
    }

    /// Registered channel ids, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Apply a document broadcast from the primary.
    ///
    /// Updates for unknown channels are parked, newest wins, until a store
    /// registers on that channel. The primary may also share stores this
    /// worker never opens; those keep one parked document each.
    pub fn dispatch_update(&self, update: StoreUpdate) {
        match self.stores.entry(update.channel) {
            Entry::Occupied(entry) => entry.get().apply_remote(update.document),
            Entry::Vacant(entry) => {
                debug!(channel = %entry.key(), "Parking update for unregistered channel");
                self.parked.insert(entry.key().clone(), update.document);
            }
        }
    }

    /// Apply a mutation forwarded by a worker.
    ///
    /// Failures are logged rather than returned; the forwarding worker has
    /// already moved on and learns the outcome from the next broadcast.
    pub async fn dispatch_mutation(&self, message: StoreMutation) {
        let Some(store) = self.get(&message.channel) else {
            warn!(channel = %message.channel, "Dropping mutation for unregistered channel");
            return;
        };

        let op = message.mutation.op();
        let path = message.mutation.path().to_string();
        if let Err(e) = store.apply_forwarded(message.mutation).await {
            warn!(
                channel = %message.channel,
                op = op,
                path = %path,
                error = %e,
                "Failed to apply forwarded mutation"
            );
        }
    }
}
