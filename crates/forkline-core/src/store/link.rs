// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport seam between shared stores in different processes.
//!
//! The primary broadcasts full documents to workers; workers forward their
//! mutations to the primary. The IPC-backed links live in `forkline-cluster`;
//! this module holds the trait plus the in-process implementations.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use forkline_protocol::{FrameError, StoreMutation, StoreUpdate};
use thiserror::Error;
use tracing::debug;

use super::registry::StoreRegistry;

/// Errors from sending store messages between processes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkError {
    /// The peer is gone.
    #[error("Link to peer closed")]
    Closed,

    /// The link cannot carry this kind of message.
    #[error("Link does not support {0}")]
    Unsupported(&'static str),

    /// Encoding or writing the frame failed.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Carries store messages to the other side of the cluster.
///
/// On the primary, `broadcast` reaches every live worker and `forward` is
/// unsupported. On a worker, `forward` reaches the primary and `broadcast`
/// is unsupported.
#[async_trait]
pub trait StoreLink: Send + Sync {
    /// Send a full document to every worker.
    async fn broadcast(&self, update: StoreUpdate) -> Result<(), LinkError>;

    /// Send a mutation to the primary.
    async fn forward(&self, mutation: StoreMutation) -> Result<(), LinkError>;
}

/// Link for a process with no peers.
///
/// Broadcasts go nowhere; forwarding fails because there is no primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalLink;

#[async_trait]
impl StoreLink for LocalLink {
    async fn broadcast(&self, update: StoreUpdate) -> Result<(), LinkError> {
        debug!(channel = %update.channel, "No workers to broadcast to");
        Ok(())
    }

    async fn forward(&self, _mutation: StoreMutation) -> Result<(), LinkError> {
        Err(LinkError::Unsupported("forwarding without a primary"))
    }
}

/// In-process stand-in for a cluster: one primary registry and any number
/// of worker registries.
///
/// Messages are delivered inline, so once a worker mutation returns the
/// primary has persisted it and every worker mirror has been refreshed.
#[derive(Debug, Default)]
pub struct MemoryHub {
    primary: StoreRegistry,
    workers: Mutex<Vec<StoreRegistry>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry the primary's stores must be registered in.
    pub fn primary_registry(&self) -> StoreRegistry {
        self.primary.clone()
    }

    /// Link for the primary's stores.
    pub fn primary_link(self: &Arc<Self>) -> Arc<dyn StoreLink> {
        Arc::new(HubLink {
            hub: Arc::clone(self),
            side: Side::Primary,
        })
    }

    /// Attach a worker whose stores live in `registry` and return its link.
    pub fn worker_link(self: &Arc<Self>, registry: StoreRegistry) -> Arc<dyn StoreLink> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registry);
        Arc::new(HubLink {
            hub: Arc::clone(self),
            side: Side::Worker,
        })
    }

    fn worker_registries(&self) -> Vec<StoreRegistry> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Primary,
    Worker,
}

struct HubLink {
    hub: Arc<MemoryHub>,
    side: Side,
}

#[async_trait]
impl StoreLink for HubLink {
    async fn broadcast(&self, update: StoreUpdate) -> Result<(), LinkError> {
        if self.side != Side::Primary {
            return Err(LinkError::Unsupported("broadcast from a worker"));
        }
        for registry in self.hub.worker_registries() {
            registry.dispatch_update(update.clone());
        }
        Ok(())
    }

    async fn forward(&self, mutation: StoreMutation) -> Result<(), LinkError> {
        if self.side != Side::Worker {
            return Err(LinkError::Unsupported("forwarding from the primary"));
        }
        self.hub.primary.dispatch_mutation(mutation).await;
        Ok(())
    }
}
