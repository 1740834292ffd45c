// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! IPC-backed store links.
//!
//! [`PrimaryLink`] pushes store updates through the supervisor to every
//! worker. [`ParentLink`] is the worker's end of the pipe: it applies
//! incoming updates to the local registry, tracks the start signal, and
//! carries forwarded mutations and gate pings back to the primary.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use forkline_core::{LinkError, StoreLink, StoreRegistry};
use forkline_protocol::{Frame, FrameError, FramedStream, Message, StoreMutation, StoreUpdate};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::supervisor::{SupervisorError, SupervisorHandle};

/// Primary side link. Broadcasts go to the supervisor once one is attached.
///
/// Stores are opened before the supervisor exists, so the handle is attached
/// afterwards; until then there are no workers and broadcasts are no-ops.
#[derive(Debug, Clone, Default)]
pub struct PrimaryLink {
    supervisor: Arc<OnceLock<SupervisorHandle>>,
}

impl PrimaryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route broadcasts through `handle`. Returns false if already attached.
    pub fn attach(&self, handle: SupervisorHandle) -> bool {
        self.supervisor.set(handle).is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.supervisor.get().is_some()
    }
}

#[async_trait]
impl StoreLink for PrimaryLink {
    async fn broadcast(&self, update: StoreUpdate) -> Result<(), LinkError> {
        match self.supervisor.get() {
            Some(handle) => match handle.broadcast(Message::StoreUpdate(update)) {
                Ok(()) => Ok(()),
                Err(SupervisorError::Frame(e)) => Err(LinkError::Frame(e)),
                Err(_) => Err(LinkError::Closed),
            },
            None => {
                debug!(channel = %update.channel, "No workers yet, broadcast skipped");
                Ok(())
            }
        }
    }

    async fn forward(&self, _mutation: StoreMutation) -> Result<(), LinkError> {
        Err(LinkError::Unsupported("forwarding from the primary"))
    }
}

/// What the worker has heard from its parent so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentState {
    /// `"start"` or `"go ahead"` was received.
    pub released: bool,
    /// The pipe to the parent is gone.
    pub closed: bool,
}

/// Worker side of the primary/worker pipe.
///
/// Cloning shares the same pipe.
#[derive(Debug, Clone)]
pub struct ParentLink {
    outbox: mpsc::UnboundedSender<Frame>,
    state: watch::Receiver<ParentState>,
}

impl ParentLink {
    /// Start reading frames from `reader` and writing frames to `writer`.
    ///
    /// Store updates are applied to `registry` as they arrive.
    pub fn new<R, W>(reader: R, writer: W, registry: StoreRegistry) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, outgoing) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ParentState::default());
        let state_tx = Arc::new(state_tx);

        tokio::spawn(read_from_parent(reader, registry, state_tx.clone()));
        tokio::spawn(write_to_parent(writer, outgoing, state_tx));

        Self { outbox, state }
    }

    /// Link over this process's stdin and stdout.
    pub fn stdio(registry: StoreRegistry) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), registry)
    }

    /// Queue `message` for the parent.
    ///
    /// Encoding happens here: a message that does not fit in a frame fails
    /// with [`LinkError::Frame`] and the pipe stays open.
    pub fn send(&self, message: Message) -> Result<(), LinkError> {
        if self.state.borrow().closed {
            return Err(LinkError::Closed);
        }
        let frame = message.to_frame()?;
        self.outbox.send(frame).map_err(|_| LinkError::Closed)
    }

    pub fn state(&self) -> ParentState {
        *self.state.borrow()
    }

    /// Receiver that changes whenever [`ParentState`] does.
    pub fn watch(&self) -> watch::Receiver<ParentState> {
        self.state.clone()
    }

    /// Resolve once the parent is gone.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means both pipe tasks ended, which only happens on close.
        let _ = state.wait_for(|s| s.closed).await;
    }
}

#[async_trait]
impl StoreLink for ParentLink {
    async fn broadcast(&self, _update: StoreUpdate) -> Result<(), LinkError> {
        Err(LinkError::Unsupported("broadcasting from a worker"))
    }

    async fn forward(&self, mutation: StoreMutation) -> Result<(), LinkError> {
        self.send(Message::StoreMutation(mutation))
    }
}

async fn read_from_parent<R>(
    reader: R,
    registry: StoreRegistry,
    state: Arc<watch::Sender<ParentState>>,
) where
    R: AsyncRead + Unpin,
{
    let mut stream = FramedStream::new(reader);
    loop {
        match stream.recv().await {
            Ok(Message::Control(signal)) if signal.releases_worker() => {
                let first = !state.borrow().released;
                state.send_modify(|s| s.released = true);
                if first {
                    info!(signal = %signal, "Released by primary");
                }
            }
            Ok(Message::Control(signal)) => {
                debug!(signal = %signal, "Ignoring control signal from primary");
            }
            Ok(Message::StoreUpdate(update)) => registry.dispatch_update(update),
            Ok(Message::StoreMutation(mutation)) => {
                debug!(channel = %mutation.channel, "Ignoring store mutation from primary");
            }
            Err(FrameError::ConnectionClosed) => {
                info!("Parent pipe closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Invalid frame from parent, closing link");
                break;
            }
        }
    }
    state.send_modify(|s| s.closed = true);
}

/// Frames arrive already encoded, so a failed write means the pipe is gone.
async fn write_to_parent<W>(
    writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    state: Arc<watch::Sender<ParentState>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut stream = FramedStream::new(writer);
    let mut closed = state.subscribe();
    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = stream.write_frame(&frame).await {
                    debug!(error = %e, "Write to parent failed");
                    state.send_modify(|s| s.closed = true);
                    break;
                }
            }
            _ = async { let _ = closed.wait_for(|s| s.closed).await; } => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkline_core::{Role, SharedStore, StoreOptions};
    use forkline_protocol::{ControlSignal, Mutation};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type FromWorker = FramedStream<ReadHalf<DuplexStream>>;
    type ToWorker = FramedStream<WriteHalf<DuplexStream>>;

    fn link_pair(registry: StoreRegistry) -> (ParentLink, FromWorker, ToWorker) {
        let (worker_end, primary_end) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_end);
        let (primary_read, primary_write) = tokio::io::split(primary_end);
        let link = ParentLink::new(worker_read, worker_write, registry);
        (
            link,
            FramedStream::new(primary_read),
            FramedStream::new(primary_write),
        )
    }

    #[tokio::test]
    async fn test_primary_link_without_supervisor_is_noop() {
        let link = PrimaryLink::new();
        assert!(!link.is_attached());
        let update = StoreUpdate {
            channel: "config".to_string(),
            document: json!({}),
        };
        assert!(link.broadcast(update).await.is_ok());
    }

    #[tokio::test]
    async fn test_primary_link_refuses_forward() {
        let link = PrimaryLink::new();
        let mutation = StoreMutation {
            channel: "config".to_string(),
            mutation: Mutation::Delete {
                path: "a".to_string(),
            },
        };
        assert!(matches!(
            link.forward(mutation).await,
            Err(LinkError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_parent_link_tracks_release() {
        let (link, _from_worker, mut to_worker) = link_pair(StoreRegistry::new());
        assert_eq!(link.state(), ParentState::default());

        to_worker
            .send(&Message::control(ControlSignal::Start))
            .await
            .unwrap();

        let mut state = link.watch();
        let released =
            tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| s.released))
                .await
                .unwrap()
                .unwrap();
        assert!(released.released);
        assert!(!released.closed);
    }

    #[tokio::test]
    async fn test_parent_link_applies_updates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = StoreRegistry::new();
        let (link, _from_worker, mut to_worker) = link_pair(registry.clone());

        let store = SharedStore::open(
            dir.path().join("shared.json"),
            StoreOptions::new("config"),
            Role::Worker { id: 1 },
            Arc::new(link.clone()),
            forkline_core::KeyedMutex::new(),
        )
        .await
        .unwrap();
        registry.register(store.clone()).unwrap();
        let mut changes = store.subscribe().await.unwrap();

        to_worker
            .send(&Message::store_update("config", json!({"db": {"models": {"User": "user"}}})))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            store.get("db.models.User").await.unwrap(),
            Some(json!("user"))
        );
    }

    #[tokio::test]
    async fn test_parent_link_forwards_mutations() {
        let (link, mut from_worker, _to_worker) = link_pair(StoreRegistry::new());

        let mutation = StoreMutation {
            channel: "config".to_string(),
            mutation: Mutation::Set {
                path: "a".to_string(),
                value: json!(1),
            },
        };
        link.forward(mutation.clone()).await.unwrap();

        let received = from_worker.recv().await.unwrap();
        assert_eq!(received, Message::StoreMutation(mutation));
    }

    #[tokio::test]
    async fn test_oversized_write_fails_without_closing_link() {
        let dir = tempfile::tempdir().unwrap();
        let (link, mut from_worker, _to_worker) = link_pair(StoreRegistry::new());
        let store = SharedStore::open(
            dir.path().join("shared.json"),
            StoreOptions::new("config"),
            Role::Worker { id: 1 },
            Arc::new(link.clone()),
            forkline_core::KeyedMutex::new(),
        )
        .await
        .unwrap();

        let blob = "x".repeat(forkline_protocol::frame::MAX_FRAME_SIZE + 1);
        let err = store.set("blob", json!(blob)).await.unwrap_err();
        assert!(matches!(
            err,
            forkline_core::StoreError::Link(LinkError::Frame(FrameError::FrameTooLarge(_)))
        ));
        assert!(!link.state().closed);

        // The pipe still carries the next write
        store.set("small", json!(1)).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), from_worker.recv())
            .await
            .unwrap()
            .unwrap();
        match received {
            Message::StoreMutation(mutation) => assert_eq!(mutation.mutation.path(), "small"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parent_link_reports_close() {
        let (link, from_worker, to_worker) = link_pair(StoreRegistry::new());
        drop(to_worker);
        drop(from_worker);

        tokio::time::timeout(Duration::from_secs(1), link.closed())
            .await
            .unwrap();
        assert!(link.state().closed);
        assert!(matches!(
            link.send(Message::control(ControlSignal::WhatNow)),
            Err(LinkError::Closed)
        ));
    }
}
