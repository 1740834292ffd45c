// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared JSON store.
//!
//! One JSON document persisted to a file and mirrored in every process of
//! the cluster. The primary is the writer of record: it persists every
//! mutation and broadcasts the resulting document to workers. Workers apply
//! mutations to their mirror immediately and forward them to the primary.
//!
//! ```text
//! worker.set("db.url", v)          primary
//!   ├─ mirror updated              │
//!   └─ StoreMutation ────────────► apply_forwarded
//!                                  ├─ mirror updated
//!                                  ├─ file written (temp + rename)
//!   apply_remote ◄──────────────── └─ StoreUpdate (full document)
//! ```
//!
//! The mirror changes before the write is persisted or forwarded. If that
//! step fails the caller gets the error but the mirror keeps the change.
//! Rolling back could discard later mutations already queued on top of it.
//! Disk and workers catch up with the next successful commit, because every
//! commit writes and broadcasts the whole document.

mod link;
pub mod path;
mod registry;

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use forkline_protocol::{Mutation, StoreMutation, StoreUpdate};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::keyed_mutex::KeyedMutex;
use crate::role::Role;

pub use link::{LinkError, LocalLink, MemoryHub, StoreLink};
pub use path::PathError;
pub use registry::StoreRegistry;

/// Errors from shared store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Reading or writing the store file failed.
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The store file exists but is not valid JSON.
    #[error("Shared store file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A mutation addressed something it cannot modify.
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// Sending the mutation to the primary failed.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Serializing the document failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another store already uses this channel id.
    #[error("Store channel already registered: {0}")]
    DuplicateChannel(String),

    /// The operation is only meaningful for the other role.
    #[error("{op} is not valid on a {role} store")]
    WrongRole { op: &'static str, role: Role },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Options for opening a [`SharedStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    /// Channel id used to route broadcasts and forwarded mutations.
    pub channel_id: String,
    /// Whether the primary broadcasts after each mutation.
    pub broadcast_on_update: bool,
    /// Defer reading the file until the first operation.
    pub lazy: bool,
    /// Document written when the file does not exist yet.
    pub default_document: Value,
}

impl StoreOptions {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            broadcast_on_update: true,
            lazy: false,
            default_document: Value::Object(Default::default()),
        }
    }

    pub fn with_broadcast_on_update(mut self, broadcast_on_update: bool) -> Self {
        self.broadcast_on_update = broadcast_on_update;
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_default_document(mut self, document: Value) -> Self {
        self.default_document = document;
        self
    }
}

struct StoreInner {
    path: PathBuf,
    options: StoreOptions,
    role: Role,
    link: Arc<dyn StoreLink>,
    writes: KeyedMutex,
    write_key: String,
    /// `None` until loaded (lazy stores only).
    document: RwLock<Option<Value>>,
    changes: watch::Sender<Arc<Value>>,
}

/// Handle to a shared JSON document. Cheap to clone.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("path", &self.inner.path)
            .field("channel", &self.inner.options.channel_id)
            .field("role", &self.inner.role)
            .finish()
    }
}

impl SharedStore {
    /// Open a standalone store: primary role, no peers, private write queue.
    pub async fn init(path: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        Self::open(
            path,
            options,
            Role::Primary,
            Arc::new(LocalLink),
            KeyedMutex::new(),
        )
        .await
    }

    /// Open the store at `path`.
    ///
    /// On the primary a missing file is created with the default document.
    /// Unless the store is lazy the file is read immediately; malformed JSON
    /// fails with [`StoreError::Corrupt`].
    pub async fn open(
        path: impl Into<PathBuf>,
        options: StoreOptions,
        role: Role,
        link: Arc<dyn StoreLink>,
        writes: KeyedMutex,
    ) -> Result<Self> {
        let path = path.into();

        if role.is_primary() && !tokio::fs::try_exists(&path).await.map_err(io_error(&path))? {
            write_atomic(&path, &options.default_document).await?;
            info!(
                path = %path.display(),
                channel = %options.channel_id,
                "Created shared store file"
            );
        }

        let document = if options.lazy {
            None
        } else {
            Some(load(&path, &options, role).await?)
        };

        let (changes, _) = watch::channel(Arc::new(document.clone().unwrap_or(Value::Null)));
        let write_key = format!("store:{}", path.display());

        debug!(
            path = %path.display(),
            channel = %options.channel_id,
            role = %role,
            lazy = options.lazy,
            "Shared store opened"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                options,
                role,
                link,
                writes,
                write_key,
                document: RwLock::new(document),
                changes,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn channel_id(&self) -> &str {
        &self.inner.options.channel_id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Whether the document has been read (always true for non-lazy stores).
    pub fn is_loaded(&self) -> bool {
        self.read_document().is_some()
    }

    /// Value at `path`, cloned out of the mirror.
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.ensure_loaded().await?;
        Ok(self
            .read_document()
            .as_ref()
            .and_then(|document| path::get(document, path).cloned()))
    }

    /// The whole document.
    pub async fn snapshot(&self) -> Result<Value> {
        self.ensure_loaded().await?;
        Ok(self.read_document().clone().unwrap_or(Value::Null))
    }

    /// Receiver that observes every change of the mirror.
    pub async fn subscribe(&self) -> Result<watch::Receiver<Arc<Value>>> {
        self.ensure_loaded().await?;
        Ok(self.inner.changes.subscribe())
    }

    /// Set the value at `path`, creating intermediate objects.
    pub async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.mutate(Mutation::Set {
            path: path.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    /// Append `value` to the array at `path`, creating it if missing.
    pub async fn push(&self, path: &str, value: Value) -> Result<()> {
        self.mutate(Mutation::Push {
            path: path.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    /// Remove the value at `path`. Returns whether anything was removed.
    pub async fn delete(&self, path: &str) -> Result<bool> {
        self.mutate(Mutation::Delete {
            path: path.to_string(),
        })
        .await
    }

    /// Replace the whole document.
    pub async fn replace(&self, document: Value) -> Result<()> {
        self.mutate(Mutation::Replace { document }).await.map(|_| ())
    }

    /// Apply a mutation forwarded by a worker (primary only).
    pub async fn apply_forwarded(&self, mutation: Mutation) -> Result<bool> {
        if !self.inner.role.is_primary() {
            return Err(StoreError::WrongRole {
                op: "apply_forwarded",
                role: self.inner.role,
            });
        }
        self.mutate(mutation).await
    }

    /// Replace the mirror with a document broadcast by the primary.
    ///
    /// Ignored on the primary, whose mirror is authoritative.
    pub fn apply_remote(&self, document: Value) {
        if self.inner.role.is_primary() {
            warn!(channel = %self.channel_id(), "Primary ignoring remote store update");
            return;
        }

        let snapshot = Arc::new(document.clone());
        *self.write_document() = Some(document);
        self.inner.changes.send_replace(snapshot);
        debug!(channel = %self.channel_id(), "Applied store update from primary");
    }

    /// Apply `mutation` to the mirror, then persist (primary) or forward
    /// (worker) it. On error the mirror keeps the change.
    async fn mutate(&self, mutation: Mutation) -> Result<bool> {
        self.ensure_loaded().await?;

        // Mirror update and queue position are taken together so that
        // persistence (or forwarding) follows mutation order.
        let (changed, snapshot, ticket) = {
            let mut guard = self.write_document();
            let document =
                guard.get_or_insert_with(|| self.inner.options.default_document.clone());
            let changed = path::apply(document, &mutation)?;
            let snapshot = Arc::new(document.clone());
            if changed {
                self.inner.changes.send_replace(Arc::clone(&snapshot));
            }
            let ticket = self.inner.writes.acquire(&self.inner.write_key);
            (changed, snapshot, ticket)
        };

        if !changed {
            return Ok(false);
        }

        let _guard = ticket.wait().await;
        match self.inner.role {
            Role::Primary => self.commit(&snapshot).await?,
            Role::Worker { .. } => {
                self.inner
                    .link
                    .forward(StoreMutation {
                        channel: self.channel_id().to_string(),
                        mutation,
                    })
                    .await?
            }
        }
        Ok(true)
    }

    async fn commit(&self, document: &Value) -> Result<()> {
        write_atomic(&self.inner.path, document).await?;

        if self.inner.options.broadcast_on_update {
            let update = StoreUpdate {
                channel: self.channel_id().to_string(),
                document: document.clone(),
            };
            if let Err(e) = self.inner.link.broadcast(update).await {
                warn!(channel = %self.channel_id(), error = %e, "Failed to broadcast store update");
            }
        }
        Ok(())
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        let loaded = load(&self.inner.path, &self.inner.options, self.inner.role).await?;
        let mut guard = self.write_document();
        // A broadcast may have landed while the file was being read.
        if guard.is_none() {
            self.inner.changes.send_replace(Arc::new(loaded.clone()));
            *guard = Some(loaded);
        }
        Ok(())
    }

    fn read_document(&self) -> std::sync::RwLockReadGuard<'_, Option<Value>> {
        self.inner
            .document
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_document(&self) -> std::sync::RwLockWriteGuard<'_, Option<Value>> {
        self.inner
            .document
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn load(path: &Path, options: &StoreOptions, role: Role) -> Result<Value> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !role.is_primary() => {
            warn!(
                path = %path.display(),
                channel = %options.channel_id,
                "Shared store file missing on worker, starting from default document"
            );
            Ok(options.default_document.clone())
        }
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Write `document` next to `path` and rename it into place.
async fn write_atomic(path: &Path, document: &Value) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let bytes = serde_json::to_vec_pretty(document)?;
    tokio::fs::write(&temp, bytes)
        .await
        .map_err(io_error(&temp))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(io_error(path))?;
    Ok(())
}
