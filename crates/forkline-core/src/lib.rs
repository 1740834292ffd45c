// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forkline Core - Coordination Primitives
//!
//! Building blocks shared by the primary and its workers:
//!
//! | Primitive | Scope | Purpose |
//! |-----------|-------|---------|
//! | [`KeyedMutex`] | one process | FIFO serialization of async work per name |
//! | [`DistributedLock`] | all processes and hosts | named mutual exclusion with TTL over a [`LockStore`] |
//! | [`SharedStore`] | one cluster | JSON document persisted by the primary, mirrored in every worker |
//!
//! # Shared store message flow
//!
//! ```text
//! ┌──────────────────────────┐   StoreUpdate (full document)   ┌───────────────────┐
//! │         primary          │────────────────────────────────►│     worker N      │
//! │  SharedStore (writer)    │                                 │ SharedStore       │
//! │  file: temp + rename     │◄────────────────────────────────│ (mirror)          │
//! └──────────────────────────┘   StoreMutation (set/push/...)  └───────────────────┘
//! ```
//!
//! Transport is abstracted by [`StoreLink`]; `forkline-cluster` provides the
//! IPC implementations, [`MemoryHub`] wires stores together in one process.
//!
//! # Lock backends
//!
//! | Backend | Type | Use |
//! |---------|------|-----|
//! | Redis | [`RedisLockStore`] | production, `SET NX PX` + compare-and-delete script |
//! | Memory | [`MemoryLockStore`] | tests and single-node deployments |
//!
//! # Modules
//!
//! - [`keyed_mutex`]: In-process per-name FIFO mutex
//! - [`lock`]: Distributed lock and its backing stores
//! - [`role`]: Primary/worker role detection
//! - [`store`]: Shared JSON store, registry and links

pub mod keyed_mutex;
pub mod lock;
pub mod role;
pub mod store;

pub use keyed_mutex::{KeyGuard, KeyedMutex, Serialized, Ticket};
pub use lock::{
    AcquireOptions, DistributedLock, LockError, LockStore, LockToken, MemoryLockStore,
    RedisLockStore,
};
pub use role::{Role, WORKER_ID_ENV};
pub use store::{
    LinkError, LocalLink, MemoryHub, SharedStore, StoreError, StoreLink, StoreOptions,
    StoreRegistry,
};
