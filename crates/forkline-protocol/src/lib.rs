// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forkline Protocol - primary/worker pipe messages
//!
//! Every worker process is connected to the primary by two pipes: the
//! worker's stdin carries primary → worker frames and its stdout carries
//! worker → primary frames. Logs go to stderr.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    forkline-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: control signals, store updates, store mutations  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde_json)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: u32 length + u16 type over stdio pipes            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Messages
//!
//! | Type | Direction | Payload |
//! |------|-----------|---------|
//! | `Control` | both | `"start"`, `"go ahead"`, `"what now"` |
//! | `StoreUpdate` | primary → worker | `{ channel, document }` |
//! | `StoreMutation` | worker → primary | `{ channel, mutation }` |

pub mod frame;
pub mod message;

pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use message::{ControlSignal, Message, Mutation, StoreMutation, StoreUpdate};
