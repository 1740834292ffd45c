// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages exchanged between the primary and its workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::{Frame, FrameError, MessageType};

/// Control values understood by the readiness gate.
///
/// Serialized as the literal strings used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlSignal {
    /// Primary finished startup; begin serving.
    #[serde(rename = "start")]
    Start,
    /// Reply to a `"what now"` ping once the primary is ready.
    #[serde(rename = "go ahead")]
    GoAhead,
    /// Worker polling ping, sent until released.
    #[serde(rename = "what now")]
    WhatNow,
}

impl ControlSignal {
    /// Wire representation of the signal.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Start => "start",
            ControlSignal::GoAhead => "go ahead",
            ControlSignal::WhatNow => "what now",
        }
    }

    /// Whether receiving this signal releases a waiting worker.
    pub fn releases_worker(&self) -> bool {
        matches!(self, ControlSignal::Start | ControlSignal::GoAhead)
    }
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single write against a shared document.
///
/// Paths are dot-separated; numeric segments address array elements and the
/// empty path addresses the document root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Assign `value` at `path`, creating intermediate objects.
    Set { path: String, value: Value },
    /// Append `value` to the array at `path` (created if missing).
    Push { path: String, value: Value },
    /// Remove the key or array element at `path`.
    Delete { path: String },
    /// Replace the whole document.
    Replace { document: Value },
}

impl Mutation {
    /// Path targeted by the mutation (empty for `Replace`).
    pub fn path(&self) -> &str {
        match self {
            Mutation::Set { path, .. }
            | Mutation::Push { path, .. }
            | Mutation::Delete { path } => path,
            Mutation::Replace { .. } => "",
        }
    }

    /// Short operation name for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Mutation::Set { .. } => "set",
            Mutation::Push { .. } => "push",
            Mutation::Delete { .. } => "delete",
            Mutation::Replace { .. } => "replace",
        }
    }
}

/// Full document broadcast for one store channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub channel: String,
    pub document: Value,
}

/// Mutation forwarded from a worker to the primary for one store channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMutation {
    pub channel: String,
    pub mutation: Mutation,
}

/// Any message carried on the primary/worker pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Control(ControlSignal),
    StoreUpdate(StoreUpdate),
    StoreMutation(StoreMutation),
}

impl Message {
    /// Frame type used for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Control(_) => MessageType::Control,
            Message::StoreUpdate(_) => MessageType::StoreUpdate,
            Message::StoreMutation(_) => MessageType::StoreMutation,
        }
    }

    /// Encode into a frame.
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        match self {
            Message::Control(signal) => Frame::new(MessageType::Control, signal),
            Message::StoreUpdate(update) => Frame::new(MessageType::StoreUpdate, update),
            Message::StoreMutation(mutation) => Frame::new(MessageType::StoreMutation, mutation),
        }
    }

    /// Decode from a frame, dispatching on its message type.
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        Ok(match frame.message_type {
            MessageType::Control => Message::Control(frame.decode()?),
            MessageType::StoreUpdate => Message::StoreUpdate(frame.decode()?),
            MessageType::StoreMutation => Message::StoreMutation(frame.decode()?),
        })
    }

    pub fn control(signal: ControlSignal) -> Self {
        Message::Control(signal)
    }

    pub fn store_update(channel: impl Into<String>, document: Value) -> Self {
        Message::StoreUpdate(StoreUpdate {
            channel: channel.into(),
            document,
        })
    }

    pub fn store_mutation(channel: impl Into<String>, mutation: Mutation) -> Self {
        Message::StoreMutation(StoreMutation {
            channel: channel.into(),
            mutation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_signals_use_literal_strings() {
        assert_eq!(
            serde_json::to_string(&ControlSignal::Start).unwrap(),
            "\"start\""
        );
        assert_eq!(
            serde_json::to_string(&ControlSignal::GoAhead).unwrap(),
            "\"go ahead\""
        );
        assert_eq!(
            serde_json::to_string(&ControlSignal::WhatNow).unwrap(),
            "\"what now\""
        );
        let parsed: ControlSignal = serde_json::from_str("\"go ahead\"").unwrap();
        assert_eq!(parsed, ControlSignal::GoAhead);
    }

    #[test]
    fn test_releases_worker() {
        assert!(ControlSignal::Start.releases_worker());
        assert!(ControlSignal::GoAhead.releases_worker());
        assert!(!ControlSignal::WhatNow.releases_worker());
    }

    #[test]
    fn test_mutation_wire_shape() {
        let mutation = Mutation::Set {
            path: "db.models.User".to_string(),
            value: json!("user"),
        };
        let encoded = serde_json::to_value(&mutation).unwrap();
        assert_eq!(
            encoded,
            json!({"op": "set", "path": "db.models.User", "value": "user"})
        );

        let delete: Mutation =
            serde_json::from_value(json!({"op": "delete", "path": "a.b"})).unwrap();
        assert_eq!(delete.path(), "a.b");
        assert_eq!(delete.op(), "delete");
    }

    #[test]
    fn test_store_update_frame_carries_channel() {
        let message = Message::store_update("shared-config", json!({"routes": ["/health"]}));
        let frame = message.to_frame().unwrap();
        assert_eq!(frame.message_type, MessageType::StoreUpdate);

        let raw: Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(raw["channel"], "shared-config");
        assert_eq!(Message::from_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_from_frame_rejects_mismatched_payload() {
        let frame = Frame::new(MessageType::Control, &json!({"not": "a signal"})).unwrap();
        assert!(matches!(
            Message::from_frame(&frame),
            Err(FrameError::Json(_))
        ));
    }
}
