// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame encoding/decoding tests for forkline-protocol.

use bytes::{BufMut, Bytes, BytesMut};
use forkline_protocol::frame::{Frame, FrameError, HEADER_SIZE, MessageType, read_frame};
use forkline_protocol::{ControlSignal, FramedStream, Message, Mutation};
use serde_json::json;

#[test]
fn test_frame_encode_decode_roundtrip() {
    let original = Message::store_update("shared-config", json!({"db": {"models": {}}}))
        .to_frame()
        .unwrap();

    let encoded = original.encode();
    let decoded = Frame::decode_from_bytes(encoded).unwrap();

    assert_eq!(original.message_type, decoded.message_type);
    assert_eq!(original.payload, decoded.payload);
}

#[test]
fn test_frame_total_length() {
    let frame = Message::control(ControlSignal::GoAhead).to_frame().unwrap();
    let encoded = frame.encode();
    assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());
}

#[test]
fn test_decode_invalid_message_type() {
    let mut buf = BytesMut::new();
    buf.put_u32(2);
    buf.put_u16(99);
    buf.put_slice(b"{}");

    let result = Frame::decode_from_bytes(buf.freeze());
    assert!(matches!(result, Err(FrameError::InvalidMessageType(99))));
}

#[test]
fn test_decode_ignores_trailing_bytes() {
    let frame = Message::control(ControlSignal::Start).to_frame().unwrap();
    let mut buf = BytesMut::from(frame.encode().as_ref());
    buf.put_slice(b"trailing");

    let decoded = Frame::decode_from_bytes(buf.freeze()).unwrap();
    assert_eq!(decoded.message_type, MessageType::Control);
    assert_eq!(decoded.payload, Bytes::from_static(b"\"start\""));
}

#[tokio::test]
async fn test_multiple_frames_in_order() {
    let (client, server) = tokio::io::duplex(4096);
    let mut writer = FramedStream::new(client);
    let mut reader = FramedStream::new(server);

    let messages = vec![
        Message::control(ControlSignal::WhatNow),
        Message::store_mutation(
            "shared-config",
            Mutation::Push {
                path: "routes".to_string(),
                value: json!("/health"),
            },
        ),
        Message::store_update("shared-config", json!({"routes": ["/health"]})),
        Message::control(ControlSignal::Start),
    ];

    for message in &messages {
        writer.send(message).await.unwrap();
    }

    for expected in &messages {
        let received = reader.recv().await.unwrap();
        assert_eq!(&received, expected);
    }
}

#[tokio::test]
async fn test_truncated_payload_is_io_error() {
    let (mut client, mut server) = tokio::io::duplex(64);

    let mut buf = BytesMut::new();
    buf.put_u32(32);
    buf.put_u16(MessageType::StoreUpdate as u16);
    buf.put_slice(b"{\"channel\"");
    tokio::io::AsyncWriteExt::write_all(&mut client, &buf)
        .await
        .unwrap();
    drop(client);

    let result = read_frame(&mut server).await;
    assert!(matches!(result, Err(FrameError::Io(_))));
}
