// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for primary/worker pipe framing.
//!
//! Every message on a worker's stdin/stdout pipe is one frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: JSON payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Maximum frame size (16 MB).
/// A store broadcast carries the whole document, so this bounds document size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Control signal (`"start"`, `"go ahead"`, `"what now"`)
    Control = 1,
    /// Full shared document pushed by the primary
    StoreUpdate = 2,
    /// Store mutation forwarded by a worker to the primary
    StoreMutation = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Control),
            2 => Ok(MessageType::StoreUpdate),
            3 => Ok(MessageType::StoreMutation),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given type and JSON-serializable body
    pub fn new<T: Serialize>(message_type: MessageType, body: &T) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(body)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Write a frame to an async writer and flush it.
///
/// Pipes to a child process are only useful once flushed, so every frame is
/// pushed through immediately.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    // Read header
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    // Read payload
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Framed codec over one direction (or both) of a pipe.
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }

    /// Read and decode the next message
    pub async fn recv(&mut self) -> Result<Message, FrameError> {
        let frame = self.read_frame().await?;
        Message::from_frame(&frame)
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Encode and send a message
    pub async fn send(&mut self, message: &Message) -> Result<(), FrameError> {
        let frame = message.to_frame()?;
        self.write_frame(&frame).await
    }
}
