//! Wire codec for object sockets.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: Data, `serde_json` encoding of one application value
//! - `0x02`: Heartbeat, empty payload

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Message, SocketError};
use crate::constants::MAX_FRAME_SIZE;

/// Type byte values.
pub mod frame_type {
    /// Application value.
    pub const DATA: u8 = 0x01;
    /// Keep-alive.
    pub const HEARTBEAT: u8 = 0x02;
}

/// Bytes in the length prefix.
const HEADER_LEN: usize = 4;

impl<T: Serialize> Message<T> {
    /// Serialize into one complete frame, header included, with the default
    /// size limit.
    pub fn encode(&self) -> Result<Vec<u8>, SocketError> {
        self.encode_with_limit(MAX_FRAME_SIZE)
    }

    /// Serialize into one complete frame, refusing bodies the receiving
    /// side would reject.
    ///
    /// # Errors
    ///
    /// `SocketError::FrameTooLarge` if type byte plus payload exceed
    /// `max_frame_size`, `SocketError::Decode` if the value cannot be
    /// serialized.
    pub fn encode_with_limit(&self, max_frame_size: u32) -> Result<Vec<u8>, SocketError> {
        match self {
            Message::Heartbeat => frame(frame_type::HEARTBEAT, &[], max_frame_size),
            Message::Data(value) => {
                let payload = serde_json::to_vec(value)
                    .map_err(|e| SocketError::Decode(format!("Cannot serialize message: {e}")))?;
                frame(frame_type::DATA, &payload, max_frame_size)
            }
        }
    }
}

/// Prefix `payload` with its length (type byte included) and type.
fn frame(kind: u8, payload: &[u8], max_frame_size: u32) -> Result<Vec<u8>, SocketError> {
    let body_len = checked_body_len(payload.len(), max_frame_size)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body_len as usize);
    out.extend_from_slice(&body_len.to_le_bytes());
    out.push(kind);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Length prefix for a payload of `payload_len` bytes.
fn checked_body_len(payload_len: usize, max_frame_size: u32) -> Result<u32, SocketError> {
    let size = u64::try_from(payload_len)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    match u32::try_from(size) {
        Ok(body_len) if body_len <= max_frame_size => Ok(body_len),
        _ => Err(SocketError::FrameTooLarge {
            size,
            max: max_frame_size,
        }),
    }
}

/// Turn one frame body (type byte + payload) into a message.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<Message<T>, SocketError> {
    let (&kind, payload) = body
        .split_first()
        .ok_or_else(|| SocketError::Decode("Invalid frame: zero length".to_string()))?;

    match kind {
        frame_type::DATA => serde_json::from_slice(payload)
            .map(Message::Data)
            .map_err(|e| SocketError::Decode(format!("Invalid data frame: {e}"))),
        frame_type::HEARTBEAT if payload.is_empty() => Ok(Message::Heartbeat),
        frame_type::HEARTBEAT => Err(SocketError::Decode(format!(
            "Heartbeat frame carries {} payload bytes",
            payload.len()
        ))),
        other => Err(SocketError::Decode(format!(
            "Unknown frame type: 0x{other:02x}"
        ))),
    }
}

/// Reassembles messages from arbitrarily split stream reads.
///
/// Bytes that do not yet form a whole frame stay buffered until the next
/// [`feed`](Self::feed).
#[derive(Debug)]
pub struct FrameDecoder<T> {
    pending: Vec<u8>,
    max_frame_size: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    /// Decoder with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Decoder that rejects frames longer than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            pending: Vec::new(),
            max_frame_size,
            _marker: PhantomData,
        }
    }

    /// Append `bytes` and return every message completed by them.
    ///
    /// # Errors
    ///
    /// A zero-length, oversized or undecodable frame. The stream is
    /// unusable afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message<T>>, SocketError> {
        self.pending.extend_from_slice(bytes);

        let mut messages = Vec::new();
        let mut consumed = 0;
        while let Some(header) = self.pending.get(consumed..consumed + HEADER_LEN) {
            let mut len_bytes = [0u8; HEADER_LEN];
            len_bytes.copy_from_slice(header);
            let body_len = u32::from_le_bytes(len_bytes);

            if body_len > self.max_frame_size {
                return Err(SocketError::FrameTooLarge {
                    size: u64::from(body_len),
                    max: self.max_frame_size,
                });
            }

            let body_start = consumed + HEADER_LEN;
            let Some(body) = self.pending.get(body_start..body_start + body_len as usize) else {
                break;
            };
            messages.push(parse_body(body)?);
            consumed = body_start + body.len();
        }

        self.pending.drain(..consumed);
        Ok(messages)
    }

    /// Returns `true` while part of a frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl<T: DeserializeOwned> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}
