//! Queue-mediated object sockets over TCP.
//!
//! Turns a raw byte stream into a channel of discrete application messages.
//! Application code never touches the stream: it pushes onto an outbound
//! queue with [`QueuedConnection::send`] and pops from an inbound queue with
//! [`QueuedConnection::receive`], while two background tasks move messages
//! between the queues and the wire.
//!
//! # Architecture
//!
//! ```text
//! AcceptLoop (server.rs)                   QueuedConnection (queued.rs)
//! ┌──────────────────────┐                ┌──────────────────────────────┐
//! │ TcpListener          │  TcpStream     │ outbound queue ─► writer task│──► wire
//! │ accept w/ poll bound ├───────────────►│ inbound queue  ◄─ reader task│◄── wire
//! │ AcceptHandler hook   │                │ ListenerSet fan-out          │
//! └──────────────────────┘                └──────────────┬───────────────┘
//!                                                        │ Connection (connection.rs)
//!                                                        ▼
//!                                          FrameDecoder / encode (framing.rs)
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 LE length][u8 type][payload]`
//!
//! See [`framing`] for frame types and codec.

pub mod connection;
pub mod framing;
pub mod listener;
pub mod queue;
pub mod queued;
pub mod server;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use connection::{Connection, ConnectionReader, ConnectionWriter};
pub use framing::FrameDecoder;
pub use listener::{ConnectionListener, ListenerId, ListenerSet, LoggingListener};
pub use queue::BlockingMessageQueue;
pub use queued::{ConnectionOptions, ConnectionState, QueuedConnection};
pub use server::{AcceptHandler, AcceptLoop, QueuedAcceptLoop, QueuedAcceptor};

/// Bounds every application message type must satisfy.
///
/// Messages cross task boundaries, are cloned when the writer peeks the
/// outbound queue, and are serialized with `serde_json` on the wire.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// One unit on the wire: either an application value or a keep-alive.
///
/// Heartbeats are filtered out by the reader task and never reach the
/// inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    /// Keep-alive sent by an idle writer.
    Heartbeat,
    /// Application payload.
    Data(T),
}

impl<T> Message<T> {
    /// Returns `true` for the heartbeat sentinel.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat)
    }

    /// Extract the application payload, if any.
    pub fn into_data(self) -> Option<T> {
        match self {
            Self::Heartbeat => None,
            Self::Data(value) => Some(value),
        }
    }
}

/// Errors raised by the socket layer.
///
/// These never cross the queue boundary into application code; they are
/// delivered through [`ConnectionListener::exception_occurred`].
#[derive(Debug)]
pub enum SocketError {
    /// Underlying transport failure.
    Io(std::io::Error),
    /// Malformed frame or payload on the wire.
    Decode(String),
    /// Frame body exceeds the configured limit, either announced by an
    /// inbound header or computed for an outbound message.
    FrameTooLarge {
        /// Body length in bytes.
        size: u64,
        /// Configured maximum.
        max: u32,
    },
    /// Peer closed the stream.
    Closed,
    /// A bounded wait elapsed (liveness or write timeout).
    TimedOut(&'static str),
    /// Operation attempted on a connection that was already closed.
    AlreadyClosed,
}

impl SocketError {
    /// Returns `true` if this error means the peer went away cleanly.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Decode(msg) => write!(f, "Decode error: {msg}"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {size} bytes (max {max})")
            }
            Self::Closed => write!(f, "Connection closed by peer"),
            Self::TimedOut(what) => write!(f, "Timed out: {what}"),
            Self::AlreadyClosed => write!(f, "Connection already closed"),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Generate a unique connection ID using a monotonic counter + random suffix.
pub(crate) fn generate_connection_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("conn:{seq:x}{rand:04x}")
}
