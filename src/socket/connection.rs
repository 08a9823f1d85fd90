//! Message-level wrapper around one TCP stream.
//!
//! A [`Connection`] splits its stream into a [`ConnectionReader`] and a
//! [`ConnectionWriter`], each behind its own async mutex. One task may be
//! receiving while another sends, but two concurrent senders (or receivers)
//! serialize on the lock rather than interleave bytes on the wire.
//!
//! [`close`](Connection::close) drops both halves, which releases the
//! socket. Every later send or receive fails with `AlreadyClosed`.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use super::framing::FrameDecoder;
use super::{generate_connection_id, Message, Payload, SocketError};
use crate::constants::{MAX_FRAME_SIZE, READ_BUFFER_SIZE};

/// Read side of a connection: socket half plus decoder state.
///
/// Decoder state lives here rather than on the stack of
/// [`receive`](Self::receive), so dropping a pending receive (for example
/// in a `select!`) never loses buffered bytes.
pub struct ConnectionReader<T> {
    half: OwnedReadHalf,
    decoder: FrameDecoder<T>,
    pending: VecDeque<Message<T>>,
    buf: Box<[u8]>,
}

impl<T> std::fmt::Debug for ConnectionReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionReader")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<T: Payload> ConnectionReader<T> {
    fn new(half: OwnedReadHalf, max_frame_size: u32) -> Self {
        Self {
            half,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            pending: VecDeque::new(),
            buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Receive exactly one message, reading from the socket as needed.
    ///
    /// Cancel-safe.
    ///
    /// # Errors
    ///
    /// `SocketError::Closed` on a clean end of stream, `SocketError::Decode`
    /// if the stream ends mid-frame or carries a malformed frame, and
    /// `SocketError::Io` on transport failure.
    pub async fn receive(&mut self) -> Result<Message<T>, SocketError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(message);
            }

            let n = self.half.read(&mut self.buf).await?;
            if n == 0 {
                if self.decoder.has_partial() {
                    return Err(SocketError::Decode("Stream ended mid-frame".to_string()));
                }
                return Err(SocketError::Closed);
            }

            self.pending.extend(self.decoder.feed(&self.buf[..n])?);
        }
    }
}

/// Write side of a connection.
pub struct ConnectionWriter<T> {
    half: OwnedWriteHalf,
    max_frame_size: u32,
    _marker: PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for ConnectionWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWriter")
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl<T: Payload> ConnectionWriter<T> {
    fn new(half: OwnedWriteHalf, max_frame_size: u32) -> Self {
        Self {
            half,
            max_frame_size,
            _marker: PhantomData,
        }
    }

    /// Encode and write one message.
    ///
    /// # Errors
    ///
    /// `SocketError::FrameTooLarge` before anything is written if the
    /// encoded message exceeds the frame limit; `SocketError::Io` on
    /// transport failure.
    pub async fn send(&mut self, message: &Message<T>) -> Result<(), SocketError> {
        let encoded = message.encode_with_limit(self.max_frame_size)?;
        self.half.write_all(&encoded).await?;
        Ok(())
    }

    /// Shut down the write direction; the peer reads end-of-stream.
    async fn shutdown(mut self) -> Result<(), SocketError> {
        self.half.shutdown().await?;
        Ok(())
    }
}

/// One TCP stream exposed as send-one / receive-one / close.
pub struct Connection<T> {
    id: String,
    peer_addr: Option<SocketAddr>,
    reader: Mutex<Option<ConnectionReader<T>>>,
    writer: Mutex<Option<ConnectionWriter<T>>>,
}

impl<T> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl<T: Payload> Connection<T> {
    /// Wrap an already-open stream with the default frame size limit.
    pub fn new(stream: TcpStream) -> Self {
        Self::with_max_frame_size(stream, MAX_FRAME_SIZE)
    }

    /// Wrap an already-open stream, refusing frames above `max_frame_size`
    /// in either direction.
    pub fn with_max_frame_size(stream: TcpStream, max_frame_size: u32) -> Self {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Socket] Could not set TCP_NODELAY: {e}");
        }
        let (read_half, write_half) = stream.into_split();

        Self {
            id: generate_connection_id(),
            peer_addr,
            reader: Mutex::new(Some(ConnectionReader::new(read_half, max_frame_size))),
            writer: Mutex::new(Some(ConnectionWriter::new(write_half, max_frame_size))),
        }
    }

    /// Open a TCP connection to `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, SocketError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    /// Unique identifier for this connection (for logs).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Send one message.
    pub async fn send_message(&self, message: &Message<T>) -> Result<(), SocketError> {
        match self.writer.lock().await.as_mut() {
            Some(writer) => writer.send(message).await,
            None => Err(SocketError::AlreadyClosed),
        }
    }

    /// Receive one message, waiting until a full frame has arrived.
    pub async fn receive_message(&self) -> Result<Message<T>, SocketError> {
        match self.reader.lock().await.as_mut() {
            Some(reader) => reader.receive().await,
            None => Err(SocketError::AlreadyClosed),
        }
    }

    /// Shut down the write direction, then release both halves. Idempotent.
    ///
    /// Waits for an in-flight send or receive to finish first.
    pub async fn close(&self) -> Result<(), SocketError> {
        let writer = self.writer.lock().await.take();
        let shutdown = match writer {
            Some(writer) => writer.shutdown().await,
            None => Ok(()),
        };
        // The socket closes once both halves are gone.
        drop(self.reader.lock().await.take());
        shutdown
    }
}
