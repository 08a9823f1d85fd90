//! objsock - queue-mediated object sockets over TCP.
//!
//! Turns a TCP byte stream into a channel of discrete, serde-serializable
//! messages. Applications push onto an outbound queue and pop from an
//! inbound queue; background tasks handle framing, heartbeats and failure
//! reporting.
//!
//! # Modules
//!
//! - [`socket`] - Framing, queues, connections, listeners and the accept loop
//! - [`config`] - Configuration loading/saving
//! - [`constants`] - Default intervals and limits
//!
//! # Example
//!
//! ```no_run
//! use objsock::{Config, ConnectionOptions, QueuedAcceptLoop, QueuedConnection};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let server = QueuedAcceptLoop::queued(&Config::default(), |conn: QueuedConnection<String>| {
//!     conn.send("welcome".to_string());
//! });
//! let addr = server.start_serving().await?;
//!
//! let client = QueuedConnection::<String>::connect(addr, ConnectionOptions::default()).await?;
//! client.start()?;
//! assert_eq!(client.receive(true).await.as_deref(), Some("welcome"));
//! client.close().await;
//! server.stop_serving().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod socket;

// Re-export commonly used types
pub use config::Config;
pub use socket::{
    AcceptHandler, AcceptLoop, BlockingMessageQueue, Connection, ConnectionListener,
    ConnectionOptions, ConnectionState, ListenerId, LoggingListener, Message, Payload,
    QueuedAcceptLoop, QueuedAcceptor, QueuedConnection, SocketError,
};
