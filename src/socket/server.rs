//! TCP accept loop producing connections.
//!
//! [`AcceptLoop`] binds a port and runs one accept task. Each `accept()` is
//! bounded by a poll timeout; timeouts are absorbed, other accept errors go
//! to [`AcceptHandler::accept_failed`] and the loop carries on. The listening
//! socket is owned by the accept task and closed when it exits.
//!
//! [`QueuedAcceptLoop`] is the common case: every accepted stream becomes a
//! [`QueuedConnection`] handed to an application callback.

use std::marker::PhantomData;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::queued::{ConnectionOptions, QueuedConnection};
use super::Payload;
use crate::config::Config;
use crate::constants::{ACCEPT_ERROR_BACKOFF, MAX_FRAME_SIZE};

/// Per-connection hooks invoked by the accept task.
pub trait AcceptHandler: Send + Sync + 'static {
    /// A client connected. Runs on the accept task; hand off and return.
    fn connection_accepted(&self, stream: TcpStream, peer: SocketAddr);

    /// `accept()` failed with something other than a poll timeout.
    ///
    /// Non-terminal: the loop backs off briefly and accepts again.
    fn accept_failed(&self, err: &std::io::Error) {
        log::error!("[Server] Accept error: {err}");
    }
}

#[derive(Debug)]
struct Serving {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Listening socket plus the task that accepts on it.
///
/// Constructed idle. [`start_serving`](Self::start_serving) binds and spawns
/// the accept task; [`stop_serving`](Self::stop_serving) cancels and joins it.
/// Both are idempotent.
pub struct AcceptLoop<H> {
    port: u16,
    poll_timeout: Duration,
    handler: Arc<H>,
    serving: Mutex<Option<Serving>>,
}

impl<H> std::fmt::Debug for AcceptLoop<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptLoop")
            .field("port", &self.port)
            .field("poll_timeout", &self.poll_timeout)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl<H> AcceptLoop<H> {
    fn serving(&self) -> MutexGuard<'_, Option<Serving>> {
        self.serving.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured port (0 means "any free port").
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The per-connection handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.serving().as_ref().map(|s| s.local_addr)
    }

    /// Returns `true` while the accept task is active.
    pub fn is_serving(&self) -> bool {
        self.serving().is_some()
    }
}

impl<H: AcceptHandler> AcceptLoop<H> {
    /// Create an idle accept loop for `port`.
    pub fn new(port: u16, poll_timeout: Duration, handler: H) -> Self {
        Self {
            port,
            poll_timeout,
            handler: Arc::new(handler),
            serving: Mutex::new(None),
        }
    }

    /// Bind `0.0.0.0:port` and spawn the accept task.
    ///
    /// Returns the bound address. If already serving, returns the existing
    /// address without binding again.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub async fn start_serving(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .with_context(|| format!("Failed to bind TCP port {}", self.port))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        let mut serving = self.serving();
        // A concurrent start may have won while we were binding.
        if let Some(existing) = serving.as_ref() {
            return Ok(existing.local_addr);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&self.handler),
            cancel.clone(),
            self.poll_timeout,
        ));
        *serving = Some(Serving {
            cancel,
            handle,
            local_addr,
        });

        log::info!("[Server] Listening on {local_addr}");
        Ok(local_addr)
    }

    /// Cancel the accept task and wait for it to exit.
    ///
    /// The listening socket is closed once this returns.
    ///
    /// Hooks run synchronously on the accept task, so the usual way to stop
    /// from a callback is to spawn a task that calls this. The same-task
    /// check only matters for a hook that drives this future in place (for
    /// example through `block_in_place`); the join is skipped there instead
    /// of deadlocking.
    pub async fn stop_serving(&self) {
        let serving = self.serving().take();
        let Some(serving) = serving else {
            return;
        };
        serving.cancel.cancel();

        if tokio::task::try_id() == Some(serving.handle.id()) {
            log::debug!("[Server] stop_serving called from accept task; not joining");
            return;
        }

        if let Err(e) = serving.handle.await {
            if e.is_panic() {
                log::error!("[Server] Accept task panicked: {e}");
            }
        }
        log::info!("[Server] Stopped listening on {}", serving.local_addr);
    }

    /// Accept loop, run as a tokio task.
    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<H>,
        cancel: CancellationToken,
        poll_timeout: Duration,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = tokio::time::timeout(poll_timeout, listener.accept()) => result,
            };

            match accepted {
                Err(_elapsed) => {
                    log::trace!("[Server] Accept poll timed out");
                }
                Ok(Ok((stream, peer))) => {
                    log::info!("[Server] Client connected: {peer}");
                    let hook = AssertUnwindSafe(|| handler.connection_accepted(stream, peer));
                    if catch_unwind(hook).is_err() {
                        log::warn!("[Server] Connection handler panicked for {peer}; continuing");
                    }
                }
                Ok(Err(e)) => {
                    handler.accept_failed(&e);
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        log::debug!("[Server] Accept loop exited");
    }
}

/// Handler that wraps each accepted stream in a [`QueuedConnection`].
pub struct QueuedAcceptor<T, F> {
    options: ConnectionOptions,
    max_frame_size: u32,
    auto_start: bool,
    on_connection: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> std::fmt::Debug for QueuedAcceptor<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedAcceptor")
            .field("options", &self.options)
            .field("max_frame_size", &self.max_frame_size)
            .field("auto_start", &self.auto_start)
            .finish_non_exhaustive()
    }
}

impl<T, F> QueuedAcceptor<T, F>
where
    T: Payload,
    F: Fn(QueuedConnection<T>) + Send + Sync + 'static,
{
    /// Auto-starting acceptor with default frame limit.
    pub fn new(options: ConnectionOptions, on_connection: F) -> Self {
        Self {
            options,
            max_frame_size: MAX_FRAME_SIZE,
            auto_start: true,
            on_connection,
            _marker: PhantomData,
        }
    }

    /// Whether accepted connections are started before the callback runs.
    #[must_use]
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Inbound frame limit for accepted connections.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl<T, F> AcceptHandler for QueuedAcceptor<T, F>
where
    T: Payload,
    F: Fn(QueuedConnection<T>) + Send + Sync + 'static,
{
    fn connection_accepted(&self, stream: TcpStream, peer: SocketAddr) {
        let connection = Connection::with_max_frame_size(stream, self.max_frame_size);
        let queued = QueuedConnection::with_options(connection, self.options);

        if self.auto_start {
            if let Err(e) = queued.start() {
                log::error!("[Server] Failed to start connection from {peer}: {e}");
                return;
            }
        }
        (self.on_connection)(queued);
    }
}

/// Accept loop whose connections arrive as [`QueuedConnection`]s.
pub type QueuedAcceptLoop<T, F> = AcceptLoop<QueuedAcceptor<T, F>>;

impl<T, F> AcceptLoop<QueuedAcceptor<T, F>>
where
    T: Payload,
    F: Fn(QueuedConnection<T>) + Send + Sync + 'static,
{
    /// Build a queued accept loop from configuration.
    pub fn queued(config: &Config, on_connection: F) -> Self {
        let acceptor = QueuedAcceptor::new(config.connection_options(), on_connection)
            .with_auto_start(config.auto_start)
            .with_max_frame_size(config.max_frame_size);
        Self::new(config.port, config.accept_poll_timeout(), acceptor)
    }
}
