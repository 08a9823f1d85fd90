//! Queue-mediated connection with background reader and writer tasks.
//!
//! A [`QueuedConnection`] owns an inbound and an outbound
//! [`BlockingMessageQueue`] and, while running, exactly two tokio tasks:
//!
//! - **Reader**: `Connection::receive_message` → drop heartbeats → inbound
//!   queue → `object_received`
//! - **Writer**: outbound queue → `Connection::send_message` →
//!   `object_sent`; sends a heartbeat after a full idle interval
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start()──► Running ──stop()/failure──► Stopped ──close()──► Closed
//!                      ▲                           │
//!                      └─────────start()───────────┘
//! ```
//!
//! Queues survive stop/start cycles. A transport or decode failure in either
//! task stops both and is reported once through `exception_occurred`; an
//! explicit `stop()` reports nothing. Tasks of a new run wait for the
//! previous run's tasks to exit before touching a queue.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::ToSocketAddrs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::listener::{ConnectionListener, ListenerId, ListenerSet};
use super::queue::BlockingMessageQueue;
use super::{Message, Payload, SocketError};
use crate::constants::{HEARTBEAT_INTERVAL, READ_TIMEOUT, WRITE_TIMEOUT};

/// Lifecycle state of a [`QueuedConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never started.
    Idle,
    /// Reader and writer tasks active.
    Running,
    /// Tasks stopped (explicitly or after a failure); queues retained.
    Stopped,
    /// Stream shut down. Terminal.
    Closed,
}

/// Timing knobs for a [`QueuedConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Idle time after which the writer sends a heartbeat.
    pub heartbeat_interval: Duration,
    /// Maximum silence from the peer before the reader gives up.
    /// `None` disables liveness detection.
    pub read_timeout: Option<Duration>,
    /// Upper bound on writing a single frame.
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            read_timeout: Some(READ_TIMEOUT),
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ConnectionState,
    /// Bumped on every start so late failures from an older run are ignored.
    generation: u64,
    cancel: Option<CancellationToken>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    connection: Connection<T>,
    inbound: BlockingMessageQueue<T>,
    outbound: BlockingMessageQueue<T>,
    listeners: ListenerSet<T>,
    options: ConnectionOptions,
    lifecycle: Mutex<Lifecycle>,
}

/// Cloneable handle to a queue-mediated connection.
///
/// All clones share the same queues, tasks and listeners.
pub struct QueuedConnection<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for QueuedConnection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for QueuedConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedConnection")
            .field("connection", &self.inner.connection)
            .field("inbound", &self.inner.inbound.size())
            .field("outbound", &self.inner.outbound.size())
            .finish_non_exhaustive()
    }
}

impl<T: Payload> QueuedConnection<T> {
    /// Wrap an open connection with default options. Does not start it.
    pub fn new(connection: Connection<T>) -> Self {
        Self::with_options(connection, ConnectionOptions::default())
    }

    /// Wrap an open connection with explicit options. Does not start it.
    pub fn with_options(connection: Connection<T>, options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                inbound: BlockingMessageQueue::new(),
                outbound: BlockingMessageQueue::new(),
                listeners: ListenerSet::new(),
                options,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Idle,
                    generation: 0,
                    cancel: None,
                    reader: None,
                    writer: None,
                }),
            }),
        }
    }

    /// Connect to `addr` and wrap the stream. Does not start it.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        options: ConnectionOptions,
    ) -> Result<Self, SocketError> {
        let connection = Connection::connect(addr).await?;
        Ok(Self::with_options(connection, options))
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection identifier (for logs).
    pub fn id(&self) -> &str {
        self.inner.connection.id()
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.connection.peer_addr()
    }

    /// Options this connection was built with.
    pub fn options(&self) -> ConnectionOptions {
        self.inner.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state
    }

    /// Returns `true` while the reader and writer tasks are active.
    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    /// Number of received messages awaiting [`receive`](Self::receive).
    pub fn inbound_len(&self) -> usize {
        self.inner.inbound.size()
    }

    /// Number of messages awaiting transmission.
    pub fn outbound_len(&self) -> usize {
        self.inner.outbound.size()
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Register a listener for this connection's events.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener<T>>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// Unregister a listener. Safe to call from inside a callback.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Queue `msg` for transmission. Never blocks.
    pub fn send(&self, msg: T) {
        self.inner.outbound.enqueue(msg.clone());
        self.inner
            .listeners
            .dispatch(|l| l.object_enqueued(self, &msg));
    }

    /// Take the next received message.
    ///
    /// With `block == true` waits until one arrives or the connection is
    /// stopped. `None` means "nothing available", not an error.
    pub async fn receive(&self, block: bool) -> Option<T> {
        self.inner.inbound.dequeue(block).await
    }

    /// Take the next received message without waiting.
    pub fn try_receive(&self) -> Option<T> {
        self.inner.inbound.try_dequeue()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the reader and writer tasks. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SocketError::AlreadyClosed` once the connection is closed.
    pub fn start(&self) -> Result<(), SocketError> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            ConnectionState::Running => return Ok(()),
            ConnectionState::Closed => return Err(SocketError::AlreadyClosed),
            ConnectionState::Idle | ConnectionState::Stopped => {}
        }

        // A failed run leaves its cancelled tasks behind; a writer among
        // them may still be finishing a frame. Each new task joins its
        // predecessor before its first queue access.
        let previous_reader = lifecycle.reader.take();
        let previous_writer = lifecycle.writer.take();
        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let token = CancellationToken::new();

        self.inner.inbound.set_blocking_allowed(true);
        lifecycle.reader = Some(tokio::spawn(self.clone().read_loop(
            token.clone(),
            generation,
            previous_reader,
        )));
        lifecycle.writer = Some(tokio::spawn(self.clone().write_loop(
            token.clone(),
            generation,
            previous_writer,
        )));
        lifecycle.cancel = Some(token);
        lifecycle.state = ConnectionState::Running;

        log::info!("[Socket] {} started (run {generation})", self.id());
        Ok(())
    }

    /// Stop both tasks and wait for them to exit.
    ///
    /// Releases any caller blocked in [`receive`](Self::receive). After this
    /// returns neither task touches the queues again. Calling it from one of
    /// this connection's own tasks skips joining that task.
    pub async fn stop(&self) {
        let (token, reader, writer) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == ConnectionState::Running {
                lifecycle.state = ConnectionState::Stopped;
            }
            (
                lifecycle.cancel.take(),
                lifecycle.reader.take(),
                lifecycle.writer.take(),
            )
        };

        self.inner.inbound.set_blocking_allowed(false);

        let Some(token) = token else {
            return;
        };
        token.cancel();

        let current = tokio::task::try_id();
        for handle in [reader, writer].into_iter().flatten() {
            if current == Some(handle.id()) {
                continue;
            }
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("[Socket] {} task panicked: {e}", self.id());
                }
            }
        }

        log::info!("[Socket] {} stopped", self.id());
    }

    /// Stop the tasks, then shut down the stream. Idempotent.
    pub async fn close(&self) {
        self.stop().await;

        let already_closed = {
            let mut lifecycle = self.lifecycle();
            std::mem::replace(&mut lifecycle.state, ConnectionState::Closed)
                == ConnectionState::Closed
        };
        if already_closed {
            return;
        }

        if let Err(e) = self.inner.connection.close().await {
            log::debug!("[Socket] {} shutdown error: {e}", self.id());
        }
        log::info!("[Socket] {} closed", self.id());
    }

    /// Wait until the outbound queue is drained, then [`close`](Self::close).
    ///
    /// Relies on the writer task to drain the queue: if the connection is not
    /// running and messages are pending, this waits indefinitely.
    pub async fn close_after_sending(&self) {
        self.inner.outbound.wait_until_empty().await;
        self.close().await;
    }

    /// Shared failure path for both tasks.
    ///
    /// Only the first failure of the current run is reported; later ones
    /// (the sibling task tripping over the same dead socket) and failures
    /// racing an explicit `stop()` are dropped.
    fn fail(&self, generation: u64, err: SocketError) {
        let first = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.generation == generation && lifecycle.state == ConnectionState::Running {
                lifecycle.state = ConnectionState::Stopped;
                if let Some(token) = &lifecycle.cancel {
                    token.cancel();
                }
                true
            } else {
                false
            }
        };

        if !first {
            log::debug!("[Socket] {} suppressed secondary error: {err}", self.id());
            return;
        }

        self.inner.inbound.set_blocking_allowed(false);
        if err.is_closed() {
            log::info!("[Socket] {} disconnected by peer", self.id());
        } else {
            log::error!("[Socket] {} failed: {err}", self.id());
        }
        self.inner
            .listeners
            .dispatch(|l| l.exception_occurred(self, &err));
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn receive_with_timeout(&self) -> Result<Message<T>, SocketError> {
        let receive = self.inner.connection.receive_message();
        match self.inner.options.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, receive).await {
                Ok(result) => result,
                Err(_elapsed) => Err(SocketError::TimedOut("no frame from peer")),
            },
            None => receive.await,
        }
    }

    async fn send_with_timeout(&self, message: &Message<T>) -> Result<(), SocketError> {
        let limit = self.inner.options.write_timeout;
        match tokio::time::timeout(limit, self.inner.connection.send_message(message)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SocketError::TimedOut("frame write")),
        }
    }

    /// Wait for a task of an earlier run. Its outcome was already reported.
    async fn join_previous(&self, previous: Option<JoinHandle<()>>) {
        if let Some(handle) = previous {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("[Socket] {} previous task panicked: {e}", self.id());
                }
            }
        }
    }

    /// Reader task: decodes messages and fills the inbound queue.
    async fn read_loop(
        self,
        token: CancellationToken,
        generation: u64,
        previous: Option<JoinHandle<()>>,
    ) {
        self.join_previous(previous).await;
        loop {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => break,
                result = self.receive_with_timeout() => result,
            };

            match result {
                Ok(Message::Heartbeat) => {
                    log::trace!("[Socket] {} heartbeat received", self.id());
                }
                Ok(Message::Data(msg)) => {
                    self.inner.inbound.enqueue(msg.clone());
                    self.inner
                        .listeners
                        .dispatch(|l| l.object_received(&self, &msg));
                }
                Err(e) => {
                    self.fail(generation, e);
                    break;
                }
            }
        }
        log::debug!("[Socket] {} reader exited (run {generation})", self.id());
    }

    /// Writer task: drains the outbound queue and heartbeats when idle.
    async fn write_loop(
        self,
        token: CancellationToken,
        generation: u64,
        previous: Option<JoinHandle<()>>,
    ) {
        self.join_previous(previous).await;
        let interval = self.inner.options.heartbeat_interval;

        'run: loop {
            // Peek, send, then pop: a failed send leaves the message queued.
            // Writes are not cancelled mid-frame; they are bounded by the
            // write timeout instead, so a restart never sees a torn frame.
            while let Some(head) = self.inner.outbound.front() {
                if token.is_cancelled() {
                    break 'run;
                }
                match self.send_with_timeout(&Message::Data(head)).await {
                    Ok(()) => {}
                    // Refused before any byte was written: the stream is fine.
                    Err(e @ SocketError::FrameTooLarge { .. }) => {
                        log::error!("[Socket] {} dropping unsendable message: {e}", self.id());
                        self.inner.outbound.try_dequeue();
                        continue;
                    }
                    Err(e) => {
                        self.fail(generation, e);
                        break 'run;
                    }
                }
                if let Some(sent) = self.inner.outbound.try_dequeue() {
                    self.inner
                        .listeners
                        .dispatch(|l| l.object_sent(&self, &sent));
                }
            }

            let idle = tokio::select! {
                biased;
                () = token.cancelled() => break 'run,
                () = self.inner.outbound.wait_for_item() => false,
                () = tokio::time::sleep(interval) => true,
            };

            if idle && self.inner.outbound.is_empty() {
                log::trace!("[Socket] {} sending heartbeat", self.id());
                if let Err(e) = self.send_with_timeout(&Message::Heartbeat).await {
                    self.fail(generation, e);
                    break 'run;
                }
            }
        }
        log::debug!("[Socket] {} writer exited (run {generation})", self.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            heartbeat_interval: Duration::from_millis(50),
            read_timeout: Some(Duration::from_millis(500)),
            write_timeout: Duration::from_secs(2),
        }
    }

    /// Helper: two connected, unstarted queued connections over loopback.
    async fn queued_pair<T: Payload>() -> (QueuedConnection<T>, QueuedConnection<T>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = QueuedConnection::connect(addr, fast_options()).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let b = QueuedConnection::with_options(Connection::new(stream), fast_options());
        (a, b)
    }

    /// Helper: queued connection whose peer is a raw socket.
    async fn raw_pair<T: Payload>() -> (QueuedConnection<T>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = QueuedConnection::connect(addr, fast_options()).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        (conn, stream)
    }

    #[derive(Default)]
    struct Recorder {
        enqueued: AtomicUsize,
        sent: AtomicUsize,
        received: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn received(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl ConnectionListener<String> for Recorder {
        fn object_enqueued(&self, _conn: &QueuedConnection<String>, _msg: &String) {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
        }

        fn object_sent(&self, _conn: &QueuedConnection<String>, _msg: &String) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }

        fn object_received(&self, _conn: &QueuedConnection<String>, msg: &String) {
            self.received.lock().unwrap().push(msg.clone());
        }

        fn exception_occurred(&self, _conn: &QueuedConnection<String>, err: &SocketError) {
            self.errors.lock().unwrap().push(err.to_string());
        }
    }

    async fn recv(conn: &QueuedConnection<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), conn.receive(true))
            .await
            .expect("Timed out waiting for message")
            .expect("Connection stopped before a message arrived")
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (a, b) = queued_pair::<String>().await;
        a.start().unwrap();
        b.start().unwrap();

        for i in 0..100 {
            a.send(format!("msg-{i}"));
        }
        for i in 0..100 {
            assert_eq!(recv(&b).await, format!("msg-{i}"));
        }

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_idle_connection_stays_alive_and_hides_heartbeats() {
        let (a, b) = queued_pair::<String>().await;
        let recorder = Arc::new(Recorder::default());
        b.add_listener(Arc::clone(&recorder) as Arc<dyn ConnectionListener<String>>);
        a.start().unwrap();
        b.start().unwrap();

        // Several read timeouts' worth of silence from the application.
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(a.is_running());
        assert!(b.is_running());
        assert!(recorder.errors().is_empty(), "got: {:?}", recorder.errors());
        assert!(recorder.received().is_empty());
        assert_eq!(b.try_receive(), None);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_stop_releases_blocked_receive() {
        let (a, b) = queued_pair::<String>().await;
        a.start().unwrap();
        b.start().unwrap();

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.receive(true).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tokio::time::timeout(Duration::from_millis(500), b.stop())
            .await
            .expect("stop() should return promptly");
        let got = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("blocked receive not released")
            .unwrap();
        assert_eq!(got, None);
        assert_eq!(b.state(), ConnectionState::Stopped);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_lifecycle_transitions_and_idempotent_stop() {
        let (a, _b) = queued_pair::<String>().await;
        assert_eq!(a.state(), ConnectionState::Idle);

        a.stop().await;
        assert_eq!(a.state(), ConnectionState::Idle);

        a.start().unwrap();
        a.start().unwrap();
        assert_eq!(a.state(), ConnectionState::Running);

        a.stop().await;
        a.stop().await;
        assert_eq!(a.state(), ConnectionState::Stopped);

        a.start().unwrap();
        assert!(a.is_running());

        a.close().await;
        a.close().await;
        assert_eq!(a.state(), ConnectionState::Closed);
        assert!(matches!(a.start(), Err(SocketError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_queues_survive_restart() {
        let (a, b) = queued_pair::<String>().await;
        a.start().unwrap();

        // Queued while the writer is not running.
        a.stop().await;
        a.send("kept-1".to_string());
        a.send("kept-2".to_string());
        assert_eq!(a.outbound_len(), 2);

        b.start().unwrap();
        a.start().unwrap();
        assert_eq!(recv(&b).await, "kept-1");
        assert_eq!(recv(&b).await, "kept-2");

        // Received while nobody was reading the inbound queue.
        a.send("parked".to_string());
        tokio::time::timeout(Duration::from_secs(2), async {
            while b.inbound_len() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message never reached inbound queue");
        b.stop().await;
        assert_eq!(b.inbound_len(), 1);
        b.start().unwrap();
        assert_eq!(b.try_receive().as_deref(), Some("parked"));
        assert_eq!(b.inbound_len(), 0);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_peer_close_reports_exactly_one_exception() {
        let (a, b) = queued_pair::<String>().await;
        let recorder = Arc::new(Recorder::default());
        a.add_listener(Arc::clone(&recorder) as Arc<dyn ConnectionListener<String>>);
        a.start().unwrap();
        b.start().unwrap();

        b.close().await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while a.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer close not detected");

        // Give the writer a chance to trip over the dead socket too.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.errors().len(), 1, "got: {:?}", recorder.errors());
        assert!(recorder.received().is_empty());
        assert_eq!(a.state(), ConnectionState::Stopped);

        a.close().await;
    }

    #[tokio::test]
    async fn test_silent_peer_trips_read_timeout() {
        let (conn, _raw) = raw_pair::<String>().await;
        let recorder = Arc::new(Recorder::default());
        conn.add_listener(Arc::clone(&recorder) as Arc<dyn ConnectionListener<String>>);
        conn.start().unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.errors().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("read timeout never fired");

        assert!(recorder.errors()[0].contains("Timed out"));
        assert_eq!(conn.state(), ConnectionState::Stopped);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_garbage_from_peer_is_terminal() {
        use tokio::io::AsyncWriteExt;

        let (conn, mut raw) = raw_pair::<String>().await;
        let recorder = Arc::new(Recorder::default());
        conn.add_listener(Arc::clone(&recorder) as Arc<dyn ConnectionListener<String>>);
        conn.start().unwrap();

        raw.write_all(&[0, 0, 0, 0]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.errors().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("decode error never reported");

        assert!(recorder.errors()[0].contains("Decode error"));
        assert!(!conn.is_running());
        conn.close().await;
    }

    #[tokio::test]
    async fn test_listener_events_for_send_and_receive() {
        let (a, b) = queued_pair::<String>().await;
        let sender = Arc::new(Recorder::default());
        let receiver = Arc::new(Recorder::default());
        a.add_listener(Arc::clone(&sender) as Arc<dyn ConnectionListener<String>>);
        b.add_listener(Arc::clone(&receiver) as Arc<dyn ConnectionListener<String>>);
        a.start().unwrap();
        b.start().unwrap();

        a.send("one".to_string());
        a.send("two".to_string());
        assert_eq!(sender.enqueued.load(Ordering::SeqCst), 2);

        assert_eq!(recv(&b).await, "one");
        assert_eq!(recv(&b).await, "two");
        assert_eq!(sender.sent.load(Ordering::SeqCst), 2);
        assert_eq!(receiver.received(), vec!["one", "two"]);

        a.close().await;
        b.close().await;
    }

    struct RemoveSelf {
        id: std::sync::OnceLock<ListenerId>,
        calls: AtomicUsize,
    }

    impl ConnectionListener<String> for RemoveSelf {
        fn object_received(&self, conn: &QueuedConnection<String>, _msg: &String) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = self.id.get() {
                conn.remove_listener(*id);
            }
        }
    }

    #[tokio::test]
    async fn test_listener_may_remove_itself_mid_dispatch() {
        let (a, b) = queued_pair::<String>().await;
        let once = Arc::new(RemoveSelf {
            id: std::sync::OnceLock::new(),
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());
        let id = b.add_listener(Arc::clone(&once) as Arc<dyn ConnectionListener<String>>);
        once.id.set(id).unwrap();
        b.add_listener(Arc::clone(&recorder) as Arc<dyn ConnectionListener<String>>);
        a.start().unwrap();
        b.start().unwrap();

        a.send("first".to_string());
        a.send("second".to_string());
        assert_eq!(recv(&b).await, "first");
        assert_eq!(recv(&b).await, "second");

        assert_eq!(once.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.listener_count(), 1);
        assert_eq!(recorder.received(), vec!["first", "second"]);
        assert!(b.is_running());

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_close_after_sending_flushes_then_closes() {
        let (a, b) = queued_pair::<String>().await;
        let recorder = Arc::new(Recorder::default());
        b.add_listener(Arc::clone(&recorder) as Arc<dyn ConnectionListener<String>>);
        a.start().unwrap();
        b.start().unwrap();

        for i in 0..10 {
            a.send(format!("last-{i}"));
        }
        tokio::time::timeout(Duration::from_secs(2), a.close_after_sending())
            .await
            .expect("close_after_sending did not finish");
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(a.outbound_len(), 0);

        for i in 0..10 {
            assert_eq!(recv(&b).await, format!("last-{i}"));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.errors().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("close never observed by peer");
        assert_eq!(recorder.errors(), vec![SocketError::Closed.to_string()]);

        b.close().await;
    }

    #[tokio::test]
    async fn test_writer_sends_heartbeats_when_idle() {
        let (conn, mut raw) = raw_pair::<String>().await;
        conn.start().unwrap();

        let mut decoder = crate::socket::FrameDecoder::<String>::new();
        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(1), raw.read(&mut buf))
            .await
            .expect("no heartbeat within a second")
            .unwrap();
        let frames = decoder.feed(&buf[..n]).unwrap();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(Message::is_heartbeat));

        conn.close().await;
    }

    async fn wait_until_stopped<T: Payload>(conn: &QueuedConnection<T>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection never stopped");
    }

    #[tokio::test]
    async fn test_restart_waits_for_write_still_in_flight() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let options = ConnectionOptions {
            heartbeat_interval: Duration::from_millis(50),
            read_timeout: None,
            write_timeout: Duration::from_secs(30),
        };
        let conn = QueuedConnection::<String>::connect(addr, options).await.unwrap();
        let (mut raw, _) = listener.accept().await.unwrap();

        // Larger than the loopback socket buffers, so the write blocks
        // until the peer starts reading.
        let big = "X".repeat(12 * 1024 * 1024);
        conn.send(big.clone());
        conn.send("Y".to_string());
        conn.send("Z".to_string());
        conn.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Fail the run while the big frame is still being written, then
        // restart without an explicit stop.
        raw.write_all(&[0, 0, 0, 0]).await.unwrap();
        wait_until_stopped(&conn).await;
        conn.start().unwrap();

        let mut decoder = crate::socket::FrameDecoder::<String>::new();
        let mut data: Vec<String> = Vec::new();
        let mut buf = vec![0u8; 256 * 1024];
        tokio::time::timeout(Duration::from_secs(10), async {
            while data.len() < 3 {
                let n = raw.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed early");
                let frames = decoder.feed(&buf[..n]).unwrap();
                data.extend(frames.into_iter().filter_map(Message::into_data));
            }
        })
        .await
        .expect("did not receive every message");

        assert_eq!(data.len(), 3);
        assert!(data[0] == big, "first message was not the big one");
        assert_eq!(data[1..], ["Y".to_string(), "Z".to_string()]);
        assert_eq!(conn.outbound_len(), 0);

        conn.close().await;
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped_and_stream_continues() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let a = QueuedConnection::with_options(
            Connection::with_max_frame_size(stream, 64),
            fast_options(),
        );
        let b = QueuedConnection::with_options(Connection::new(accepted), fast_options());
        let recorder = Arc::new(Recorder::default());
        a.add_listener(Arc::clone(&recorder) as Arc<dyn ConnectionListener<String>>);
        a.start().unwrap();
        b.start().unwrap();

        a.send("z".repeat(200));
        a.send("small".to_string());

        assert_eq!(recv(&b).await, "small");
        assert_eq!(recorder.sent.load(Ordering::SeqCst), 1);
        assert!(recorder.errors().is_empty(), "got: {:?}", recorder.errors());
        assert!(a.is_running());
        assert_eq!(a.outbound_len(), 0);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_queues_are_frozen_after_stop() {
        let (a, b) = queued_pair::<String>().await;
        a.start().unwrap();
        b.start().unwrap();
        a.send("before".to_string());
        assert_eq!(recv(&b).await, "before");

        a.stop().await;
        a.send("pending-1".to_string());
        a.send("pending-2".to_string());
        let (inbound, outbound) = (a.inbound_len(), a.outbound_len());
        assert_eq!(outbound, 2);

        // The peer keeps sending and reading.
        for i in 0..20 {
            b.send(format!("late-{i}"));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(a.inbound_len(), inbound);
        assert_eq!(a.outbound_len(), outbound);
        assert_eq!(b.inbound_len(), 0);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_queues_are_frozen_after_failure_and_stop() {
        use tokio::io::AsyncWriteExt;

        let (conn, mut raw) = raw_pair::<String>().await;
        conn.start().unwrap();
        let first = Message::Data("first".to_string()).encode().unwrap();
        raw.write_all(&first).await.unwrap();
        assert_eq!(recv(&conn).await, "first");

        raw.write_all(&[0, 0, 0, 0]).await.unwrap();
        wait_until_stopped(&conn).await;
        conn.stop().await;

        conn.send("stranded".to_string());
        let (inbound, outbound) = (conn.inbound_len(), conn.outbound_len());
        assert_eq!((inbound, outbound), (0, 1));

        let (mut rd, mut wr) = raw.split();
        let writes = async {
            for i in 0..20 {
                let frame = Message::Data(format!("ignored-{i}")).encode().unwrap();
                wr.write_all(&frame).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let reads = async {
            let mut buf = [0u8; 1024];
            let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
            while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, rd.read(&mut buf)).await {
                if n == 0 {
                    break;
                }
            }
        };
        tokio::join!(writes, reads);

        assert_eq!(conn.inbound_len(), inbound);
        assert_eq!(conn.outbound_len(), outbound);
        assert_eq!(conn.state(), ConnectionState::Stopped);

        conn.close().await;
    }
}
