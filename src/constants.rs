//! Crate-wide constants for objsock.
//!
//! Centralizes the timing and sizing defaults used by the socket layer.
//! Everything here can be overridden at runtime through [`crate::Config`].
//!
//! # Categories
//!
//! - **Heartbeat & Liveness**: writer keep-alive and reader idle detection
//! - **Server**: accept-loop polling and back-off
//! - **Wire**: frame size limits and read buffer sizing

use std::time::Duration;

// ============================================================================
// Heartbeat & Liveness
// ============================================================================

/// Idle interval after which the writer task sends a heartbeat.
///
/// The writer wakes immediately when something is enqueued, so this only
/// governs keep-alive traffic on an otherwise idle connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How long the reader waits for any frame (heartbeat included) before
/// declaring the peer dead.
///
/// Must comfortably exceed [`HEARTBEAT_INTERVAL`] or idle connections will
/// be torn down.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single frame write.
///
/// A peer that stops draining its socket would otherwise park the writer
/// task forever and make `stop()` unbounded.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Server
// ============================================================================

/// Default TCP port for `objsock serve`.
pub const DEFAULT_PORT: u16 = 7420;

/// Bounded wait for a single `accept()` call.
///
/// Timeouts are expected control flow; the loop re-checks its serving
/// state and accepts again.
pub const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Back-off after a failed accept before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Wire
// ============================================================================

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Socket read buffer size (64 KB).
pub const READ_BUFFER_SIZE: usize = 64 * 1024;
