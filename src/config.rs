//! Configuration loading and persistence.
//!
//! Reads `config.json` from the objsock config directory, then applies
//! `OBJSOCK_*` environment overrides. Missing files and missing fields fall
//! back to the defaults in [`crate::constants`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{fs, io};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    ACCEPT_POLL_TIMEOUT, DEFAULT_PORT, HEARTBEAT_INTERVAL, MAX_FRAME_SIZE, READ_TIMEOUT,
    WRITE_TIMEOUT,
};
use crate::socket::ConnectionOptions;

/// Config file name inside [`Config::config_dir`].
const CONFIG_FILE: &str = "config.json";

/// Configuration for objsock servers and clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// TCP port the accept loop binds (0 picks a free port).
    pub port: u16,
    /// Bounded wait for each `accept()` call, in milliseconds.
    pub accept_poll_timeout_ms: u64,
    /// Idle time before the writer sends a heartbeat, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Peer silence tolerated by the reader, in milliseconds. 0 disables.
    pub read_timeout_ms: u64,
    /// Upper bound on writing a single frame, in milliseconds.
    pub write_timeout_ms: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: u32,
    /// Start accepted connections before handing them to the callback.
    pub auto_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            accept_poll_timeout_ms: duration_ms(ACCEPT_POLL_TIMEOUT),
            heartbeat_interval_ms: duration_ms(HEARTBEAT_INTERVAL),
            read_timeout_ms: duration_ms(READ_TIMEOUT),
            write_timeout_ms: duration_ms(WRITE_TIMEOUT),
            max_frame_size: MAX_FRAME_SIZE,
            auto_start: true,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `OBJSOCK_CONFIG_DIR` overrides the platform config directory
    /// (Linux: `~/.config/objsock`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("OBJSOCK_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("objsock")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Path of the config file.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) if is_not_found(&e) => {
                log::debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a specific file, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Applies `OBJSOCK_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from an arbitrary variable lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_from(&lookup, "OBJSOCK_PORT", &mut self.port);
        override_from(&lookup, "OBJSOCK_ACCEPT_POLL_MS", &mut self.accept_poll_timeout_ms);
        override_from(&lookup, "OBJSOCK_HEARTBEAT_MS", &mut self.heartbeat_interval_ms);
        override_from(&lookup, "OBJSOCK_READ_TIMEOUT_MS", &mut self.read_timeout_ms);
        override_from(&lookup, "OBJSOCK_WRITE_TIMEOUT_MS", &mut self.write_timeout_ms);
        override_from(&lookup, "OBJSOCK_MAX_FRAME_SIZE", &mut self.max_frame_size);
        override_from(&lookup, "OBJSOCK_AUTO_START", &mut self.auto_start);
    }

    /// Persists the configuration to the default config file.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Persists the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Timing options for queued connections.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            read_timeout: (self.read_timeout_ms > 0)
                .then(|| Duration::from_millis(self.read_timeout_ms)),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    /// Bounded wait for each `accept()` call.
    pub fn accept_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_poll_timeout_ms)
    }
}

fn override_from<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => log::warn!("Ignoring {name}={raw:?}: not a valid value"),
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|e| e.kind() == io::ErrorKind::NotFound)
}
