//! Controller configuration and the per-run runtime value.
//!
//! Configuration is layered: built-in defaults, then `bosun.toml` in the
//! working directory, then `BOSUN_*` environment variables; CLI flags are
//! merged on top by `main`. The resolved [`Runtime`] is built once and
//! threaded read-only through the host runner.

use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while assembling the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Figment(#[from] Box<figment::Error>),
}

/// Tunables of the controller itself, independent of any inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of hosts driven in parallel.
    pub fanout: usize,
    /// Bound on the initial `CheckAlive`/`Ack` handshake.
    pub handshake_timeout_secs: u64,
    /// Dispatcher executable uploaded during bootstrap. Defaults to the
    /// running executable; override for cross-architecture targets.
    pub dispatcher: Option<Utf8PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            fanout: 4,
            handshake_timeout_secs: 30,
            dispatcher: None,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from defaults, `bosun.toml`, and `BOSUN_*`.
    ///
    /// # Errors
    /// Returns an error when a layer is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("bosun.toml"))
            .merge(Env::prefixed("BOSUN_"))
            .extract()
            .map_err(|e| ConfigError::Figment(Box::new(e)))
    }
}

/// Everything the run needs besides the inventory and the script: resolved
/// configuration plus the mode flags from the command line.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub config: RunnerConfig,
    /// Probe but never mutate.
    pub dry_run: bool,
    /// Operator-facing verbosity (0..3+).
    pub verbosity: u8,
    /// Debug logging on both sides of the pipe.
    pub debug: bool,
}

impl Runtime {
    #[must_use]
    pub fn new(config: RunnerConfig, dry_run: bool, verbosity: u8, debug: bool) -> Self {
        Self {
            config,
            dry_run,
            verbosity,
            debug,
        }
    }

    /// Path of the dispatcher executable shipped to targets.
    ///
    /// # Errors
    /// Returns an error when no path is configured and the current
    /// executable cannot be determined.
    pub fn dispatcher_path(&self) -> std::io::Result<PathBuf> {
        match &self.config.dispatcher {
            Some(path) => Ok(path.clone().into_std_path_buf()),
            None => std::env::current_exe(),
        }
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.handshake_timeout_secs)
    }
}
