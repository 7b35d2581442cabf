//! TOML configuration for the scheduler daemon.
//!
//! Every section falls back to compiled-in defaults, so an empty file (or no
//! file at all) yields a working four-slot scheduler on port 9000.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::node::NodeSettings;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PHANTOM_SCHEDULER_CONFIG";

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/phantom-scheduler/scheduler.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SchedulerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded scheduler configuration");
        Ok(config)
    }

    /// Try, in order: `$PHANTOM_SCHEDULER_CONFIG`, the system path, then
    /// defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PHANTOM_SCHEDULER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.slots == 0 {
            anyhow::bail!("pool.slots must be at least 1");
        }
        if self.pool.poll_interval_ms == 0 {
            anyhow::bail!("pool.poll_interval_ms must be greater than 0");
        }
        if self.network.port_attempts == 0 {
            anyhow::bail!("network.port_attempts must be at least 1");
        }
        if self.launch.runner.trim().is_empty() {
            anyhow::bail!("launch.runner must not be empty");
        }
        Ok(())
    }

    /// Dispatch-loop timing derived from the pool and callback sections.
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            poll_interval: Duration::from_millis(self.pool.poll_interval_ms),
            worker_timeout: self.pool.worker_timeout_sec.map(Duration::from_secs),
            callback_timeout: Duration::from_secs(self.callback.connect_timeout_sec),
        }
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface the inbound server and Node sockets listen on.
    pub bind_host: String,
    /// Host name passed to workers. Defaults to the machine's host name.
    pub advertise_host: Option<String>,
    /// First port tried for the inbound server; Nodes follow it.
    pub base_port: u16,
    /// How many consecutive ports to try before giving up on a bind.
    pub port_attempts: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            advertise_host: None,
            base_port: 9000,
            port_attempts: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of Node slots (and workers).
    pub slots: usize,
    /// How long an idle Node waits on the queue before re-checking the
    /// termination flag (milliseconds).
    pub poll_interval_ms: u64,
    /// Give up on a worker that has not replied within this many seconds.
    /// Unset waits forever.
    pub worker_timeout_sec: Option<u64>,
    /// How many times a slot may relaunch a lost worker.
    pub max_worker_restarts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            poll_interval_ms: 100,
            worker_timeout_sec: None,
            max_worker_restarts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Launch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Queueing command prefixed to the runner, e.g. `qsub`. Empty runs the
    /// runner directly.
    pub queue_cmd: String,
    /// Worker program; receives `-h <host> -p <port>`.
    pub runner: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            queue_cmd: String::new(),
            runner: "./psrunner".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Connect timeout when reporting a blocking job's completion code.
    pub connect_timeout_sec: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
