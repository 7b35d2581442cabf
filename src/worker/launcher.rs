//! Starting worker processes for Node slots.
//!
//! Workers are started through an operator-supplied queueing command (a
//! cluster submission tool such as `qsub`, or nothing at all), which is
//! handed the runner and the Node's address:
//!
//! ```text
//! <queue_cmd...> <runner...> -h <host> -p <port>
//! ```

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};

/// Something that can start a worker pointed at a Node.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker that will connect to `host:port`.
    async fn launch(&self, host: &str, port: u16) -> Result<()>;
}

/// Launches workers as local child processes.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    queue_cmd: Vec<String>,
    runner: Vec<String>,
}

impl CommandLauncher {
    /// Both commands are split on whitespace. An empty `queue_cmd` runs the
    /// runner directly.
    pub fn new(queue_cmd: &str, runner: &str) -> Self {
        Self {
            queue_cmd: queue_cmd.split_whitespace().map(str::to_string).collect(),
            runner: runner.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Full argv for a worker connecting to `host:port`.
    pub fn command_line(&self, host: &str, port: u16) -> Vec<String> {
        self.queue_cmd
            .iter()
            .chain(self.runner.iter())
            .cloned()
            .chain([
                "-h".to_string(),
                host.to_string(),
                "-p".to_string(),
                port.to_string(),
            ])
            .collect()
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, host: &str, port: u16) -> Result<()> {
        if self.runner.is_empty() {
            return Err(SchedulerError::Launch("no runner configured".into()));
        }

        let argv = self.command_line(host, port);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SchedulerError::Launch("empty launch command".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SchedulerError::Launch(format!("failed to spawn '{}': {}", program, e)))?;

        info!(pid = child.id(), command = %argv.join(" "), "worker launch command started");

        // Reap the child so it does not linger as a zombie. With a queueing
        // command this only tracks the submission, not the worker itself.
        let command = argv.join(" ");
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(%command, "worker launch command exited");
                }
                Ok(status) => {
                    warn!(%command, exit_code = status.code(), "worker launch command failed");
                }
                Err(e) => {
                    warn!(%command, error = %e, "could not wait on worker launch command");
                }
            }
        });

        Ok(())
    }
}

/// Host name workers should connect to: the configured override, else the
/// machine's host name, else `localhost`.
pub fn advertise_host(configured: Option<&str>) -> String {
    if let Some(host) = configured.filter(|h| !h.trim().is_empty()) {
        return host.trim().to_string();
    }
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
