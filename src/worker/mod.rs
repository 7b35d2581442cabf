//! Worker side of a Node connection.
//!
//! The runner connects to its Node, executes every job it is sent as a shell
//! command and answers with the exit code, until the Node sends `EXIT` or
//! hangs up.

pub mod launcher;

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::proto::wire;

/// Serve jobs from the Node at `host:port`. Returns the number of jobs run.
pub async fn run(host: &str, port: u16) -> Result<u64> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    info!(host, port, "connected to node");

    let mut completed = 0u64;
    loop {
        let job = match wire::read_chunk(&mut stream).await {
            Ok(chunk) => chunk,
            Err(SchedulerError::ConnectionClosed) => {
                warn!(host, port, "node closed the connection");
                break;
            }
            Err(e) => return Err(e),
        };

        if wire::is_exit(&job) {
            info!(host, port, completed, "EXIT received");
            break;
        }

        let command = String::from_utf8_lossy(&job).into_owned();
        let code = execute(&command).await;
        stream.write_all(code.as_bytes()).await?;
        completed += 1;
    }

    Ok(completed)
}

/// Run `command` through `sh -c` and return its exit code as text.
/// Signals and spawn failures report [`wire::UNKNOWN_CODE`].
pub async fn execute(command: &str) -> String {
    debug!(command, "executing job");
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) => match status.code() {
            Some(code) => {
                debug!(command, code, "job exited");
                code.to_string()
            }
            None => {
                warn!(command, "job terminated by signal");
                wire::UNKNOWN_CODE.to_string()
            }
        },
        Err(e) => {
            warn!(command, error = %e, "failed to spawn job");
            wire::UNKNOWN_CODE.to_string()
        }
    }
}
