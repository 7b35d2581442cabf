//! Out-of-band completion notification for blocking jobs.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Connect to `addr`, send `code`, and close the connection.
///
/// One attempt only; the connect is bounded by `connect_timeout`.
pub async fn deliver(addr: SocketAddr, code: &str, connect_timeout: Duration) -> Result<()> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SchedulerError::CallbackTimeout(addr))??;

    stream.write_all(code.as_bytes()).await?;
    stream.shutdown().await?;

    debug!(%addr, code, "completion code delivered");
    Ok(())
}
