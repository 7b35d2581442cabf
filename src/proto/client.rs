//! Client side of the inbound submission protocol.
//!
//! A blocking submission hosts its own callback listener: the client binds
//! it before talking to the scheduler, sends its port, and then waits for
//! the Node to connect back with the completion code.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::proto::wire;

/// How the scheduler should treat a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Fire and forget.
    NonBlocking,
    /// Wait for the completion code. The callback listener binds `port`
    /// (0 for an ephemeral port) and waits at most `wait` for the callback.
    Blocking { port: u16, wait: Duration },
}

/// Outcome of [`submit`].
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReport {
    pub server: String,
    pub payload: String,
    pub blocking: bool,
    /// Completion code from the worker, for blocking submissions.
    pub code: Option<String>,
    pub elapsed_ms: u64,
}

/// Submit `payload` to the scheduler's inbound server at `server`.
pub async fn submit(server: &str, payload: &[u8], mode: SubmitMode) -> Result<SubmitReport> {
    let started = Instant::now();

    let callback = match mode {
        SubmitMode::Blocking { port, .. } => {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            let bound = listener.local_addr()?.port();
            debug!(port = bound, "callback listener ready");
            Some((listener, bound))
        }
        SubmitMode::NonBlocking => None,
    };

    let mut stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;

    match &callback {
        Some((_, port)) => {
            exchange(&mut stream, wire::BLOCKING_TOKEN).await?;
            exchange(&mut stream, port.to_string().as_bytes()).await?;
        }
        None => exchange(&mut stream, wire::NON_BLOCKING_TOKEN).await?,
    }
    stream.write_all(payload).await?;
    stream.shutdown().await?;
    info!(server, blocking = callback.is_some(), "job submitted");

    let code = match (callback, mode) {
        (Some((listener, _)), SubmitMode::Blocking { wait, .. }) => {
            Some(await_completion(&listener, wait).await?)
        }
        _ => None,
    };

    Ok(SubmitReport {
        server: server.to_string(),
        payload: String::from_utf8_lossy(payload).into_owned(),
        blocking: code.is_some(),
        code,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Send one chunk and wait for the server's `SET`.
async fn exchange(stream: &mut TcpStream, chunk: &[u8]) -> Result<()> {
    stream.write_all(chunk).await?;
    let reply = wire::read_chunk(stream).await?;
    if !wire::is_ack(&reply) {
        return Err(SchedulerError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("expected SET, got {:?}", String::from_utf8_lossy(&reply)),
        )));
    }
    Ok(())
}

/// Accept the Node's callback connection and read the completion code.
pub async fn await_completion(listener: &TcpListener, wait: Duration) -> Result<String> {
    let addr = listener.local_addr()?;
    let read = async {
        let (mut stream, peer) = listener.accept().await?;
        debug!(%peer, "callback connection accepted");
        let mut buf = Vec::with_capacity(wire::CHUNK_SIZE);
        stream.read_to_end(&mut buf).await?;
        Ok::<_, SchedulerError>(wire::parse_completion_code(&buf))
    };

    tokio::time::timeout(wait, read)
        .await
        .map_err(|_| SchedulerError::CallbackTimeout(addr))?
}
