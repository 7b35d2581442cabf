//! Inbound submission server.
//!
//! `InboundServer` accepts client connections and handles each one on its
//! own task. A connection carries exactly one submission:
//!
//! 1. blocking token, answered with `SET`
//! 2. callback port (blocking submissions only), answered with `SET`
//! 3. job payload
//!
//! An `EXIT` payload raises the termination flag to drain instead of
//! queueing anything.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::ports::bind_with_fallback;
use crate::proto::wire;
use crate::scheduler::job::Job;
use crate::scheduler::queue::JobQueue;
use crate::termination::{Termination, TerminationFlag};

// ---------------------------------------------------------------------------
// InboundServer
// ---------------------------------------------------------------------------

pub struct InboundServer {
    listener: TcpListener,
    port: u16,
    queue: Arc<JobQueue>,
    flag: TerminationFlag,
}

impl InboundServer {
    /// Bind on the first free port at or after `start_port`.
    pub async fn bind(
        host: &str,
        start_port: u16,
        port_attempts: u16,
        queue: Arc<JobQueue>,
        flag: TerminationFlag,
    ) -> Result<Self> {
        let (listener, port) = bind_with_fallback(host, start_port, port_attempts).await?;
        info!(host, port, "inbound server listening");
        Ok(Self {
            listener,
            port,
            queue,
            flag,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept submissions until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            let (mut stream, peer) = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept submission connection");
                        continue;
                    }
                },
            };

            debug!(%peer, "accepted submission connection");
            let queue = Arc::clone(&self.queue);
            let flag = self.flag.clone();

            tokio::spawn(async move {
                match handle_submission(&mut stream, peer, &queue, &flag).await {
                    Ok(Submission::Queued(job_id)) => {
                        debug!(%peer, %job_id, queued = queue.len(), "submission queued");
                    }
                    Ok(Submission::Exit) => {
                        info!(%peer, "EXIT received, draining queue");
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "rejected malformed submission");
                    }
                }
            });
        }

        info!(port = self.port, "inbound server stopped");
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

/// What a handled connection did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued(Uuid),
    Exit,
}

/// Run the submission exchange on one connection.
///
/// Nothing is queued unless the whole exchange succeeds. A blocking job's
/// callback address is the client's own IP with the port it sent.
pub async fn handle_submission<S>(
    stream: &mut S,
    peer: SocketAddr,
    queue: &JobQueue,
    flag: &TerminationFlag,
) -> Result<Submission>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let token = wire::read_chunk(stream).await?;
    let blocking = wire::is_blocking_token(&token);
    stream.write_all(wire::ACK).await?;

    let callback = if blocking {
        let port_chunk = wire::read_chunk(stream).await?;
        let port = wire::parse_callback_port(&port_chunk)?;
        stream.write_all(wire::ACK).await?;
        Some(SocketAddr::new(peer.ip(), port))
    } else {
        None
    };

    let payload = wire::read_chunk(stream).await?;
    if wire::is_exit(&payload) {
        flag.raise(Termination::Drain);
        return Ok(Submission::Exit);
    }

    let job = Job::new(payload, callback);
    let id = job.id;
    queue.push(job);
    Ok(Submission::Queued(id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use tokio::io::{duplex, AsyncReadExt};

    fn peer() -> SocketAddr {
        "10.1.2.3:45678".parse().unwrap()
    }

    async fn expect_ack<S: AsyncRead + Unpin>(stream: &mut S) {
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, wire::ACK);
    }

    #[tokio::test]
    async fn test_non_blocking_submission_is_queued() {
        let queue = JobQueue::new();
        let flag = TerminationFlag::new();
        let (mut client, mut server) = duplex(4096);

        let handler = async { handle_submission(&mut server, peer(), &queue, &flag).await };
        let driver = async {
            client.write_all(b"NONBLOCKING").await.unwrap();
            expect_ack(&mut client).await;
            client.write_all(b"JOB1").await.unwrap();
        };
        let (result, ()) = tokio::join!(handler, driver);

        assert!(matches!(result.unwrap(), Submission::Queued(_)));
        let job = queue.try_pop().unwrap();
        assert_eq!(&job.payload[..], b"JOB1");
        assert!(!job.is_blocking());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_submission_records_callback() {
        let queue = JobQueue::new();
        let flag = TerminationFlag::new();
        let (mut client, mut server) = duplex(4096);

        let handler = async { handle_submission(&mut server, peer(), &queue, &flag).await };
        let driver = async {
            client.write_all(b"BLOCKING").await.unwrap();
            expect_ack(&mut client).await;
            client.write_all(b"9500").await.unwrap();
            expect_ack(&mut client).await;
            client.write_all(b"JOB2").await.unwrap();
        };
        let (result, ()) = tokio::join!(handler, driver);

        assert!(matches!(result.unwrap(), Submission::Queued(_)));
        let job = queue.try_pop().unwrap();
        assert_eq!(&job.payload[..], b"JOB2");
        assert_eq!(job.callback, Some("10.1.2.3:9500".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_exit_sets_drain_and_queues_nothing() {
        let queue = JobQueue::new();
        let flag = TerminationFlag::new();
        let (mut client, mut server) = duplex(4096);

        let handler = async { handle_submission(&mut server, peer(), &queue, &flag).await };
        let driver = async {
            client.write_all(b"NONBLOCKING").await.unwrap();
            expect_ack(&mut client).await;
            client.write_all(b"EXIT").await.unwrap();
        };
        let (result, ()) = tokio::join!(handler, driver);

        assert_eq!(result.unwrap(), Submission::Exit);
        assert_eq!(flag.get(), Termination::Drain);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_non_numeric_port_is_rejected() {
        let queue = JobQueue::new();
        let flag = TerminationFlag::new();
        let (mut client, mut server) = duplex(4096);

        let handler = async { handle_submission(&mut server, peer(), &queue, &flag).await };
        let driver = async {
            client.write_all(b"BLOCKING").await.unwrap();
            expect_ack(&mut client).await;
            client.write_all(b"not-a-port").await.unwrap();
        };
        let (result, ()) = tokio::join!(handler, driver);

        assert!(matches!(result, Err(SchedulerError::InvalidCallbackPort(_))));
        assert!(queue.is_empty());
        assert!(flag.is_running());
    }

    #[tokio::test]
    async fn test_disconnect_mid_exchange_queues_nothing() {
        let queue = JobQueue::new();
        let flag = TerminationFlag::new();
        let (mut client, mut server) = duplex(4096);

        let handler = async { handle_submission(&mut server, peer(), &queue, &flag).await };
        let driver = async move {
            client.write_all(b"NONBLOCKING").await.unwrap();
            expect_ack(&mut client).await;
            drop(client);
        };
        let (result, ()) = tokio::join!(handler, driver);

        assert!(matches!(result, Err(SchedulerError::ConnectionClosed)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_server_accepts_over_tcp_and_stops_on_cancel() {
        let queue = Arc::new(JobQueue::new());
        let flag = TerminationFlag::new();
        let server = InboundServer::bind("127.0.0.1", 0, 1, Arc::clone(&queue), flag)
            .await
            .unwrap();
        let port = server.port();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.serve(cancel.clone()));

        let addr = format!("127.0.0.1:{}", port);
        crate::proto::client::submit(&addr, b"JOB1", crate::proto::client::SubmitMode::NonBlocking)
            .await
            .unwrap();

        let job = queue
            .pop_timeout(std::time::Duration::from_secs(5))
            .await
            .expect("job should be queued");
        assert_eq!(&job.payload[..], b"JOB1");

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("server should stop")
            .unwrap();
    }
}
