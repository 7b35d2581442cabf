//! A single worker slot.
//!
//! A `Node` owns one listening socket, accepts exactly one worker connection
//! on it, and then feeds that worker jobs from the shared queue until the
//! termination flag says to stop:
//!
//! ```text
//! NotRunning -> Waiting -> Idle <-> Working -> Dead
//! ```
//!
//! The listener is dropped as soon as the worker connects, so any further
//! connection attempts on the slot's port are refused by the OS.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::ports::bind_with_fallback;
use crate::proto::{callback, wire};
use crate::scheduler::job::Job;
use crate::scheduler::queue::JobQueue;
use crate::termination::{Termination, TerminationFlag};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    NotRunning,
    Waiting,
    Idle,
    Working,
    Dead,
}

/// Observable status of a slot. Survives Node restarts, so the scheduler
/// can hand out one cell per slot.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<watch::Sender<NodeStatus>>);

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(NodeStatus::NotRunning);
        Self(Arc::new(tx))
    }

    pub fn get(&self) -> NodeStatus {
        *self.0.borrow()
    }

    pub fn set(&self, status: NodeStatus) {
        self.0.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.0.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Timing knobs for the dispatch loop.
#[derive(Debug, Clone, Copy)]
pub struct NodeSettings {
    /// How long an idle Node waits on the queue before re-checking the flag.
    pub poll_interval: Duration,
    /// Upper bound on a worker's reply. `None` waits forever.
    pub worker_timeout: Option<Duration>,
    /// Connect timeout for completion callbacks.
    pub callback_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            worker_timeout: None,
            callback_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a Node stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    /// The termination flag ended the loop.
    Finished,
    /// The worker disconnected, errored or timed out.
    WorkerLost,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct Node {
    slot: usize,
    port: u16,
    listener: Option<TcpListener>,
    worker: Option<TcpStream>,
    queue: Arc<JobQueue>,
    flag: TerminationFlag,
    status: StatusCell,
    settings: NodeSettings,
}

impl Node {
    /// Bind the slot's listening socket on the first free port at or after
    /// `start_port`.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        slot: usize,
        host: &str,
        start_port: u16,
        port_attempts: u16,
        queue: Arc<JobQueue>,
        flag: TerminationFlag,
        status: StatusCell,
        settings: NodeSettings,
    ) -> Result<Self> {
        let (listener, port) = bind_with_fallback(host, start_port, port_attempts).await?;
        debug!(slot, port, "node listening");
        status.set(NodeStatus::NotRunning);

        Ok(Self {
            slot,
            port,
            listener: Some(listener),
            worker: None,
            queue,
            flag,
            status,
            settings,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> NodeStatus {
        self.status.get()
    }

    /// Wait for the worker, dispatch jobs until told to stop, then say
    /// goodbye to the worker.
    pub async fn run(mut self) -> NodeExit {
        let exit = match self.wait_for_worker().await {
            Ok(true) => self.dispatch_loop().await,
            Ok(false) => {
                info!(slot = self.slot, port = self.port, "stopped before a worker connected");
                NodeExit::Finished
            }
            Err(e) => {
                error!(slot = self.slot, port = self.port, error = %e, "failed to accept worker");
                NodeExit::WorkerLost
            }
        };
        self.shutdown().await;
        exit
    }

    fn should_continue(&self) -> bool {
        match self.flag.get() {
            Termination::Running => true,
            Termination::Drain => !self.queue.is_empty(),
            Termination::Immediate => false,
        }
    }

    /// Accept the slot's single worker. Returns `Ok(false)` if the flag
    /// stopped the Node first.
    async fn wait_for_worker(&mut self) -> Result<bool> {
        let Some(listener) = self.listener.take() else {
            return Err(SchedulerError::ConnectionClosed);
        };
        self.status.set(NodeStatus::Waiting);

        loop {
            if !self.should_continue() {
                return Ok(false);
            }
            let accepted = tokio::select! {
                accepted = listener.accept() => Some(accepted),
                _ = tokio::time::sleep(self.settings.poll_interval) => None,
            };
            if let Some(accepted) = accepted {
                // One worker per slot: stop listening before reporting Idle.
                drop(listener);
                let (stream, peer) = accepted?;
                stream.set_nodelay(true)?;
                info!(slot = self.slot, port = self.port, %peer, "worker connected");
                self.worker = Some(stream);
                self.status.set(NodeStatus::Idle);
                return Ok(true);
            }
        }
    }

    async fn dispatch_loop(&mut self) -> NodeExit {
        while self.should_continue() {
            let Some(job) = self.queue.pop_timeout(self.settings.poll_interval).await else {
                continue;
            };
            if self.flag.get() == Termination::Immediate {
                // Never start new work once an immediate stop is requested.
                self.queue.push_front(job);
                break;
            }

            self.status.set(NodeStatus::Working);
            debug!(
                slot = self.slot,
                job_id = %job.id,
                payload = %job.payload_lossy(),
                queued_ms = job.queued_ms(),
                "dispatching job"
            );

            match self.dispatch(&job).await {
                Ok(Some(code)) => {
                    info!(
                        slot = self.slot,
                        job_id = %job.id,
                        blocking = job.is_blocking(),
                        code = %code,
                        "job finished"
                    );
                    // Delivered before the next pop so a drain cannot finish
                    // ahead of its callbacks.
                    if let Some(addr) = job.callback {
                        let timeout = self.settings.callback_timeout;
                        if let Err(e) = callback::deliver(addr, &code, timeout).await {
                            warn!(slot = self.slot, job_id = %job.id, %addr, error = %e, "completion callback failed");
                        }
                    }
                }
                Ok(None) => {
                    warn!(slot = self.slot, job_id = %job.id, "abandoning job on immediate stop");
                    return NodeExit::Finished;
                }
                Err(e) => {
                    error!(slot = self.slot, job_id = %job.id, error = %e, "worker lost while running job");
                    return NodeExit::WorkerLost;
                }
            }

            self.status.set(NodeStatus::Idle);
        }
        NodeExit::Finished
    }

    /// Send one job and read the completion code. `Ok(None)` means an
    /// immediate stop arrived while the worker was busy.
    async fn dispatch(&mut self, job: &Job) -> Result<Option<String>> {
        let limit = self.settings.worker_timeout;
        let flag = self.flag.clone();
        let worker = self.worker.as_mut().ok_or(SchedulerError::ConnectionClosed)?;

        worker.write_all(&job.payload).await?;

        let reply = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, wire::read_chunk(worker))
                    .await
                    .map_err(|_| SchedulerError::WorkerTimeout(limit))?,
                None => wire::read_chunk(worker).await,
            }
        };

        tokio::select! {
            chunk = reply => Ok(Some(wire::parse_completion_code(&chunk?))),
            _ = flag.wait_for(Termination::Immediate) => Ok(None),
        }
    }

    /// Send `EXIT` to the worker and close everything. Safe to call more
    /// than once.
    pub async fn shutdown(&mut self) {
        self.listener.take();
        if let Some(mut worker) = self.worker.take() {
            if let Err(e) = worker.write_all(wire::EXIT_SENTINEL).await {
                debug!(slot = self.slot, error = %e, "could not send EXIT to worker");
            }
            let _ = worker.shutdown().await;
            info!(slot = self.slot, port = self.port, "worker released");
        }
        self.status.set(NodeStatus::Dead);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
