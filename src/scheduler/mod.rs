//! Scheduler orchestration: the job queue, the inbound server and the pool
//! of Node slots.

pub mod engine;
pub mod job;
pub mod queue;

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::inbound::InboundServer;
use crate::node::{Node, NodeStatus, StatusCell};
use crate::ports::next_port;
use crate::shutdown::install_shutdown_handler;
use crate::termination::{Termination, TerminationFlag};
use crate::worker::launcher::{advertise_host, CommandLauncher, WorkerLauncher};

use self::engine::{supervise_slot, SlotContext};

pub use self::engine::SlotReport;
pub use self::job::Job;
pub use self::queue::JobQueue;

/// Builds and runs a scheduler from configuration.
pub struct Scheduler {
    config: SchedulerConfig,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Scheduler {
    /// Scheduler that launches workers with the configured queue command.
    pub fn new(config: SchedulerConfig) -> Self {
        let launcher = Arc::new(CommandLauncher::new(
            &config.launch.queue_cmd,
            &config.launch.runner,
        ));
        Self { config, launcher }
    }

    /// Scheduler with a custom way of starting workers.
    pub fn with_launcher(config: SchedulerConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self { config, launcher }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Bind every socket, start the inbound server and one supervisor per
    /// slot, and launch the workers.
    ///
    /// The inbound server claims `base_port` (or the next free port) and
    /// each Node claims the next free port after the previous one. Bind
    /// failures other than "address in use" are returned.
    pub async fn start(&self) -> Result<RunningScheduler> {
        let net = &self.config.network;
        let queue = Arc::new(JobQueue::new());
        let flag = TerminationFlag::new();
        let cancel = CancellationToken::new();
        let settings = self.config.node_settings();
        let host = advertise_host(net.advertise_host.as_deref());

        let inbound = InboundServer::bind(
            &net.bind_host,
            net.base_port,
            net.port_attempts,
            Arc::clone(&queue),
            flag.clone(),
        )
        .await?;
        let inbound_port = inbound.port();

        let mut nodes = Vec::with_capacity(self.config.pool.slots);
        let mut slots = Vec::with_capacity(self.config.pool.slots);
        let mut claimed = inbound_port;
        for slot in 0..self.config.pool.slots {
            let status = StatusCell::new();
            let node = Node::bind(
                slot,
                &net.bind_host,
                next_port(claimed)?,
                net.port_attempts,
                Arc::clone(&queue),
                flag.clone(),
                status.clone(),
                settings,
            )
            .await?;
            claimed = node.port();
            slots.push(SlotHandle {
                slot,
                port: claimed,
                status,
            });
            nodes.push(node);
        }

        let inbound_task = tokio::spawn(inbound.serve(cancel.clone()));

        let mut supervisors = JoinSet::new();
        for (node, handle) in nodes.into_iter().zip(&slots) {
            let ctx = SlotContext {
                advertise_host: host.clone(),
                bind_host: net.bind_host.clone(),
                port_attempts: net.port_attempts,
                max_restarts: self.config.pool.max_worker_restarts,
                launcher: Arc::clone(&self.launcher),
                queue: Arc::clone(&queue),
                flag: flag.clone(),
                status: handle.status.clone(),
                settings,
            };
            supervisors.spawn(supervise_slot(node, ctx));
        }

        info!(
            inbound_port,
            slots = slots.len(),
            node_ports = ?slots.iter().map(|s| s.port).collect::<Vec<_>>(),
            %host,
            "scheduler started"
        );

        Ok(RunningScheduler {
            inbound_port,
            slots,
            queue,
            flag,
            cancel,
            inbound: Some(inbound_task),
            supervisors,
        })
    }

    /// Start the scheduler and block until every slot has finished.
    ///
    /// SIGINT or SIGTERM stops the scheduler immediately; submitting an
    /// `EXIT` job drains the queue first.
    pub async fn run(&self) -> Result<Vec<SlotReport>> {
        let mut running = self.start().await?;

        let interrupt = install_shutdown_handler();
        let flag = running.flag().clone();
        let cancel = running.cancel.clone();
        let stopper = tokio::spawn(async move {
            interrupt.cancelled().await;
            flag.raise(Termination::Immediate);
            cancel.cancel();
        });

        let reports = running.wait().await;
        stopper.abort();

        let lost = reports.iter().filter(|r| r.worker_lost).count();
        info!(slots = reports.len(), lost, "scheduler stopped");
        Ok(reports)
    }
}

/// Per-slot view kept by the running scheduler.
#[derive(Debug, Clone)]
struct SlotHandle {
    slot: usize,
    port: u16,
    status: StatusCell,
}

/// Handle to a started scheduler.
pub struct RunningScheduler {
    inbound_port: u16,
    slots: Vec<SlotHandle>,
    queue: Arc<JobQueue>,
    flag: TerminationFlag,
    cancel: CancellationToken,
    inbound: Option<JoinHandle<()>>,
    supervisors: JoinSet<SlotReport>,
}

impl RunningScheduler {
    pub fn inbound_port(&self) -> u16 {
        self.inbound_port
    }

    /// Ports the Nodes were first bound to, in slot order.
    pub fn node_ports(&self) -> Vec<u16> {
        self.slots.iter().map(|s| s.port).collect()
    }

    pub fn statuses(&self) -> Vec<(usize, NodeStatus)> {
        self.slots.iter().map(|s| (s.slot, s.status.get())).collect()
    }

    pub fn flag(&self) -> &TerminationFlag {
        &self.flag
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Wait for every slot to finish, then stop the inbound server.
    /// Returns the reports of slots that finished during this call.
    pub async fn wait(&mut self) -> Vec<SlotReport> {
        let mut reports = Vec::new();
        while let Some(joined) = self.supervisors.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "slot supervisor panicked"),
            }
        }
        reports.sort_by_key(|r| r.slot);
        self.stop_inbound().await;
        reports
    }

    /// Raise the termination level and wait for the scheduler to stop.
    /// Calling it again after the scheduler stopped does nothing.
    pub async fn shutdown(&mut self, level: Termination) -> Vec<SlotReport> {
        self.flag.raise(level);
        self.wait().await
    }

    async fn stop_inbound(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.inbound.take() {
            if let Err(e) = task.await {
                error!(error = %e, "inbound server task failed");
            }
        }
    }
}
