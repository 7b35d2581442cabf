//! phantom-scheduler -- dispatches jobs submitted over TCP to a pool of
//! external worker processes.
//!
//! Clients submit jobs to the inbound server, which pushes them onto a shared
//! FIFO. Each Node owns one worker connection and pulls jobs off the queue
//! for it; blocking submissions get the worker's completion code back on a
//! callback connection.

pub mod config;
pub mod error;
pub mod inbound;
pub mod node;
pub mod ports;
pub mod proto;
pub mod scheduler;
pub mod shutdown;
pub mod termination;
pub mod worker;

use anyhow::Result;

pub use crate::config::SchedulerConfig;
pub use crate::error::SchedulerError;
pub use crate::scheduler::{RunningScheduler, Scheduler, SlotReport};
pub use crate::termination::{Termination, TerminationFlag};

/// Run the scheduler daemon until it drains or is interrupted, returning how
/// each slot ended.
pub async fn serve(config: SchedulerConfig) -> Result<Vec<SlotReport>> {
    config.validate()?;

    let scheduler = Scheduler::new(config);
    let cfg = scheduler.config();
    tracing::info!(
        slots = cfg.pool.slots,
        base_port = cfg.network.base_port,
        queue_cmd = %cfg.launch.queue_cmd,
        runner = %cfg.launch.runner,
        "Starting scheduler"
    );

    let reports = scheduler.run().await?;

    for report in reports.iter().filter(|r| r.worker_lost) {
        tracing::warn!(slot = report.slot, port = report.port, "slot ended with its worker lost");
    }

    Ok(reports)
}
