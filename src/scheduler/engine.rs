use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::node::{Node, NodeExit, NodeSettings, StatusCell};
use crate::scheduler::queue::JobQueue;
use crate::termination::TerminationFlag;
use crate::worker::launcher::WorkerLauncher;

/// Everything a slot needs to (re)start its Node and worker.
pub(crate) struct SlotContext {
    pub advertise_host: String,
    pub bind_host: String,
    pub port_attempts: u16,
    pub max_restarts: u32,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub queue: Arc<JobQueue>,
    pub flag: TerminationFlag,
    pub status: StatusCell,
    pub settings: NodeSettings,
}

/// How a slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotReport {
    pub slot: usize,
    pub port: u16,
    pub restarts: u32,
    pub worker_lost: bool,
}

/// Launch the slot's worker and run its Node. A lost worker is relaunched
/// on a fresh Node while the scheduler is still running and the restart
/// budget allows it.
pub(crate) async fn supervise_slot(mut node: Node, ctx: SlotContext) -> SlotReport {
    let slot = node.slot();
    let mut restarts = 0;

    loop {
        let port = node.port();

        if let Err(e) = ctx.launcher.launch(&ctx.advertise_host, port).await {
            error!(slot, port, error = %e, "failed to launch worker");
            node.shutdown().await;
            return SlotReport {
                slot,
                port,
                restarts,
                worker_lost: true,
            };
        }
        info!(slot, port, host = %ctx.advertise_host, "worker launched");

        match node.run().await {
            NodeExit::Finished => {
                info!(slot, port, restarts, "slot finished");
                return SlotReport {
                    slot,
                    port,
                    restarts,
                    worker_lost: false,
                };
            }
            NodeExit::WorkerLost => {
                let lost = SlotReport {
                    slot,
                    port,
                    restarts,
                    worker_lost: true,
                };
                if !ctx.flag.is_running() {
                    return lost;
                }
                if restarts >= ctx.max_restarts {
                    warn!(slot, port, restarts, "worker lost, no restarts left");
                    return lost;
                }

                restarts += 1;
                warn!(slot, port, restarts, "worker lost, relaunching");
                node = match Node::bind(
                    slot,
                    &ctx.bind_host,
                    port,
                    ctx.port_attempts,
                    Arc::clone(&ctx.queue),
                    ctx.flag.clone(),
                    ctx.status.clone(),
                    ctx.settings,
                )
                .await
                {
                    Ok(node) => node,
                    Err(e) => {
                        error!(slot, port, error = %e, "failed to rebind slot");
                        return lost;
                    }
                };
            }
        }
    }
}
