//! Process-wide tri-state shutdown signal shared by the inbound server and
//! every Node.
//!
//! The level only ever moves upward: once a drain has been requested the
//! scheduler cannot be put back into `Running`, and `Immediate` is final.

use std::sync::Arc;

use tokio::sync::watch;

/// How far along shutdown the scheduler is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Termination {
    /// Keep dispatching jobs.
    Running = 0,
    /// Finish the jobs already queued, then stop.
    Drain = 1,
    /// Stop now and abandon anything still queued.
    Immediate = 2,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Running => write!(f, "running"),
            Termination::Drain => write!(f, "drain"),
            Termination::Immediate => write!(f, "immediate"),
        }
    }
}

/// Cloneable handle to the shared termination level.
#[derive(Debug, Clone)]
pub struct TerminationFlag {
    tx: Arc<watch::Sender<Termination>>,
}

impl Default for TerminationFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Termination::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Current level.
    pub fn get(&self) -> Termination {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.get() == Termination::Running
    }

    /// Raise the level to `level`. Returns `true` if the level changed;
    /// requests to lower it are ignored.
    pub fn raise(&self, level: Termination) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if level > *current {
                *current = level;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(level = %level, "termination level raised");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<Termination> {
        self.tx.subscribe()
    }

    /// Resolve once the level is at least `level`.
    pub async fn wait_for(&self, level: Termination) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|current| *current >= level).await;
    }
}
