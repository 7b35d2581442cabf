//! Error types shared by the scheduler library.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no free port found in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid callback port: {0:?}")]
    InvalidCallbackPort(String),

    #[error("worker did not reply within {0:?}")]
    WorkerTimeout(Duration),

    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("callback connection to {0} timed out")]
    CallbackTimeout(SocketAddr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
