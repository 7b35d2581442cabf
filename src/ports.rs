//! Listener binding with upward port fallback.

use std::io::ErrorKind;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Bind a TCP listener on `host`, starting at `start` and moving up one port
/// at a time while the address is already in use.
///
/// At most `attempts` ports are tried. Any bind error other than
/// "address in use" is returned immediately. A `start` of 0 asks the OS for an
/// ephemeral port. Returns the listener and the port it actually holds.
pub async fn bind_with_fallback(host: &str, start: u16, attempts: u16) -> Result<(TcpListener, u16)> {
    let end = start.saturating_add(attempts.saturating_sub(1));

    for port in start..=end {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                debug!(host, port = bound, "bound listener");
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(host, port, "port in use, trying next");
                continue;
            }
            Err(e) => {
                return Err(SchedulerError::Bind {
                    addr: format!("{}:{}", host, port),
                    source: e,
                });
            }
        }
    }

    Err(SchedulerError::PortsExhausted { start, end })
}

/// First port to try after `claimed`, or an error when `claimed` is the top
/// of the port range.
pub fn next_port(claimed: u16) -> Result<u16> {
    claimed.checked_add(1).ok_or(SchedulerError::PortsExhausted {
        start: claimed,
        end: claimed,
    })
}
