//! Unframed chunk protocol shared by the inbound server, the Nodes, the
//! worker runner and the submission client.
//!
//! Every message is a single write of at most [`CHUNK_SIZE`] bytes and is
//! received with a single read. There is no length prefix: the protocol is
//! strictly request/response, so a peer never has two messages in flight.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, SchedulerError};

/// Largest message read in one go.
pub const CHUNK_SIZE: usize = 1024;

/// Acknowledgement sent by the inbound server after the token and port.
pub const ACK: &[u8] = b"SET";

/// Token announcing a blocking submission.
pub const BLOCKING_TOKEN: &[u8] = b"BLOCKING";

/// Token sent by clients for fire-and-forget submissions. Any token other
/// than [`BLOCKING_TOKEN`] is treated the same way.
pub const NON_BLOCKING_TOKEN: &[u8] = b"NONBLOCKING";

/// Payload that asks the scheduler to drain and stop, and the message a
/// Node sends its worker on shutdown.
pub const EXIT_SENTINEL: &[u8] = b"EXIT";

/// Completion code reported when a job's exit status is unknown.
pub const UNKNOWN_CODE: &str = "-1";

/// Read one chunk of at most [`CHUNK_SIZE`] bytes.
///
/// A zero-length read means the peer closed the connection and is reported
/// as [`SchedulerError::ConnectionClosed`].
pub async fn read_chunk<S>(stream: &mut S) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(CHUNK_SIZE);
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(SchedulerError::ConnectionClosed);
    }
    buf.truncate(n);
    Ok(buf.freeze())
}

/// Whether a token chunk requests a blocking submission.
pub fn is_blocking_token(chunk: &[u8]) -> bool {
    chunk.trim_ascii() == BLOCKING_TOKEN
}

pub fn is_exit(payload: &[u8]) -> bool {
    payload.trim_ascii() == EXIT_SENTINEL
}

pub fn is_ack(chunk: &[u8]) -> bool {
    chunk.trim_ascii() == ACK
}

/// Parse an ASCII decimal callback port. Port 0 is rejected because nothing
/// can be listening there.
pub fn parse_callback_port(chunk: &[u8]) -> Result<u16> {
    let text = String::from_utf8_lossy(chunk);
    let text = text.trim();
    match text.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(SchedulerError::InvalidCallbackPort(text.to_string())),
    }
}

/// Turn a worker reply into the completion code string.
pub fn parse_completion_code(chunk: &[u8]) -> String {
    String::from_utf8_lossy(chunk.trim_ascii()).into_owned()
}
