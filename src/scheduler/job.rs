//! A submitted unit of work.

use std::borrow::Cow;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A job waiting in, or just taken from, the shared queue.
///
/// The payload is opaque to the scheduler and is written to the worker
/// byte-for-byte. A job is *blocking* when it carries a callback address: the
/// Node that runs it reports the completion code there.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub payload: Bytes,
    pub callback: Option<SocketAddr>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: impl Into<Bytes>, callback: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            callback,
            submitted_at: Utc::now(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.callback.is_some()
    }

    /// Milliseconds since submission, for log output.
    pub fn queued_ms(&self) -> i64 {
        (Utc::now() - self.submitted_at).num_milliseconds()
    }

    /// Payload rendered for log output.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
