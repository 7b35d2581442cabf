//! Job submission protocol: chunk helpers, the submission client and
//! completion callbacks.

pub mod callback;
pub mod client;
pub mod wire;
