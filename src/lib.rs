//! Gearman job-queue server core: wire codecs, the in-memory data model,
//! the scheduler, the command dispatcher, and the Tokio runtime surface
//! that wires them together. See `server::run` for the entry point a binary
//! would call.

pub mod dispatch;
pub mod error;
pub mod model;
pub mod queue;
pub mod server;
pub mod wire;
