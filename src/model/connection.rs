use bytes::Bytes;
use tokio::sync::mpsc;

use super::job::{FunctionName, JobHandle};
use crate::wire::Outgoing;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

/// Per-(worker, function) capability: the function this worker can run and
/// its optional timeout, in registration order so round-robin rotation has
/// something stable to rotate.
#[derive(Debug, Clone)]
pub struct Capability {
    pub function: FunctionName,
    pub timeout: Option<u32>,
}

#[derive(Debug, Default)]
pub struct WorkerState {
    pub capabilities: Vec<Capability>,
    pub assigned_jobs: Vec<JobHandle>,
    pub is_sleeping: bool,
    pub is_noop_sent: bool,
}

impl WorkerState {
    pub fn has_capability(&self, function: &FunctionName) -> bool {
        self.capabilities.iter().any(|c| &c.function == function)
    }

    /// Rotates `function` to the end of the capability list, so the next
    /// `GRAB_JOB` from this worker considers a different function first.
    pub fn rotate_to_back(&mut self, function: &FunctionName) {
        if let Some(pos) = self.capabilities.iter().position(|c| &c.function == function) {
            let cap = self.capabilities.remove(pos);
            self.capabilities.push(cap);
        }
    }
}

/// A connection, wrapped with its client and/or worker role state. A single
/// connection may act as both simultaneously (submit jobs *and* register as
/// a worker), matching the source's "Client"/"Worker" being projections of
/// the same underlying connection rather than distinct connection types.
#[derive(Debug)]
pub struct ServerConnection {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedSender<Outgoing>,
    pub client_id: Option<Bytes>,
    pub exceptions: bool,
    /// Jobs this connection submitted and is subscribed to (client role).
    pub submitted_jobs: Vec<JobHandle>,
    pub worker: Option<WorkerState>,
}

impl ServerConnection {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            id,
            outbound,
            client_id: None,
            exceptions: false,
            submitted_jobs: Vec::new(),
            worker: None,
        }
    }

    pub fn worker_mut(&mut self) -> &mut WorkerState {
        self.worker.get_or_insert_with(WorkerState::default)
    }

    pub fn send(&self, msg: impl Into<Outgoing>) {
        // An unbounded channel send only fails once the connection's writer
        // task has exited (the peer disconnected); dropping the message is
        // correct since nothing will ever read it.
        let _ = self.outbound.send(msg.into());
    }
}
