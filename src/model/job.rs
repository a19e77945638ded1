use bytes::Bytes;

use crate::wire::protocol::Priority;

use super::connection::ConnectionId;

/// Opaque job handle, `"<prefix>:<seq>"`. Cheap to clone since it's backed
/// by `Bytes`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct JobHandle(pub Bytes);

impl JobHandle {
    pub fn as_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A function name, as advertised by workers and referenced by clients.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FunctionName(pub Bytes);

#[derive(Debug, Clone)]
pub struct Job {
    pub handle: JobHandle,
    pub function: FunctionName,
    pub unique: Bytes,
    pub priority: Priority,
    pub data: Bytes,
    pub retries: u32,
    pub numerator: u32,
    pub denominator: u32,
    /// `true` once the persistent store holds this job.
    pub job_queued: bool,
    /// Set when the last subscribing client disconnects before a worker
    /// picks the job up; a worker that would otherwise take it instead
    /// drops and frees it.
    pub ignore_job: bool,
    /// `None` while queued; `Some` once a worker has it reserved.
    pub worker: Option<ConnectionId>,
    /// Clients subscribed to this job's completion (empty for background
    /// jobs).
    pub clients: Vec<ConnectionId>,
}

impl Job {
    pub fn is_background(&self) -> bool {
        self.clients.is_empty()
    }
}
