//! Dispatcher-level error taxonomy: protocol, resource, state, adapter, and
//! transport failures, each carrying an error code string a client can match
//! on plus a human-readable message.

use crate::wire::protocol::Response;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError {
    pub code: &'static str,
    pub message: String,
}

impl DispatchError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn job_not_found(handle: impl std::fmt::Display) -> Self {
        Self::new("job_not_found", format!("no such job {handle}"))
    }

    pub fn no_registered_function(handle: impl std::fmt::Display) -> Self {
        Self::new("no_registered_function", format!("job {handle} belongs to a function no longer registered"))
    }

    pub fn queue_full() -> Self {
        Self::new("queue_full", "queue is full")
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DispatchError {}

impl From<DispatchError> for Response {
    fn from(e: DispatchError) -> Self {
        Response::Error { code: e.code, message: e.message }
    }
}
