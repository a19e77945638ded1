pub mod connection;
pub mod function;
pub mod job;
pub mod scheduler;
pub mod server;

pub use connection::{Capability, ConnectionId, ServerConnection, WorkerState};
pub use function::{Function, FunctionRegistry};
pub use job::{FunctionName, Job, JobHandle};
pub use server::Server;
