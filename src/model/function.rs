use std::collections::VecDeque;

use super::connection::ConnectionId;
use super::job::{FunctionName, JobHandle};
use crate::wire::protocol::Priority;

/// A registered function: its per-priority ready queues and the circular
/// list of workers that can serve it.
///
/// The source represents the worker list as an intrusive circular
/// doubly-linked list so a single rotation pointer can fan out `NOOP`s
/// fairly across repeated submits. A `VecDeque` with pop-front/push-back
/// gives the same fairness property without unsafe pointer juggling.
#[derive(Debug, Default)]
pub struct Function {
    pub queues: [VecDeque<JobHandle>; 3],
    pub workers: VecDeque<ConnectionId>,
    /// `0` means unlimited.
    pub max_queue_size: [usize; 3],
    pub job_total: u64,
    pub job_running: u64,
}

impl Function {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn job_count(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Pushes `handle` to the back of its priority's ready queue,
    /// respecting `max_queue_size`. Returns `false` (and does not enqueue)
    /// if the queue is already at capacity.
    pub fn push(&mut self, priority: Priority, handle: JobHandle) -> bool {
        let cap = self.max_queue_size[priority.index()];
        let q = &mut self.queues[priority.index()];
        if cap != 0 && q.len() >= cap {
            return false;
        }
        q.push_back(handle);
        true
    }

    /// Pops the highest-priority ready job, if any.
    pub fn pop_highest(&mut self) -> Option<JobHandle> {
        for p in Priority::ALL {
            if let Some(h) = self.queues[p.index()].pop_front() {
                return Some(h);
            }
        }
        None
    }

    pub fn remove_worker(&mut self, id: ConnectionId) {
        self.workers.retain(|&w| w != id);
    }

    pub fn register_worker(&mut self, id: ConnectionId) {
        if !self.workers.contains(&id) {
            self.workers.push_back(id);
        }
    }
}

#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: std::collections::HashMap<FunctionName, Function>,
}

impl FunctionRegistry {
    pub fn get_or_create(&mut self, name: &FunctionName) -> &mut Function {
        self.functions.entry(name.clone()).or_insert_with(Function::new)
    }

    pub fn get(&self, name: &FunctionName) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn get_mut(&mut self, name: &FunctionName) -> Option<&mut Function> {
        self.functions.get_mut(name)
    }

    pub fn remove(&mut self, name: &FunctionName) -> Option<Function> {
        self.functions.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FunctionName, &Function)> {
        self.functions.iter()
    }

    pub fn create_empty(&mut self, name: FunctionName) {
        self.functions.entry(name).or_insert_with(Function::new);
    }
}
