use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::DispatchError;
use crate::queue::QueueAdapter;
use crate::wire::protocol::{Priority, Response};
use crate::wire::Outgoing;

use super::connection::{ConnectionId, ServerConnection};
use super::function::FunctionRegistry;
use super::job::{FunctionName, Job, JobHandle};

fn now_epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Root entity: owns the job-handle counter, the dual job index, the
/// function registry, and every live connection. Mutated only from the
/// model-owner task (see `server_task`); never shared behind a `Mutex`.
pub struct Server {
    host_prefix: String,
    next_handle: u64,
    pub(crate) jobs: HashMap<JobHandle, Job>,
    pub(crate) jobs_by_unique: HashMap<(FunctionName, Bytes), JobHandle>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) connections: HashMap<ConnectionId, ServerConnection>,
    pub(crate) queue: Arc<dyn QueueAdapter>,
    pub job_retries: u32,
    pub worker_wakeup: u32,
    pub round_robin: bool,
    queue_startup: bool,
    pub shutdown: bool,
    pub shutdown_graceful: bool,
}

impl Server {
    pub fn new(host: impl Into<String>, queue: Arc<dyn QueueAdapter>) -> Self {
        Self {
            host_prefix: format!("H:{}", host.into()),
            next_handle: 1,
            jobs: HashMap::new(),
            jobs_by_unique: HashMap::new(),
            functions: FunctionRegistry::default(),
            connections: HashMap::new(),
            queue,
            job_retries: 0,
            worker_wakeup: 0,
            round_robin: false,
            queue_startup: false,
            shutdown: false,
            shutdown_graceful: false,
        }
    }

    fn next_job_handle(&mut self) -> JobHandle {
        let seq = self.next_handle;
        self.next_handle += 1;
        JobHandle(Bytes::from(format!("{}:{}", self.host_prefix, seq)))
    }

    // --- connection lifecycle ---

    pub fn add_connection(&mut self, id: ConnectionId, outbound: mpsc::UnboundedSender<Outgoing>) {
        self.connections.insert(id, ServerConnection::new(id, outbound));
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ServerConnection> {
        self.connections.get(&id)
    }

    pub fn send_to(&self, id: ConnectionId, msg: impl Into<Outgoing>) {
        if let Some(conn) = self.connections.get(&id) {
            conn.send(msg);
        }
    }

    /// Unlinks a disconnected connection from every job it touched: as a
    /// client, it abandons foreground jobs (marking them `ignore_job` if it
    /// was the last subscriber and the job hasn't been picked up yet); as a
    /// worker, every job it held is re-queued with `retries` incremented,
    /// dropping (and WORK_FAIL-ing subscribers of) any job that has then
    /// hit `job_retries`.
    pub async fn disconnect(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else { return };

        for handle in &conn.submitted_jobs {
            let Some(job) = self.jobs.get_mut(handle) else { continue };
            job.clients.retain(|&c| c != id);
            if job.clients.is_empty() && job.worker.is_none() {
                job.ignore_job = true;
            }
        }

        if let Some(worker) = conn.worker {
            for function in self.functions_for_worker_snapshot(&worker) {
                if let Some(f) = self.functions.get_mut(&function) {
                    f.remove_worker(id);
                }
            }

            for handle in worker.assigned_jobs {
                self.requeue_after_worker_loss(handle).await;
            }
        }
    }

    fn functions_for_worker_snapshot(
        &self,
        worker: &super::connection::WorkerState,
    ) -> Vec<FunctionName> {
        worker.capabilities.iter().map(|c| c.function.clone()).collect()
    }

    async fn requeue_after_worker_loss(&mut self, handle: JobHandle) {
        let Some(job) = self.jobs.get_mut(&handle) else { return };
        job.worker = None;
        job.retries += 1;
        job.numerator = 0;
        job.denominator = 0;

        if let Some(f) = self.functions.get_mut(&job.function) {
            f.job_running = f.job_running.saturating_sub(1);
        }

        if job.retries == self.job_retries {
            let clients = job.clients.clone();
            let (unique, function) = (job.unique.clone(), job.function.0.clone());
            self.jobs.remove(&handle);
            self.jobs_by_unique.retain(|_, h| h != &handle);
            let _ = self.queue.done(&unique, &function).await;

            for c in clients {
                self.send_to(c, Response::WorkFail { handle: handle.as_bytes() });
            }
            return;
        }

        if job.ignore_job {
            // Nobody is waiting and it was never picked up for real work;
            // leave it out of the ready queue entirely.
            return;
        }

        let priority = job.priority;
        let function = job.function.clone();
        self.enqueue_ready(&function, priority, handle);
    }

    // --- job creation ---

    fn effective_unique(unique: &Bytes, payload: &Bytes) -> Bytes {
        if unique.as_ref() == b"-" && !payload.is_empty() {
            payload.clone()
        } else {
            unique.clone()
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn submit_job(
        &mut self,
        conn_id: ConnectionId,
        function: Bytes,
        unique: Bytes,
        payload: Bytes,
        priority: Priority,
        background: bool,
        epoch: Option<u64>,
    ) -> Response {
        let fname = FunctionName(function);

        if epoch.is_some() && !self.queue.supports_epoch() {
            return Response::Error {
                code: "queue_error",
                message: "queue adapter does not support epoch scheduling".into(),
            };
        }

        let has_unique = !unique.is_empty();
        let eff_unique = Self::effective_unique(&unique, &payload);

        if has_unique {
            if let Some(existing) = self.jobs_by_unique.get(&(fname.clone(), eff_unique.clone())).cloned() {
                if !background {
                    if let Some(job) = self.jobs.get_mut(&existing) {
                        if !job.clients.contains(&conn_id) {
                            job.clients.push(conn_id);
                        }
                        job.ignore_job = false;
                    }
                    if let Some(conn) = self.connections.get_mut(&conn_id) {
                        conn.submitted_jobs.push(existing.clone());
                    }
                }
                return Response::JobCreated { handle: existing.as_bytes() };
            }
        }

        // Admission control: per-function, per-priority queue cap.
        {
            let f = self.functions.get_or_create(&fname);
            let cap = f.max_queue_size[priority.index()];
            if cap != 0 && f.queue_len(priority) >= cap {
                return DispatchError::queue_full().into();
            }
        }

        let handle = self.next_job_handle();
        let stored_unique = if has_unique { eff_unique.clone() } else { handle.as_bytes() };

        let mut job = Job {
            handle: handle.clone(),
            function: fname.clone(),
            unique: stored_unique.clone(),
            priority,
            data: payload.clone(),
            retries: 0,
            numerator: 0,
            denominator: 0,
            job_queued: false,
            ignore_job: false,
            worker: None,
            clients: if background { Vec::new() } else { vec![conn_id] },
        };

        if background {
            if let Err(e) = self.queue.add(&stored_unique, &fname.0, &payload, priority, epoch).await {
                let _ = self.queue.done(&stored_unique, &fname.0).await;
                return Response::Error { code: "queue_error", message: e.to_string() };
            }
            job.job_queued = true;
        }

        let is_future_epoch = epoch.map(|e| e > now_epoch_secs()).unwrap_or(false);

        self.jobs.insert(handle.clone(), job);
        if has_unique {
            self.jobs_by_unique.insert((fname.clone(), eff_unique), handle.clone());
        }
        if !background {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                conn.submitted_jobs.push(handle.clone());
            }
        }

        {
            let f = self.functions.get_or_create(&fname);
            f.job_total += 1;
        }

        if !is_future_epoch && !self.queue_startup {
            self.enqueue_ready(&fname, priority, handle.clone());
        } else if !is_future_epoch && self.queue_startup {
            // Startup replay path: already marked `job_queued`; still needs
            // to land in the ready queue so it's schedulable.
            self.enqueue_ready_no_wakeup(&fname, priority, handle.clone());
        }

        Response::JobCreated { handle: handle.as_bytes() }
    }

    /// Adds a job as if it had just been submitted with `job_queued=true`,
    /// for durable-store replay at startup (spec §4.9). Does not
    /// re-persist. A job whose `epoch` is still in the future is indexed
    /// but kept off the ready FIFO, matching `submit_job`'s handling of
    /// `SUBMIT_JOB_EPOCH`.
    pub fn replay_add(
        &mut self,
        function: Bytes,
        unique: Bytes,
        data: Bytes,
        priority: Priority,
        epoch: Option<u64>,
    ) {
        let fname = FunctionName(function);
        let handle = self.next_job_handle();
        let stored_unique = if unique.is_empty() { handle.as_bytes() } else { unique.clone() };

        let job = Job {
            handle: handle.clone(),
            function: fname.clone(),
            unique: stored_unique.clone(),
            priority,
            data,
            retries: 0,
            numerator: 0,
            denominator: 0,
            job_queued: true,
            ignore_job: false,
            worker: None,
            clients: Vec::new(),
        };

        self.jobs.insert(handle.clone(), job);
        if !unique.is_empty() {
            self.jobs_by_unique.insert((fname.clone(), stored_unique), handle.clone());
        }
        self.functions.get_or_create(&fname).job_total += 1;

        let is_future_epoch = epoch.map(|e| e > now_epoch_secs()).unwrap_or(false);
        if !is_future_epoch {
            self.enqueue_ready_no_wakeup(&fname, priority, handle);
        }
    }

    pub fn begin_queue_startup(&mut self) {
        self.queue_startup = true;
    }

    pub fn end_queue_startup(&mut self) {
        self.queue_startup = false;
    }

    /// Enqueues a job to its function's ready FIFO and fans `NOOP` out to
    /// sleeping workers (spec §4.5 step 1-2).
    fn enqueue_ready(&mut self, function: &FunctionName, priority: Priority, handle: JobHandle) {
        self.wake_workers(function);
        self.enqueue_ready_no_wakeup(function, priority, handle);
    }

    fn enqueue_ready_no_wakeup(&mut self, function: &FunctionName, priority: Priority, handle: JobHandle) {
        let f = self.functions.get_or_create(function);
        f.push(priority, handle);
    }

    // --- status / introspection ---

    pub fn get_status(&self, handle: &[u8]) -> Response {
        let handle = Bytes::copy_from_slice(handle);
        match self.jobs.get(&JobHandle(handle.clone())) {
            Some(job) if !job.ignore_job => Response::GetStatusRes {
                handle,
                known: true,
                running: job.worker.is_some(),
                numerator: Bytes::from(job.numerator.to_string()),
                denominator: Bytes::from(job.denominator.to_string()),
            },
            _ => Response::GetStatusRes {
                handle,
                known: false,
                running: false,
                numerator: Bytes::from_static(b"0"),
                denominator: Bytes::from_static(b"0"),
            },
        }
    }

    // --- accessors used by dispatch/text admin ---

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn functions_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    pub fn connections_iter(&self) -> impl Iterator<Item = &ServerConnection> {
        self.connections.values()
    }

    pub fn job(&self, handle: &JobHandle) -> Option<&Job> {
        self.jobs.get(handle)
    }

    pub fn job_mut(&mut self, handle: &JobHandle) -> Option<&mut Job> {
        self.jobs.get_mut(handle)
    }

    pub fn remove_job(&mut self, handle: &JobHandle) -> Option<Job> {
        self.jobs_by_unique.retain(|_, h| h != handle);
        self.jobs.remove(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NullQueueAdapter;

    fn server() -> Server {
        Server::new("test", Arc::new(NullQueueAdapter))
    }

    fn add_conn(server: &mut Server, id: u64) -> (ConnectionId, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cid = ConnectionId(id);
        server.add_connection(cid, tx);
        (cid, rx)
    }

    #[tokio::test]
    async fn test_submit_creates_job_and_enqueues() {
        let mut s = server();
        let (c1, _rx) = add_conn(&mut s, 1);

        let resp = s
            .submit_job(
                c1,
                Bytes::from_static(b"reverse"),
                Bytes::from_static(b"u1"),
                Bytes::from_static(b"hello"),
                Priority::Normal,
                false,
                None,
            )
            .await;

        assert!(matches!(resp, Response::JobCreated { .. }));
        assert_eq!(s.functions.get(&FunctionName(Bytes::from_static(b"reverse"))).unwrap().job_count(), 1);
    }

    #[tokio::test]
    async fn test_unique_coalescing_returns_same_handle() {
        let mut s = server();
        let (c1, _rx1) = add_conn(&mut s, 1);
        let (c2, _rx2) = add_conn(&mut s, 2);

        let r1 = s
            .submit_job(
                c1,
                Bytes::from_static(b"f"),
                Bytes::from_static(b"u"),
                Bytes::from_static(b"x"),
                Priority::Normal,
                false,
                None,
            )
            .await;
        let r2 = s
            .submit_job(
                c2,
                Bytes::from_static(b"f"),
                Bytes::from_static(b"u"),
                Bytes::from_static(b"x"),
                Priority::Normal,
                false,
                None,
            )
            .await;

        let (Response::JobCreated { handle: h1 }, Response::JobCreated { handle: h2 }) = (r1, r2) else {
            panic!("expected JobCreated");
        };
        assert_eq!(h1, h2);
        assert_eq!(s.functions.get(&FunctionName(Bytes::from_static(b"f"))).unwrap().job_count(), 1);

        let job = s.job(&JobHandle(h1)).unwrap();
        assert_eq!(job.clients.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_submit() {
        let mut s = server();
        let (c1, _rx) = add_conn(&mut s, 1);
        s.functions.get_or_create(&FunctionName(Bytes::from_static(b"f"))).max_queue_size[Priority::Normal.index()] = 1;

        let r1 = s
            .submit_job(c1, Bytes::from_static(b"f"), Bytes::new(), Bytes::from_static(b"a"), Priority::Normal, false, None)
            .await;
        let r2 = s
            .submit_job(c1, Bytes::from_static(b"f"), Bytes::new(), Bytes::from_static(b"b"), Priority::Normal, false, None)
            .await;

        assert!(matches!(r1, Response::JobCreated { .. }));
        assert!(matches!(r2, Response::Error { code: "queue_full", .. }));
    }

    #[tokio::test]
    async fn test_disconnect_abandons_foreground_job_before_pickup() {
        let mut s = server();
        let (c1, _rx) = add_conn(&mut s, 1);

        let resp = s
            .submit_job(c1, Bytes::from_static(b"f"), Bytes::new(), Bytes::from_static(b"x"), Priority::Normal, false, None)
            .await;
        let Response::JobCreated { handle } = resp else { panic!() };

        s.disconnect(c1).await;

        let job = s.job(&JobHandle(handle)).unwrap();
        assert!(job.ignore_job);
    }
}
