//! Worker↔job matching: `NOOP` wakeup fanout, capability registration, and
//! `GRAB_JOB`/`PRE_SLEEP` handling (spec §4.5).

use bytes::Bytes;

use crate::wire::protocol::Response;

use super::connection::{Capability, ConnectionId};
use super::job::FunctionName;
use super::server::Server;

impl Server {
    /// Registers (or updates the timeout of) a worker's capability to run
    /// `function`, creating the function if this is the first reference to
    /// it.
    pub fn can_do(&mut self, conn_id: ConnectionId, function: Bytes, timeout: Option<u32>) {
        let fname = FunctionName(function);
        self.functions.get_or_create(&fname);

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            let ws = conn.worker_mut();
            match ws.capabilities.iter_mut().find(|c| c.function == fname) {
                Some(cap) => cap.timeout = timeout,
                None => ws.capabilities.push(Capability { function: fname.clone(), timeout }),
            }
        }

        if let Some(f) = self.functions.get_mut(&fname) {
            f.register_worker(conn_id);
        }
    }

    pub fn cant_do(&mut self, conn_id: ConnectionId, function: Bytes) {
        let fname = FunctionName(function);

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            if let Some(ws) = conn.worker.as_mut() {
                ws.capabilities.retain(|c| c.function != fname);
            }
        }

        if let Some(f) = self.functions.get_mut(&fname) {
            f.remove_worker(conn_id);
        }
    }

    pub fn reset_abilities(&mut self, conn_id: ConnectionId) {
        let functions: Vec<FunctionName> = self
            .connections
            .get(&conn_id)
            .and_then(|c| c.worker.as_ref())
            .map(|w| w.capabilities.iter().map(|c| c.function.clone()).collect())
            .unwrap_or_default();

        for f in functions {
            if let Some(func) = self.functions.get_mut(&f) {
                func.remove_worker(conn_id);
            }
        }

        if let Some(conn) = self.connections.get_mut(&conn_id) {
            if let Some(ws) = conn.worker.as_mut() {
                ws.capabilities.clear();
            }
        }
    }

    /// Wakes sleeping workers registered for `function`: walks the
    /// function's worker list from its current head, sends `NOOP` to each
    /// worker that `is_sleeping && !is_noop_sent`, stopping after
    /// `worker_wakeup` notifications (`0` = unlimited). Advances the list's
    /// head past the last notified worker so repeated calls fan out evenly.
    pub(crate) fn wake_workers(&mut self, function: &FunctionName) {
        let worker_ids: Vec<ConnectionId> = match self.functions.get(function) {
            Some(f) => f.workers.iter().copied().collect(),
            None => return,
        };

        let limit = self.worker_wakeup as usize;
        let mut notified = 0usize;
        let mut advance = 0usize;

        for (i, wid) in worker_ids.iter().enumerate() {
            advance = i + 1;

            let should_notify = self
                .connections
                .get(wid)
                .and_then(|c| c.worker.as_ref())
                .map(|ws| ws.is_sleeping && !ws.is_noop_sent)
                .unwrap_or(false);

            if !should_notify {
                continue;
            }

            if let Some(conn) = self.connections.get_mut(wid) {
                conn.worker_mut().is_noop_sent = true;
                conn.send(Response::Noop);
            }
            notified += 1;

            if limit != 0 && notified >= limit {
                break;
            }
        }

        if notified > 0 {
            if let Some(f) = self.functions.get_mut(function) {
                for _ in 0..advance {
                    if let Some(w) = f.workers.pop_front() {
                        f.workers.push_back(w);
                    }
                }
            }
        }
    }

    /// `PRE_SLEEP`: if a job is already available for one of this worker's
    /// capabilities, the race is resolved by sending `NOOP` immediately
    /// instead of marking the worker asleep.
    pub fn pre_sleep(&mut self, conn_id: ConnectionId) {
        let available = self
            .connections
            .get(&conn_id)
            .and_then(|c| c.worker.as_ref())
            .map(|ws| {
                ws.capabilities
                    .iter()
                    .any(|c| self.functions.get(&c.function).map(|f| f.job_count() > 0).unwrap_or(false))
            })
            .unwrap_or(false);

        let Some(conn) = self.connections.get_mut(&conn_id) else { return };
        let ws = conn.worker_mut();

        if available {
            ws.is_sleeping = false;
            ws.is_noop_sent = true;
            conn.send(Response::Noop);
        } else {
            ws.is_sleeping = true;
            ws.is_noop_sent = false;
        }
    }

    /// `GRAB_JOB`/`GRAB_JOB_UNIQ`: clears sleep state, finds the first
    /// capability with a runnable job (rotating it to the back of the
    /// worker's capability list first if `round_robin` is set, so the next
    /// grab considers a different function), and assigns the
    /// highest-priority job from that function's FIFO.
    pub fn grab_job(&mut self, conn_id: ConnectionId, uniq: bool) -> Response {
        let Some(conn) = self.connections.get_mut(&conn_id) else { return Response::NoJob };
        let ws = conn.worker_mut();
        ws.is_sleeping = false;
        ws.is_noop_sent = false;

        let chosen = ws
            .capabilities
            .iter()
            .find(|c| self.functions.get(&c.function).map(|f| f.job_count() > 0).unwrap_or(false))
            .map(|c| c.function.clone());

        let Some(function) = chosen else { return Response::NoJob };

        if self.round_robin {
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                conn.worker_mut().rotate_to_back(&function);
            }
        }

        loop {
            let handle = match self.functions.get_mut(&function).and_then(|f| f.pop_highest()) {
                Some(h) => h,
                None => return Response::NoJob,
            };

            let ignore = self.jobs.get(&handle).map(|j| j.ignore_job).unwrap_or(true);
            if ignore {
                self.remove_job(&handle);
                continue;
            }

            let (data, jfunction, junique) = {
                let job = self.jobs.get_mut(&handle).expect("checked above");
                job.worker = Some(conn_id);
                (job.data.clone(), job.function.0.clone(), job.unique.clone())
            };

            if let Some(f) = self.functions.get_mut(&function) {
                f.job_running += 1;
            }
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                conn.worker_mut().assigned_jobs.push(handle.clone());
            }

            return if uniq {
                Response::JobAssignUniq {
                    handle: handle.as_bytes(),
                    function: jfunction,
                    unique: junique,
                    payload: data,
                }
            } else {
                Response::JobAssign { handle: handle.as_bytes(), function: jfunction, payload: data }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::queue::NullQueueAdapter;
    use crate::wire::protocol::Priority;
    use crate::wire::Outgoing;

    #[tokio::test]
    async fn test_grab_job_after_submit() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));

        let worker = ConnectionId(1);
        let (wtx, mut rx) = mpsc::unbounded_channel();
        s.add_connection(worker, wtx);
        s.can_do(worker, Bytes::from_static(b"reverse"), None);

        let client = ConnectionId(2);
        let (ctx, _crx) = mpsc::unbounded_channel();
        s.add_connection(client, ctx);

        let resp = s
            .submit_job(
                client,
                Bytes::from_static(b"reverse"),
                Bytes::new(),
                Bytes::from_static(b"hello"),
                Priority::Normal,
                false,
                None,
            )
            .await;
        assert!(matches!(resp, Response::JobCreated { .. }));

        let assign = s.grab_job(worker, false);
        match assign {
            Response::JobAssign { function, payload, .. } => {
                assert_eq!(function, Bytes::from_static(b"reverse"));
                assert_eq!(payload, Bytes::from_static(b"hello"));
            },
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(s.grab_job(worker, false), Response::NoJob));
        let _ = rx.try_recv();
    }

    #[tokio::test]
    async fn test_pre_sleep_then_noop_on_submit() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        let worker = ConnectionId(1);
        let (wtx, mut wrx) = mpsc::unbounded_channel();
        s.add_connection(worker, wtx);
        s.can_do(worker, Bytes::from_static(b"f"), None);
        s.pre_sleep(worker);

        let client = ConnectionId(2);
        let (ctx, _crx) = mpsc::unbounded_channel();
        s.add_connection(client, ctx);

        s.submit_job(client, Bytes::from_static(b"f"), Bytes::new(), Bytes::from_static(b"x"), Priority::Normal, false, None)
            .await;

        let msg = wrx.try_recv().expect("expected a NOOP to have been queued");
        assert_eq!(msg, Outgoing::Response(Response::Noop));
    }
}
