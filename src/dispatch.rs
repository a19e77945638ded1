//! Command dispatcher: maps a decoded [`Command`]/[`TextCommand`] onto
//! `Server` mutations and the response (if any) owed back to the
//! originating connection (spec §4.6, §4.7, §4.8).
//!
//! Commands with no reply (`CAN_DO`, `CANT_DO`, `RESET_ABILITIES`,
//! `PRE_SLEEP`, `SET_CLIENT_ID`, the `WORK_*` family) return `None`; any
//! broadcast to other connections they trigger happens as a side effect via
//! `Server::send_to`, not through the return value.

use bytes::Bytes;

use crate::error::DispatchError;
use crate::model::{ConnectionId, FunctionName, JobHandle, Server};
use crate::wire::protocol::{Command, Response};
use crate::wire::text::{TextCommand, TextResponse};

/// Dispatches one decoded binary command. `None` means this connection gets
/// no direct reply (it may still have received packets as a side effect,
/// e.g. a `NOOP` from `PRE_SLEEP` racing an already-queued job).
pub async fn dispatch_request(server: &mut Server, conn_id: ConnectionId, cmd: Command) -> Option<Response> {
    match cmd {
        Command::EchoReq { payload } => Some(Response::EchoRes { payload }),

        Command::SubmitJob { function, unique, payload, priority, background, epoch } => {
            Some(server.submit_job(conn_id, function, unique, payload, priority, background, epoch).await)
        },

        Command::GetStatus { handle } => Some(server.get_status(&handle)),

        Command::OptionReq { name } => {
            if name.as_ref() == b"exceptions" {
                if let Some(conn) = server.connections.get_mut(&conn_id) {
                    conn.exceptions = true;
                }
                Some(Response::OptionRes { name })
            } else {
                Some(Response::Error { code: "unknown_option", message: "unrecognised option".into() })
            }
        },

        Command::CanDo { function } => {
            server.can_do(conn_id, function, None);
            None
        },
        Command::CanDoTimeout { function, timeout } => {
            server.can_do(conn_id, function, Some(timeout));
            None
        },
        Command::CantDo { function } => {
            server.cant_do(conn_id, function);
            None
        },
        Command::ResetAbilities => {
            server.reset_abilities(conn_id);
            None
        },
        Command::PreSleep => {
            server.pre_sleep(conn_id);
            None
        },
        Command::GrabJob { uniq } => Some(server.grab_job(conn_id, uniq)),

        Command::WorkData { handle, payload } => {
            broadcast_to_clients(server, &handle, conn_id, Response::WorkData { handle: handle.clone(), payload })
        },
        Command::WorkWarning { handle, payload } => {
            broadcast_to_clients(server, &handle, conn_id, Response::WorkWarning { handle: handle.clone(), payload })
        },
        Command::WorkStatus { handle, numerator, denominator } => {
            if let Some(err) = check_worker_assignment(server, &handle, conn_id) {
                return Some(err);
            }
            let num: u32 = parse_u32_or_zero(&numerator);
            let den: u32 = parse_u32_or_zero(&denominator);
            let clients = if let Some(job) = server.job_mut(&JobHandle(handle.clone())) {
                job.numerator = num;
                job.denominator = den;
                job.clients.clone()
            } else {
                Vec::new()
            };
            for c in clients {
                server.send_to(
                    c,
                    Response::WorkStatus { handle: handle.clone(), numerator: numerator.clone(), denominator: denominator.clone() },
                );
            }
            None
        },
        Command::WorkComplete { handle, payload } => {
            if let Some(err) = check_worker_assignment(server, &handle, conn_id) {
                return Some(err);
            }
            let clients = server.job(&JobHandle(handle.clone())).map(|j| j.clients.clone()).unwrap_or_default();
            for c in clients {
                server.send_to(c, Response::WorkComplete { handle: handle.clone(), payload: payload.clone() });
            }
            finish_job(server, &JobHandle(handle)).await;
            None
        },
        Command::WorkException { handle, payload } => {
            if let Some(err) = check_worker_assignment(server, &handle, conn_id) {
                return Some(err);
            }
            let clients = server.job(&JobHandle(handle.clone())).map(|j| j.clients.clone()).unwrap_or_default();
            for c in clients {
                let wants_exceptions = server.connections.get(&c).map(|conn| conn.exceptions).unwrap_or(false);
                if wants_exceptions {
                    server.send_to(c, Response::WorkException { handle: handle.clone(), payload: payload.clone() });
                }
            }
            None
        },
        Command::WorkFail { handle } => {
            if let Some(err) = check_worker_assignment(server, &handle, conn_id) {
                return Some(err);
            }
            let clients = server.job(&JobHandle(handle.clone())).map(|j| j.clients.clone()).unwrap_or_default();
            for c in clients {
                server.send_to(c, Response::WorkFail { handle: handle.clone() });
            }
            finish_job(server, &JobHandle(handle)).await;
            None
        },

        Command::SetClientId { id } => {
            if let Some(conn) = server.connections.get_mut(&conn_id) {
                conn.client_id = Some(id);
            }
            None
        },
    }
}

/// Checks that `conn_id` is the worker currently holding `handle`, distinguishing
/// two distinct `State` errors (spec §7): the handle may simply not exist or not
/// be this worker's (`job_not_found`), or the job may exist and be correctly
/// held but reference a function that no longer has a registry entry
/// (`no_registered_function`). `drop function` itself refuses to remove an
/// entry while `job_running > 0`, so that second arm is defensive rather
/// than reachable through any normal admin sequence.
fn check_worker_assignment(server: &Server, handle: &[u8], conn_id: ConnectionId) -> Option<Response> {
    let Some(job) = server.job(&JobHandle(Bytes::copy_from_slice(handle))) else {
        return Some(Response::from(DispatchError::job_not_found(String::from_utf8_lossy(handle))));
    };
    if job.worker != Some(conn_id) {
        return Some(Response::from(DispatchError::job_not_found(String::from_utf8_lossy(handle))));
    }
    if server.functions().get(&job.function).is_none() {
        return Some(Response::from(DispatchError::no_registered_function(String::from_utf8_lossy(handle))));
    }
    None
}

fn broadcast_to_clients(server: &mut Server, handle: &Bytes, conn_id: ConnectionId, msg: Response) -> Option<Response> {
    if let Some(err) = check_worker_assignment(server, handle, conn_id) {
        return Some(err);
    }
    let clients = server.job(&JobHandle(handle.clone())).map(|j| j.clients.clone()).unwrap_or_default();
    for c in clients {
        server.send_to(c, msg.clone());
    }
    None
}

fn parse_u32_or_zero(bytes: &[u8]) -> u32 {
    std::str::from_utf8(bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Removes a job that has reached a terminal state (`WORK_COMPLETE` or
/// `WORK_FAIL`): drops the durable record and decrements the owning
/// function's running count.
async fn finish_job(server: &mut Server, handle: &JobHandle) {
    if let Some(job) = server.job(handle) {
        let function = job.function.clone();
        let unique = job.unique.clone();
        if let Some(f) = server.functions_mut().get_mut(&function) {
            f.job_running = f.job_running.saturating_sub(1);
        }
        let _ = server.queue.done(&unique, &function.0).await;
    }
    server.remove_job(handle);
}

/// Dispatches one decoded text/admin command (spec §4.8).
pub fn dispatch_text(server: &mut Server, cmd: TextCommand) -> TextResponse {
    match cmd {
        TextCommand::Workers => {
            let mut lines: Vec<String> = server
                .connections_iter()
                .map(|c| {
                    let client_id = c.client_id.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_else(|| "-".into());
                    let (state, fns) = match c.worker.as_ref() {
                        Some(ws) => (
                            if ws.is_sleeping { "sleeping" } else { "awake" },
                            ws.capabilities.iter().map(|cap| String::from_utf8_lossy(&cap.function.0).into_owned()).collect::<Vec<_>>().join(" "),
                        ),
                        None => ("awake", String::new()),
                    };
                    format!("{} {} {} : {}", c.id.0, client_id, state, fns)
                })
                .collect();
            lines.push(".".to_string());
            TextResponse::Raw(lines.join("\r\n"))
        },

        TextCommand::Status => {
            let mut lines: Vec<String> = server
                .functions()
                .iter()
                .map(|(name, f)| {
                    format!(
                        "{}\t{}\t{}\t{}",
                        String::from_utf8_lossy(&name.0),
                        f.job_count() as u64 + f.job_running,
                        f.job_running,
                        f.worker_count()
                    )
                })
                .collect();
            lines.push(".".to_string());
            TextResponse::Raw(lines.join("\r\n"))
        },

        TextCommand::MaxQueue { function, sizes } => {
            let f = server.functions_mut().get_or_create(&FunctionName(Bytes::from(function)));
            for (i, size) in sizes.iter().enumerate() {
                if let Some(n) = size {
                    f.max_queue_size[i] = (*n).max(0) as usize;
                }
            }
            TextResponse::Ok
        },

        TextCommand::Shutdown { graceful } => {
            server.shutdown = true;
            server.shutdown_graceful = graceful;
            TextResponse::Ok
        },

        TextCommand::Verbose => TextResponse::Ok,

        TextCommand::Version => TextResponse::Raw(env!("CARGO_PKG_VERSION").to_string()),

        TextCommand::GetPid => TextResponse::Raw(std::process::id().to_string()),

        TextCommand::CreateFunction { name } => {
            server.functions_mut().create_empty(FunctionName(Bytes::from(name)));
            TextResponse::Ok
        },

        TextCommand::DropFunction { name } => {
            let fname = FunctionName(Bytes::from(name));
            match server.functions().get(&fname) {
                Some(f) if f.worker_count() > 0 || f.job_running > 0 => {
                    TextResponse::Err { code: "in_use", message: "function has active workers or running jobs".into() }
                },
                _ => {
                    server.functions_mut().remove(&fname);
                    TextResponse::Ok
                },
            }
        },

        TextCommand::Unknown { line } => {
            TextResponse::Err { code: "unknown_command", message: String::from_utf8_lossy(&line).into_owned() }
        },
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

    fn server_with_conns() -> (Server, ConnectionId, ConnectionId, mpsc::UnboundedReceiver<Outgoing>, mpsc::UnboundedReceiver<Outgoing>) {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        let client = ConnectionId(1);
        let worker = ConnectionId(2);
        let (ctx, crx) = mpsc::unbounded_channel();
        let (wtx, wrx) = mpsc::unbounded_channel();
        s.add_connection(client, ctx);
        s.add_connection(worker, wtx);
        (s, client, worker, crx, wrx)
    }

    #[tokio::test]
    async fn test_submit_grab_complete_notifies_client() {
        let (mut s, client, worker, mut crx, _wrx) = server_with_conns();
        s.can_do(worker, Bytes::from_static(b"reverse"), None);

        let resp = dispatch_request(
            &mut s,
            client,
            Command::SubmitJob {
                function: Bytes::from_static(b"reverse"),
                unique: Bytes::new(),
                payload: Bytes::from_static(b"hello"),
                priority: Priority::Normal,
                background: false,
                epoch: None,
            },
        )
        .await;
        let Some(Response::JobCreated { handle }) = resp else { panic!("expected JobCreated") };

        let assign = dispatch_request(&mut s, worker, Command::GrabJob { uniq: false }).await;
        assert!(matches!(assign, Some(Response::JobAssign { .. })));

        let done = dispatch_request(&mut s, worker, Command::WorkComplete { handle: handle.clone(), payload: Bytes::from_static(b"olleh") }).await;
        assert!(done.is_none());

        let got = crx.try_recv().unwrap();
        assert_eq!(got, Outgoing::Response(Response::WorkComplete { handle: handle.clone(), payload: Bytes::from_static(b"olleh") }));
        assert!(s.job(&JobHandle(handle)).is_none());
    }

    #[tokio::test]
    async fn test_work_complete_from_wrong_worker_is_job_not_found() {
        let (mut s, client, worker, _crx, _wrx) = server_with_conns();
        s.can_do(worker, Bytes::from_static(b"f"), None);

        let resp = dispatch_request(
            &mut s,
            client,
            Command::SubmitJob {
                function: Bytes::from_static(b"f"),
                unique: Bytes::new(),
                payload: Bytes::from_static(b"x"),
                priority: Priority::Normal,
                background: false,
                epoch: None,
            },
        )
        .await;
        let Some(Response::JobCreated { handle }) = resp else { panic!() };

        // Never grabbed by `worker`, so it has no assignment yet.
        let imposter = ConnectionId(99);
        let resp = dispatch_request(&mut s, imposter, Command::WorkComplete { handle, payload: Bytes::new() }).await;
        assert!(matches!(resp, Some(Response::Error { code: "job_not_found", .. })));
    }

    #[tokio::test]
    async fn test_option_req_exceptions_then_work_exception_delivered() {
        let (mut s, client, worker, mut crx, _wrx) = server_with_conns();
        s.can_do(worker, Bytes::from_static(b"f"), None);

        let resp = dispatch_request(&mut s, client, Command::OptionReq { name: Bytes::from_static(b"exceptions") }).await;
        assert!(matches!(resp, Some(Response::OptionRes { .. })));

        let resp = dispatch_request(
            &mut s,
            client,
            Command::SubmitJob {
                function: Bytes::from_static(b"f"),
                unique: Bytes::new(),
                payload: Bytes::from_static(b"x"),
                priority: Priority::Normal,
                background: false,
                epoch: None,
            },
        )
        .await;
        let Some(Response::JobCreated { handle }) = resp else { panic!() };
        dispatch_request(&mut s, worker, Command::GrabJob { uniq: false }).await;

        dispatch_request(&mut s, worker, Command::WorkException { handle: handle.clone(), payload: Bytes::from_static(b"boom") }).await;

        let got = crx.try_recv().unwrap();
        assert_eq!(got, Outgoing::Response(Response::WorkException { handle, payload: Bytes::from_static(b"boom") }));
    }

    #[tokio::test]
    async fn test_dispatch_text_maxqueue_and_status() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        let resp = dispatch_text(&mut s, TextCommand::MaxQueue { function: b"f".to_vec(), sizes: [Some(3), Some(3), Some(3)] });
        assert_eq!(resp, TextResponse::Ok);

        let resp = dispatch_text(&mut s, TextCommand::Status);
        match resp {
            TextResponse::Raw(s) => assert!(s.contains('f') || s == "."),
            other => panic!("unexpected {other:?}"),
        }
    }

    // --- end-to-end scenarios, driven through dispatch against a bare Server ---

    #[tokio::test]
    async fn scenario_unique_coalescing_delivers_to_both_clients() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        let c1 = ConnectionId(1);
        let c2 = ConnectionId(2);
        let worker = ConnectionId(3);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (wtx, _wrx) = mpsc::unbounded_channel();
        s.add_connection(c1, tx1);
        s.add_connection(c2, tx2);
        s.add_connection(worker, wtx);
        s.can_do(worker, Bytes::from_static(b"f"), None);

        let submit = |unique: &'static [u8]| Command::SubmitJob {
            function: Bytes::from_static(b"f"),
            unique: Bytes::from_static(unique),
            payload: Bytes::from_static(b"x"),
            priority: Priority::Normal,
            background: false,
            epoch: None,
        };

        let Some(Response::JobCreated { handle: h1 }) = dispatch_request(&mut s, c1, submit(b"u")).await else { panic!() };
        let Some(Response::JobCreated { handle: h2 }) = dispatch_request(&mut s, c2, submit(b"u")).await else { panic!() };
        assert_eq!(h1, h2);

        let assigned = dispatch_request(&mut s, worker, Command::GrabJob { uniq: false }).await;
        assert!(matches!(assigned, Some(Response::JobAssign { .. })));
        assert!(matches!(dispatch_request(&mut s, worker, Command::GrabJob { uniq: false }).await, Some(Response::NoJob)));

        dispatch_request(&mut s, worker, Command::WorkComplete { handle: h1.clone(), payload: Bytes::from_static(b"y") }).await;

        let got1 = rx1.try_recv().unwrap();
        let got2 = rx2.try_recv().unwrap();
        let expect = Outgoing::Response(Response::WorkComplete { handle: h1, payload: Bytes::from_static(b"y") });
        assert_eq!(got1, expect);
        assert_eq!(got2, expect);
    }

    #[tokio::test]
    async fn scenario_background_submit_and_status_transitions() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        let client = ConnectionId(1);
        let worker = ConnectionId(2);
        let (ctx, _crx) = mpsc::unbounded_channel();
        let (wtx, _wrx) = mpsc::unbounded_channel();
        s.add_connection(client, ctx);
        s.add_connection(worker, wtx);
        s.can_do(worker, Bytes::from_static(b"f"), None);

        let Some(Response::JobCreated { handle }) = dispatch_request(
            &mut s,
            client,
            Command::SubmitJob {
                function: Bytes::from_static(b"f"),
                unique: Bytes::new(),
                payload: Bytes::from_static(b"data"),
                priority: Priority::Normal,
                background: true,
                epoch: None,
            },
        )
        .await
        else {
            panic!()
        };

        let status = dispatch_request(&mut s, client, Command::GetStatus { handle: handle.clone() }).await;
        assert_eq!(
            status,
            Some(Response::GetStatusRes {
                handle: handle.clone(),
                known: true,
                running: false,
                numerator: Bytes::from_static(b"0"),
                denominator: Bytes::from_static(b"0"),
            })
        );

        dispatch_request(&mut s, worker, Command::GrabJob { uniq: false }).await;
        dispatch_request(
            &mut s,
            worker,
            Command::WorkStatus { handle: handle.clone(), numerator: Bytes::from_static(b"3"), denominator: Bytes::from_static(b"7") },
        )
        .await;

        let status = dispatch_request(&mut s, client, Command::GetStatus { handle: handle.clone() }).await;
        assert_eq!(
            status,
            Some(Response::GetStatusRes {
                handle: handle.clone(),
                known: true,
                running: true,
                numerator: Bytes::from_static(b"3"),
                denominator: Bytes::from_static(b"7"),
            })
        );

        dispatch_request(&mut s, worker, Command::WorkComplete { handle: handle.clone(), payload: Bytes::new() }).await;

        let status = dispatch_request(&mut s, client, Command::GetStatus { handle }).await;
        assert!(matches!(status, Some(Response::GetStatusRes { known: false, running: false, .. })));
    }

    #[tokio::test]
    async fn scenario_worker_disconnect_retries_then_work_fail() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        s.job_retries = 2;
        let client = ConnectionId(1);
        let worker_a = ConnectionId(2);
        let worker_b = ConnectionId(3);
        let (ctx, mut crx) = mpsc::unbounded_channel();
        s.add_connection(client, ctx);

        let Some(Response::JobCreated { handle }) = dispatch_request(
            &mut s,
            client,
            Command::SubmitJob {
                function: Bytes::from_static(b"f"),
                unique: Bytes::new(),
                payload: Bytes::from_static(b"x"),
                priority: Priority::Normal,
                background: false,
                epoch: None,
            },
        )
        .await
        else {
            panic!()
        };

        let (atx, _arx) = mpsc::unbounded_channel();
        s.add_connection(worker_a, atx);
        s.can_do(worker_a, Bytes::from_static(b"f"), None);
        assert!(matches!(dispatch_request(&mut s, worker_a, Command::GrabJob { uniq: false }).await, Some(Response::JobAssign { .. })));
        s.disconnect(worker_a).await;
        assert!(crx.try_recv().is_err(), "job should still be pending after the first retry");

        let (btx, _brx) = mpsc::unbounded_channel();
        s.add_connection(worker_b, btx);
        s.can_do(worker_b, Bytes::from_static(b"f"), None);
        assert!(matches!(dispatch_request(&mut s, worker_b, Command::GrabJob { uniq: false }).await, Some(Response::JobAssign { .. })));
        s.disconnect(worker_b).await;

        let got = crx.try_recv().expect("client should be told the job failed");
        assert_eq!(got, Outgoing::Response(Response::WorkFail { handle }));
    }

    #[tokio::test]
    async fn scenario_graceful_shutdown_stops_accepting_but_not_existing_work() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        let resp = dispatch_text(&mut s, TextCommand::Shutdown { graceful: true });
        assert_eq!(resp, TextResponse::Ok);
        assert!(s.shutdown);
        assert!(s.shutdown_graceful);
    }

    #[tokio::test]
    async fn scenario_hard_shutdown_flags_non_graceful() {
        let mut s = Server::new("test", Arc::new(NullQueueAdapter));
        let resp = dispatch_text(&mut s, TextCommand::Shutdown { graceful: false });
        assert_eq!(resp, TextResponse::Ok);
        assert!(s.shutdown);
        assert!(!s.shutdown_graceful);
    }

    #[tokio::test]
    async fn test_work_complete_with_deregistered_function_is_no_registered_function() {
        let (mut s, client, worker, _crx, _wrx) = server_with_conns();
        s.can_do(worker, Bytes::from_static(b"f"), None);

        let resp = dispatch_request(
            &mut s,
            client,
            Command::SubmitJob {
                function: Bytes::from_static(b"f"),
                unique: Bytes::new(),
                payload: Bytes::from_static(b"x"),
                priority: Priority::Normal,
                background: false,
                epoch: None,
            },
        )
        .await;
        let Some(Response::JobCreated { handle }) = resp else { panic!() };
        dispatch_request(&mut s, worker, Command::GrabJob { uniq: false }).await;

        // A function's registry entry can only be removed via `drop function`,
        // which itself refuses while a job is running; simulate that entry
        // going missing anyway to exercise the distinct error state.
        s.functions_mut().remove(&FunctionName(Bytes::from_static(b"f")));

        let resp = dispatch_request(&mut s, worker, Command::WorkComplete { handle, payload: Bytes::new() }).await;
        assert!(matches!(resp, Some(Response::Error { code: "no_registered_function", .. })));
    }
}
