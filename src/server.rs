//! Accept loop + per-connection tasks + the single model-owner task that
//! holds the only mutable `Server` value (spec §4.3, §5, §9's
//! re-architecture note: message passing instead of a mutex over shared
//! state).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, time};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::dispatch::{dispatch_request, dispatch_text};
use crate::model::{ConnectionId, Server};
use crate::queue::QueueAdapter;
use crate::wire::binary::Error as BinaryError;
use crate::wire::{self, Event, Outgoing};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables that would otherwise be free-standing globals in the source;
/// threaded through explicitly instead (see `src/bin/gearmand-rs/args.rs`).
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub job_retries: u32,
    pub worker_wakeup: u32,
    pub round_robin: bool,
}

/// Two independent cancellation signals, so a `shutdown graceful` admin
/// command can stop accepting new connections without severing connections
/// already in flight, while `shutdown` (or Ctrl-C) severs both.
#[derive(Clone)]
pub struct ShutdownTokens {
    pub accept: CancellationToken,
    pub hard: CancellationToken,
}

impl ShutdownTokens {
    pub fn new() -> Self {
        Self { accept: CancellationToken::new(), hard: CancellationToken::new() }
    }

    fn cancel_all(&self) {
        self.accept.cancel();
        self.hard.cancel();
    }
}

impl Default for ShutdownTokens {
    fn default() -> Self {
        Self::new()
    }
}

enum ModelMsg {
    Connect { id: ConnectionId, outbound: mpsc::UnboundedSender<Outgoing> },
    Event { id: ConnectionId, event: Event },
    Disconnect { id: ConnectionId },
}

/// Binds the accept loop to `listener` and runs until both shutdown tokens
/// have fired and every connection has drained.
pub async fn run(
    listener: TcpListener,
    shutdown: ShutdownTokens,
    config: Config,
    queue: Arc<dyn QueueAdapter>,
) -> anyhow::Result<()> {
    let (model_tx, model_rx) = mpsc::channel::<ModelMsg>(1024);

    let model_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(run_model(model_rx, config, queue, shutdown))
    };

    let accept_result = accept_loop(listener, shutdown.clone(), model_tx.clone()).await;
    drop(model_tx);

    if let Err(error) = &accept_result {
        error!(%error, "accept loop exited with an error");
    }

    model_handle.await??;
    accept_result
}

async fn accept_loop(
    listener: TcpListener,
    shutdown: ShutdownTokens,
    model_tx: mpsc::Sender<ModelMsg>,
) -> anyhow::Result<()> {
    loop {
        let accepted = select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.accept.cancelled() => return Ok(()),
        };

        match accepted {
            Ok((stream, _addr)) => {
                tokio::spawn(connection_task(stream, shutdown.clone(), model_tx.clone()));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        }
    }
}

fn apply_socket_options(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_linger(Some(Duration::from_secs(0)))?;
    Ok(())
}

#[instrument(name = "connection", skip_all, fields(peer = %stream.peer_addr().map(|a| a.to_string()).unwrap_or_default()))]
async fn connection_task(stream: TcpStream, shutdown: ShutdownTokens, model_tx: mpsc::Sender<ModelMsg>) {
    if let Err(error) = apply_socket_options(&stream) {
        warn!(%error, "failed to apply socket options");
    }

    let id = ConnectionId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed));
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();

    if model_tx.send(ModelMsg::Connect { id, outbound: outbound_tx }).await.is_err() {
        return;
    }

    debug!(?id, "accepted connection");
    let mut framed = wire::framed(stream);

    loop {
        select! {
            next = framed.next() => match next {
                None => break,
                Some(Ok(event)) => {
                    if model_tx.send(ModelMsg::Event { id, event }).await.is_err() {
                        break;
                    }
                },
                Some(Err(wire::Error::Binary(BinaryError::Client(resp)))) => {
                    let _ = framed.send(Outgoing::Response(resp)).await;
                    break;
                },
                Some(Err(error)) => {
                    warn!(?id, %error, "connection error");
                    break;
                },
            },
            Some(msg) = outbound_rx.recv() => {
                if framed.send(msg).await.is_err() {
                    break;
                }
            },
            _ = shutdown.hard.cancelled() => break,
        }
    }

    let _ = model_tx.send(ModelMsg::Disconnect { id }).await;
    let _ = time::timeout(Duration::from_millis(200), framed.into_inner().shutdown()).await;
}

async fn run_model(
    mut rx: mpsc::Receiver<ModelMsg>,
    config: Config,
    queue: Arc<dyn QueueAdapter>,
    shutdown: ShutdownTokens,
) -> anyhow::Result<()> {
    let mut server = Server::new(config.host, queue.clone());
    server.job_retries = config.job_retries;
    server.worker_wakeup = config.worker_wakeup;
    server.round_robin = config.round_robin;

    let mut replayed = Vec::new();
    queue.replay(&mut |job| replayed.push(job)).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;

    server.begin_queue_startup();
    for job in replayed {
        server.replay_add(job.function, job.unique, job.data, job.priority, job.epoch);
    }
    server.end_queue_startup();

    while let Some(msg) = rx.recv().await {
        match msg {
            ModelMsg::Connect { id, outbound } => server.add_connection(id, outbound),
            ModelMsg::Event { id, event } => match event {
                Event::Request(cmd) => {
                    if let Some(resp) = dispatch_request(&mut server, id, cmd).await {
                        server.send_to(id, resp);
                    }
                },
                Event::Text(cmd) => {
                    let resp = dispatch_text(&mut server, cmd);
                    server.send_to(id, resp);
                },
            },
            ModelMsg::Disconnect { id } => server.disconnect(id).await,
        }

        if server.shutdown {
            server.shutdown = false;
            if server.shutdown_graceful {
                shutdown.accept.cancel();
            } else {
                shutdown.cancel_all();
                break;
            }
        }

        if server.shutdown_graceful && server.jobs.is_empty() {
            shutdown.cancel_all();
            break;
        }
    }

    Ok(())
}
