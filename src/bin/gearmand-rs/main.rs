mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn, Level};

use crate::args::Args;
use gearman_rs::queue::{MemoryQueueAdapter, NullQueueAdapter, QueueAdapter};
use gearman_rs::server::{self, Config, ShutdownTokens};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(if args.verbose { Level::TRACE } else { Level::DEBUG })
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let queue: Arc<dyn QueueAdapter> = match args.queue.as_str() {
        "none" => Arc::new(NullQueueAdapter),
        "memory" => Arc::new(MemoryQueueAdapter::default()),
        other => {
            error!(queue = other, "unrecognised queue backend");
            return ExitCode::from(2);
        },
    };

    let shutdown = ShutdownTokens::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            info!("received interrupt, shutting down");
            shutdown.accept.cancel();
            shutdown.hard.cancel();
        });
    }

    match run(args, shutdown, queue).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args, shutdown: ShutdownTokens, queue: Arc<dyn QueueAdapter>) -> Result<()> {
    let listener = TcpListener::bind((args.listen, args.port)).await.context("failed to listen for connections")?;
    info!(addr = %listener.local_addr()?, "listening");
    info!(threads = args.threads, "ignoring --threads: the Tokio runtime schedules all connections itself");

    let config = Config {
        host: hostname(),
        job_retries: args.job_retries,
        worker_wakeup: args.worker_wakeup,
        round_robin: args.round_robin,
    };

    server::run(listener, shutdown, config, queue).await
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "gearmand-rs".to_string())
}
