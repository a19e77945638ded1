use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 4730)]
    pub port: u16,
    /// Kept for CLI compatibility with the source daemon; the Tokio runtime
    /// schedules all connections on its own executor regardless of this
    /// value.
    #[arg(short = 't', long, default_value_t = 4)]
    pub threads: u32,
    /// Number of sleeping workers notified per job submission (0 = all).
    #[arg(short = 'w', long, default_value_t = 0)]
    pub worker_wakeup: u32,
    /// Number of worker-loss re-queues before a job is dropped and its
    /// clients sent WORK_FAIL (0 = never drop).
    #[arg(short = 'r', long, default_value_t = 0)]
    pub job_retries: u32,
    /// Distributes GRAB_JOB fairly across a worker's registered functions
    /// instead of always preferring the first.
    #[arg(long, default_value_t)]
    pub round_robin: bool,
    /// Durable queue backend: `none` (default, in-memory only) or `memory`
    /// (in-process, exercised for testing/demo purposes; real backends are
    /// out of scope).
    #[arg(short = 'q', long, default_value = "none")]
    pub queue: String,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
    /// Enables trace-level logging.
    #[arg(short, long, default_value_t)]
    pub verbose: bool,
}
