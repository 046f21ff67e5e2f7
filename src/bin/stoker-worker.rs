//! Bundled worker process for stoker pools.
//!
//! Speaks the line-framed JSON relay over stdin/stdout. Primarily a test
//! and demo vehicle; real deployments ship their own worker binaries.

use std::time::Duration;

use clap::Parser;

use stoker::worker_main::{run_worker, WorkerBehavior};

#[derive(Parser)]
#[command(
    name = "stoker-worker",
    about = "Relay worker process for stoker pools",
    version
)]
struct Cli {
    /// Reply with the stop request on the n-th job, then exit.
    #[arg(long, value_name = "N")]
    stop_after: Option<u64>,

    /// Never send the readiness handshake (fault injection).
    #[arg(long)]
    skip_handshake: bool,

    /// Delay the readiness handshake by this many milliseconds.
    #[arg(long, value_name = "MS")]
    handshake_delay_ms: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    run_worker(WorkerBehavior {
        stop_after: cli.stop_after,
        skip_handshake: cli.skip_handshake,
        handshake_delay: cli.handshake_delay_ms.map(Duration::from_millis),
    });
}
