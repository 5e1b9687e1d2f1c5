//! Scenario driver for the accel_dma transport.
//!
//! Runs the transport test programs on a simulated fabric. Exits 0 on success,
//! otherwise with the packed code of the first failing check.
//!
//! ```bash
//! dma_scenarios simple
//! dma_scenarios --pin 3 matrix --n 128 --m 32
//! RUST_LOG=accel_dma=trace dma_scenarios server-client --clients 8
//! ```

mod affinity;
mod scenarios;

use std::process::ExitCode;
use std::time::Duration;

use accel_dma::FabricConfig;
use accel_dma::sim::Fabric;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use scenarios::{Failure, Layout};

#[derive(Parser)]
#[command(name = "dma_scenarios")]
#[command(about = "Run accel_dma transport scenarios on a simulated fabric")]
struct Cli {
    /// Pin the driver thread to this core
    #[arg(long, global = true)]
    pin: Option<usize>,

    /// Simulated delay after each copied segment, in microseconds
    #[arg(long, global = true, default_value = "0")]
    segment_latency_us: u64,

    /// Engine command queue depth
    #[arg(long, global = true, default_value = "1024")]
    queue_depth: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Immediate to self, then a tracked one-segment gather
    Simple,
    /// Submatrix gather/scatter between two barrier-sequenced contexts
    Matrix {
        /// Side of the full matrix
        #[arg(long, default_value = "128")]
        n: usize,
        /// Side of the submatrix
        #[arg(long, default_value = "32")]
        m: usize,
        /// First row of the submatrix
        #[arg(long, default_value = "32")]
        row: usize,
        /// First column of the submatrix
        #[arg(long, default_value = "64")]
        col: usize,
    },
    /// Page fault and no-route reporting
    Error,
    /// One server handing its table address to concurrent clients.
    /// SIGINT or SIGTERM unbinds the server and ends the run.
    ServerClient {
        /// Number of clients
        #[arg(
            short,
            long,
            default_value = "4",
            value_parser = clap::value_parser!(u16).range(..=i64::from(scenarios::MAX_CLIENTS))
        )]
        clients: u16,
    },
    /// Contiguous self-put between offset buffers
    Loopback {
        /// Bytes to copy
        #[arg(short, long, default_value = "72")]
        bytes: usize,
    },
}

fn run(cli: Cli) -> Result<(), Failure> {
    if let Some(core) = cli.pin {
        let cpu = affinity::pin_current(core);
        info!(?cpu, "driver running");
    }

    let config = FabricConfig::default()
        .with_segment_latency(Duration::from_micros(cli.segment_latency_us))
        .with_queue_depth(cli.queue_depth);
    let fabric = Fabric::new(config)?;

    match cli.command {
        Command::Simple => scenarios::simple(&fabric),
        Command::Matrix { n, m, row, col } => {
            scenarios::matrix(&fabric, Layout { n, m, row, col })
        }
        Command::Error => scenarios::error(&fabric),
        Command::ServerClient { clients } => scenarios::server_client(&fabric, clients, true),
        Command::Loopback { bytes } => scenarios::loopback(&fabric, bytes),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.exit_code();
            error!(code, "{}", e);
            ExitCode::from(code)
        }
    }
}
