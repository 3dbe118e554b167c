//! castsink SNTP - query a time server
//!
//! Runs one or more rounds of clock exchanges and reports the offset and
//! round trip each round settled on, along with the adjusted current time.

use castsink_cli::{format_micros, format_unix_micros, Config};
use castsink_io::{MediaClock, SystemClock};
use castsink_protocol::ClockSync;
use clap::Parser;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "castsink-sntp")]
#[command(about = "Measure local clock offset against an SNTP server", long_about = None)]
struct Args {
    /// Time server (defaults to the configured server)
    host: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Response timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Exchanges per round (defaults to the configured batch size)
    #[arg(short, long)]
    batch: Option<usize>,

    /// Number of rounds
    #[arg(short = 'n', long, default_value = "1")]
    count: u32,

    /// Pause between rounds in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.sntp.server = host;
    }
    if let Some(port) = args.port {
        config.sntp.port = port;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.sntp.timeout_ms = timeout_ms;
    }
    if let Some(batch) = args.batch {
        config.sntp.batch_size = batch;
    }
    config.validate()?;

    let clock = SystemClock::new();
    let sync = ClockSync::with_clock(clock, config.clock_sync());
    let server = &config.sntp.server;

    let mut successes = 0u32;
    for attempt in 1..=args.count.max(1) {
        if attempt > 1 {
            thread::sleep(Duration::from_millis(args.interval_ms));
        }

        match sync.request_time_best_of(server, config.sntp.batch_size) {
            Ok(state) => {
                successes += 1;
                println!(
                    "{}: offset {} round trip {}",
                    server,
                    format_micros(state.offset.as_micros()),
                    format_micros(state.round_trip.as_micros())
                );
            }
            Err(e) => {
                tracing::warn!("Round {} with {} failed: {}", attempt, server, e);
                eprintln!("{}: {}", server, e);
            }
        }
    }

    if successes == 0 {
        anyhow::bail!("No response from {}", server);
    }

    let local_wall = clock.wall_us();
    let remote = sync.remote_now_us()?;
    println!("local  {}", format_unix_micros(local_wall));
    println!("remote {}", format_unix_micros(remote));
    println!("delta  {}", format_micros(remote - local_wall));

    Ok(())
}
