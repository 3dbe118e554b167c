//! castsink Receiver - RTP stream receiver
//!
//! Receives an RTP stream, restores packet order, requests retransmission
//! of missing packets and writes payloads to stdout, a file or a UDP relay.
//! Receiver reports go back to the source at a fixed interval.

use bytes::Bytes;
use castsink_cli::{format_receiver_stats, Config, RtpReceiver};
use castsink_io::{DatagramSocket, MediaClock, SystemClock};
use clap::Parser;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// How long a receive call may block before pending units are re-examined
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const TOOL_NAME: &str = concat!("castsink ", env!("CARGO_PKG_VERSION"));

#[derive(Parser, Debug)]
#[command(name = "castsink-receiver")]
#[command(about = "RTP receiver with reordering and retransmission requests", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Output file (use '-' for stdout, or 'udp://host:port')
    #[arg(short, long)]
    output: Option<String>,

    /// Reorder grace window in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Destination for retransmission requests
    #[arg(long)]
    feedback: Option<SocketAddr>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout can carry the stream
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.receiver.listen = listen;
    }
    if let Some(output) = args.output {
        config.receiver.output = output;
    }
    if let Some(grace_ms) = args.grace_ms {
        config.reorder.grace_window_ms = grace_ms;
    }
    if args.feedback.is_some() {
        config.receiver.feedback = args.feedback;
    }
    if let Some(stats) = args.stats {
        config.receiver.stats_interval_secs = stats;
    }
    config.validate()?;

    tracing::info!("castsink receiver starting...");
    tracing::info!("Output target: {}", config.receiver.output);

    let socket = DatagramSocket::bind(config.receiver.listen)?;
    if let Err(e) = socket.set_recv_buffer_size(config.receiver.recv_buffer_size) {
        tracing::warn!("Failed to set receive buffer size: {}", e);
    }
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    tracing::info!("Listening on: {}", socket.local_addr()?);

    let mut writer = open_output(&config.receiver.output)?;

    let receiver = Arc::new(Mutex::new(RtpReceiver::new(
        config.reorder(),
        config.receiver.sender_ssrc,
    )));

    // Statistics thread
    let stats_interval = config.receiver.stats_interval();
    if !stats_interval.is_zero() {
        let receiver = receiver.clone();
        let start_time = Instant::now();
        thread::spawn(move || loop {
            thread::sleep(stats_interval);
            let stats = receiver.lock().snapshot();
            tracing::info!("{}", format_receiver_stats(&stats, start_time.elapsed()));
        });
    }

    let clock = SystemClock::new();
    let mut buffer = vec![0u8; 2048];
    let mut source: Option<SocketAddr> = None;
    let mut delivered = 0usize;
    let report_interval = config.receiver.report_interval();
    let mut last_report = Instant::now();

    tracing::info!("Ready to receive packets...");

    loop {
        match socket.recv_from(&mut buffer) {
            Ok((n, remote_addr)) => {
                if source != Some(remote_addr) {
                    tracing::info!("Receiving from {}", remote_addr);
                    source = Some(remote_addr);
                }
                let datagram = Bytes::copy_from_slice(&buffer[..n]);
                if let Err(e) = receiver.lock().on_datagram(datagram) {
                    tracing::debug!("Dropping {} byte datagram from {}: {}", n, remote_addr, e);
                }
            }
            Err(e) if e.is_would_block() => {}
            Err(e) => {
                tracing::error!("Receive error: {}", e);
                continue;
            }
        }

        let report_due = !report_interval.is_zero() && last_report.elapsed() >= report_interval;
        let (nacks, report) = {
            let mut receiver = receiver.lock();
            delivered += receiver.drain_to(clock.now_us(), writer.as_mut())?;
            let report = if report_due {
                receiver.receiver_report()
            } else {
                None
            };
            (receiver.take_nacks(), report)
        };
        if report_due {
            last_report = Instant::now();
        }

        if let Some(source) = source {
            let target = config.receiver.feedback_addr(source);
            for nack in nacks {
                tracing::debug!("Sending NACK for {} to {}", nack.pid, target);
                if let Err(e) = socket.send_to(&nack.to_bytes(), target) {
                    tracing::warn!("Failed to send NACK to {}: {}", target, e);
                }
            }

            if let Some(report) = report {
                match report.to_compound(&config.receiver.cname, TOOL_NAME) {
                    Ok(packet) => {
                        tracing::debug!("Sending receiver report to {}", target);
                        if let Err(e) = socket.send_to(&packet, target) {
                            tracing::warn!("Failed to send receiver report to {}: {}", target, e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to build receiver report: {}", e),
                }
            }
        }

        if delivered >= 50 {
            writer.flush()?;
            delivered = 0;
        }
    }
}

fn open_output(target: &str) -> anyhow::Result<Box<dyn Write>> {
    if target == "-" {
        tracing::info!("Writing to stdout");
        Ok(Box::new(io::stdout()))
    } else if let Some(addr_str) = target.strip_prefix("udp://") {
        let target_addr: SocketAddr = addr_str
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid UDP output address '{}': {}", addr_str, e))?;

        tracing::info!("Relaying to UDP: {}", target_addr);
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(target_addr)?;
        Ok(Box::new(UdpWriter::new(socket)))
    } else {
        tracing::info!("Writing to file: {}", target);
        let file = File::create(target)
            .map_err(|e| anyhow::anyhow!("Failed to create file '{}': {}", target, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

struct UdpWriter {
    socket: std::net::UdpSocket,
}

impl UdpWriter {
    fn new(socket: std::net::UdpSocket) -> Self {
        Self { socket }
    }
}

impl Write for UdpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
