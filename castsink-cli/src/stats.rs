//! Statistics display and formatting

use castsink_protocol::{ReceptionReport, ReorderStats};
use std::time::Duration;

/// Receiver counters shared with the statistics thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStats {
    pub packets: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub malformed: u64,
    pub foreign_ssrc: u64,
    pub rejected_seq: u64,
    pub nacks_sent: u64,
    pub pending_units: usize,
    pub reorder: ReorderStats,
    pub report: Option<ReceptionReport>,
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

/// Format a signed microsecond quantity (offsets, round trips)
pub fn format_micros(us: i64) -> String {
    let sign = if us < 0 { "-" } else { "" };
    let abs = us.unsigned_abs();
    if abs >= 1_000_000 {
        format!("{}{:.3}s", sign, abs as f64 / 1_000_000.0)
    } else if abs >= 1_000 {
        format!("{}{:.2}ms", sign, abs as f64 / 1_000.0)
    } else {
        format!("{}{}µs", sign, abs)
    }
}

/// Format microseconds since the Unix epoch as `seconds.micros`
pub fn format_unix_micros(us: i64) -> String {
    format!("{}.{:06}", us.div_euclid(1_000_000), us.rem_euclid(1_000_000))
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// One-line receiver summary
pub fn format_receiver_stats(stats: &ReceiverStats, elapsed: Duration) -> String {
    let throughput_bps = if elapsed.as_secs() > 0 {
        (stats.bytes_in * 8) / elapsed.as_secs()
    } else {
        0
    };

    let (lost, fraction) = match &stats.report {
        Some(report) => (
            report.cumulative_lost,
            report.fraction_lost as f64 * 100.0 / 256.0,
        ),
        None => (0, 0.0),
    };

    format!(
        "[{:8}] Packets: {} | In: {} | Out: {} | Rate: {} | Pending: {} | Lost: {} ({:.1}%) | NACK: {} | Recovered: {} | Skipped: {} | Dup: {}",
        format_duration(elapsed),
        stats.packets,
        format_bytes(stats.bytes_in),
        format_bytes(stats.bytes_out),
        format_bandwidth(throughput_bps),
        stats.pending_units,
        lost,
        fraction,
        stats.nacks_sent,
        stats.reorder.recovered,
        stats.reorder.skipped,
        stats.reorder.duplicates
    )
}
