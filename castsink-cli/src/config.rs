//! Configuration file support for castsink CLI tools

use castsink::render::VideoSchedulerConfig;
use castsink_protocol::{ClockSyncConfig, ReorderConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Time server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SntpSection {
    /// Time server host name or address
    #[serde(default = "default_server")]
    pub server: String,
    /// Time server UDP port
    #[serde(default = "default_ntp_port")]
    pub port: u16,
    /// Response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Exchanges combined into one clock estimate
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between the exchanges of a batch, in milliseconds
    #[serde(default = "default_batch_spacing_ms")]
    pub batch_spacing_ms: u64,
}

fn default_server() -> String {
    "pool.ntp.org".to_string()
}

fn default_ntp_port() -> u16 {
    castsink_protocol::ntp::NTP_PORT
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_batch_size() -> usize {
    castsink_protocol::clock_sync::DEFAULT_BATCH_SIZE
}

fn default_batch_spacing_ms() -> u64 {
    33
}

impl Default for SntpSection {
    fn default() -> Self {
        SntpSection {
            server: default_server(),
            port: default_ntp_port(),
            timeout_ms: default_timeout_ms(),
            batch_size: default_batch_size(),
            batch_spacing_ms: default_batch_spacing_ms(),
        }
    }
}

/// Reorder buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderSection {
    /// How long a gap may stay open before it is skipped, in milliseconds
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
}

fn default_grace_window_ms() -> u64 {
    50
}

impl Default for ReorderSection {
    fn default() -> Self {
        ReorderSection {
            grace_window_ms: default_grace_window_ms(),
        }
    }
}

/// Video presentation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSection {
    /// Lateness beyond which a rendered frame counts as late, in milliseconds
    #[serde(default = "default_late_tolerance_ms")]
    pub late_tolerance_ms: u64,
}

fn default_late_tolerance_ms() -> u64 {
    15
}

impl Default for VideoSection {
    fn default() -> Self {
        VideoSection {
            late_tolerance_ms: default_late_tolerance_ms(),
        }
    }
}

/// RTP receiver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverSection {
    /// Address to receive RTP on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Output destination (file path, "-" for stdout, or "udp://host:port")
    #[serde(default = "default_output")]
    pub output: String,
    /// Where to send retransmission requests; defaults to the RTP source
    /// address with the port incremented by one
    pub feedback: Option<SocketAddr>,
    /// SSRC to put in outgoing feedback
    #[serde(default = "default_sender_ssrc")]
    pub sender_ssrc: u32,
    /// Kernel receive buffer size
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Statistics interval in seconds (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Receiver report interval in seconds (0 disables)
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Canonical name announced with receiver reports
    #[serde(default = "default_cname")]
    pub cname: String,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5004))
}

fn default_output() -> String {
    "-".to_string()
}

fn default_sender_ssrc() -> u32 {
    0xDEAD_BEEF
}

fn default_recv_buffer_size() -> usize {
    256 * 1024
}

fn default_stats_interval() -> u64 {
    1
}

fn default_report_interval() -> u64 {
    5
}

fn default_cname() -> String {
    "castsink@localhost".to_string()
}

impl Default for ReceiverSection {
    fn default() -> Self {
        ReceiverSection {
            listen: default_listen(),
            output: default_output(),
            feedback: None,
            sender_ssrc: default_sender_ssrc(),
            recv_buffer_size: default_recv_buffer_size(),
            stats_interval_secs: default_stats_interval(),
            report_interval_secs: default_report_interval(),
            cname: default_cname(),
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sntp: SntpSection,
    #[serde(default)]
    pub reorder: ReorderSection,
    #[serde(default)]
    pub video: VideoSection,
    #[serde(default)]
    pub receiver: ReceiverSection,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Config::default()),
        }
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the core cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sntp.server.is_empty() {
            return Err(ConfigError::Invalid("sntp.server is empty".into()));
        }
        if self.sntp.port == 0 {
            return Err(ConfigError::Invalid("sntp.port must be non-zero".into()));
        }
        if self.sntp.timeout_ms == 0 {
            return Err(ConfigError::Invalid("sntp.timeout_ms must be non-zero".into()));
        }
        if self.sntp.batch_size == 0 {
            return Err(ConfigError::Invalid("sntp.batch_size must be non-zero".into()));
        }
        if self.receiver.cname.len() > 255 {
            return Err(ConfigError::Invalid(
                "receiver.cname is longer than 255 bytes".into(),
            ));
        }
        if self.reorder.grace_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "reorder.grace_window_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn clock_sync(&self) -> ClockSyncConfig {
        ClockSyncConfig {
            port: self.sntp.port,
            timeout: Duration::from_millis(self.sntp.timeout_ms),
            batch_spacing: Duration::from_millis(self.sntp.batch_spacing_ms),
        }
    }

    pub fn reorder(&self) -> ReorderConfig {
        ReorderConfig {
            grace_window: Duration::from_millis(self.reorder.grace_window_ms),
        }
    }

    pub fn video_scheduler(&self) -> VideoSchedulerConfig {
        VideoSchedulerConfig {
            late_tolerance: Duration::from_millis(self.video.late_tolerance_ms),
        }
    }
}

impl ReceiverSection {
    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Get receiver report interval as Duration
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Feedback destination for media arriving from `source`
    pub fn feedback_addr(&self, source: SocketAddr) -> SocketAddr {
        self.feedback.unwrap_or_else(|| {
            let mut addr = source;
            addr.set_port(source.port().wrapping_add(1));
            addr
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
