//! Server configuration: an optional YAML file overlaid with CLI flags.

use anyhow::{Context, Result};
use clap::Args;
use linefeed_connectors::socket::{ConsumerMode, SocketConfig};
use linefeed_core::{Framing, OverflowPolicy};
use std::fs;
use std::path::{Path, PathBuf};

/// Options shared by every command that runs a stream server.
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// YAML file with server settings (flags below take precedence)
    #[arg(long, short = 'c', env = "LINEFEED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host or interface to bind (0.0.0.0 = all interfaces)
    #[arg(long, env = "LINEFEED_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, short, env = "LINEFEED_PORT")]
    pub port: Option<u16>,

    /// Consumer mode: single or multi
    #[arg(long)]
    pub mode: Option<ConsumerMode>,

    /// Maximum concurrent consumers (multi mode)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Wire framing: newline or length-prefixed
    #[arg(long)]
    pub framing: Option<Framing>,

    /// Maximum frame payload in bytes
    #[arg(long)]
    pub max_frame_len: Option<usize>,

    /// Delay between records in milliseconds
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// Frames buffered per consumer
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// What to do when a consumer lags: backpressure or drop
    #[arg(long)]
    pub overflow: Option<OverflowPolicy>,

    /// Log every record sent
    #[arg(long)]
    pub log_records: bool,
}

impl ServerArgs {
    /// Build the effective configuration.
    pub fn resolve(&self) -> Result<SocketConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => SocketConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        if let Some(max) = self.max_frame_len {
            config.max_frame_len = max;
        }
        if let Some(delay) = self.delay_ms {
            config.flow.record_delay_ms = delay;
        }
        if let Some(depth) = self.queue_depth {
            config.flow.queue_depth = depth;
        }
        if let Some(overflow) = self.overflow {
            config.flow.overflow = overflow;
        }
        if self.log_records {
            config.log_records = true;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Load server settings from a YAML file.
pub fn load_config(path: &Path) -> Result<SocketConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: SocketConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}
