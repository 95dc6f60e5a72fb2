//! Configuration for socket connectors.

use linefeed_core::{Error, FlowConfig, Framing, Result, DEFAULT_MAX_FRAME_LEN};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many consumers the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerMode {
    /// Accept exactly one consumer, stream to it, then stop.
    #[default]
    Single,
    /// Keep accepting consumers until shut down, each with its own cursor.
    Multi,
}

impl std::str::FromStr for ConsumerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" | "one" => Ok(ConsumerMode::Single),
            "multi" | "many" => Ok(ConsumerMode::Multi),
            other => Err(format!("unknown consumer mode '{}'", other)),
        }
    }
}

/// Configuration for socket connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Host to bind/connect to. `0.0.0.0` binds all local interfaces.
    pub host: String,
    /// Port to bind/connect to (0 = any free port when binding).
    pub port: u16,
    /// Single or multi consumer (server only).
    pub mode: ConsumerMode,
    /// Maximum number of concurrent sessions (multi mode only).
    pub max_connections: usize,
    /// Wire framing.
    pub framing: Framing,
    /// Maximum payload size of one frame in bytes.
    pub max_frame_len: usize,
    /// Pacing and backpressure.
    pub flow: FlowConfig,
    /// Log every streamed record at debug level.
    pub log_records: bool,
    /// Connection timeout in milliseconds (consumer only).
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds (0 = no timeout, consumer only).
    pub read_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9009,
            mode: ConsumerMode::Single,
            max_connections: 10,
            framing: Framing::Newline,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            flow: FlowConfig::default(),
            log_records: false,
            connect_timeout_ms: 5000,
            read_timeout_ms: 0,
        }
    }
}

impl SocketConfig {
    /// Create a new socket configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Create a server configuration bound to all interfaces.
    pub fn server(port: u16) -> Self {
        Self::new("0.0.0.0", port)
    }

    /// Create a consumer configuration that connects to a server.
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port)
    }

    /// Set the consumer mode.
    pub fn with_mode(mut self, mode: ConsumerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set maximum concurrent sessions.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the wire framing.
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Set flow control.
    pub fn with_flow(mut self, flow: FlowConfig) -> Self {
        self.flow = flow;
        self
    }

    /// Set the inter-record delay.
    pub fn with_record_delay(mut self, delay_ms: u64) -> Self {
        self.flow.record_delay_ms = delay_ms;
        self
    }

    /// Enable per-record logging.
    pub fn with_log_records(mut self, enabled: bool) -> Self {
        self.log_records = enabled;
        self
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set read timeout.
    pub fn with_read_timeout(mut self, timeout_ms: u64) -> Self {
        self.read_timeout_ms = timeout_ms;
        self
    }

    /// Get the socket address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    /// Check the configuration before binding.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_frame_len must be between 1 and {}",
                u32::MAX
            )));
        }
        self.flow.validate()
    }
}
