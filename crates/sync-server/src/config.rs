//! Server configuration loaded from `SYNC_*` environment variables.
//!
//! # Environment Variables
//!
//! - `SYNC_STREAM_ADDR`: Stream listener address. Default: `0.0.0.0:10030`
//! - `SYNC_HTTP_ADDR`: Delivery API address. Default: `0.0.0.0:3000`
//! - `SYNC_QUEUE_CAPACITY`: Updates buffered per session server. Default: `1000`
//! - `SYNC_HANDSHAKE_TIMEOUT_SECS`: Time allowed for the stream hello. Default: `10`
//!
//! # Examples
//!
//! ```bash
//! SYNC_QUEUE_CAPACITY=5000 SYNC_HTTP_ADDR=127.0.0.1:8080 cargo run -p sync-server
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use sync_router::registry::{DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY};
use sync_router::server::{DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_STREAM_ADDR};
use sync_router::SyncServerConfig;
use thiserror::Error;
use tracing::info;

/// Default address of the HTTP delivery API.
pub const DEFAULT_HTTP_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3000);

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address session servers connect their streams to
    pub stream_addr: SocketAddr,
    /// Address of the HTTP delivery API
    pub http_addr: SocketAddr,
    /// Capacity of each session server's update queue
    pub queue_capacity: usize,
    /// Time a session server has to send its hello frame
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_addr: DEFAULT_STREAM_ADDR,
            http_addr: DEFAULT_HTTP_ADDR,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load server configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let stream_addr = match lookup("SYNC_STREAM_ADDR") {
            Some(value) => parse_addr("SYNC_STREAM_ADDR", value)?,
            None => DEFAULT_STREAM_ADDR,
        };
        let http_addr = match lookup("SYNC_HTTP_ADDR") {
            Some(value) => parse_addr("SYNC_HTTP_ADDR", value)?,
            None => DEFAULT_HTTP_ADDR,
        };

        let queue_capacity = match lookup("SYNC_QUEUE_CAPACITY") {
            Some(value) => parse_queue_capacity(value)?,
            None => DEFAULT_QUEUE_CAPACITY,
        };

        let handshake_timeout = match lookup("SYNC_HANDSHAKE_TIMEOUT_SECS") {
            Some(value) => {
                Duration::from_secs(parse_positive("SYNC_HANDSHAKE_TIMEOUT_SECS", value)?)
            }
            None => Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        };

        Ok(Self {
            stream_addr,
            http_addr,
            queue_capacity,
            handshake_timeout,
        })
    }

    /// Stream listener configuration derived from this config.
    pub fn stream_config(&self) -> SyncServerConfig {
        SyncServerConfig {
            stream_addr: self.stream_addr,
            handshake_timeout: self.handshake_timeout,
        }
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Stream listener: {}", self.stream_addr);
        info!("Delivery API: {}", self.http_addr);
        info!("Queue capacity per server: {}", self.queue_capacity);
        info!("Handshake timeout: {}s", self.handshake_timeout.as_secs());
    }
}

fn parse_addr(var: &'static str, value: String) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
        var,
        reason: e.to_string(),
        value,
    })
}

fn parse_queue_capacity(value: String) -> Result<usize, ConfigError> {
    let capacity = parse_positive("SYNC_QUEUE_CAPACITY", value.clone())?;
    match usize::try_from(capacity) {
        Ok(capacity) if capacity <= MAX_QUEUE_CAPACITY => Ok(capacity),
        _ => Err(ConfigError::InvalidValue {
            var: "SYNC_QUEUE_CAPACITY",
            value,
            reason: format!("must be at most {}", MAX_QUEUE_CAPACITY),
        }),
    }
}

fn parse_positive(var: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            var,
            value,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
