//! Centralized configuration for specsplit.
//!
//! Constants live on [`TransportConfig`]; the per-side settings a deployment
//! tunes live on [`ClientConfig`] and [`ServerConfig`], which can be loaded
//! from JSON.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport-level defaults and limits.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 7860;

    // Client connection establishment
    pub const DEFAULT_MAX_RETRIES: u32 = 10;
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

    // Framing
    pub const FRAME_HEADER_LEN: usize = 4;
    pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 30; // 1 GiB

    // Keepalive
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Draft-side (client) connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target host name or IP.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Connection attempts before giving up with `ConnectFailed`.
    pub max_retries: u32,
    /// Fixed delay between connection attempts.
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    /// Per-operation socket timeout. `None` waits forever.
    #[serde(with = "option_duration_ms")]
    pub socket_timeout: Option<Duration>,
    /// Largest payload accepted in either direction.
    pub max_frame_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: TransportConfig::DEFAULT_HOST.to_string(),
            port: TransportConfig::DEFAULT_PORT,
            max_retries: TransportConfig::DEFAULT_MAX_RETRIES,
            retry_backoff: TransportConfig::DEFAULT_RETRY_BACKOFF,
            socket_timeout: None,
            max_frame_size: TransportConfig::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a client config for the given target address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the number of connection attempts.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the delay between connection attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the per-operation socket timeout.
    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Set the maximum frame payload size.
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// `host:port` form used for logging and errors.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Target-side (server) listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,
    /// Port to bind (0 = OS-assigned).
    pub port: u16,
    /// Largest payload accepted in either direction.
    pub max_frame_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: TransportConfig::DEFAULT_HOST.to_string(),
            port: TransportConfig::DEFAULT_PORT,
            max_frame_size: TransportConfig::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Create a server config for the given bind address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the maximum frame payload size.
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
