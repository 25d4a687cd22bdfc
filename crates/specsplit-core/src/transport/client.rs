//! Draft-side persistent TCP client.
//!
//! Holds at most one socket to the target. [`PersistentClient::ensure_connected`]
//! is the only place connections are (re)established; `send` and `receive`
//! never reconnect on their own, so the caller decides when a round trip is
//! retried.

use super::channel::{ConnectionState, FramedChannel, Liveness};
use super::retry::{retry_async, RetryConfig};
use crate::config::ClientConfig;
use crate::error::{is_retryable_connect_error, Result, SplitError};
use std::io;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Persistent connection to the target server.
#[derive(Debug)]
pub struct PersistentClient {
    config: ClientConfig,
    channel: Option<FramedChannel<TcpStream>>,
    state: ConnectionState,
    reconnects: u64,
}

impl PersistentClient {
    /// Create a client. No connection is made until `ensure_connected`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            channel: None,
            state: ConnectionState::Disconnected,
            reconnects: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Number of times a dead connection has been replaced.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Local address of the live socket, if any.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.channel
            .as_ref()
            .and_then(|c| c.get_ref().local_addr().ok())
    }

    /// Make sure a usable connection is held.
    ///
    /// An existing connection is probed without blocking; if the peer is gone
    /// it is closed and replaced before this returns. Fails with
    /// `ConnectFailed` once the retry budget is spent; the client stays usable
    /// for a later call.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        let replacing = match self.channel.as_mut() {
            Some(channel) => match channel.probe() {
                Liveness::Alive => return Ok(()),
                Liveness::Closed => {
                    warn!("Connection to {} closed by peer", self.config.addr());
                    true
                }
                Liveness::Failed(e) => {
                    warn!("Connection to {} failed probe: {}", self.config.addr(), e);
                    true
                }
            },
            None => self.state == ConnectionState::Broken,
        };

        // The old socket is fully closed before a new one is opened.
        self.close().await;
        self.state = ConnectionState::Connecting;

        match self.connect().await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = ConnectionState::Connected;
                if replacing {
                    self.reconnects += 1;
                    info!(
                        "Reconnected to {} (reconnect #{})",
                        self.config.addr(),
                        self.reconnects
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Send one frame over the current connection.
    ///
    /// An oversized payload is refused without touching the socket and the
    /// connection stays up.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(SplitError::NotConnected)?;
        let result = channel.send(payload).await;
        self.after_io(result)
    }

    /// Receive one frame from the current connection.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let channel = self.channel.as_mut().ok_or(SplitError::NotConnected)?;
        let result = channel.receive().await;
        self.after_io(result)
    }

    /// Release the socket if one is held. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            debug!("Closing connection to {}", self.config.addr());
            channel.shutdown().await;
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Drop a connection whose last operation left it unusable.
    fn after_io<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if self.channel.as_ref().is_some_and(|c| c.is_broken()) {
                warn!("Connection to {} broken: {}", self.config.addr(), e);
                self.channel = None;
                self.state = ConnectionState::Broken;
            }
        }
        result
    }

    async fn connect(&self) -> Result<FramedChannel<TcpStream>> {
        let addr = self.config.addr();
        info!("Connecting to {}", addr);

        let retry = RetryConfig::fixed(self.config.max_retries, self.config.retry_backoff);
        let (result, stats) = retry_async(
            &retry,
            || connect_once(&self.config),
            is_retryable_connect_error,
        )
        .await;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "Giving up on {} after {} attempt(s) and {:?} of backoff: {}",
                    addr, stats.attempts, stats.total_delay, e
                );
                return Err(SplitError::ConnectFailed {
                    addr,
                    attempts: stats.attempts,
                    reason: e.to_string(),
                });
            }
        };

        info!(
            "Connected to {} after {} attempt(s) ({:?} of backoff)",
            addr, stats.attempts, stats.total_delay
        );
        Ok(FramedChannel::new(stream)
            .with_max_frame_size(self.config.max_frame_size)
            .with_io_timeout(self.config.socket_timeout))
    }
}

async fn connect_once(config: &ClientConfig) -> io::Result<TcpStream> {
    let connect = TcpStream::connect((config.host.as_str(), config.port));
    let stream = match config.socket_timeout {
        Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", limit),
            )
        })??,
        None => connect.await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
