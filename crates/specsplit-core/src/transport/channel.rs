//! Message-oriented channel over a byte stream.
//!
//! A [`FramedChannel`] owns exactly one stream. Once any operation fails in a
//! way that leaves the stream position unknown, the channel is marked broken
//! and refuses further traffic; the owner must drop it and open a new one.

use super::protocol::{encode_frame, read_frame};
use crate::config::TransportConfig;
use crate::error::{Result, SplitError, TransportError};
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tracing::debug;

/// Liveness state of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket held.
    Disconnected,
    /// Connection attempts in progress.
    Connecting,
    /// Socket held and usable.
    Connected,
    /// Last operation failed; the socket was closed and must be replaced.
    Broken,
}

/// Result of a non-blocking liveness check.
#[derive(Debug)]
pub enum Liveness {
    /// Nothing indicates the peer is gone.
    Alive,
    /// The peer closed its side.
    Closed,
    /// The socket reported an error (reset, broken pipe).
    Failed(io::Error),
}

/// A byte stream a [`FramedChannel`] can run over.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Check, without blocking or consuming data, whether the peer is still there.
    fn probe(&self) -> Liveness;
}

impl PeerStream for TcpStream {
    fn probe(&self) -> Liveness {
        let mut buf = [0u8; 1];
        match self.peek(&mut buf).now_or_never() {
            // Nothing to read yet: the usual state between round trips.
            None => Liveness::Alive,
            Some(Ok(0)) => Liveness::Closed,
            Some(Ok(_)) => Liveness::Alive,
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Liveness::Alive,
            Some(Err(e)) => Liveness::Failed(e),
        }
    }
}

impl PeerStream for DuplexStream {
    fn probe(&self) -> Liveness {
        Liveness::Alive
    }
}

/// Length-framed, ordered, request/reply channel over one stream.
#[derive(Debug)]
pub struct FramedChannel<S = TcpStream> {
    stream: S,
    broken: bool,
    max_frame_size: u32,
    io_timeout: Option<Duration>,
    frames_sent: u64,
    frames_received: u64,
}

impl<S: PeerStream> FramedChannel<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            broken: false,
            max_frame_size: TransportConfig::DEFAULT_MAX_FRAME_SIZE,
            io_timeout: None,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    /// Set the largest payload accepted in either direction.
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Bound every send and receive by `timeout`. `None` waits forever.
    pub fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Whether a previous failure left this channel unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Send one frame.
    ///
    /// An oversized payload is rejected up front and leaves the channel usable;
    /// any failure after writing started marks the channel broken.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let frame = encode_frame(payload, self.max_frame_size)?;

        let timeout = self.io_timeout;
        let stream = &mut self.stream;
        let result = with_timeout(timeout, async move {
            stream
                .write_all(&frame)
                .await
                .map_err(TransportError::from)?;
            stream.flush().await.map_err(TransportError::from)?;
            Ok(())
        })
        .await;

        match result {
            Ok(()) => {
                self.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                self.mark_broken(&e);
                Err(e)
            }
        }
    }

    /// Receive one complete frame.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        self.ensure_usable()?;

        let timeout = self.io_timeout;
        let max = self.max_frame_size;
        let result = with_timeout(timeout, read_frame(&mut self.stream, max)).await;

        match result {
            Ok(payload) => {
                self.frames_received += 1;
                Ok(payload)
            }
            Err(e) => {
                self.mark_broken(&e);
                Err(e)
            }
        }
    }

    /// Non-blocking liveness check. A dead peer marks the channel broken.
    pub fn probe(&mut self) -> Liveness {
        if self.broken {
            return Liveness::Closed;
        }
        let liveness = self.stream.probe();
        if !matches!(liveness, Liveness::Alive) {
            self.broken = true;
        }
        liveness
    }

    /// Close the write side, letting the peer observe a clean close.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Ignoring error while shutting down channel: {}", e);
        }
        self.broken = true;
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.broken {
            return Err(SplitError::NotConnected);
        }
        Ok(())
    }

    fn mark_broken(&mut self, err: &SplitError) {
        if err.is_connection_fatal() {
            debug!("Marking channel broken: {}", err);
            self.broken = true;
        }
    }
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::TimedOut(limit))?,
        None => fut.await,
    }
}
