//! Target-side single-peer TCP server.
//!
//! The draft/target split is a 1:1 pairing, so the server serves exactly one
//! peer at a time. While that peer is live, a background task accepts and
//! immediately closes any other inbound connection so it can never interleave
//! frames with the real session.
//!
//! # Thread Safety
//!
//! `accept`, `send` and `receive` take `&mut self`; a caller that wants
//! `accept` off its main loop moves the server into a spawned task and gets
//! it back through the task's `JoinHandle`.

use super::channel::FramedChannel;
use crate::config::ServerConfig;
use crate::error::{Result, SplitError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Persistent single-peer server.
#[derive(Debug)]
pub struct PersistentServer {
    config: ServerConfig,
    listener: Option<Arc<TcpListener>>,
    local_addr: SocketAddr,
    peer: Option<FramedChannel<TcpStream>>,
    peer_addr: Option<SocketAddr>,
    rejector: Option<JoinHandle<()>>,
    rejected: Arc<AtomicU64>,
}

impl PersistentServer {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Target server listening on {}", local_addr);

        Ok(Self {
            config,
            listener: Some(Arc::new(listener)),
            local_addr,
            peer: None,
            peer_addr: None,
            rejector: None,
            rejected: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the accepted peer, if one is live.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.has_peer().then_some(self.peer_addr).flatten()
    }

    /// Whether an accepted, unbroken peer is held.
    pub fn has_peer(&self) -> bool {
        self.peer.as_ref().is_some_and(|p| !p.is_broken())
    }

    /// Inbound connections turned away while a peer was live.
    pub fn rejected_connections(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Wait for the draft peer to connect.
    ///
    /// Blocks until a connection arrives, so run it on its own task if other
    /// work must continue. Fails with `ProtocolViolation` if a live peer is
    /// already held; a peer that broke or was released is replaced.
    pub async fn accept(&mut self) -> Result<SocketAddr> {
        if self.has_peer() {
            return Err(SplitError::protocol(format!(
                "already serving peer {:?}; only one peer is supported",
                self.peer_addr
            )));
        }
        let listener = self.listener.clone().ok_or(SplitError::NotConnected)?;
        self.release_peer().await;

        info!("Waiting for draft peer on {}", self.local_addr);
        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|e| SplitError::io_with_addr(e, self.local_addr))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SplitError::io_with_addr(e, peer_addr))?;
        info!("Accepted draft peer {}", peer_addr);

        // The server waits indefinitely for the next request.
        self.peer = Some(
            FramedChannel::new(stream)
                .with_max_frame_size(self.config.max_frame_size)
                .with_io_timeout(None),
        );
        self.peer_addr = Some(peer_addr);
        self.rejector = Some(tokio::spawn(reject_extra_peers(
            listener,
            peer_addr,
            self.rejected.clone(),
        )));

        Ok(peer_addr)
    }

    /// Send one frame to the accepted peer.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let peer = self.live_peer()?;
        let result = peer.send(payload).await;
        self.after_io(result).await
    }

    /// Receive one frame from the accepted peer.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let peer = self.live_peer()?;
        let result = peer.receive().await;
        self.after_io(result).await
    }

    /// Drop the current peer (if any) so `accept` can take a new one.
    pub async fn release_peer(&mut self) {
        if let Some(handle) = self.rejector.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(mut peer) = self.peer.take() {
            debug!("Releasing draft peer {:?}", self.peer_addr);
            if !peer.is_broken() {
                peer.shutdown().await;
            }
        }
        self.peer_addr = None;
    }

    /// Close the peer connection and the listening socket. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.release_peer().await;
        if self.listener.take().is_some() {
            info!("Target server on {} closed", self.local_addr);
        }
    }

    fn live_peer(&mut self) -> Result<&mut FramedChannel<TcpStream>> {
        match self.peer.as_mut() {
            Some(peer) if !peer.is_broken() => Ok(peer),
            _ => Err(SplitError::NotConnected),
        }
    }

    async fn after_io<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !self.peer.as_ref().is_some_and(|p| p.is_broken()) {
                return result;
            }
            if e.is_peer_closed() {
                info!("Draft peer {:?} disconnected", self.peer_addr);
            } else {
                warn!("Connection to draft peer {:?} broken: {}", self.peer_addr, e);
            }
            self.release_peer().await;
        }
        result
    }
}

impl Drop for PersistentServer {
    fn drop(&mut self) {
        if let Some(handle) = self.rejector.take() {
            handle.abort();
        }
    }
}

async fn reject_extra_peers(
    listener: Arc<TcpListener>,
    current: SocketAddr,
    rejected: Arc<AtomicU64>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                warn!(
                    "Rejecting connection from {}: already serving draft peer {}",
                    addr, current
                );
                rejected.fetch_add(1, Ordering::Relaxed);
                drop(stream);
            }
            Err(e) => {
                debug!("Accept failed while rejecting extra peers: {}", e);
                // Avoid spinning when the process is out of file descriptors.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
