//! Draft-side and target-side workers that run speculative decoding across
//! the persistent link.
//!
//! Each `execute_model` call is exactly one round trip: one proposals frame
//! out, one scores frame back. Heartbeats may be interleaved between round
//! trips but never inside one.

use super::codec::WireMessage;
use super::interfaces::{
    DeviceResident, ExecuteModelRequest, SpeculativeProposer, SpeculativeScorer, SpeculativeScores,
};
use super::tensor::Device;
use crate::cancel::CancellationToken;
use crate::config::{ClientConfig, ServerConfig};
use crate::error::{Result, SplitError, TransportError};
use crate::transport::{PersistentClient, PersistentServer};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Draft-side worker: proposes locally, scores remotely.
pub struct RemoteDraftWorker<P> {
    proposer: P,
    client: PersistentClient,
    device: Device,
    next_nonce: u64,
    steps: u64,
}

impl<P: SpeculativeProposer> RemoteDraftWorker<P> {
    /// Create a worker. Scores are moved onto `device` as they arrive.
    pub fn new(proposer: P, config: ClientConfig, device: Device) -> Self {
        Self {
            proposer,
            client: PersistentClient::new(config),
            device,
            next_nonce: 1,
            steps: 0,
        }
    }

    pub fn proposer(&self) -> &P {
        &self.proposer
    }

    pub fn client(&self) -> &PersistentClient {
        &self.client
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Round trips completed successfully.
    pub fn steps_completed(&self) -> u64 {
        self.steps
    }

    /// Run one decode step: propose, ship the proposals to the target and
    /// return its scores on the local device.
    ///
    /// A failure after the proposals were sent closes the connection; the
    /// step is never resent and the caller decides whether to retry it.
    pub async fn execute_model(
        &mut self,
        request: &ExecuteModelRequest,
    ) -> Result<SpeculativeScores> {
        let proposals = self
            .proposer
            .get_spec_proposals(request, &request.seq_ids_with_bonus_token_in_last_step)
            .await?;
        debug!("Step {}: {:?}", self.steps + 1, proposals);
        let payload = WireMessage::Proposals(proposals.stage_for_wire()).encode()?;

        self.client.ensure_connected().await?;
        self.client.send(&payload).await?;
        let reply = self.client.receive().await?;

        match self.decode_reply(reply).await? {
            WireMessage::Scores(staged) => {
                self.steps += 1;
                Ok(staged.unstage_from_wire(self.device))
            }
            other => {
                self.client.close().await;
                Err(SplitError::protocol(format!(
                    "expected scores from target, got {:?}",
                    other.kind()
                )))
            }
        }
    }

    /// Application-level keepalive. Returns the round-trip time.
    ///
    /// The target must answer with a matching ack within `timeout`; otherwise
    /// the connection is closed so the next step reconnects.
    pub async fn heartbeat(&mut self, timeout: Duration) -> Result<Duration> {
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        let payload = WireMessage::Heartbeat { nonce }.encode()?;

        self.client.ensure_connected().await?;
        let started = Instant::now();
        self.client.send(&payload).await?;

        let reply = match tokio::time::timeout(timeout, self.client.receive()).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!("Heartbeat {} unanswered after {:?}", nonce, timeout);
                self.client.close().await;
                return Err(TransportError::TimedOut(timeout).into());
            }
        };

        match self.decode_reply(reply).await? {
            WireMessage::HeartbeatAck { nonce: acked } if acked == nonce => {
                let rtt = started.elapsed();
                debug!("Heartbeat {} acknowledged in {:?}", nonce, rtt);
                Ok(rtt)
            }
            other => {
                self.client.close().await;
                Err(SplitError::protocol(format!(
                    "expected ack for heartbeat {}, got {:?}",
                    nonce, other
                )))
            }
        }
    }

    /// Close the connection to the target.
    pub async fn close(&mut self) {
        self.client.close().await;
    }

    async fn decode_reply(&mut self, reply: Vec<u8>) -> Result<WireMessage> {
        match WireMessage::decode(reply) {
            Ok(message) => Ok(message),
            Err(e) => {
                warn!("Undecodable reply from target: {}", e);
                self.client.close().await;
                Err(e)
            }
        }
    }
}

/// Target-side worker: receives proposals, scores them, replies.
pub struct RemoteTargetWorker<S> {
    scorer: S,
    server: PersistentServer,
    device: Device,
    steps: u64,
    heartbeats: u64,
}

impl<S: SpeculativeScorer> RemoteTargetWorker<S> {
    /// Wrap an already bound server. Proposals are moved onto `device`
    /// before scoring.
    pub fn new(scorer: S, server: PersistentServer, device: Device) -> Self {
        Self {
            scorer,
            server,
            device,
            steps: 0,
            heartbeats: 0,
        }
    }

    /// Bind a server and wrap it.
    pub async fn bind(scorer: S, config: ServerConfig, device: Device) -> Result<Self> {
        let server = PersistentServer::bind(config).await?;
        Ok(Self::new(scorer, server, device))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    pub fn server(&self) -> &PersistentServer {
        &self.server
    }

    pub fn steps_completed(&self) -> u64 {
        self.steps
    }

    pub fn heartbeats_answered(&self) -> u64 {
        self.heartbeats
    }

    /// Wait for the draft peer to connect.
    pub async fn accept_peer(&mut self) -> Result<SocketAddr> {
        self.server.accept().await
    }

    /// Serve one decode step for the connected peer.
    ///
    /// Heartbeats that arrive first are answered in place. Any failure
    /// releases the peer so the draft side observes a closed connection
    /// instead of waiting for a reply that will never come.
    pub async fn execute_model(
        &mut self,
        request: &ExecuteModelRequest,
    ) -> Result<SpeculativeScores> {
        let result = self.serve_step(request).await;
        if result.is_err() && self.server.has_peer() {
            self.server.release_peer().await;
        }
        result
    }

    /// Accept peers and serve steps until `shutdown` is cancelled.
    ///
    /// `request_for_step` supplies the local request for each step. A peer
    /// that leaves or misbehaves is dropped and the next one is accepted.
    pub async fn serve<F>(
        &mut self,
        mut request_for_step: F,
        shutdown: &CancellationToken,
    ) -> Result<()>
    where
        F: FnMut() -> ExecuteModelRequest,
    {
        while !shutdown.is_cancelled() {
            if !self.server.has_peer() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = self.server.accept() => { accepted?; }
                }
                continue;
            }

            let request = request_for_step();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.execute_model(&request) => match result {
                    Ok(_) => {}
                    Err(e) if e.is_peer_closed() => {
                        info!("Draft peer disconnected; waiting for reconnect")
                    }
                    Err(e) => warn!("Step failed, dropping draft peer: {}", e),
                },
            }
        }

        info!(
            "Target worker stopping after {} steps ({} heartbeats)",
            self.steps, self.heartbeats
        );
        self.server.close().await;
        Ok(())
    }

    async fn serve_step(&mut self, request: &ExecuteModelRequest) -> Result<SpeculativeScores> {
        loop {
            let frame = self.server.receive().await?;
            match WireMessage::decode(frame)? {
                WireMessage::Heartbeat { nonce } => {
                    let ack = WireMessage::HeartbeatAck { nonce }.encode()?;
                    self.server.send(&ack).await?;
                    self.heartbeats += 1;
                    debug!("Answered heartbeat {}", nonce);
                }
                WireMessage::Proposals(staged) => {
                    let proposals = staged.unstage_from_wire(self.device);
                    let scores = self.scorer.score_proposals(request, &proposals).await?;
                    let reply = WireMessage::Scores(scores.clone().stage_for_wire()).encode()?;
                    self.server.send(&reply).await?;
                    self.steps += 1;
                    debug!("Step {} scored {:?}", self.steps, scores);
                    return Ok(scores);
                }
                other => {
                    return Err(SplitError::protocol(format!(
                        "unexpected {:?} message from draft peer",
                        other.kind()
                    )));
                }
            }
        }
    }
}
