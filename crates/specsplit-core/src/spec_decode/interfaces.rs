//! Records exchanged between the draft and target sides, and the proposer /
//! scorer seams that produce them.

use super::tensor::{Device, Tensor};
use crate::error::{Result, SplitError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Log-probability of one token at one position.
#[derive(Debug, Clone, PartialEq)]
pub struct Logprob {
    pub logprob: f32,
    /// Rank of the token in the vocabulary distribution.
    pub rank: Option<u32>,
    pub decoded_token: Option<String>,
}

impl Logprob {
    pub fn new(logprob: f32) -> Self {
        Self {
            logprob,
            rank: None,
            decoded_token: None,
        }
    }
}

/// Per-position prompt log-probabilities for one request.
///
/// The first prompt position has no logprob and is `None`.
pub type PromptLogprobs = Vec<Option<BTreeMap<u32, Logprob>>>;

/// What a worker is asked to do for one decode step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteModelRequest {
    /// Sequences in the batch, in batch order.
    pub seq_ids: Vec<u64>,
    /// Number of speculative tokens to propose per sequence (k).
    pub num_lookahead_slots: usize,
    /// Sequences that were assigned a bonus token in their last forward pass.
    pub seq_ids_with_bonus_token_in_last_step: HashSet<u64>,
}

impl ExecuteModelRequest {
    pub fn new(seq_ids: Vec<u64>, num_lookahead_slots: usize) -> Self {
        Self {
            seq_ids,
            num_lookahead_slots,
            seq_ids_with_bonus_token_in_last_step: HashSet::new(),
        }
    }

    pub fn with_bonus_tokens(mut self, seq_ids: impl IntoIterator<Item = u64>) -> Self {
        self.seq_ids_with_bonus_token_in_last_step = seq_ids.into_iter().collect();
        self
    }

    pub fn batch_size(&self) -> usize {
        self.seq_ids.len()
    }
}

/// Draft tokens proposed for one decode step.
///
/// `proposal_token_ids` is `[batch, k]`, `proposal_probs` shares that leading
/// shape, and `proposal_lens[i]` is the number of valid proposals for
/// sequence `i` (never more than `k`). When `no_proposals` is set the shapes
/// still hold but the token ids and lengths carry nothing usable.
#[derive(Clone, PartialEq)]
pub struct SpeculativeProposals {
    proposal_token_ids: Tensor,
    proposal_probs: Tensor,
    proposal_lens: Tensor,
    no_proposals: bool,
}

impl SpeculativeProposals {
    /// Build a proposals batch, rejecting inconsistent shapes or lengths.
    pub fn new(
        proposal_token_ids: Tensor,
        proposal_probs: Tensor,
        proposal_lens: Tensor,
    ) -> Result<Self> {
        Self::from_parts(proposal_token_ids, proposal_probs, proposal_lens, false)
    }

    /// An empty batch of `batch_size` sequences with `no_proposals` set.
    pub fn no_proposals(batch_size: usize) -> Result<Self> {
        Ok(Self {
            proposal_token_ids: Tensor::from_vec::<i64>(vec![batch_size, 0], &[])?,
            proposal_probs: Tensor::from_vec::<f32>(vec![batch_size, 0], &[])?,
            proposal_lens: Tensor::from_vec(vec![batch_size], &vec![0i64; batch_size])?,
            no_proposals: true,
        })
    }

    pub(crate) fn from_parts(
        proposal_token_ids: Tensor,
        proposal_probs: Tensor,
        proposal_lens: Tensor,
        no_proposals: bool,
    ) -> Result<Self> {
        let proposals = Self {
            proposal_token_ids,
            proposal_probs,
            proposal_lens,
            no_proposals,
        };
        let k = proposals.validate_shapes()?;
        if !no_proposals {
            proposals.validate_lens(k)?;
        }
        Ok(proposals)
    }

    /// Check that the three tensors agree on `[batch, k]`; returns `k`.
    fn validate_shapes(&self) -> Result<usize> {
        let ids = &self.proposal_token_ids;
        if ids.ndim() != 2 || !ids.dtype().is_integer() {
            return Err(SplitError::invalid_record(format!(
                "proposal_token_ids must be a 2-D integer tensor, got {:?}",
                ids
            )));
        }
        let (batch, k) = (ids.shape()[0], ids.shape()[1]);

        let probs = &self.proposal_probs;
        if probs.ndim() < 2 || probs.shape()[..2] != ids.shape()[..] {
            return Err(SplitError::invalid_record(format!(
                "proposal_probs shape {:?} does not lead with [{}, {}]",
                probs.shape(),
                batch,
                k
            )));
        }
        if !probs.dtype().is_float() {
            return Err(SplitError::invalid_record(format!(
                "proposal_probs must be floating point, got {}",
                probs.dtype()
            )));
        }

        let lens = &self.proposal_lens;
        if lens.shape() != [batch] {
            return Err(SplitError::invalid_record(format!(
                "proposal_lens shape {:?} does not match batch size {}",
                lens.shape(),
                batch
            )));
        }
        Ok(k)
    }

    fn validate_lens(&self, k: usize) -> Result<()> {
        for (i, len) in self.proposal_lens.to_i64_vec()?.into_iter().enumerate() {
            if len < 0 || len as u64 > k as u64 {
                return Err(SplitError::invalid_record(format!(
                    "proposal_lens[{}] = {} is outside 0..={}",
                    i, len, k
                )));
            }
        }
        Ok(())
    }

    pub fn proposal_token_ids(&self) -> &Tensor {
        &self.proposal_token_ids
    }

    pub fn proposal_probs(&self) -> &Tensor {
        &self.proposal_probs
    }

    pub fn proposal_lens(&self) -> &Tensor {
        &self.proposal_lens
    }

    pub fn has_no_proposals(&self) -> bool {
        self.no_proposals
    }

    pub fn batch_size(&self) -> usize {
        self.proposal_lens.dim(0).unwrap_or(0)
    }

    /// Proposal width `k`.
    pub fn num_speculative_tokens(&self) -> usize {
        self.proposal_token_ids.dim(1).unwrap_or(0)
    }

    /// Move every tensor to `device`.
    pub fn to(&mut self, device: Device) -> &mut Self {
        self.proposal_token_ids = self.proposal_token_ids.to(device);
        self.proposal_probs = self.proposal_probs.to(device);
        self.proposal_lens = self.proposal_lens.to(device);
        self
    }

    pub fn cpu(&mut self) -> &mut Self {
        self.to(Device::Cpu)
    }

    pub fn npu(&mut self, ordinal: u32) -> &mut Self {
        self.to(Device::Npu(ordinal))
    }
}

impl fmt::Debug for SpeculativeProposals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeculativeProposals")
            .field("proposal_token_ids", &self.proposal_token_ids.shape())
            .field("proposal_probs", &self.proposal_probs.shape())
            .field("proposal_lens", &self.proposal_lens.shape())
            .field("no_proposals", &self.no_proposals)
            .finish()
    }
}

/// Target-model scores for one proposals batch.
#[derive(Clone, PartialEq)]
pub struct SpeculativeScores {
    probs: Tensor,
    logprobs: Tensor,
    token_ids: Tensor,
    hidden_states: Option<Tensor>,
    prompt_logprobs: Option<Vec<PromptLogprobs>>,
}

impl SpeculativeScores {
    /// Build a scores record. `probs`, `logprobs` and `token_ids` must share
    /// the same leading `[sequence, position]` shape.
    pub fn new(probs: Tensor, logprobs: Tensor, token_ids: Tensor) -> Result<Self> {
        if token_ids.ndim() < 2 {
            return Err(SplitError::invalid_record(format!(
                "token_ids must be at least 2-D, got shape {:?}",
                token_ids.shape()
            )));
        }
        let lead = &token_ids.shape()[..2];
        for (name, t) in [("probs", &probs), ("logprobs", &logprobs)] {
            if t.ndim() < 2 || &t.shape()[..2] != lead {
                return Err(SplitError::invalid_record(format!(
                    "{} shape {:?} does not lead with {:?}",
                    name,
                    t.shape(),
                    lead
                )));
            }
        }
        Ok(Self {
            probs,
            logprobs,
            token_ids,
            hidden_states: None,
            prompt_logprobs: None,
        })
    }

    /// Attach the scoring model's last hidden states (one row per sequence).
    pub fn with_hidden_states(mut self, hidden_states: Tensor) -> Result<Self> {
        if hidden_states.dim(0) != self.token_ids.dim(0) {
            return Err(SplitError::invalid_record(format!(
                "hidden_states shape {:?} does not match batch size {:?}",
                hidden_states.shape(),
                self.token_ids.dim(0)
            )));
        }
        self.hidden_states = Some(hidden_states);
        Ok(self)
    }

    /// Attach prompt logprobs, one entry per request.
    pub fn with_prompt_logprobs(mut self, prompt_logprobs: Vec<PromptLogprobs>) -> Self {
        self.prompt_logprobs = Some(prompt_logprobs);
        self
    }

    pub fn probs(&self) -> &Tensor {
        &self.probs
    }

    pub fn logprobs(&self) -> &Tensor {
        &self.logprobs
    }

    pub fn token_ids(&self) -> &Tensor {
        &self.token_ids
    }

    pub fn hidden_states(&self) -> Option<&Tensor> {
        self.hidden_states.as_ref()
    }

    pub fn prompt_logprobs(&self) -> Option<&[PromptLogprobs]> {
        self.prompt_logprobs.as_deref()
    }

    pub fn batch_size(&self) -> usize {
        self.token_ids.dim(0).unwrap_or(0)
    }

    /// Move every tensor to `device`.
    pub fn to(&mut self, device: Device) -> &mut Self {
        self.probs = self.probs.to(device);
        self.logprobs = self.logprobs.to(device);
        self.token_ids = self.token_ids.to(device);
        if let Some(hidden) = self.hidden_states.as_mut() {
            *hidden = hidden.to(device);
        }
        self
    }

    pub fn cpu(&mut self) -> &mut Self {
        self.to(Device::Cpu)
    }

    pub fn npu(&mut self, ordinal: u32) -> &mut Self {
        self.to(Device::Npu(ordinal))
    }
}

impl fmt::Debug for SpeculativeScores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpeculativeScores(probs={:?}, token_ids={:?})",
            self.probs.shape(),
            self.token_ids.shape()
        )
    }
}

/// A record whose tensors live on some device.
pub trait DeviceResident: Sized {
    /// Where the record's primary tensor lives.
    fn device(&self) -> Device;

    /// Move every tensor to `device`.
    fn place(&mut self, device: Device);

    /// Move the record to host memory for sending.
    fn stage_for_wire(self) -> Staged<Self> {
        Staged::stage(self)
    }
}

impl DeviceResident for SpeculativeProposals {
    fn device(&self) -> Device {
        self.proposal_token_ids.device()
    }

    fn place(&mut self, device: Device) {
        self.to(device);
    }
}

impl DeviceResident for SpeculativeScores {
    fn device(&self) -> Device {
        self.token_ids.device()
    }

    fn place(&mut self, device: Device) {
        self.to(device);
    }
}

/// A record whose tensors are all in host memory.
///
/// The wire codec only encodes and decodes `Staged` values, so device-resident
/// data can never reach a socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged<T> {
    record: T,
    origin: Device,
}

impl<T: DeviceResident> Staged<T> {
    fn stage(mut record: T) -> Self {
        let origin = record.device();
        record.place(Device::Cpu);
        Self { record, origin }
    }

    /// Wrap a record that was just decoded into host memory.
    pub(crate) fn from_wire(record: T) -> Self {
        Self {
            record,
            origin: Device::Cpu,
        }
    }

    /// The staged record.
    pub fn get(&self) -> &T {
        &self.record
    }

    /// Device the record was on before staging (`Cpu` for decoded records).
    pub fn origin(&self) -> Device {
        self.origin
    }

    /// Move the record onto `device` and hand it back.
    pub fn unstage_from_wire(self, device: Device) -> T {
        let mut record = self.record;
        record.place(device);
        record
    }
}

/// Produces draft tokens for a decode step.
#[async_trait]
pub trait SpeculativeProposer: Send {
    /// Propose up to `request.num_lookahead_slots` tokens per sequence.
    async fn get_spec_proposals(
        &mut self,
        request: &ExecuteModelRequest,
        seq_ids_with_bonus_token_in_last_step: &HashSet<u64>,
    ) -> Result<SpeculativeProposals>;
}

/// Scores draft tokens with the target model.
#[async_trait]
pub trait SpeculativeScorer: Send {
    async fn score_proposals(
        &mut self,
        request: &ExecuteModelRequest,
        proposals: &SpeculativeProposals,
    ) -> Result<SpeculativeScores>;
}
