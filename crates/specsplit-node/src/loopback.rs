//! Stand-in proposer and scorer for exercising a link without models.

use async_trait::async_trait;
use specsplit_core::{
    DType, ExecuteModelRequest, Result, SpeculativeProposals, SpeculativeProposer,
    SpeculativeScorer, SpeculativeScores, Tensor,
};
use std::collections::HashSet;

/// Proposes `k` deterministic tokens per sequence.
#[derive(Debug, Default)]
pub struct SyntheticProposer {
    step: u64,
}

#[async_trait]
impl SpeculativeProposer for SyntheticProposer {
    async fn get_spec_proposals(
        &mut self,
        request: &ExecuteModelRequest,
        _seq_ids_with_bonus_token_in_last_step: &HashSet<u64>,
    ) -> Result<SpeculativeProposals> {
        self.step += 1;
        let batch = request.batch_size();
        let k = request.num_lookahead_slots;
        if batch == 0 || k == 0 {
            return SpeculativeProposals::no_proposals(batch);
        }

        let step = self.step as i64;
        let ids: Vec<i64> = request
            .seq_ids
            .iter()
            .flat_map(|&seq| (0..k as i64).map(move |j| (seq as i64 * 31 + step * 7 + j) % 32_000))
            .collect();
        let probs: Vec<f32> = (0..batch * k).map(|i| 1.0 / (2 + i % k) as f32).collect();

        SpeculativeProposals::new(
            Tensor::from_vec(vec![batch, k], &ids)?,
            Tensor::from_vec(vec![batch, k], &probs)?,
            Tensor::from_vec(vec![batch], &vec![k as i64; batch])?,
        )
    }
}

/// Accepts every proposed token with probability 1 and echoes the last
/// proposed token as the bonus token.
#[derive(Debug, Default)]
pub struct MirrorScorer;

#[async_trait]
impl SpeculativeScorer for MirrorScorer {
    async fn score_proposals(
        &mut self,
        _request: &ExecuteModelRequest,
        proposals: &SpeculativeProposals,
    ) -> Result<SpeculativeScores> {
        let batch = proposals.batch_size();
        if proposals.has_no_proposals() {
            // Bonus token only.
            return SpeculativeScores::new(
                Tensor::from_vec(vec![batch, 1], &vec![1.0f32; batch])?,
                Tensor::zeros(DType::F32, vec![batch, 1])?,
                Tensor::from_vec(vec![batch, 1], &vec![0i64; batch])?,
            );
        }

        let k = proposals.num_speculative_tokens();
        let width = k + 1;
        let proposed = proposals.proposal_token_ids().to_i64_vec()?;
        let mut token_ids = Vec::with_capacity(batch * width);
        for row in proposed.chunks(k.max(1)).take(batch) {
            token_ids.extend_from_slice(row);
            token_ids.push(row.last().copied().unwrap_or(0));
        }
        if k == 0 {
            token_ids.resize(batch, 0);
        }

        SpeculativeScores::new(
            Tensor::from_vec(vec![batch, width], &vec![1.0f32; batch * width])?,
            Tensor::zeros(DType::F32, vec![batch, width])?,
            Tensor::from_vec(vec![batch, width], &token_ids)?,
        )
    }
}
