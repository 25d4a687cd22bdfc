//! Speculative-decoding records and the workers that exchange them.
//!
//! - **Tensor**: host buffer with an explicit dtype, shape and device tag
//! - **Interfaces**: proposals/scores records, two-phase wire staging, and
//!   the proposer/scorer traits
//! - **Codec**: versioned binary envelope for everything sent in a frame
//! - **Worker**: draft and target sides of one round trip

pub mod codec;
pub mod interfaces;
pub mod tensor;
pub mod worker;

pub use codec::{MessageKind, WireMessage};
pub use interfaces::{
    DeviceResident, ExecuteModelRequest, Logprob, PromptLogprobs, SpeculativeProposals,
    SpeculativeProposer, SpeculativeScorer, SpeculativeScores, Staged,
};
pub use tensor::{DType, Device, Element, Tensor};
pub use worker::{RemoteDraftWorker, RemoteTargetWorker};
