//! Specsplit Core - transport and data contracts for split speculative decoding.
//!
//! A draft model on one host proposes tokens; a target model on another host
//! scores them. This crate provides the persistent, length-framed TCP link
//! between the two and the records that travel over it.
//!
//! # Example
//!
//! ```rust,ignore
//! use specsplit_core::{ClientConfig, Device, ExecuteModelRequest, RemoteDraftWorker};
//!
//! #[tokio::main]
//! async fn main() -> specsplit_core::Result<()> {
//!     let mut worker = RemoteDraftWorker::new(
//!         my_proposer,
//!         ClientConfig::new("10.0.0.2", 7860),
//!         Device::Npu(0),
//!     );
//!
//!     let request = ExecuteModelRequest::new(vec![0, 1, 2, 3], 4);
//!     let scores = worker.execute_model(&request).await?;
//!     println!("Scored {} sequences", scores.batch_size());
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod spec_decode;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{ClientConfig, ServerConfig, TransportConfig};
pub use error::{Result, SplitError, TransportError};
pub use spec_decode::{
    DType, Device, DeviceResident, ExecuteModelRequest, Logprob, PromptLogprobs,
    RemoteDraftWorker, RemoteTargetWorker, SpeculativeProposals, SpeculativeProposer,
    SpeculativeScorer, SpeculativeScores, Staged, Tensor, WireMessage,
};
pub use transport::{ConnectionState, FramedChannel, PersistentClient, PersistentServer};
