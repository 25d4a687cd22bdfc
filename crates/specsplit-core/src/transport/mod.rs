//! Persistent point-to-point transport between the draft and target sides.
//!
//! Carries opaque, length-prefixed frames over TCP between exactly one client
//! and one server.
//!
//! # Architecture
//!
//! - **Protocol**: frame encoding and the full-length read loop
//! - **Channel**: one stream wrapped as an ordered message channel
//! - **Client**: draft side, bounded-retry connect and reconnect on failure
//! - **Server**: target side, accepts a single peer and rejects the rest

pub mod channel;
pub mod client;
pub mod protocol;
pub mod retry;
pub mod server;

pub use channel::{ConnectionState, FramedChannel, Liveness, PeerStream};
pub use client::PersistentClient;
pub use protocol::{encode_frame, read_frame, write_frame};
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use server::PersistentServer;
