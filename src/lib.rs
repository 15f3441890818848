//! PeerShare client-side transfer engine.
//!
//! Takes a file on one endpoint and reconstructs it byte-identically on the
//! other over a single ordered, reliable, message-oriented channel, while
//! surviving transient disconnects, adapting chunk sizes to path conditions,
//! persisting progress across restarts, and keeping the sender's in-flight
//! buffer bounded.
//!
//! The transport, the signalling rendezvous, the durable store, and the
//! clock are trait collaborators: production implementations live in
//! [`transport::webrtc`], [`signalling::ws`], and [`core::store::disk`];
//! in-memory fakes for every one of them make the engine testable without
//! a browser or a network.

pub mod core;
pub mod signalling;
pub mod transport;
pub mod utils;

pub use crate::core::config::{BackpressureMode, EngineConfig, RuntimeOverrides};
pub use crate::core::events::{EventBuffer, EventEnvelope, EventLog};
pub use crate::core::transfer::engine::{EngineEvent, TransferEngine};
pub use crate::core::transfer::{ErrorCode, TransferError};
