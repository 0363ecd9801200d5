//! Peer-to-peer calls negotiated through a shared document store.
//!
//! A caller writes an offer into a session record, a callee answers in the
//! same record, and both sides trickle ICE candidates through per-session
//! collections. [`CallClient`] is the entry point; [`NegotiationCoordinator`]
//! drives a single call.

pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod store;
pub mod transcription;
pub mod utils;

#[cfg(test)]
mod testing;

pub use commands::CallClient;
pub use config::CallConfig;
pub use error::{CallError, ConfigError, Result, StoreError};
pub use logger::{init_logging, CallEvent};
pub use peer::{CallState, NegotiationCoordinator};
pub use session::{CallRegistry, SessionId};
pub use store::{DocumentStore, MemoryStore};
pub use transcription::{HttpTranscriber, TranscriptionBridge};
