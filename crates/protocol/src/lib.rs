//! ccbot Protocol
//!
//! Shared types for the ccbot bridge: transcript events produced by the
//! monitor, delivery tasks consumed by the per-user pipeline, and the chat
//! transport contract the pipeline sends through.

// Re-exports
pub mod transport;
pub mod types;

pub use transport::{ChatTransport, TransportError};
pub use types::*;
