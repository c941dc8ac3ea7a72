//! Domain model for h2probe
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Direction, MessageKind, Pid, SocketId, StreamId, Transport};

pub use errors::{AgentError, ConfigError, DecodeError};
