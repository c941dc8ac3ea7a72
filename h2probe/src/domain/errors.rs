//! Structured error types for h2probe
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::Pid;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("{binary} is not a Go binary (no .go.buildinfo section)")]
    NotGoBinary { binary: String },

    #[error("Failed to attach {probe} to {symbol}: {error}")]
    ProbeAttachFailed { probe: String, symbol: String, error: String },

    #[error("No probe could be attached to {binary}")]
    NothingAttached { binary: String },

    #[error("eBPF map {0} not found")]
    MapNotFound(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read layout file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid layout file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid Go version {0:?} (expected e.g. \"go1.21.4\")")]
    InvalidGoVersion(String),

    #[error("Unknown offset name {0:?}")]
    UnknownOffset(String),

    #[error("Missing required offset {0:?}")]
    MissingOffset(&'static str),

    #[error("Offset {name} = {value} does not fit in 32 bits")]
    OffsetOutOfRange { name: String, value: u64 },

    #[error("Invalid itab address for {name}: {value:?}")]
    InvalidItab { name: &'static str, value: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown record source {0}")]
    UnknownSource(u8),

    #[error("Unknown direction tag {0}")]
    UnknownDirection(u8),

    #[error("Unknown message kind {0}")]
    UnknownMessageKind(u8),

    #[error("Unknown protocol tag {0}")]
    UnknownProtocol(u8),

    #[error("Payload length {data_len} disagrees with name/value lengths {header_len}+{value_len}")]
    LengthMismatch { data_len: u32, header_len: u32, value_len: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_display() {
        let err = AgentError::ProcessNotFound(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 not found");
    }

    #[test]
    fn test_probe_attach_error() {
        let err = AgentError::ProbeAttachFailed {
            probe: "go_http2_server_conn_process_headers".to_string(),
            symbol: "net/http.(*http2serverConn).processHeaders".to_string(),
            error: "symbol not found".to_string(),
        };
        assert!(err.to_string().contains("go_http2_server_conn_process_headers"));
        assert!(err.to_string().contains("processHeaders"));
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::Truncated { expected: 120, actual: 8 };
        assert_eq!(err.to_string(), "Record truncated: need 120 bytes, got 8");
    }
}
