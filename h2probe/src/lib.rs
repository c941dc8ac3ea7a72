//! # h2probe - HTTP/2 and gRPC Header Capture for Go Programs
//!
//! h2probe attaches eBPF uprobes to the HTTP/2 machinery inside a running,
//! unmodified Go binary (the `net/http` bundled HTTP/2 stack and `grpc-go`'s
//! transport) and reconstructs header blocks: request and response headers
//! with their stream id, direction, owning socket and TCP sequence.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Go Application                              │
//! │          (net/http HTTP/2, grpc-go transport)                   │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ method entry
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   eBPF Programs (Kernel)                        │
//! │  • Uprobes: 8 header entry points (h2probe-common::probes)      │
//! │  • Tracepoints: syscalls/sys_{enter,exit}_read (seq dedup)      │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer records
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     h2probe (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Layout     │──▶│   Probing    │──▶│   Blocks     │         │
//! │  │   (JSON)     │   │  (eBPF maps) │   │ (text/NDJSON)│         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`cli`]: Command-line arguments
//! - [`config`]: Layout file (Go struct offsets, itab addresses, kernel offsets)
//! - [`domain`]: Newtypes, record tags and error enums
//! - [`preflight`]: Privilege, kernel, and Go binary checks
//! - [`process_lookup`]: Resolve a process name to PID and executable
//! - [`probing`]: eBPF loading and attachment, record decoding, block grouping
//!
//! ## Data Flow
//!
//! 1. The layout file is parsed into `GoProcInfo` and `KernelOffsets`.
//! 2. Both are published into the eBPF maps before any program is attached.
//! 3. Each probe hit emits one record per header field plus an END record.
//! 4. [`probing::EventProcessor`] folds records into header blocks keyed by
//!    (socket, stream, message kind) and writes each block when its END
//!    record arrives.

pub mod cli;
pub mod config;
pub mod domain;
pub mod preflight;
pub mod probing;
pub mod process_lookup;
