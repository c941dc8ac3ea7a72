//! # Shared Data Structures and Probe Pipeline (eBPF ↔ Userspace)
//!
//! Types shared between the kernel-side eBPF programs and the userspace agent,
//! plus the header-capture pipeline itself. All map and record types are
//! `#[repr(C)]` so both sides agree on layout.
//!
//! The pipeline is written against the traits in [`host`] so the same code runs
//! inside the eBPF object (`h2probe-ebpf`, backed by `aya-ebpf` helpers and
//! maps) and in host unit tests (backed by an in-memory mock).
//!
//! ## Layers, leaves first
//!
//! 1. [`abi`] - Go calling convention, register vs. stack
//! 2. [`goruntime`] - interface/string/slice shapes, offset-table navigation
//! 3. [`conn`] - `net.Conn` → socket descriptor, TLS and gRPC unwrapping
//! 4. [`socket`] - sequence numbers, five-tuple, connection identity
//! 5. [`emit`] - bounded header records and terminal markers
//! 6. [`probes`] - one entry point per instrumented Go method
//!
//! ## Key Types
//!
//! - [`GoProcInfo`] - per-process layout table (`PROC_INFO` map)
//! - [`KernelOffsets`] - kernel struct offsets (`KERNEL_OFFSETS` map)
//! - [`Http2EventHeader`] - fixed part of every ring buffer record
//! - [`TraceStats`] - agent-side counters (`TRACE_STATS` map)

#![cfg_attr(not(any(test, feature = "user")), no_std)]

pub mod abi;
pub mod conn;
pub mod emit;
pub mod goruntime;
pub mod host;
pub mod probes;
pub mod proc_info;
pub mod record;
pub mod socket;
pub mod tables;

#[cfg(test)]
pub(crate) mod testing;

pub use proc_info::{go_version, GoProcInfo, OffsetId, GO_REGABI_VERSION, OFFSET_COUNT};
pub use record::{
    FiveTuple, Http2EventHeader, Http2Payload, Http2Scratch, EVENT_HEADER_SIZE, MAX_EVENT_SIZE,
};
pub use tables::{KernelOffsets, PendingRead, SocketInfo, TcpSeqKey, TraceStats, TraceUid};

#[cfg(feature = "user")]
use aya::Pod;

// Values crossing the map/ring buffer boundary as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for GoProcInfo {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for KernelOffsets {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TcpSeqKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SocketInfo {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TraceUid {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TraceStats {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for PendingRead {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for Http2EventHeader {}
