//! # eBPF Program Loading and Attachment
//!
//! Loads compiled eBPF bytecode, publishes the layout tables the probes read,
//! and attaches programs to their hook points.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load eBPF bytecode from embedded binary
//! - [`publish_layout()`] - Fill `PROC_INFO`, `TRACE_UID`, `TRACE_STATS`, `KERNEL_OFFSETS`
//! - [`attach_read_tracepoints()`] - `syscalls/sys_{enter,exit}_read`
//! - [`attach_header_uprobes()`] - One uprobe per instrumented Go method
//!
//! `KERNEL_OFFSETS` is written last: its `ready` flag is what lets a probe
//! hit go past the readiness gate, so every other table is in place first.

use anyhow::{Context, Result};
use aya::{
    include_bytes_aligned,
    maps::HashMap,
    programs::{TracePoint, UProbe},
    Ebpf,
};
use aya_log::EbpfLogger;
use h2probe_common::{GoProcInfo, KernelOffsets, TraceStats, TraceUid};
use log::{info, warn};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::{AgentError, Pid};

/// eBPF program name → Go symbol it is attached to
pub const HEADER_UPROBES: [(&str, &str); 8] = [
    ("go_http2_client_conn_write_header", "net/http.(*http2ClientConn).writeHeader"),
    ("go_http2_client_conn_write_headers", "net/http.(*http2ClientConn).writeHeaders"),
    ("go_http2_server_conn_process_headers", "net/http.(*http2serverConn).processHeaders"),
    ("go_http2_server_conn_write_headers", "net/http.(*http2serverConn).writeHeaders"),
    (
        "go_http2_client_conn_read_loop_handle_response",
        "net/http.(*http2clientConnReadLoop).handleResponse",
    ),
    (
        "go_grpc_loopy_writer_write_header",
        "google.golang.org/grpc/internal/transport.(*loopyWriter).writeHeader",
    ),
    (
        "go_grpc_http2_server_operate_headers",
        "google.golang.org/grpc/internal/transport.(*http2Server).operateHeaders",
    ),
    (
        "go_grpc_http2_client_operate_headers",
        "google.golang.org/grpc/internal/transport.(*http2Client).operateHeaders",
    ),
];

/// Tracepoint program name → `syscalls` event
pub const READ_TRACEPOINTS: [(&str, &str); 2] =
    [("sys_enter_read", "sys_enter_read"), ("sys_exit_read", "sys_exit_read")];

/// Load the eBPF program binary
///
/// Always uses the release build: debug builds pull in formatting code the
/// BPF target cannot link.
///
/// # Errors
/// Returns an error if the eBPF program binary cannot be loaded
pub fn load_ebpf_program() -> Result<Ebpf> {
    let bpf =
        Ebpf::load(include_bytes_aligned!("../../../target/bpfel-unknown-none/release/h2probe"))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Socket identities start from a per-run seed so ids from two agent runs
/// against the same process do not collide.
#[must_use]
pub fn socket_id_seed() -> u64 {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    (secs & 0xffff_ffff) << 32
}

/// Publish the per-process layout and initialize the shared counters
///
/// # Errors
/// Returns an error if any of the maps is missing or rejects the insert
pub fn publish_layout(
    bpf: &mut Ebpf,
    pid: Pid,
    proc_info: &GoProcInfo,
    kernel: &KernelOffsets,
) -> Result<(), AgentError> {
    let mut procs: HashMap<_, u32, GoProcInfo> =
        HashMap::try_from(bpf.map_mut("PROC_INFO").ok_or(AgentError::MapNotFound("PROC_INFO"))?)?;
    procs.insert(pid.tgid(), proc_info, 0)?;
    info!("✓ Published Go layout for {pid} (version 0x{:06x})", proc_info.version);

    let mut uid: HashMap<_, u32, TraceUid> =
        HashMap::try_from(bpf.map_mut("TRACE_UID").ok_or(AgentError::MapNotFound("TRACE_UID"))?)?;
    uid.insert(0, TraceUid { socket_id: socket_id_seed() }, 0)?;

    let mut stats: HashMap<_, u32, TraceStats> = HashMap::try_from(
        bpf.map_mut("TRACE_STATS").ok_or(AgentError::MapNotFound("TRACE_STATS"))?,
    )?;
    stats.insert(0, TraceStats::default(), 0)?;

    let mut offsets: HashMap<_, u32, KernelOffsets> = HashMap::try_from(
        bpf.map_mut("KERNEL_OFFSETS").ok_or(AgentError::MapNotFound("KERNEL_OFFSETS"))?,
    )?;
    offsets.insert(0, kernel, 0)?;
    info!("✓ Published kernel offsets");

    Ok(())
}

/// Attach the `read(2)` tracepoints feeding the TCP sequence dedup table
///
/// # Errors
/// Returns an error if a program is missing or cannot be loaded or attached
pub fn attach_read_tracepoints(bpf: &mut Ebpf) -> Result<()> {
    for (name, event) in READ_TRACEPOINTS {
        let program: &mut TracePoint = bpf
            .program_mut(name)
            .with_context(|| format!("{name} program not found"))?
            .try_into()?;
        program.load()?;
        program.attach("syscalls", event)?;
        info!("✓ Attached tracepoint: syscalls/{event}");
    }
    Ok(())
}

/// Attach every header uprobe whose symbol exists in the target binary.
///
/// A binary that does not link gRPC (or only acts as client or server) lacks
/// some symbols; those are skipped with a warning. Returns the number of
/// attached probes.
///
/// # Errors
/// Returns an error if a program is missing from the object or none of the
/// symbols could be attached
pub fn attach_header_uprobes(bpf: &mut Ebpf, target_path: &str, pid: Pid) -> Result<usize> {
    let mut attached = 0;

    for (name, symbol) in HEADER_UPROBES {
        let program: &mut UProbe = bpf
            .program_mut(name)
            .ok_or_else(|| AgentError::ProbeAttachFailed {
                probe: name.to_string(),
                symbol: symbol.to_string(),
                error: "program not found in eBPF object".to_string(),
            })?
            .try_into()?;
        program.load()?;

        match program.attach(Some(symbol), 0, target_path, Some(pid.0)) {
            Ok(_) => {
                info!("✓ Attached uprobe: {symbol}");
                attached += 1;
            }
            Err(e) => {
                warn!("⚠️  Could not attach {name} to {symbol}: {e}");
            }
        }
    }

    if attached == 0 {
        return Err(AgentError::NothingAttached { binary: target_path.to_string() }.into());
    }
    Ok(attached)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uprobe_program_names_are_unique() {
        for (i, (a, _)) in HEADER_UPROBES.iter().enumerate() {
            for (b, _) in &HEADER_UPROBES[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_uprobe_symbols_are_go_methods() {
        for (_, symbol) in HEADER_UPROBES {
            assert!(symbol.contains(".(*"), "{symbol}");
        }
    }

    #[test]
    fn test_socket_id_seed_leaves_low_bits_free() {
        assert_eq!(socket_id_seed() & 0xffff_ffff, 0);
    }
}
