//! # eBPF Kernel-Side Instrumentation
//!
//! Uprobes on Go `net/http` (bundled HTTP/2) and `grpc-go` transport methods
//! that reconstruct HTTP/2 header events, plus `read(2)` tracepoints that keep
//! the TCP sequence dedup table current.
//!
//! The capture logic lives in `h2probe_common::probes`; this crate only binds
//! it to `aya-ebpf` maps and helpers ([`KernelHost`], [`GoCall`]).
//!
//! ## Programs
//!
//! - **Uprobes**: `go_http2_*`, `go_grpc_*` - one per instrumented Go method
//! - **Tracepoints**: `sys_enter_read`, `sys_exit_read` - read sequence recording
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (4MB) for header records
//! - `PROC_INFO` - Per-process Go layout, keyed by tgid
//! - `KERNEL_OFFSETS` - Kernel struct offsets under key 0
//! - `TRACE_UID` / `TRACE_STATS` - Identity generator and counters under key 0
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_user, bpf_probe_read_user_buf, gen::bpf_get_current_task,
    },
    macros::{map, tracepoint, uprobe},
    maps::{HashMap, LruHashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::warn;
use h2probe_common::{
    host::{
        CallContext, EventSink, KernelAccess, Register, TaskInfo, TraceTables, UserMemory,
    },
    probes,
    record::TASK_COMM_LEN,
    socket,
    tables::StatId,
    GoProcInfo, Http2Scratch, KernelOffsets, PendingRead, SocketInfo, TcpSeqKey, TraceStats,
    TraceUid,
};

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer carrying header records to userspace
///
/// - **Size**: 4MB
/// - **Usage**: Kernel writes sized views of the scratch area with
///   `EVENTS.output()`, userspace reads with `ring_buf.next()`
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(4 * 1024 * 1024, 0);

/// Map: tgid → Go layout table
///
/// Published by userspace before attaching; a process without an entry is
/// ignored by every probe.
#[map]
static PROC_INFO: HashMap<u32, GoProcInfo> = HashMap::with_max_entries(64, 0);

/// Map: 0 → kernel struct offsets (`ready` set once published)
#[map]
static KERNEL_OFFSETS: HashMap<u32, KernelOffsets> = HashMap::with_max_entries(1, 0);

/// Map: (tgid, fd, copied_seq after read) → copied_seq before read
#[map]
static TCP_SEQ: LruHashMap<TcpSeqKey, u32> = LruHashMap::with_max_entries(65536, 0);

/// Map: tgid << 32 | fd → connection identity
#[map]
static SOCKET_INFO: LruHashMap<u64, SocketInfo> = LruHashMap::with_max_entries(65536, 0);

/// Map: 0 → last connection identity handed out
#[map]
static TRACE_UID: HashMap<u32, TraceUid> = HashMap::with_max_entries(1, 0);

/// Map: 0 → counters read by `diagnostics`
#[map]
static TRACE_STATS: HashMap<u32, TraceStats> = HashMap::with_max_entries(1, 0);

/// Map: pid_tgid → state of an in-flight `read(2)`
#[map]
static READ_ARGS: HashMap<u64, PendingRead> = HashMap::with_max_entries(10240, 0);

/// One record assembly area per CPU
#[map]
static HTTP2_SCRATCH: PerCpuArray<Http2Scratch> = PerCpuArray::with_max_entries(1, 0);

// ============================================================================
// Host adapters
// ============================================================================

/// Maps and helpers of the running program
struct KernelHost;

impl UserMemory for KernelHost {
    #[inline(always)]
    fn read_user<T: Copy>(&self, addr: u64) -> Option<T> {
        unsafe { bpf_probe_read_user(addr as *const T).ok() }
    }

    #[inline(always)]
    fn read_user_bytes(&self, addr: u64, dst: &mut [u8]) -> bool {
        unsafe { bpf_probe_read_user_buf(addr as *const u8, dst).is_ok() }
    }
}

impl KernelHost {
    /// task_struct → files → fdt → fd[fd] → file → private_data (socket) → sk
    #[inline(always)]
    fn walk_to_sock(&self, fd: i32, offsets: &KernelOffsets) -> Option<u64> {
        let task = unsafe { bpf_get_current_task() };
        let files: u64 = self.read_kernel(task + u64::from(offsets.task_files))?;
        let fdt: u64 = self.read_kernel(files + u64::from(offsets.files_fdt))?;
        let fd_array: u64 = self.read_kernel(fdt + u64::from(offsets.fdtable_fd))?;
        let file: u64 = self.read_kernel(fd_array + (fd as u64) * 8)?;
        let socket: u64 = self.read_kernel(file + u64::from(offsets.file_private_data))?;
        self.read_kernel(socket + u64::from(offsets.socket_sk))
    }
}

impl KernelAccess for KernelHost {
    #[inline(always)]
    fn read_kernel<T: Copy>(&self, addr: u64) -> Option<T> {
        if addr == 0 {
            return None;
        }
        unsafe { bpf_probe_read_kernel(addr as *const T).ok() }
    }

    #[inline(always)]
    fn socket_from_fd(&self, fd: i32, offsets: &KernelOffsets) -> u64 {
        if fd < 0 {
            return 0;
        }
        self.walk_to_sock(fd, offsets).unwrap_or(0)
    }
}

impl TaskInfo for KernelHost {
    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn ktime_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
    }
}

impl TraceTables for KernelHost {
    #[inline(always)]
    fn proc_info(&self, tgid: u32) -> Option<&GoProcInfo> {
        unsafe { PROC_INFO.get(&tgid) }
    }

    #[inline(always)]
    fn kernel_offsets(&self) -> Option<&KernelOffsets> {
        unsafe { KERNEL_OFFSETS.get(&0) }
    }

    #[inline(always)]
    fn read_seq_begin(&self, key: &TcpSeqKey) -> Option<u32> {
        unsafe { TCP_SEQ.get(key).copied() }
    }

    #[inline(always)]
    fn record_read_seq(&self, key: &TcpSeqKey, seq_begin: u32) {
        let _ = TCP_SEQ.insert(key, &seq_begin, 0);
    }

    #[inline(always)]
    fn socket_info(&self, conn_key: u64) -> Option<SocketInfo> {
        unsafe { SOCKET_INFO.get(&conn_key).copied() }
    }

    #[inline(always)]
    fn store_socket_info(&self, conn_key: u64, info: &SocketInfo) {
        let _ = SOCKET_INFO.insert(&conn_key, info, 0);
    }

    #[inline(always)]
    fn next_socket_uid(&self) -> Option<u64> {
        let uid = TRACE_UID.get_ptr_mut(&0)?;
        let counter = unsafe { AtomicU64::from_ptr(core::ptr::addr_of_mut!((*uid).socket_id)) };
        Some(counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    #[inline(always)]
    fn bump_stat(&self, stat: StatId) {
        let Some(stats) = TRACE_STATS.get_ptr_mut(&0) else {
            return;
        };
        let field = unsafe {
            match stat {
                StatId::SocketMapCount => core::ptr::addr_of_mut!((*stats).socket_map_count),
                StatId::EmittedEvents => core::ptr::addr_of_mut!((*stats).emitted_events),
                StatId::DroppedEvents => core::ptr::addr_of_mut!((*stats).dropped_events),
                StatId::AbandonedEvents => core::ptr::addr_of_mut!((*stats).abandoned_events),
            }
        };
        unsafe { AtomicU64::from_ptr(field) }.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    fn pending_read(&self, pid_tgid: u64) -> Option<PendingRead> {
        unsafe { READ_ARGS.get(&pid_tgid).copied() }
    }

    #[inline(always)]
    fn store_pending_read(&self, pid_tgid: u64, pending: &PendingRead) {
        let _ = READ_ARGS.insert(&pid_tgid, pending, 0);
    }

    #[inline(always)]
    fn clear_pending_read(&self, pid_tgid: u64) {
        let _ = READ_ARGS.remove(&pid_tgid);
    }
}

impl EventSink for KernelHost {
    #[inline(always)]
    fn emit(&self, record: &[u8]) -> bool {
        EVENTS.output(record, 0).is_ok()
    }
}

/// Registers captured at a uprobe hit (x86_64)
struct GoCall<'a>(&'a ProbeContext);

impl CallContext for GoCall<'_> {
    #[inline(always)]
    fn register(&self, reg: Register) -> u64 {
        let regs = unsafe { &*self.0.regs };
        let value = match reg {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdi => regs.rdi,
            Register::Rsi => regs.rsi,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R14 => regs.r14,
        };
        value as u64
    }

    #[inline(always)]
    fn stack_pointer(&self) -> u64 {
        unsafe { (*self.0.regs).rsp as u64 }
    }
}

/// Hand the per-CPU scratch area and host adapters to a probe body
#[inline(always)]
fn run_probe<F>(ctx: &ProbeContext, probe: F) -> Result<(), i64>
where
    F: FnOnce(&KernelHost, &GoCall<'_>, &mut Http2Scratch),
{
    let Some(scratch) = HTTP2_SCRATCH.get_ptr_mut(0) else {
        warn!(ctx, "per-cpu scratch unavailable");
        return Err(1);
    };
    let scratch = unsafe { &mut *scratch };
    probe(&KernelHost, &GoCall(ctx), scratch);
    Ok(())
}

// ============================================================================
// eBPF Program Hooks - net/http bundled HTTP/2
// ============================================================================

/// Hook: net/http.(*http2ClientConn).writeHeader
#[uprobe]
pub fn go_http2_client_conn_write_header(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::client_conn_write_header(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: net/http.(*http2ClientConn).writeHeaders
#[uprobe]
pub fn go_http2_client_conn_write_headers(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::client_conn_write_headers(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: net/http.(*http2serverConn).processHeaders
#[uprobe]
pub fn go_http2_server_conn_process_headers(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::server_conn_process_headers(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: net/http.(*http2serverConn).writeHeaders
#[uprobe]
pub fn go_http2_server_conn_write_headers(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::server_conn_write_headers(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: net/http.(*http2clientConnReadLoop).handleResponse
#[uprobe]
pub fn go_http2_client_conn_read_loop_handle_response(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::client_read_loop_handle_response(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// ============================================================================
// eBPF Program Hooks - grpc-go transport
// ============================================================================

/// Hook: google.golang.org/grpc/internal/transport.(*loopyWriter).writeHeader
#[uprobe]
pub fn go_grpc_loopy_writer_write_header(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::grpc_loopy_writer_write_header(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: google.golang.org/grpc/internal/transport.(*http2Server).operateHeaders
#[uprobe]
pub fn go_grpc_http2_server_operate_headers(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::grpc_http2_server_operate_headers(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: google.golang.org/grpc/internal/transport.(*http2Client).operateHeaders
#[uprobe]
pub fn go_grpc_http2_client_operate_headers(ctx: ProbeContext) -> u32 {
    match run_probe(&ctx, |h, c, s| probes::grpc_http2_client_operate_headers(h, c, s)) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

// ============================================================================
// eBPF Program Hooks - read(2) sequence recording
// ============================================================================

/// Hook: syscalls/sys_enter_read
///
/// Layout from /sys/kernel/debug/tracing/events/syscalls/sys_enter_read/format:
/// `fd` at offset 16.
#[tracepoint]
pub fn sys_enter_read(ctx: TracePointContext) -> u32 {
    match try_sys_enter_read(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sys_enter_read(ctx: &TracePointContext) -> Result<(), i64> {
    let fd: u64 = unsafe { ctx.read_at(16)? };
    socket::read_entry(&KernelHost, fd as i32);
    Ok(())
}

/// Hook: syscalls/sys_exit_read (`ret` at offset 16)
#[tracepoint]
pub fn sys_exit_read(ctx: TracePointContext) -> u32 {
    match try_sys_exit_read(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sys_exit_read(ctx: &TracePointContext) -> Result<(), i64> {
    let ret: i64 = unsafe { ctx.read_at(16)? };
    socket::read_exit(&KernelHost, ret);
    Ok(())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
