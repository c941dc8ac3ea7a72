//! Keys and values of the shared eBPF maps (other than `PROC_INFO`)

/// Kernel structure offsets for the running kernel, published once by
/// userspace under key 0 of `KERNEL_OFFSETS`.
///
/// Probes treat a missing entry or `ready == 0` as "not initialized yet" and
/// abandon the event.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelOffsets {
    pub ready: u32,

    // task_struct -> files -> fdt -> fd[] -> file -> private_data -> sk
    pub task_files: u32,
    pub files_fdt: u32,
    pub fdtable_fd: u32,
    pub file_private_data: u32,
    pub socket_sk: u32,

    // struct tcp_sock
    pub tcp_write_seq: u32,
    pub tcp_copied_seq: u32,

    // struct sock_common
    pub skc_daddr: u32,
    pub skc_rcv_saddr: u32,
    pub skc_dport: u32,
    pub skc_num: u32,
    pub skc_family: u32,
    pub skc_v6_daddr: u32,
    pub skc_v6_rcv_saddr: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,
}

impl KernelOffsets {
    #[inline(always)]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready != 0
    }
}

/// `TCP_SEQ` key: the end of a read as seen from `tcp_sock.copied_seq`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TcpSeqKey {
    pub tgid: u32,
    pub fd: u32,
    pub tcp_seq_end: u32,
}

/// `SOCKET_INFO` value, keyed by [`conn_key`]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketInfo {
    pub uid: u64,
}

impl SocketInfo {
    #[inline(always)]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.uid != 0
    }
}

/// `TRACE_UID` value under key 0: the socket identity generator
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceUid {
    /// Last identity handed out
    pub socket_id: u64,
}

/// `TRACE_STATS` value under key 0
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceStats {
    /// Connections that received a fresh identity
    pub socket_map_count: u64,
    /// Records written to the ring buffer
    pub emitted_events: u64,
    /// Records the ring buffer refused (full or reservation failure)
    pub dropped_events: u64,
    /// Calls abandoned before emission (unready tables, unresolved socket, seq 0)
    pub abandoned_events: u64,
}

/// Counter selector for `TraceTables::bump_stat`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatId {
    SocketMapCount,
    EmittedEvents,
    DroppedEvents,
    AbandonedEvents,
}

/// `READ_ARGS` value: state carried from `read(2)` entry to exit
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingRead {
    pub fd: u32,
    /// `copied_seq` before the read
    pub seq_begin: u32,
}

/// `SOCKET_INFO` key for a descriptor of a process
#[inline(always)]
#[must_use]
pub fn conn_key(tgid: u32, fd: i32) -> u64 {
    #[allow(clippy::cast_sign_loss)]
    let fd = fd as u32;
    (u64::from(tgid) << 32) | u64::from(fd)
}
