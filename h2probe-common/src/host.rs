//! Host services the probe pipeline runs against
//!
//! Inside the kernel these are `aya-ebpf` helpers and maps (see the
//! `h2probe-ebpf` crate); in unit tests they are an in-memory mock. Everything
//! here is infallible from the caller's point of view: a failed read is
//! `None`, a failed map update is ignored.

use crate::proc_info::GoProcInfo;
use crate::record::TASK_COMM_LEN;
use crate::tables::{KernelOffsets, PendingRead, SocketInfo, StatId, TcpSeqKey};

/// amd64 registers the Go register ABI and runtime use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdi,
    Rsi,
    R8,
    R9,
    R10,
    R11,
    /// Current `g` under the register ABI
    R14,
}

/// Registers captured at a uprobe hit
pub trait CallContext {
    fn register(&self, reg: Register) -> u64;
    fn stack_pointer(&self) -> u64;
}

/// Bounded reads of the traced process's memory.
///
/// Reads are all-or-nothing: either every requested byte is copied or the
/// destination is left untouched.
pub trait UserMemory {
    fn read_user<T: Copy>(&self, addr: u64) -> Option<T>;
    fn read_user_bytes(&self, addr: u64, dst: &mut [u8]) -> bool;
}

/// Kernel-side reads for socket resolution
pub trait KernelAccess {
    fn read_kernel<T: Copy>(&self, addr: u64) -> Option<T>;

    /// Address of the `struct sock` behind `fd` in the current task, 0 if
    /// the descriptor does not resolve.
    fn socket_from_fd(&self, fd: i32, offsets: &KernelOffsets) -> u64;
}

/// Identity of the current task
pub trait TaskInfo {
    fn pid_tgid(&self) -> u64;
    fn ktime_ns(&self) -> u64;
    fn comm(&self) -> [u8; TASK_COMM_LEN];

    #[inline(always)]
    fn tgid(&self) -> u32 {
        (self.pid_tgid() >> 32) as u32
    }
}

/// Shared maps, each accessed through single-key operations
pub trait TraceTables {
    fn proc_info(&self, tgid: u32) -> Option<&GoProcInfo>;
    fn kernel_offsets(&self) -> Option<&KernelOffsets>;

    fn read_seq_begin(&self, key: &TcpSeqKey) -> Option<u32>;
    fn record_read_seq(&self, key: &TcpSeqKey, seq_begin: u32);

    fn socket_info(&self, conn_key: u64) -> Option<SocketInfo>;
    fn store_socket_info(&self, conn_key: u64, info: &SocketInfo);

    /// Atomically advance the identity generator and return the new value,
    /// `None` if the generator entry is missing.
    fn next_socket_uid(&self) -> Option<u64>;

    fn bump_stat(&self, stat: StatId);

    fn pending_read(&self, pid_tgid: u64) -> Option<PendingRead>;
    fn store_pending_read(&self, pid_tgid: u64, pending: &PendingRead);
    fn clear_pending_read(&self, pid_tgid: u64);
}

/// Asynchronous, lossy event channel
pub trait EventSink {
    /// Returns false when the channel refused the record
    fn emit(&self, record: &[u8]) -> bool;
}

/// Everything a probe needs from its environment
pub trait ProbeHost: UserMemory + KernelAccess + TaskInfo + TraceTables + EventSink {}

impl<T> ProbeHost for T where T: UserMemory + KernelAccess + TaskInfo + TraceTables + EventSink {}
