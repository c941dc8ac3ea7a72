//! Socket enrichment: sequence, five-tuple, connection identity
//!
//! Runs once per probe hit, before any header field is emitted. On success the
//! record header carries everything except `msg_type` and `data_len`; on any
//! failure `tcp_seq` stays 0 and the assembler emits nothing for the call.

use crate::emit::Http2Invocation;
use crate::host::{KernelAccess, ProbeHost, TaskInfo, TraceTables};
use crate::record::{
    FiveTuple, AF_INET, AF_INET6, DATA_SOURCE_GO_HTTP2_UPROBE, IPPROTO_TCP, PROTO_HTTP2,
    PROTO_TLS_HTTP2, T_EGRESS, T_INGRESS,
};
use crate::tables::{conn_key, KernelOffsets, PendingRead, SocketInfo, StatId, TcpSeqKey};

/// Fill the record header for a call on `fd`.
///
/// Returns false, and bumps the abandoned counter, when the event cannot be
/// attributed to a socket.
#[inline(always)]
pub fn fill_common_socket<H: ProbeHost>(
    host: &H,
    inv: &mut Http2Invocation<'_>,
    fd: i32,
    direction: u8,
    coroutine_id: u64,
) -> bool {
    inv.header_mut().tcp_seq = 0;
    let filled = enrich(host, inv, fd, direction, coroutine_id).is_some();
    if !filled {
        host.bump_stat(StatId::AbandonedEvents);
    }
    filled
}

#[inline(always)]
fn enrich<H: ProbeHost>(
    host: &H,
    inv: &mut Http2Invocation<'_>,
    fd: i32,
    direction: u8,
    coroutine_id: u64,
) -> Option<()> {
    let offsets = *host.kernel_offsets().filter(|o| o.is_ready())?;
    if fd < 0 {
        return None;
    }
    let sk = host.socket_from_fd(fd, &offsets);
    if sk == 0 {
        return None;
    }

    let tcp_seq = resolve_sequence(host, &offsets, sk, fd, direction);
    if tcp_seq == 0 {
        return None;
    }

    let pid_tgid = host.pid_tgid();
    #[allow(clippy::cast_possible_truncation)]
    let (tgid, pid) = ((pid_tgid >> 32) as u32, pid_tgid as u32);
    let socket_id = socket_identity(host, tgid, fd)?;

    let data_type = if inv.tls { PROTO_TLS_HTTP2 } else { PROTO_HTTP2 };
    let header = inv.header_mut();
    header.source = DATA_SOURCE_GO_HTTP2_UPROBE;
    header.direction = direction;
    header.data_type = data_type;
    header.coroutine_id = coroutine_id;
    header.timestamp_ns = host.ktime_ns();
    header.comm = host.comm();
    header.socket_id = socket_id;
    header.tgid = tgid;
    header.pid = pid;
    header.tuple = read_five_tuple(host, &offsets, sk);
    // Last: a nonzero sequence marks the header complete
    header.tcp_seq = tcp_seq;
    Some(())
}

/// Egress uses the live write cursor. Ingress only sees the cursor after the
/// read and recovers the read's start from the dedup table; a miss is 0.
#[inline(always)]
fn resolve_sequence<H>(host: &H, offsets: &KernelOffsets, sk: u64, fd: i32, direction: u8) -> u32
where
    H: KernelAccess + TaskInfo + TraceTables,
{
    if direction == T_EGRESS {
        return host.read_kernel::<u32>(sk + u64::from(offsets.tcp_write_seq)).unwrap_or(0);
    }

    let seq_end = host.read_kernel::<u32>(sk + u64::from(offsets.tcp_copied_seq)).unwrap_or(0);
    if seq_end == 0 {
        return 0;
    }
    #[allow(clippy::cast_sign_loss)]
    let key = TcpSeqKey { tgid: host.tgid(), fd: fd as u32, tcp_seq_end: seq_end };
    host.read_seq_begin(&key).unwrap_or(0)
}

#[inline(always)]
fn read_five_tuple<K: KernelAccess>(host: &K, offsets: &KernelOffsets, sk: u64) -> FiveTuple {
    let field = |off: u32| sk + u64::from(off);
    let mut tuple = FiveTuple { l4_protocol: IPPROTO_TCP, ..FiveTuple::default() };

    tuple.sport = host.read_kernel::<u16>(field(offsets.skc_num)).unwrap_or(0);
    tuple.dport = u16::from_be(host.read_kernel::<u16>(field(offsets.skc_dport)).unwrap_or(0));

    match host.read_kernel::<u16>(field(offsets.skc_family)).unwrap_or(0) {
        AF_INET => {
            let local: [u8; 4] = host.read_kernel(field(offsets.skc_rcv_saddr)).unwrap_or_default();
            let remote: [u8; 4] = host.read_kernel(field(offsets.skc_daddr)).unwrap_or_default();
            tuple.saddr[..4].copy_from_slice(&local);
            tuple.daddr[..4].copy_from_slice(&remote);
            tuple.addr_len = 4;
        }
        AF_INET6 => {
            tuple.saddr = host.read_kernel(field(offsets.skc_v6_rcv_saddr)).unwrap_or_default();
            tuple.daddr = host.read_kernel(field(offsets.skc_v6_daddr)).unwrap_or_default();
            tuple.addr_len = 16;
        }
        _ => {}
    }
    tuple
}

/// Stable identity for `(tgid, fd)`, allocated from the generator on first
/// sight.
///
/// Two first sights racing on different CPUs may both allocate; the later
/// store wins and the earlier id is never seen again.
#[inline(always)]
pub fn socket_identity<T: TraceTables>(tables: &T, tgid: u32, fd: i32) -> Option<u64> {
    let key = conn_key(tgid, fd);
    if let Some(info) = tables.socket_info(key).filter(SocketInfo::is_valid) {
        return Some(info.uid);
    }
    let uid = tables.next_socket_uid()?;
    tables.store_socket_info(key, &SocketInfo { uid });
    tables.bump_stat(StatId::SocketMapCount);
    Some(uid)
}

// ============================================================================
// read(2) sequence recording
// ============================================================================

#[inline(always)]
fn inet_socket<K: KernelAccess>(host: &K, offsets: &KernelOffsets, fd: i32) -> Option<u64> {
    let sk = host.socket_from_fd(fd, offsets);
    if sk == 0 {
        return None;
    }
    match host.read_kernel::<u16>(sk + u64::from(offsets.skc_family))? {
        AF_INET | AF_INET6 => Some(sk),
        _ => None,
    }
}

/// `sys_enter_read`: remember where the socket's read cursor stood
#[inline(always)]
pub fn read_entry<H: ProbeHost>(host: &H, fd: i32) {
    if fd < 0 || host.proc_info(host.tgid()).is_none() {
        return;
    }
    let Some(offsets) = host.kernel_offsets().filter(|o| o.is_ready()).copied() else {
        return;
    };
    let Some(sk) = inet_socket(host, &offsets, fd) else {
        return;
    };
    let Some(seq_begin) = host.read_kernel::<u32>(sk + u64::from(offsets.tcp_copied_seq)) else {
        return;
    };
    #[allow(clippy::cast_sign_loss)]
    let pending = PendingRead { fd: fd as u32, seq_begin };
    host.store_pending_read(host.pid_tgid(), &pending);
}

/// `sys_exit_read`: record `(tgid, fd, end) -> begin` for a read that
/// consumed bytes
#[inline(always)]
pub fn read_exit<H: ProbeHost>(host: &H, ret: i64) {
    let pid_tgid = host.pid_tgid();
    let Some(pending) = host.pending_read(pid_tgid) else {
        return;
    };
    host.clear_pending_read(pid_tgid);
    if ret <= 0 {
        return;
    }
    let Some(offsets) = host.kernel_offsets().filter(|o| o.is_ready()).copied() else {
        return;
    };
    #[allow(clippy::cast_possible_wrap)]
    let Some(sk) = inet_socket(host, &offsets, pending.fd as i32) else {
        return;
    };
    let seq_end = host.read_kernel::<u32>(sk + u64::from(offsets.tcp_copied_seq)).unwrap_or(0);
    if seq_end == 0 || seq_end == pending.seq_begin {
        return;
    }
    let key = TcpSeqKey { tgid: host.tgid(), fd: pending.fd, tcp_seq_end: seq_end };
    host.record_read_seq(&key, pending.seq_begin);
}
