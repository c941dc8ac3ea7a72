//! Go connection object → OS socket descriptor
//!
//! Every HTTP/2 transport keeps its connection as a `net.Conn` interface. For
//! plain TCP that is a `*net.TCPConn`, for TLS a `*tls.Conn` wrapping one, and
//! gRPC with transport credentials adds its own `syscallConn` wrapper around
//! the `*tls.Conn`. The locators below peel those layers until they reach
//! `netFD.pfd.Sysfd`.

use crate::abi::first_argument;
use crate::goruntime::{
    decode_interface, deref_field, is_recognized_wrapper, navigate, read_or_default, GoInterface,
};
use crate::host::{CallContext, UserMemory};
use crate::proc_info::{GoProcInfo, OffsetId};

/// Resolved descriptor and whether TLS was peeled on the way
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnFd {
    /// -1 when the connection type was not recognized
    pub fd: i32,
    pub tls: bool,
}

impl ConnFd {
    pub const UNKNOWN: ConnFd = ConnFd { fd: -1, tls: false };

    #[must_use]
    pub fn is_known(&self) -> bool {
        self.fd >= 0
    }
}

/// `*net.TCPConn` → `conn.fd` → `pfd.Sysfd`
#[inline(always)]
pub fn fd_from_tcp_conn_interface<M: UserMemory>(
    mem: &M,
    iface: GoInterface,
    info: &GoProcInfo,
) -> i32 {
    let net_fd = deref_field(mem, iface.data, OffsetId::NetConnFd, info);
    if net_fd == 0 {
        return -1;
    }
    #[allow(clippy::cast_possible_truncation)]
    let fd = read_or_default::<i64, M>(mem, navigate(net_fd, OffsetId::NetFdSysfd, info)) as i32;
    fd
}

/// Resolve the `net.Conn` interface stored at `addr`
#[inline(always)]
pub fn fd_from_tcp_or_tls_conn_interface<M: UserMemory>(
    mem: &M,
    addr: u64,
    info: &GoProcInfo,
) -> ConnFd {
    let iface = decode_interface(mem, addr);
    if iface.itab == 0 {
        return ConnFd::UNKNOWN;
    }

    if iface.itab == info.net_tcp_conn_itab {
        return ConnFd { fd: fd_from_tcp_conn_interface(mem, iface, info), tls: false };
    }

    if iface.itab == info.crypto_tls_conn_itab {
        let inner = decode_interface(mem, navigate(iface.data, OffsetId::TlsConnConn, info));
        if inner.itab != info.net_tcp_conn_itab {
            return ConnFd { fd: -1, tls: true };
        }
        return ConnFd { fd: fd_from_tcp_conn_interface(mem, inner, info), tls: true };
    }

    ConnFd::UNKNOWN
}

/// Strip gRPC's `syscallConn` wrapper from the interface at `addr`.
///
/// Returns the address to resolve next and whether a wrapper was removed.
/// Exactly one extra indirection is taken on a match, none otherwise.
#[inline(always)]
pub fn unwrap_grpc_conn<M: UserMemory>(mem: &M, addr: u64, info: &GoProcInfo) -> (u64, bool) {
    if !is_recognized_wrapper(mem, addr, info) {
        return (addr, false);
    }
    let outer = decode_interface(mem, addr);
    let inner = decode_interface(mem, outer.data);
    (inner.data, true)
}

#[inline(always)]
fn fd_from_grpc_conn_field<M: UserMemory>(mem: &M, addr: u64, info: &GoProcInfo) -> ConnFd {
    let (addr, wrapped) = unwrap_grpc_conn(mem, addr, info);
    let mut conn = fd_from_tcp_or_tls_conn_interface(mem, addr, info);
    conn.tls |= wrapped;
    conn
}

// ============================================================================
// Call-site locators
// ============================================================================

/// `(*http2serverConn).X` receiver → `sc.conn`
#[inline(always)]
pub fn server_conn_fd<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> ConnFd
where
    C: CallContext,
    M: UserMemory,
{
    let sc = first_argument(ctx, mem, info);
    fd_from_tcp_or_tls_conn_interface(mem, navigate(sc, OffsetId::Http2ServerConnConn, info), info)
}

/// `*http2ClientConn` → `cc.tconn`
#[inline(always)]
pub fn client_conn_fd_from<M: UserMemory>(mem: &M, cc: u64, info: &GoProcInfo) -> ConnFd {
    fd_from_tcp_or_tls_conn_interface(mem, navigate(cc, OffsetId::Http2ClientConnTconn, info), info)
}

/// `(*http2ClientConn).X` receiver → `cc.tconn`
#[inline(always)]
pub fn client_conn_fd<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> ConnFd
where
    C: CallContext,
    M: UserMemory,
{
    client_conn_fd_from(mem, first_argument(ctx, mem, info), info)
}

/// `(*http2clientConnReadLoop).X` receiver → `rl.cc` → `cc.tconn`
#[inline(always)]
pub fn client_read_loop_fd<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> ConnFd
where
    C: CallContext,
    M: UserMemory,
{
    let rl = first_argument(ctx, mem, info);
    let cc = deref_field(mem, rl, OffsetId::Http2ClientConnReadLoopCc, info);
    client_conn_fd_from(mem, cc, info)
}

/// `(*transport.http2Client).X` receiver → `t.conn`
#[inline(always)]
pub fn grpc_client_fd<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> ConnFd
where
    C: CallContext,
    M: UserMemory,
{
    let t = first_argument(ctx, mem, info);
    fd_from_grpc_conn_field(mem, navigate(t, OffsetId::GrpcHttp2ClientConn, info), info)
}

/// `(*transport.http2Server).X` receiver → `t.conn`
#[inline(always)]
pub fn grpc_server_fd<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> ConnFd
where
    C: CallContext,
    M: UserMemory,
{
    let t = first_argument(ctx, mem, info);
    fd_from_grpc_conn_field(mem, navigate(t, OffsetId::GrpcHttp2ServerConn, info), info)
}

/// `(*transport.loopyWriter).X` receiver → `framer` → `writer` → `conn`
#[inline(always)]
pub fn loopy_writer_fd<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> ConnFd
where
    C: CallContext,
    M: UserMemory,
{
    let l = first_argument(ctx, mem, info);
    let framer = deref_field(mem, l, OffsetId::GrpcLoopyWriterFramer, info);
    let writer = deref_field(mem, framer, OffsetId::GrpcFramerWriter, info);
    fd_from_grpc_conn_field(mem, navigate(writer, OffsetId::GrpcBufWriterConn, info), info)
}

/// `loopyWriter.side`: 0 for the client transport, 1 for the server
#[inline(always)]
pub fn loopy_writer_side<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> u32
where
    C: CallContext,
    M: UserMemory,
{
    let l = first_argument(ctx, mem, info);
    read_or_default::<u32, M>(mem, navigate(l, OffsetId::GrpcLoopyWriterSide, info))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::Register;
    use crate::proc_info::go_version;
    use crate::testing::{MockCall, MockHost};

    pub const TCP_ITAB: u64 = 0x0070_1000;
    pub const TLS_ITAB: u64 = 0x0070_2000;
    pub const SYSCALL_CONN_ITAB: u64 = 0x0070_3000;

    /// Layout shaped like a Go 1.20 binary
    pub fn layout() -> GoProcInfo {
        let mut info = GoProcInfo::new(go_version(1, 20, 5))
            .with_offset(OffsetId::Http2ServerConnConn, 0x10)
            .with_offset(OffsetId::Http2ClientConnTconn, 0x08)
            .with_offset(OffsetId::Http2ClientConnNextStreamId, 0xdc)
            .with_offset(OffsetId::Http2ClientConnReadLoopCc, 0x00)
            .with_offset(OffsetId::Http2MetaHeadersFrameHeaders, 0x00)
            .with_offset(OffsetId::Http2MetaHeadersFrameFields, 0x08)
            .with_offset(OffsetId::Http2FrameHeaderStreamId, 0x08)
            .with_offset(OffsetId::Http2WriteResHeadersStreamId, 0x00)
            .with_offset(OffsetId::Http2WriteResHeadersHttpResCode, 0x08)
            .with_offset(OffsetId::Http2WriteResHeadersDate, 0x38)
            .with_offset(OffsetId::Http2WriteResHeadersContentType, 0x48)
            .with_offset(OffsetId::Http2WriteResHeadersContentLength, 0x58)
            .with_offset(OffsetId::GrpcHttp2ClientConn, 0x40)
            .with_offset(OffsetId::GrpcHttp2ServerConn, 0x20)
            .with_offset(OffsetId::GrpcLoopyWriterFramer, 0x28)
            .with_offset(OffsetId::GrpcLoopyWriterSide, 0x00)
            .with_offset(OffsetId::GrpcFramerWriter, 0x00)
            .with_offset(OffsetId::GrpcBufWriterConn, 0x28)
            .with_offset(OffsetId::TlsConnConn, 0x00)
            .with_offset(OffsetId::NetConnFd, 0x00)
            .with_offset(OffsetId::NetFdSysfd, 0x10)
            .with_offset(OffsetId::RuntimeGGoid, 0x98);
        info.net_tcp_conn_itab = TCP_ITAB;
        info.crypto_tls_conn_itab = TLS_ITAB;
        info.credentials_syscall_conn_itab = SYSCALL_CONN_ITAB;
        info
    }

    /// Lay out a `*net.TCPConn` for `fd` and store it as a `net.Conn` at `slot`
    pub fn place_tcp_conn(host: &mut MockHost, slot: u64, tcp_conn: u64, fd: i32) {
        let net_fd = tcp_conn + 0x100;
        host.memory.write(slot, &GoInterface { itab: TCP_ITAB, data: tcp_conn });
        host.memory.write_u64(tcp_conn, net_fd);
        host.memory.write(net_fd + 0x10, &i64::from(fd));
    }

    /// Same, wrapped in a `*tls.Conn`
    pub fn place_tls_conn(host: &mut MockHost, slot: u64, tls_conn: u64, fd: i32) {
        host.memory.write(slot, &GoInterface { itab: TLS_ITAB, data: tls_conn });
        place_tcp_conn(host, tls_conn, tls_conn + 0x1000, fd);
    }

    #[test]
    fn test_tcp_conn_resolves_sysfd() {
        let mut host = MockHost::new();
        let info = layout();
        place_tcp_conn(&mut host, 0x1000, 0x2000, 7);
        assert_eq!(
            fd_from_tcp_or_tls_conn_interface(&host, 0x1000, &info),
            ConnFd { fd: 7, tls: false }
        );
    }

    #[test]
    fn test_tls_conn_marks_tls() {
        let mut host = MockHost::new();
        let info = layout();
        place_tls_conn(&mut host, 0x1000, 0x3000, 9);
        assert_eq!(
            fd_from_tcp_or_tls_conn_interface(&host, 0x1000, &info),
            ConnFd { fd: 9, tls: true }
        );
    }

    #[test]
    fn test_unknown_conn_type_is_minus_one() {
        let mut host = MockHost::new();
        let info = layout();
        host.memory.write(0x1000, &GoInterface { itab: 0x0099_0000, data: 0x2000 });
        assert_eq!(fd_from_tcp_or_tls_conn_interface(&host, 0x1000, &info), ConnFd::UNKNOWN);
        assert_eq!(fd_from_tcp_or_tls_conn_interface(&host, 0x5000, &info), ConnFd::UNKNOWN);
    }

    #[test]
    fn test_grpc_wrapper_takes_one_extra_indirection() {
        let mut host = MockHost::new();
        let info = layout();
        let transport = 0x10_000_u64;
        let conn_field = transport + 0x20;
        // syscallConn{Conn: *tls.Conn}: the wrapper's data holds the inner interface
        host.memory.write(conn_field, &GoInterface { itab: SYSCALL_CONN_ITAB, data: 0x11_000 });
        host.memory.write(0x11_000, &GoInterface { itab: 0x0070_4000, data: 0x12_000 });
        place_tcp_conn(&mut host, 0x12_000, 0x13_000, 12);

        let ctx = MockCall::new(0).with_register(Register::Rax, transport);
        assert_eq!(grpc_server_fd(&ctx, &host, &info), ConnFd { fd: 12, tls: true });
    }

    #[test]
    fn test_grpc_without_wrapper_takes_none() {
        let mut host = MockHost::new();
        let info = layout();
        let transport = 0x10_000_u64;
        place_tcp_conn(&mut host, transport + 0x40, 0x13_000, 5);

        let ctx = MockCall::new(0).with_register(Register::Rax, transport);
        assert_eq!(grpc_client_fd(&ctx, &host, &info), ConnFd { fd: 5, tls: false });
        assert_eq!(unwrap_grpc_conn(&host, transport + 0x40, &info), (transport + 0x40, false));
    }

    #[test]
    fn test_loopy_writer_chain_and_side() {
        let mut host = MockHost::new();
        let info = layout();
        let loopy = 0x20_000_u64;
        let framer = 0x21_000_u64;
        let writer = 0x22_000_u64;
        host.memory.write_u32(loopy, 1);
        host.memory.write_u64(loopy + 0x28, framer);
        host.memory.write_u64(framer, writer);
        place_tcp_conn(&mut host, writer + 0x28, 0x23_000, 21);

        let ctx = MockCall::new(0).with_register(Register::Rax, loopy);
        assert_eq!(loopy_writer_fd(&ctx, &host, &info), ConnFd { fd: 21, tls: false });
        assert_eq!(loopy_writer_side(&ctx, &host, &info), 1);
    }

    #[test]
    fn test_read_loop_reaches_client_conn() {
        let mut host = MockHost::new();
        let info = layout();
        let rl = 0x30_000_u64;
        let cc = 0x31_000_u64;
        host.memory.write_u64(rl, cc);
        place_tls_conn(&mut host, cc + 0x08, 0x32_000, 4);

        let ctx = MockCall::new(0).with_register(Register::Rax, rl);
        assert_eq!(client_read_loop_fd(&ctx, &host, &info), ConnFd { fd: 4, tls: true });
    }
}
