//! Per-process Go layout table
//!
//! Published by userspace into the `PROC_INFO` map (keyed by tgid) before any
//! probe in that process can do work. Go does not keep struct layouts stable
//! across releases, so every field the probes touch is reached through an
//! [`OffsetId`] looked up in [`GoProcInfo::offsets`].

/// Pack a Go version into the form stored in [`GoProcInfo::version`].
#[must_use]
pub const fn go_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | (minor << 8) | patch
}

/// First Go release using the register-based calling convention on amd64.
///
/// The offset table is produced against the same boundary, so both the ABI
/// choice and the layout agree on which side of it a process is.
pub const GO_REGABI_VERSION: u32 = go_version(1, 17, 0);

/// Number of entries in [`GoProcInfo::offsets`]
pub const OFFSET_COUNT: usize = 22;

/// Semantic field identifiers resolved through the per-process offset table.
///
/// Names follow `<Go type><field>`; the `Http2` prefix refers to the copy of
/// `x/net/http2` bundled into `net/http`, `Grpc` to
/// `google.golang.org/grpc/internal/transport`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OffsetId {
    /// `http2serverConn.conn` (`net.Conn`)
    Http2ServerConnConn = 0,
    /// `http2ClientConn.tconn` (`net.Conn`)
    Http2ClientConnTconn = 1,
    /// `http2ClientConn.nextStreamID` (`uint32`)
    Http2ClientConnNextStreamId = 2,
    /// `http2clientConnReadLoop.cc` (`*http2ClientConn`)
    Http2ClientConnReadLoopCc = 3,
    /// `http2MetaHeadersFrame.http2HeadersFrame` (`*http2HeadersFrame`)
    Http2MetaHeadersFrameHeaders = 4,
    /// `http2MetaHeadersFrame.Fields` (`[]hpack.HeaderField`)
    Http2MetaHeadersFrameFields = 5,
    /// `http2FrameHeader.StreamID` reached from `*http2HeadersFrame`
    Http2FrameHeaderStreamId = 6,
    /// `http2writeResHeaders.streamID`
    Http2WriteResHeadersStreamId = 7,
    /// `http2writeResHeaders.httpResCode`
    Http2WriteResHeadersHttpResCode = 8,
    /// `http2writeResHeaders.date`
    Http2WriteResHeadersDate = 9,
    /// `http2writeResHeaders.contentType`
    Http2WriteResHeadersContentType = 10,
    /// `http2writeResHeaders.contentLength`
    Http2WriteResHeadersContentLength = 11,
    /// `transport.http2Client.conn` (`net.Conn`)
    GrpcHttp2ClientConn = 12,
    /// `transport.http2Server.conn` (`net.Conn`)
    GrpcHttp2ServerConn = 13,
    /// `transport.loopyWriter.framer` (`*framer`)
    GrpcLoopyWriterFramer = 14,
    /// `transport.loopyWriter.side` (`side`)
    GrpcLoopyWriterSide = 15,
    /// `transport.framer.writer` (`*bufWriter`)
    GrpcFramerWriter = 16,
    /// `transport.bufWriter.conn` (`net.Conn`)
    GrpcBufWriterConn = 17,
    /// `tls.Conn.conn` (`net.Conn`)
    TlsConnConn = 18,
    /// `net.conn.fd` (`*netFD`) inside `net.TCPConn`
    NetConnFd = 19,
    /// `netFD.pfd.Sysfd` (`int`)
    NetFdSysfd = 20,
    /// `runtime.g.goid`
    RuntimeGGoid = 21,
}

impl OffsetId {
    pub const ALL: [OffsetId; OFFSET_COUNT] = [
        OffsetId::Http2ServerConnConn,
        OffsetId::Http2ClientConnTconn,
        OffsetId::Http2ClientConnNextStreamId,
        OffsetId::Http2ClientConnReadLoopCc,
        OffsetId::Http2MetaHeadersFrameHeaders,
        OffsetId::Http2MetaHeadersFrameFields,
        OffsetId::Http2FrameHeaderStreamId,
        OffsetId::Http2WriteResHeadersStreamId,
        OffsetId::Http2WriteResHeadersHttpResCode,
        OffsetId::Http2WriteResHeadersDate,
        OffsetId::Http2WriteResHeadersContentType,
        OffsetId::Http2WriteResHeadersContentLength,
        OffsetId::GrpcHttp2ClientConn,
        OffsetId::GrpcHttp2ServerConn,
        OffsetId::GrpcLoopyWriterFramer,
        OffsetId::GrpcLoopyWriterSide,
        OffsetId::GrpcFramerWriter,
        OffsetId::GrpcBufWriterConn,
        OffsetId::TlsConnConn,
        OffsetId::NetConnFd,
        OffsetId::NetFdSysfd,
        OffsetId::RuntimeGGoid,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Key used for this field in the userspace layout file
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            OffsetId::Http2ServerConnConn => "http2_server_conn_conn",
            OffsetId::Http2ClientConnTconn => "http2_client_conn_tconn",
            OffsetId::Http2ClientConnNextStreamId => "http2_client_conn_next_stream_id",
            OffsetId::Http2ClientConnReadLoopCc => "http2_client_conn_read_loop_cc",
            OffsetId::Http2MetaHeadersFrameHeaders => "http2_meta_headers_frame_headers",
            OffsetId::Http2MetaHeadersFrameFields => "http2_meta_headers_frame_fields",
            OffsetId::Http2FrameHeaderStreamId => "http2_frame_header_stream_id",
            OffsetId::Http2WriteResHeadersStreamId => "http2_write_res_headers_stream_id",
            OffsetId::Http2WriteResHeadersHttpResCode => "http2_write_res_headers_http_res_code",
            OffsetId::Http2WriteResHeadersDate => "http2_write_res_headers_date",
            OffsetId::Http2WriteResHeadersContentType => "http2_write_res_headers_content_type",
            OffsetId::Http2WriteResHeadersContentLength => {
                "http2_write_res_headers_content_length"
            }
            OffsetId::GrpcHttp2ClientConn => "grpc_http2_client_conn",
            OffsetId::GrpcHttp2ServerConn => "grpc_http2_server_conn",
            OffsetId::GrpcLoopyWriterFramer => "grpc_loopy_writer_framer",
            OffsetId::GrpcLoopyWriterSide => "grpc_loopy_writer_side",
            OffsetId::GrpcFramerWriter => "grpc_framer_writer",
            OffsetId::GrpcBufWriterConn => "grpc_buf_writer_conn",
            OffsetId::TlsConnConn => "tls_conn_conn",
            OffsetId::NetConnFd => "net_conn_fd",
            OffsetId::NetFdSysfd => "net_fd_sysfd",
            OffsetId::RuntimeGGoid => "runtime_g_goid",
        }
    }
}

/// Layout and identity table for one traced Go process.
///
/// Stored as the value of the `PROC_INFO` eBPF map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GoProcInfo {
    /// Packed compiler version, see [`go_version`]
    pub version: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Byte offsets indexed by [`OffsetId::index`]
    pub offsets: [u32; OFFSET_COUNT],

    /// itab address of `*net.TCPConn` as `net.Conn`
    pub net_tcp_conn_itab: u64,

    /// itab address of `*crypto/tls.Conn` as `net.Conn`
    pub crypto_tls_conn_itab: u64,

    /// itab address of gRPC's `credentials/internal.syscallConn` as `net.Conn`
    ///
    /// gRPC wraps the TLS connection in this type when the peer negotiated
    /// TLS, so a match also means the HTTP/2 traffic is TLS-carried.
    pub credentials_syscall_conn_itab: u64,
}

impl GoProcInfo {
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self {
            version,
            _padding: 0,
            offsets: [0; OFFSET_COUNT],
            net_tcp_conn_itab: 0,
            crypto_tls_conn_itab: 0,
            credentials_syscall_conn_itab: 0,
        }
    }

    #[must_use]
    pub const fn with_offset(mut self, id: OffsetId, offset: u32) -> Self {
        self.offsets[id.index()] = offset;
        self
    }

    #[inline(always)]
    #[must_use]
    pub fn offset(&self, id: OffsetId) -> u64 {
        u64::from(self.offsets[id.index()])
    }

    /// Whether arguments arrive in registers rather than on the stack
    #[inline(always)]
    #[must_use]
    pub fn uses_register_abi(&self) -> bool {
        self.version >= GO_REGABI_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_packing_orders_releases() {
        assert!(go_version(1, 16, 15) < GO_REGABI_VERSION);
        assert!(go_version(1, 17, 0) >= GO_REGABI_VERSION);
        assert!(go_version(1, 21, 4) > go_version(1, 17, 13));
        assert_eq!(go_version(1, 17, 0), 0x0001_1100);
    }

    #[test]
    fn test_offset_ids_are_dense() {
        for (i, id) in OffsetId::ALL.iter().enumerate() {
            assert_eq!(id.index(), i);
        }
    }

    #[test]
    fn test_offset_names_are_unique() {
        for (i, a) in OffsetId::ALL.iter().enumerate() {
            for b in &OffsetId::ALL[i + 1..] {
                assert_ne!(a.name(), b.name());
            }
        }
    }

    #[test]
    fn test_with_offset() {
        let info = GoProcInfo::new(go_version(1, 20, 0)).with_offset(OffsetId::NetFdSysfd, 16);
        assert_eq!(info.offset(OffsetId::NetFdSysfd), 16);
        assert_eq!(info.offset(OffsetId::NetConnFd), 0);
        assert!(info.uses_register_abi());
        assert!(!GoProcInfo::new(go_version(1, 16, 0)).uses_register_abi());
    }
}
