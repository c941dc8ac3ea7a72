//! Probe entry points
//!
//! One function per instrumented Go method. Each is generic over the host so
//! the `h2probe-ebpf` program shims and the unit tests drive the same code.
//! All of them start the same way: look up the process layout (no layout, no
//! work), take over the scratch area, locate the connection, enrich, then
//! hand header fields to the assembler.

use crate::abi::{first_argument, read_arg, ArgSlot};
use crate::conn::{
    client_conn_fd, client_read_loop_fd, grpc_client_fd, grpc_server_fd, loopy_writer_fd,
    loopy_writer_side, server_conn_fd, ConnFd,
};
use crate::emit::{
    emit_field, emit_terminator, submit_header_block, FieldBytes, Http2Invocation, StreamMeta,
};
use crate::goruntime::{
    current_goroutine_id, deref_field, navigate, read_or_default, GoSlice, GoString,
};
use crate::host::{CallContext, ProbeHost, Register, UserMemory};
use crate::proc_info::{GoProcInfo, OffsetId};
use crate::record::{
    Http2Scratch, MSG_REQUEST, MSG_REQUEST_END, MSG_RESPONSE, T_EGRESS, T_INGRESS,
};
use crate::socket::fill_common_socket;

// func (cc *http2ClientConn) writeHeader(name, value string)
const WRITE_HEADER_NAME_PTR: ArgSlot = ArgSlot::new(Register::Rbx, 16);
const WRITE_HEADER_NAME_LEN: ArgSlot = ArgSlot::new(Register::Rcx, 24);
const WRITE_HEADER_VALUE_PTR: ArgSlot = ArgSlot::new(Register::Rdi, 32);
const WRITE_HEADER_VALUE_LEN: ArgSlot = ArgSlot::new(Register::Rsi, 40);

// func (sc *http2serverConn) processHeaders(f *http2MetaHeadersFrame) error
// func (t *http2Server) operateHeaders(frame *http2.MetaHeadersFrame, ...) (fatal bool)
// func (t *http2Client) operateHeaders(frame *http2.MetaHeadersFrame)
const SECOND_ARG_FRAME: ArgSlot = ArgSlot::new(Register::Rbx, 16);

// func (sc *http2serverConn) writeHeaders(st *http2stream, headerData *http2writeResHeaders) error
// func (rl *http2clientConnReadLoop) handleResponse(cs *http2clientStream, f *http2MetaHeadersFrame) (*Response, error)
const THIRD_ARG: ArgSlot = ArgSlot::new(Register::Rcx, 24);

// func (l *loopyWriter) writeHeader(streamID uint32, endStream bool, hf []hpack.HeaderField, onWrite func()) error
const LOOPY_STREAM_ID: ArgSlot = ArgSlot::new(Register::Rbx, 16);
const LOOPY_FIELDS_PTR: ArgSlot = ArgSlot::new(Register::Rdi, 24);
const LOOPY_FIELDS_LEN: ArgSlot = ArgSlot::new(Register::Rsi, 32);
const LOOPY_FIELDS_CAP: ArgSlot = ArgSlot::new(Register::R8, 40);

const STATUS: &[u8] = b":status";

/// Enrich the invocation for a call on `conn`
#[inline(always)]
fn enrich_call<H, C>(
    host: &H,
    ctx: &C,
    info: &GoProcInfo,
    inv: &mut Http2Invocation<'_>,
    conn: ConnFd,
    direction: u8,
) -> bool
where
    H: ProbeHost,
    C: CallContext,
{
    inv.tls = conn.tls;
    let goid = current_goroutine_id(ctx, host, info);
    fill_common_socket(host, inv, conn.fd, direction, goid)
}

/// Stream id a client connection is about to use: `nextStreamID` has already
/// been advanced past it.
#[inline(always)]
fn client_stream_id<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> u32
where
    C: CallContext,
    M: UserMemory,
{
    let cc = first_argument(ctx, mem, info);
    read_or_default::<u32, M>(mem, navigate(cc, OffsetId::Http2ClientConnNextStreamId, info))
        .wrapping_sub(2)
}

/// `MetaHeadersFrame` → `*HeadersFrame` → `FrameHeader.StreamID`
#[inline(always)]
fn frame_stream_id<M: UserMemory>(mem: &M, frame: u64, info: &GoProcInfo) -> u32 {
    let headers = deref_field(mem, frame, OffsetId::Http2MetaHeadersFrameHeaders, info);
    read_or_default::<u32, M>(mem, navigate(headers, OffsetId::Http2FrameHeaderStreamId, info))
}

#[inline(always)]
fn frame_fields<M: UserMemory>(mem: &M, frame: u64, info: &GoProcInfo) -> GoSlice {
    read_or_default(mem, navigate(frame, OffsetId::Http2MetaHeadersFrameFields, info))
}

/// Shared body of the probes that receive a decoded `MetaHeadersFrame`
#[inline(always)]
fn received_header_block<H, C>(
    host: &H,
    ctx: &C,
    info: &GoProcInfo,
    scratch: &mut Http2Scratch,
    conn: ConnFd,
    frame_slot: ArgSlot,
    msg_type: u8,
) where
    H: ProbeHost,
    C: CallContext,
{
    let mut inv = Http2Invocation::begin(scratch);
    let frame = read_arg(ctx, host, info, frame_slot);
    if !enrich_call(host, ctx, info, &mut inv, conn, T_INGRESS) {
        return;
    }
    let meta = StreamMeta { fd: conn.fd, stream_id: frame_stream_id(host, frame, info), msg_type };
    submit_header_block(host, &mut inv, &meta, frame_fields(host, frame, info));
}

/// `net/http.(*http2ClientConn).writeHeader`: one request header
pub fn client_conn_write_header<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let mut inv = Http2Invocation::begin(scratch);
    let conn = client_conn_fd(ctx, host, info);
    if !enrich_call(host, ctx, info, &mut inv, conn, T_EGRESS) {
        return;
    }

    let meta = StreamMeta {
        fd: conn.fd,
        stream_id: client_stream_id(ctx, host, info),
        msg_type: MSG_REQUEST,
    };
    let name = GoString {
        ptr: read_arg(ctx, host, info, WRITE_HEADER_NAME_PTR),
        len: read_arg(ctx, host, info, WRITE_HEADER_NAME_LEN),
    };
    let value = GoString {
        ptr: read_arg(ctx, host, info, WRITE_HEADER_VALUE_PTR),
        len: read_arg(ctx, host, info, WRITE_HEADER_VALUE_LEN),
    };
    emit_field(host, &mut inv, &meta, FieldBytes::Target(name), FieldBytes::Target(value));
}

/// `net/http.(*http2ClientConn).writeHeaders`: closes the block the
/// `writeHeader` calls built
pub fn client_conn_write_headers<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let mut inv = Http2Invocation::begin(scratch);
    let conn = client_conn_fd(ctx, host, info);
    if !enrich_call(host, ctx, info, &mut inv, conn, T_EGRESS) {
        return;
    }

    let meta = StreamMeta {
        fd: conn.fd,
        stream_id: client_stream_id(ctx, host, info),
        msg_type: MSG_REQUEST_END,
    };
    emit_field(host, &mut inv, &meta, FieldBytes::EMPTY, FieldBytes::EMPTY);
}

/// `net/http.(*http2serverConn).processHeaders`: request headers read by a
/// server
pub fn server_conn_process_headers<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let conn = server_conn_fd(ctx, host, info);
    received_header_block(host, ctx, info, scratch, conn, SECOND_ARG_FRAME, MSG_REQUEST);
}

/// `net/http.(*http2serverConn).writeHeaders`: the response headers the
/// server renders itself
pub fn server_conn_write_headers<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let mut inv = Http2Invocation::begin(scratch);
    let conn = server_conn_fd(ctx, host, info);
    if !enrich_call(host, ctx, info, &mut inv, conn, T_EGRESS) {
        return;
    }

    let res = read_arg(ctx, host, info, THIRD_ARG);
    let stream_id = read_or_default::<u32, H>(
        host,
        navigate(res, OffsetId::Http2WriteResHeadersStreamId, info),
    );
    let meta = StreamMeta { fd: conn.fd, stream_id, msg_type: MSG_RESPONSE };

    let code = read_or_default::<u32, H>(
        host,
        navigate(res, OffsetId::Http2WriteResHeadersHttpResCode, info),
    );
    if code != 0 {
        let status = status_digits(code);
        emit_field(host, &mut inv, &meta, FieldBytes::Local(STATUS), FieldBytes::Local(&status));
    }

    let fixed: [(&[u8], OffsetId); 3] = [
        (b"date", OffsetId::Http2WriteResHeadersDate),
        (b"content-type", OffsetId::Http2WriteResHeadersContentType),
        (b"content-length", OffsetId::Http2WriteResHeadersContentLength),
    ];
    for (name, id) in fixed {
        let value: GoString = read_or_default(host, navigate(res, id, info));
        if value.len != 0 {
            emit_field(host, &mut inv, &meta, FieldBytes::Local(name), FieldBytes::Target(value));
        }
    }

    emit_terminator(host, &mut inv, &meta);
}

/// Three ASCII digits of an HTTP status code
#[inline(always)]
fn status_digits(code: u32) -> [u8; 3] {
    #[allow(clippy::cast_possible_truncation)]
    [
        b'0' + ((code % 1000) / 100) as u8,
        b'0' + ((code % 100) / 10) as u8,
        b'0' + (code % 10) as u8,
    ]
}

/// `net/http.(*http2clientConnReadLoop).handleResponse`: response headers
/// read by a client
pub fn client_read_loop_handle_response<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let conn = client_read_loop_fd(ctx, host, info);
    received_header_block(host, ctx, info, scratch, conn, THIRD_ARG, MSG_RESPONSE);
}

/// `transport.(*loopyWriter).writeHeader`: headers written by either gRPC
/// side
pub fn grpc_loopy_writer_write_header<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let mut inv = Http2Invocation::begin(scratch);
    let conn = loopy_writer_fd(ctx, host, info);
    if !enrich_call(host, ctx, info, &mut inv, conn, T_EGRESS) {
        return;
    }

    let fields = GoSlice {
        ptr: read_arg(ctx, host, info, LOOPY_FIELDS_PTR),
        len: read_arg(ctx, host, info, LOOPY_FIELDS_LEN),
        cap: read_arg(ctx, host, info, LOOPY_FIELDS_CAP),
    };
    #[allow(clippy::cast_possible_truncation)]
    let stream_id = read_arg(ctx, host, info, LOOPY_STREAM_ID) as u32;
    let msg_type = if loopy_writer_side(ctx, host, info) != 0 { MSG_RESPONSE } else { MSG_REQUEST };
    let meta = StreamMeta { fd: conn.fd, stream_id, msg_type };
    submit_header_block(host, &mut inv, &meta, fields);
}

/// `transport.(*http2Server).operateHeaders`: request headers read by a gRPC
/// server
pub fn grpc_http2_server_operate_headers<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let conn = grpc_server_fd(ctx, host, info);
    received_header_block(host, ctx, info, scratch, conn, SECOND_ARG_FRAME, MSG_REQUEST);
}

/// `transport.(*http2Client).operateHeaders`: response headers read by a gRPC
/// client
pub fn grpc_http2_client_operate_headers<H, C>(host: &H, ctx: &C, scratch: &mut Http2Scratch)
where
    H: ProbeHost,
    C: CallContext,
{
    let Some(info) = host.proc_info(host.tgid()) else {
        return;
    };
    let conn = grpc_client_fd(ctx, host, info);
    received_header_block(host, ctx, info, scratch, conn, SECOND_ARG_FRAME, MSG_RESPONSE);
}
