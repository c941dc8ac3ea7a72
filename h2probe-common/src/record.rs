//! Emitted header record (eBPF → userspace)
//!
//! Every record is an [`Http2EventHeader`] followed by the payload prefix
//! (`fd`, `stream_id`, `header_len`, `value_len`, 16 bytes) and the
//! concatenated name and value bytes. Only the first
//! `emission_size(data_len)` bytes of the per-CPU [`Http2Scratch`] are
//! written to the ring buffer.

use core::mem::size_of;

// ============================================================================
// Tags
// ============================================================================

/// `Http2EventHeader::source` for records produced by the Go HTTP/2 uprobes
pub const DATA_SOURCE_GO_HTTP2_UPROBE: u8 = 2;

/// Data written by the traced process
pub const T_EGRESS: u8 = 0;
/// Data read by the traced process
pub const T_INGRESS: u8 = 1;

/// Plain-text HTTP/2
pub const PROTO_HTTP2: u8 = 21;
/// HTTP/2 carried over TLS
pub const PROTO_TLS_HTTP2: u8 = 22;

pub const MSG_REQUEST: u8 = 1;
pub const MSG_RESPONSE: u8 = 2;
pub const MSG_REQUEST_END: u8 = 3;
pub const MSG_RESPONSE_END: u8 = 4;

/// Added to a base kind to form its terminal marker
pub const MSG_END_INCREMENT: u8 = 2;

pub const IPPROTO_TCP: u8 = 6;
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

// ============================================================================
// Capacities
// ============================================================================

pub const TASK_COMM_LEN: usize = 16;

/// Mask applied to name and value lengths. Lengths wrap, they do not saturate.
pub const HEADER_LEN_MASK: u64 = 0x03FF;

/// Bytes available for name + value + terminator
pub const HTTP2_BUFFER_INFO_SIZE: usize = 2048;

/// `fd`, `stream_id`, `header_len`, `value_len`
pub const HTTP2_PAYLOAD_PREFIX_LEN: u32 = 16;

/// Header fields taken from one `[]hpack.HeaderField`; the rest are dropped
pub const MAX_HEADER_FIELDS: usize = 9;

/// Emission sizes are rounded up to this many bytes
pub const EVENT_ALIGN: usize = 8;

pub const EVENT_HEADER_SIZE: usize = size_of::<Http2EventHeader>();

/// Largest record ever written to the ring buffer
pub const MAX_EVENT_SIZE: usize = size_of::<Http2Scratch>();

// ============================================================================
// Record layout
// ============================================================================

/// Flow addresses as read from `struct sock_common`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FiveTuple {
    /// Local address; first 4 bytes for IPv4
    pub saddr: [u8; 16],
    /// Remote address; first 4 bytes for IPv4
    pub daddr: [u8; 16],
    /// Local port, host byte order
    pub sport: u16,
    /// Remote port, host byte order
    pub dport: u16,
    /// 4, 16, or 0 when the family was not recognized
    pub addr_len: u8,
    pub l4_protocol: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 2],
}

/// Fixed part of every emitted record
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Http2EventHeader {
    /// Always [`DATA_SOURCE_GO_HTTP2_UPROBE`]
    pub source: u8,
    /// [`T_EGRESS`] or [`T_INGRESS`]
    pub direction: u8,
    /// [`PROTO_HTTP2`] or [`PROTO_TLS_HTTP2`]
    pub data_type: u8,
    /// `MSG_*`
    pub msg_type: u8,

    /// Resolved TCP sequence; 0 means enrichment failed and nothing is emitted
    pub tcp_seq: u32,

    /// goid of the goroutine making the call (0 if unknown)
    pub coroutine_id: u64,

    /// `bpf_ktime_get_ns()` at enrichment time
    pub timestamp_ns: u64,

    pub comm: [u8; TASK_COMM_LEN],

    /// Stable per-connection identity
    pub socket_id: u64,

    pub tgid: u32,
    pub pid: u32,

    pub tuple: FiveTuple,

    /// Payload length: [`HTTP2_PAYLOAD_PREFIX_LEN`] + name + value
    pub data_len: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,
}

/// Variable part of a record
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Http2Payload {
    pub fd: u32,
    pub stream_id: u32,
    pub header_len: u32,
    pub value_len: u32,
    pub info: [u8; HTTP2_BUFFER_INFO_SIZE],
}

impl Default for Http2Payload {
    fn default() -> Self {
        Self { fd: 0, stream_id: 0, header_len: 0, value_len: 0, info: [0; HTTP2_BUFFER_INFO_SIZE] }
    }
}

/// Per-CPU scratch area a record is assembled in before emission.
///
/// Lives in a `PerCpuArray`; one invocation owns it from entry to exit.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Http2Scratch {
    pub header: Http2EventHeader,
    pub payload: Http2Payload,
}

impl Http2Scratch {
    /// View of the first `len` bytes, clamped to the scratch size
    #[must_use]
    #[allow(unsafe_code)]
    pub fn as_bytes(&self, len: usize) -> &[u8] {
        let len = if len > MAX_EVENT_SIZE { MAX_EVENT_SIZE } else { len };
        // SAFETY: repr(C) with explicit padding fields, so every byte is initialized.
        unsafe { core::slice::from_raw_parts(core::ptr::from_ref(self).cast::<u8>(), len) }
    }
}

/// Bytes of the scratch area to emit for a payload of `data_len` bytes.
///
/// Covers the header, the payload, and one terminator byte, rounded up to
/// [`EVENT_ALIGN`] and capped at [`MAX_EVENT_SIZE`].
#[inline(always)]
#[must_use]
pub fn emission_size(data_len: u32) -> usize {
    let raw = EVENT_HEADER_SIZE + data_len as usize + 1;
    let aligned = (raw + EVENT_ALIGN - 1) & !(EVENT_ALIGN - 1);
    if aligned > MAX_EVENT_SIZE {
        MAX_EVENT_SIZE
    } else {
        aligned
    }
}
