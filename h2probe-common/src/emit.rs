//! Header record assembly and emission
//!
//! One [`Http2Invocation`] owns the per-CPU scratch area for the duration of a
//! probe hit. The socket enrichment fills the record header once per call;
//! every header field then rewrites the payload and emits a sized view of the
//! scratch area. A call's fields are followed by a terminal record of kind
//! `base + MSG_END_INCREMENT` with empty name and value.

use crate::goruntime::{read_or_default, GoHeaderField, GoSlice, GoString, HEADER_FIELD_SIZE};
use crate::host::{EventSink, TraceTables, UserMemory};
use crate::record::{
    emission_size, Http2EventHeader, Http2Scratch, HEADER_LEN_MASK, HTTP2_BUFFER_INFO_SIZE,
    HTTP2_PAYLOAD_PREFIX_LEN, MAX_HEADER_FIELDS, MSG_END_INCREMENT,
};
use crate::tables::StatId;

/// Scratch state scoped to a single probe hit
pub struct Http2Invocation<'a> {
    /// Set by the connection locator when a TLS layer was peeled
    pub tls: bool,
    scratch: &'a mut Http2Scratch,
}

impl<'a> Http2Invocation<'a> {
    /// Take over the scratch area, clearing anything a previous hit left
    /// behind that could cause an emission.
    #[inline(always)]
    pub fn begin(scratch: &'a mut Http2Scratch) -> Self {
        scratch.header.tcp_seq = 0;
        scratch.header.data_len = 0;
        Self { tls: false, scratch }
    }

    #[inline(always)]
    pub fn header(&self) -> &Http2EventHeader {
        &self.scratch.header
    }

    #[inline(always)]
    pub fn header_mut(&mut self) -> &mut Http2EventHeader {
        &mut self.scratch.header
    }

    /// Whether socket enrichment produced a sequence to emit under
    #[inline(always)]
    pub fn is_enriched(&self) -> bool {
        self.scratch.header.tcp_seq != 0
    }
}

/// Where a name or value comes from
#[derive(Clone, Copy, Debug)]
pub enum FieldBytes<'b> {
    /// A Go string in the traced process
    Target(GoString),
    /// Bytes produced by the probe itself
    Local(&'b [u8]),
}

impl FieldBytes<'static> {
    pub const EMPTY: FieldBytes<'static> = FieldBytes::Local(&[]);
}

impl FieldBytes<'_> {
    #[inline(always)]
    fn masked_len(&self) -> usize {
        let len = match self {
            FieldBytes::Target(s) => s.len,
            FieldBytes::Local(b) => b.len() as u64,
        };
        #[allow(clippy::cast_possible_truncation)]
        let masked = (len & HEADER_LEN_MASK) as usize;
        masked
    }

    /// Copy the first `len` bytes into `dst`; false when the source was
    /// unreadable.
    #[inline(always)]
    fn copy_into<M: UserMemory>(&self, mem: &M, dst: &mut [u8]) -> bool {
        match self {
            FieldBytes::Target(s) => mem.read_user_bytes(s.ptr, dst),
            FieldBytes::Local(b) => match b.get(..dst.len()) {
                Some(src) => {
                    dst.copy_from_slice(src);
                    true
                }
                None => false,
            },
        }
    }
}

/// Per-call tags shared by every record of a header block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamMeta {
    pub fd: i32,
    pub stream_id: u32,
    /// Base kind (`MSG_REQUEST` / `MSG_RESPONSE`) or an explicit END kind
    pub msg_type: u8,
}

impl StreamMeta {
    #[must_use]
    pub fn terminal(&self) -> Self {
        Self { msg_type: self.msg_type.wrapping_add(MSG_END_INCREMENT), ..*self }
    }
}

/// Assemble one header field into the scratch area and emit it.
///
/// Returns true when the record reached the channel. Nothing is emitted for an
/// invocation whose enrichment failed.
#[inline(always)]
pub fn emit_field<H>(
    host: &H,
    inv: &mut Http2Invocation<'_>,
    meta: &StreamMeta,
    name: FieldBytes<'_>,
    value: FieldBytes<'_>,
) -> bool
where
    H: UserMemory + TraceTables + EventSink,
{
    if !inv.is_enriched() {
        return false;
    }

    let header_len = name.masked_len();
    let value_len = value.masked_len();
    if header_len + value_len > HTTP2_BUFFER_INFO_SIZE - HTTP2_PAYLOAD_PREFIX_LEN as usize {
        host.bump_stat(StatId::DroppedEvents);
        return false;
    }

    let scratch = &mut *inv.scratch;
    scratch.header.msg_type = meta.msg_type;

    let payload = &mut scratch.payload;
    #[allow(clippy::cast_sign_loss)]
    let fd = meta.fd as u32;
    payload.fd = fd;
    payload.stream_id = meta.stream_id;
    #[allow(clippy::cast_possible_truncation)]
    {
        payload.header_len = header_len as u32;
        payload.value_len = value_len as u32;
    }

    // A denied read leaves zeros, not the previous field's bytes
    if let Some(dst) = payload.info.get_mut(..header_len) {
        if !name.copy_into(host, dst) {
            dst.fill(0);
        }
    }
    if let Some(dst) = payload.info.get_mut(header_len..header_len + value_len) {
        if !value.copy_into(host, dst) {
            dst.fill(0);
        }
    }
    if let Some(end) = payload.info.get_mut(header_len + value_len) {
        *end = 0;
    }

    let data_len = HTTP2_PAYLOAD_PREFIX_LEN + payload.header_len + payload.value_len;
    scratch.header.data_len = data_len;

    let sent = host.emit(scratch.as_bytes(emission_size(data_len)));
    host.bump_stat(if sent { StatId::EmittedEvents } else { StatId::DroppedEvents });
    sent
}

/// Emit the empty record closing a header block
#[inline(always)]
pub fn emit_terminator<H>(host: &H, inv: &mut Http2Invocation<'_>, meta: &StreamMeta) -> bool
where
    H: UserMemory + TraceTables + EventSink,
{
    emit_field(host, inv, &meta.terminal(), FieldBytes::EMPTY, FieldBytes::EMPTY)
}

/// Emit up to [`MAX_HEADER_FIELDS`] entries of a `[]hpack.HeaderField`, then
/// the terminal record.
///
/// Entries past the ceiling are dropped without a trace in the output; the
/// terminal record still closes the block.
#[inline(always)]
pub fn submit_header_block<H>(
    host: &H,
    inv: &mut Http2Invocation<'_>,
    meta: &StreamMeta,
    fields: GoSlice,
) where
    H: UserMemory + TraceTables + EventSink,
{
    for idx in 0..MAX_HEADER_FIELDS {
        if idx as u64 >= fields.len {
            break;
        }
        let addr = fields.ptr.wrapping_add(idx as u64 * HEADER_FIELD_SIZE);
        let field: GoHeaderField = read_or_default(host, addr);
        let (name, value) = (FieldBytes::Target(field.name), FieldBytes::Target(field.value));
        emit_field(host, inv, meta, name, value);
    }
    emit_terminator(host, inv, meta);
}
