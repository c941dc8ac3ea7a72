//! # Ring Buffer Record Decoding
//!
//! A record is an [`Http2EventHeader`] followed by the 16-byte payload prefix
//! (`fd`, `stream_id`, `header_len`, `value_len`) and `header_len + value_len`
//! bytes of name and value. The kernel side rounds the record up to 8 bytes,
//! so trailing bytes past the value are padding.

use h2probe_common::record::{
    FiveTuple, DATA_SOURCE_GO_HTTP2_UPROBE, HTTP2_PAYLOAD_PREFIX_LEN, TASK_COMM_LEN,
};
use h2probe_common::{Http2EventHeader, EVENT_HEADER_SIZE};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::domain::{DecodeError, Direction, MessageKind, SocketId, StreamId, Transport};

const PREFIX_LEN: usize = HTTP2_PAYLOAD_PREFIX_LEN as usize;

/// One decoded header field (or END marker) as emitted by a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub direction: Direction,
    pub kind: MessageKind,
    pub transport: Transport,
    pub tcp_seq: u32,
    pub goid: u64,
    pub timestamp_ns: u64,
    pub comm: String,
    pub socket_id: SocketId,
    pub tgid: u32,
    pub pid: u32,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub fd: u32,
    pub stream_id: StreamId,
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderRecord {
    /// Decode one ring buffer record
    ///
    /// # Errors
    /// Returns an error if the record is shorter than its declared lengths,
    /// the lengths disagree with each other, or a tag is out of range
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let min = EVENT_HEADER_SIZE + PREFIX_LEN;
        if bytes.len() < min {
            return Err(DecodeError::Truncated { expected: min, actual: bytes.len() });
        }

        // SAFETY: length checked above; Http2EventHeader is repr(C) plain data
        #[allow(unsafe_code)]
        let header =
            unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<Http2EventHeader>()) };

        if header.source != DATA_SOURCE_GO_HTTP2_UPROBE {
            return Err(DecodeError::UnknownSource(header.source));
        }
        let direction = Direction::try_from(header.direction)?;
        let kind = MessageKind::try_from(header.msg_type)?;
        let transport = Transport::try_from(header.data_type)?;

        let prefix = &bytes[EVENT_HEADER_SIZE..min];
        let fd = read_u32(prefix, 0);
        let stream_id = read_u32(prefix, 4);
        let header_len = read_u32(prefix, 8);
        let value_len = read_u32(prefix, 12);

        if u64::from(header.data_len)
            != u64::from(HTTP2_PAYLOAD_PREFIX_LEN) + u64::from(header_len) + u64::from(value_len)
        {
            return Err(DecodeError::LengthMismatch {
                data_len: header.data_len,
                header_len,
                value_len,
            });
        }

        let name_end = min + header_len as usize;
        let value_end = name_end + value_len as usize;
        if bytes.len() < value_end {
            return Err(DecodeError::Truncated { expected: value_end, actual: bytes.len() });
        }

        Ok(Self {
            direction,
            kind,
            transport,
            tcp_seq: header.tcp_seq,
            goid: header.coroutine_id,
            timestamp_ns: header.timestamp_ns,
            comm: comm_to_string(&header.comm),
            socket_id: SocketId(header.socket_id),
            tgid: header.tgid,
            pid: header.pid,
            local: local_addr(&header.tuple),
            remote: remote_addr(&header.tuple),
            fd,
            stream_id: StreamId(stream_id),
            name: bytes[min..name_end].to_vec(),
            value: bytes[name_end..value_end].to_vec(),
        })
    }

    #[must_use]
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

fn comm_to_string(comm: &[u8; TASK_COMM_LEN]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(TASK_COMM_LEN);
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

fn ip_from(raw: &[u8; 16], addr_len: u8) -> Option<IpAddr> {
    match addr_len {
        4 => Some(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
        16 => Some(IpAddr::V6(Ipv6Addr::from(*raw))),
        _ => None,
    }
}

fn local_addr(tuple: &FiveTuple) -> Option<SocketAddr> {
    ip_from(&tuple.saddr, tuple.addr_len).map(|ip| SocketAddr::new(ip, tuple.sport))
}

fn remote_addr(tuple: &FiveTuple) -> Option<SocketAddr> {
    ip_from(&tuple.daddr, tuple.addr_len).map(|ip| SocketAddr::new(ip, tuple.dport))
}
