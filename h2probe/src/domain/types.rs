//! Newtypes and tags for values that cross the ring buffer boundary

use h2probe_common::record::{
    MSG_REQUEST, MSG_REQUEST_END, MSG_RESPONSE, MSG_RESPONSE_END, PROTO_HTTP2, PROTO_TLS_HTTP2,
    T_EGRESS, T_INGRESS,
};
use serde::Serialize;
use std::fmt;

use super::errors::DecodeError;

/// Process ID (thread group ID in kernel terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl Pid {
    /// Key of this process in the `PROC_INFO` map
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn tgid(self) -> u32 {
        self.0 as u32
    }
}

/// Per-connection identity assigned in the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket:{}", self.0)
    }
}

/// HTTP/2 stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream:{}", self.0)
    }
}

/// Which way the header block travelled, seen from the traced process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Egress,
    Ingress,
}

impl TryFrom<u8> for Direction {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            T_EGRESS => Ok(Self::Egress),
            T_INGRESS => Ok(Self::Ingress),
            other => Err(DecodeError::UnknownDirection(other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Egress => "egress",
            Self::Ingress => "ingress",
        })
    }
}

/// Record kind; the `*End` variants close a header block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    RequestEnd,
    ResponseEnd,
}

impl MessageKind {
    #[must_use]
    pub fn is_end(self) -> bool {
        matches!(self, Self::RequestEnd | Self::ResponseEnd)
    }

    /// The kind of the block an END record closes
    #[must_use]
    pub fn base(self) -> Self {
        match self {
            Self::Request | Self::RequestEnd => Self::Request,
            Self::Response | Self::ResponseEnd => Self::Response,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            MSG_REQUEST => Ok(Self::Request),
            MSG_RESPONSE => Ok(Self::Response),
            MSG_REQUEST_END => Ok(Self::RequestEnd),
            MSG_RESPONSE_END => Ok(Self::ResponseEnd),
            other => Err(DecodeError::UnknownMessageKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.base() {
            Self::Request => "request",
            _ => "response",
        })
    }
}

/// Whether the HTTP/2 connection was carried over TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Plain,
    Tls,
}

impl TryFrom<u8> for Transport {
    type Error = DecodeError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            PROTO_HTTP2 => Ok(Self::Plain),
            PROTO_TLS_HTTP2 => Ok(Self::Tls),
            other => Err(DecodeError::UnknownProtocol(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid(1234).to_string(), "PID:1234");
        assert_eq!(Pid(77).tgid(), 77);
    }

    #[test]
    fn test_message_kind_base() {
        assert_eq!(MessageKind::try_from(3).unwrap(), MessageKind::RequestEnd);
        assert_eq!(MessageKind::RequestEnd.base(), MessageKind::Request);
        assert_eq!(MessageKind::ResponseEnd.base(), MessageKind::Response);
        assert!(MessageKind::ResponseEnd.is_end());
        assert!(!MessageKind::Response.is_end());
    }

    #[test]
    fn test_unknown_tags_are_rejected() {
        assert!(matches!(Direction::try_from(9), Err(DecodeError::UnknownDirection(9))));
        assert!(matches!(MessageKind::try_from(0), Err(DecodeError::UnknownMessageKind(0))));
        assert!(matches!(Transport::try_from(20), Err(DecodeError::UnknownProtocol(20))));
    }
}
