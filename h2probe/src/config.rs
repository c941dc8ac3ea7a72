//! # Layout Configuration
//!
//! The probes never look up Go symbols or DWARF themselves. Everything they
//! need about the target binary and the running kernel is read from a JSON
//! layout file and published into `PROC_INFO` / `KERNEL_OFFSETS` before the
//! programs are attached.
//!
//! ```json
//! {
//!   "go": {
//!     "version": "go1.21.4",
//!     "offsets": { "http2_server_conn_conn": 16, "net_fd_sysfd": 16, "...": 0 },
//!     "itabs": { "tcp_conn": "0x7a5e40", "tls_conn": "0x7a5f00", "syscall_conn": 0 }
//!   },
//!   "kernel": { "task_files": 2976, "file_private_data": 200,
//!               "tcp_write_seq": 2012, "tcp_copied_seq": 1584 }
//! }
//! ```
//!
//! Offset names are [`OffsetId::name`]. gRPC and TLS offsets may be omitted
//! for binaries that do not link those packages; every other offset is
//! required. Kernel fields not listed fall back to the x86_64 layout of 5.x
//! and 6.x kernels where that layout has been stable.

use h2probe_common::{go_version, GoProcInfo, KernelOffsets, OffsetId};
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::domain::ConfigError;

/// Parsed layout file
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LayoutConfig {
    pub go: GoLayout,
    pub kernel: KernelLayout,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GoLayout {
    /// Compiler version as printed by `go version`, e.g. `go1.21.4`
    pub version: String,
    pub offsets: BTreeMap<String, u64>,
    #[serde(default)]
    pub itabs: ItabLayout,
}

/// `net.Conn` itab addresses; 0 or absent means "never matches"
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ItabLayout {
    pub tcp_conn: Address,
    pub tls_conn: Address,
    pub syscall_conn: Address,
}

/// An address written either as a JSON number or a string (`"0x..."` or decimal)
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Address {
    Number(u64),
    Text(String),
}

impl Default for Address {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl Address {
    fn resolve(&self, name: &'static str) -> Result<u64, ConfigError> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => {
                let s = s.trim();
                let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => s.parse(),
                };
                parsed.map_err(|_| ConfigError::InvalidItab { name, value: s.to_string() })
            }
        }
    }
}

/// Kernel structure offsets.
///
/// The `task_struct`, `file` and `tcp_sock` offsets move with every kernel
/// config and must be supplied.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KernelLayout {
    pub task_files: u32,
    #[serde(default = "default_files_fdt")]
    pub files_fdt: u32,
    #[serde(default = "default_fdtable_fd")]
    pub fdtable_fd: u32,
    pub file_private_data: u32,
    #[serde(default = "default_socket_sk")]
    pub socket_sk: u32,
    pub tcp_write_seq: u32,
    pub tcp_copied_seq: u32,
    #[serde(default)]
    pub skc_daddr: u32,
    #[serde(default = "default_skc_rcv_saddr")]
    pub skc_rcv_saddr: u32,
    #[serde(default = "default_skc_dport")]
    pub skc_dport: u32,
    #[serde(default = "default_skc_num")]
    pub skc_num: u32,
    #[serde(default = "default_skc_family")]
    pub skc_family: u32,
    #[serde(default = "default_skc_v6_daddr")]
    pub skc_v6_daddr: u32,
    #[serde(default = "default_skc_v6_rcv_saddr")]
    pub skc_v6_rcv_saddr: u32,
}

fn default_files_fdt() -> u32 {
    32
}
fn default_fdtable_fd() -> u32 {
    8
}
fn default_socket_sk() -> u32 {
    24
}
fn default_skc_rcv_saddr() -> u32 {
    4
}
fn default_skc_dport() -> u32 {
    12
}
fn default_skc_num() -> u32 {
    14
}
fn default_skc_family() -> u32 {
    16
}
fn default_skc_v6_daddr() -> u32 {
    56
}
fn default_skc_v6_rcv_saddr() -> u32 {
    72
}

impl LayoutConfig {
    /// Read and parse a layout file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a valid layout
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_json(&content)
    }

    /// Parse a layout from a JSON string
    ///
    /// # Errors
    /// Returns an error if the JSON does not describe a layout
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Build the `PROC_INFO` value for the target process
    ///
    /// # Errors
    /// Returns an error on an unparsable version, an unknown or oversized
    /// offset, a missing required offset, or a malformed itab address
    pub fn to_proc_info(&self) -> Result<GoProcInfo, ConfigError> {
        let (major, minor, patch) = parse_go_version(&self.go.version)?;
        let mut info = GoProcInfo::new(go_version(major, minor, patch));

        for (name, &value) in &self.go.offsets {
            let id = OffsetId::ALL
                .iter()
                .copied()
                .find(|id| id.name() == name)
                .ok_or_else(|| ConfigError::UnknownOffset(name.clone()))?;
            let offset = u32::try_from(value)
                .map_err(|_| ConfigError::OffsetOutOfRange { name: name.clone(), value })?;
            info = info.with_offset(id, offset);
        }

        for id in OffsetId::ALL {
            if !self.go.offsets.contains_key(id.name()) {
                if is_optional(id) {
                    debug!("offset {} not provided, left at 0", id.name());
                } else {
                    return Err(ConfigError::MissingOffset(id.name()));
                }
            }
        }

        info.net_tcp_conn_itab = self.go.itabs.tcp_conn.resolve("tcp_conn")?;
        info.crypto_tls_conn_itab = self.go.itabs.tls_conn.resolve("tls_conn")?;
        info.credentials_syscall_conn_itab = self.go.itabs.syscall_conn.resolve("syscall_conn")?;

        Ok(info)
    }

    /// Build the `KERNEL_OFFSETS` value, marked ready
    #[must_use]
    pub fn to_kernel_offsets(&self) -> KernelOffsets {
        let k = &self.kernel;
        KernelOffsets {
            ready: 1,
            task_files: k.task_files,
            files_fdt: k.files_fdt,
            fdtable_fd: k.fdtable_fd,
            file_private_data: k.file_private_data,
            socket_sk: k.socket_sk,
            tcp_write_seq: k.tcp_write_seq,
            tcp_copied_seq: k.tcp_copied_seq,
            skc_daddr: k.skc_daddr,
            skc_rcv_saddr: k.skc_rcv_saddr,
            skc_dport: k.skc_dport,
            skc_num: k.skc_num,
            skc_family: k.skc_family,
            skc_v6_daddr: k.skc_v6_daddr,
            skc_v6_rcv_saddr: k.skc_v6_rcv_saddr,
            _padding: 0,
        }
    }
}

/// gRPC and TLS fields are absent from binaries that do not link those packages
fn is_optional(id: OffsetId) -> bool {
    matches!(
        id,
        OffsetId::GrpcHttp2ClientConn
            | OffsetId::GrpcHttp2ServerConn
            | OffsetId::GrpcLoopyWriterFramer
            | OffsetId::GrpcLoopyWriterSide
            | OffsetId::GrpcFramerWriter
            | OffsetId::GrpcBufWriterConn
            | OffsetId::TlsConnConn
    )
}

/// Parse `go1.21.4`, `1.21.4`, `go1.22` or `go1.21rc2` into its numeric parts.
///
/// A missing patch is 0; pre-release suffixes are ignored.
///
/// # Errors
/// Returns an error if major or minor is missing or not a number
pub fn parse_go_version(raw: &str) -> Result<(u32, u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidGoVersion(raw.to_string());
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("go").unwrap_or(trimmed);

    let mut parts = trimmed.split('.');
    let major = leading_number(parts.next()).ok_or_else(invalid)?;
    let minor = leading_number(parts.next()).ok_or_else(invalid)?;
    let patch = leading_number(parts.next()).unwrap_or(0);

    // Packed version reserves 8 bits for minor and patch
    if minor > 0xff || patch > 0xff {
        return Err(invalid());
    }
    Ok((major, minor, patch))
}

fn leading_number(part: Option<&str>) -> Option<u32> {
    let part = part?;
    let end = part.find(|c: char| !c.is_ascii_digit()).unwrap_or(part.len());
    part[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn full_offsets() -> String {
        let entries: Vec<String> =
            OffsetId::ALL.iter().map(|id| format!("\"{}\": {}", id.name(), id.index() * 8)).collect();
        entries.join(", ")
    }

    fn sample_json() -> String {
        format!(
            r#"{{
                "go": {{
                    "version": "go1.21.4",
                    "offsets": {{ {} }},
                    "itabs": {{ "tcp_conn": "0x7a5e40", "tls_conn": 8019712, "syscall_conn": "0" }}
                }},
                "kernel": {{
                    "task_files": 2976,
                    "file_private_data": 200,
                    "tcp_write_seq": 2012,
                    "tcp_copied_seq": 1584
                }}
            }}"#,
            full_offsets()
        )
    }

    #[test]
    fn test_parse_go_version() {
        assert_eq!(parse_go_version("go1.21.4").unwrap(), (1, 21, 4));
        assert_eq!(parse_go_version("1.16.15").unwrap(), (1, 16, 15));
        assert_eq!(parse_go_version("go1.22").unwrap(), (1, 22, 0));
        assert_eq!(parse_go_version("go1.21rc2").unwrap(), (1, 21, 0));
        assert!(parse_go_version("devel").is_err());
        assert!(parse_go_version("go1").is_err());
    }

    #[test]
    fn test_to_proc_info() {
        let layout = LayoutConfig::from_json(&sample_json()).unwrap();
        let info = layout.to_proc_info().unwrap();

        assert_eq!(info.version, go_version(1, 21, 4));
        assert!(info.uses_register_abi());
        assert_eq!(info.offset(OffsetId::NetFdSysfd), OffsetId::NetFdSysfd.index() as u64 * 8);
        assert_eq!(info.net_tcp_conn_itab, 0x7a_5e40);
        assert_eq!(info.crypto_tls_conn_itab, 8_019_712);
        assert_eq!(info.credentials_syscall_conn_itab, 0);
    }

    #[test]
    fn test_kernel_defaults() {
        let layout = LayoutConfig::from_json(&sample_json()).unwrap();
        let k = layout.to_kernel_offsets();

        assert!(k.is_ready());
        assert_eq!(k.task_files, 2976);
        assert_eq!(k.files_fdt, 32);
        assert_eq!(k.socket_sk, 24);
        assert_eq!(k.skc_family, 16);
        assert_eq!(k.skc_v6_daddr, 56);
    }

    #[test]
    fn test_grpc_offsets_are_optional() {
        let offsets: Vec<String> = OffsetId::ALL
            .iter()
            .filter(|id| !is_optional(**id))
            .map(|id| format!("\"{}\": 8", id.name()))
            .collect();
        let json = sample_json().replace(&full_offsets(), &offsets.join(", "));

        let info = LayoutConfig::from_json(&json).unwrap().to_proc_info().unwrap();
        assert_eq!(info.offset(OffsetId::GrpcLoopyWriterSide), 0);
        assert_eq!(info.offset(OffsetId::Http2ServerConnConn), 8);
    }

    #[test]
    fn test_missing_required_offset() {
        let json = sample_json().replace("\"net_fd_sysfd\"", "\"unused\"");
        let err = LayoutConfig::from_json(&json).unwrap().to_proc_info().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOffset(name) if name == "unused"));

        let offsets: Vec<String> = OffsetId::ALL
            .iter()
            .filter(|id| **id != OffsetId::NetFdSysfd)
            .map(|id| format!("\"{}\": 8", id.name()))
            .collect();
        let json = sample_json().replace(&full_offsets(), &offsets.join(", "));
        let err = LayoutConfig::from_json(&json).unwrap().to_proc_info().unwrap_err();
        assert!(matches!(err, ConfigError::MissingOffset("net_fd_sysfd")));
    }

    #[test]
    fn test_bad_itab() {
        let json = sample_json().replace("\"0x7a5e40\"", "\"0xzz\"");
        let err = LayoutConfig::from_json(&json).unwrap().to_proc_info().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidItab { name: "tcp_conn", .. }));
    }

    #[test]
    fn test_missing_kernel_field_is_rejected() {
        let json = sample_json().replace("\"task_files\": 2976,", "");
        assert!(matches!(LayoutConfig::from_json(&json), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_json().as_bytes()).unwrap();

        let layout = LayoutConfig::from_file(file.path()).unwrap();
        assert_eq!(layout.go.version, "go1.21.4");

        let err = LayoutConfig::from_file("/nonexistent/layout.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/layout.json"));
    }
}
