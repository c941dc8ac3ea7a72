//! Pre-flight checks for h2probe
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::Path;

use crate::domain::AgentError;

/// Minimum kernel version required for eBPF features used by h2probe
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Section every Go executable carries since Go 1.13
const GO_BUILDINFO_SECTION: &str = ".go.buildinfo";

/// `"\xff Go buildinf:"`
const GO_BUILDINFO_MAGIC: &[u8; 14] = b"\xff Go buildinf:";

/// Set when the version string is stored inline after the header (Go 1.18+)
const GO_BUILDINFO_FLAG_INLINE: u8 = 0x2;

const GO_BUILDINFO_HEADER_LEN: usize = 32;

/// Run all pre-flight checks before eBPF loading
///
/// Returns the compiler version recorded in the binary, if it could be read.
pub fn run_preflight_checks(target_path: &str) -> Result<Option<String>> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(target_path)?;
    check_go_binary(target_path)
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would do, but checking them needs more than libc
    bail!(
        "Permission denied: h2probe requires root privileges to load eBPF programs.\n\n\
         Run with: sudo h2probe ..."
    );
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             h2probe requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {}",
            major,
            minor,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    Ok(())
}

/// `"6.1.0-arch1-1"` → `(6, 1)`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor =
        parts.next()?.chars().take_while(char::is_ascii_digit).collect::<String>().parse().ok()?;
    Some((major, minor))
}

/// Check if the target binary exists and is readable
fn check_binary_exists(target_path: &str) -> Result<()> {
    let path = Path::new(target_path);
    if !path.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            target_path
        );
    }
    if !path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --target must point to an executable file, not a directory.",
            target_path
        );
    }
    Ok(())
}

/// Check that the target was produced by the Go toolchain and read its
/// compiler version
fn check_go_binary(target_path: &str) -> Result<Option<String>> {
    let file_data = std::fs::read(target_path)
        .with_context(|| format!("Failed to read binary: {target_path}"))?;

    let obj = object::File::parse(&*file_data)
        .with_context(|| format!("Failed to parse {target_path} as an object file"))?;

    let Some(section) = obj.section_by_name(GO_BUILDINFO_SECTION) else {
        return Err(AgentError::NotGoBinary { binary: target_path.to_string() }.into());
    };
    let data = section.data().context("Failed to read .go.buildinfo")?;

    if !obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0) {
        eprintln!("warning: binary stripped, uprobes cannot be attached by symbol name");
    }

    Ok(go_version_from_buildinfo(data))
}

/// Extract the inline version string from a `.go.buildinfo` section.
///
/// Binaries older than Go 1.18 store it behind pointers instead; those yield
/// `None` and the layout file's version is used unchecked.
#[must_use]
pub fn go_version_from_buildinfo(data: &[u8]) -> Option<String> {
    if data.len() < GO_BUILDINFO_HEADER_LEN || !data.starts_with(GO_BUILDINFO_MAGIC) {
        return None;
    }
    let flags = data[GO_BUILDINFO_MAGIC.len() + 1];
    if flags & GO_BUILDINFO_FLAG_INLINE == 0 {
        return None;
    }

    let rest = &data[GO_BUILDINFO_HEADER_LEN..];
    let (len, consumed) = read_uvarint(rest)?;
    let len = usize::try_from(len).ok()?;
    let bytes = rest.get(consumed..consumed.checked_add(len)?)?;
    String::from_utf8(bytes.to_vec()).ok()
}

/// Unsigned LEB128 as written by Go's `binary.PutUvarint`
fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Check if the target process exists
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
pub fn check_proc_access(pid: i32) -> Result<()> {
    let maps_path = format!("/proc/{pid}/maps");
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {pid})\n\
             - Permission denied (run with sudo)\n\
             - /proc is not mounted"
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buildinfo(flags: u8, version: &str) -> Vec<u8> {
        let mut data = GO_BUILDINFO_MAGIC.to_vec();
        data.push(8);
        data.push(flags);
        data.resize(GO_BUILDINFO_HEADER_LEN, 0);
        data.push(u8::try_from(version.len()).unwrap());
        data.extend_from_slice(version.as_bytes());
        data.extend_from_slice(b"\x80\x01path\tgithub.com/acme/svc");
        data
    }

    #[test]
    fn test_kernel_release_parsing() {
        assert_eq!(parse_kernel_release("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }

    #[test]
    fn test_binary_not_found() {
        let result = check_binary_exists("/nonexistent/path/to/binary");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Binary not found"));
    }

    #[test]
    fn test_process_not_found() {
        let result = check_process_exists(999_999_999);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_inline_buildinfo_version() {
        let data = buildinfo(GO_BUILDINFO_FLAG_INLINE, "go1.21.4");
        assert_eq!(go_version_from_buildinfo(&data).as_deref(), Some("go1.21.4"));
    }

    #[test]
    fn test_pointer_buildinfo_has_no_inline_version() {
        let data = buildinfo(0, "go1.16.15");
        assert_eq!(go_version_from_buildinfo(&data), None);
    }

    #[test]
    fn test_truncated_buildinfo() {
        let data = buildinfo(GO_BUILDINFO_FLAG_INLINE, "go1.21.4");
        assert_eq!(go_version_from_buildinfo(&data[..36]), None);
        assert_eq!(go_version_from_buildinfo(&data[..10]), None);
        assert_eq!(go_version_from_buildinfo(b"not a buildinfo section at all, no"), None);
    }

    #[test]
    fn test_uvarint() {
        assert_eq!(read_uvarint(&[0x08]), Some((8, 1)));
        assert_eq!(read_uvarint(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_uvarint(&[0x80]), None);
    }

    #[test]
    fn test_non_go_binary_is_rejected() {
        // The test binary itself is a Rust ELF
        let exe = std::env::current_exe().unwrap();
        let err = check_go_binary(exe.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("not a Go binary"));
    }
}
