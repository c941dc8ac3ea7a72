//! Go runtime value shapes and navigation helpers
//!
//! Only the shapes the probes read are modeled: interface headers, strings,
//! slices, and `hpack.HeaderField`. Field offsets inside Go structs come from
//! the per-process table, never from constants.

use crate::host::{CallContext, Register, UserMemory};
use crate::proc_info::{GoProcInfo, OffsetId};

/// Two-word interface value: `(itab, data)`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GoInterface {
    pub itab: u64,
    pub data: u64,
}

/// `string` header
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GoString {
    pub ptr: u64,
    pub len: u64,
}

/// Slice header
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GoSlice {
    pub ptr: u64,
    pub len: u64,
    pub cap: u64,
}

/// `golang.org/x/net/http2/hpack.HeaderField`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GoHeaderField {
    pub name: GoString,
    pub value: GoString,
    pub sensitive: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7],
}

/// Element stride of `[]hpack.HeaderField`
pub const HEADER_FIELD_SIZE: u64 = core::mem::size_of::<GoHeaderField>() as u64;

/// Read a value, falling back to its zero value on a denied read
#[inline(always)]
pub fn read_or_default<T, M>(mem: &M, addr: u64) -> T
where
    T: Copy + Default,
    M: UserMemory,
{
    mem.read_user::<T>(addr).unwrap_or_default()
}

#[inline(always)]
pub fn decode_interface<M: UserMemory>(mem: &M, addr: u64) -> GoInterface {
    read_or_default(mem, addr)
}

/// Whether the interface at `addr` holds gRPC's TLS wrapper connection type.
///
/// A zero itab is never recognized, even when the process table has none
/// configured.
#[inline(always)]
pub fn is_recognized_wrapper<M: UserMemory>(mem: &M, addr: u64, info: &GoProcInfo) -> bool {
    let itab = decode_interface(mem, addr).itab;
    itab != 0 && itab == info.credentials_syscall_conn_itab
}

/// Address of the field `id` inside the struct at `base`
#[inline(always)]
#[must_use]
pub fn navigate(base: u64, id: OffsetId, info: &GoProcInfo) -> u64 {
    base.wrapping_add(info.offset(id))
}

/// Follow the pointer stored in field `id` of the struct at `base`
#[inline(always)]
pub fn deref_field<M: UserMemory>(mem: &M, base: u64, id: OffsetId, info: &GoProcInfo) -> u64 {
    read_or_default::<u64, M>(mem, navigate(base, id, info))
}

/// goid of the calling goroutine, 0 when it cannot be determined.
///
/// Under the register ABI R14 holds the current `g`. Older releases keep it in
/// thread-local storage, which is not reachable from a uprobe portably.
#[inline(always)]
pub fn current_goroutine_id<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> u64
where
    C: CallContext,
    M: UserMemory,
{
    if !info.uses_register_abi() {
        return 0;
    }
    let g = ctx.register(Register::R14);
    if g == 0 {
        return 0;
    }
    read_or_default::<u64, M>(mem, navigate(g, OffsetId::RuntimeGGoid, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc_info::go_version;
    use crate::testing::{MockCall, MockHost};

    #[test]
    fn test_header_field_stride() {
        assert_eq!(HEADER_FIELD_SIZE, 40);
        assert_eq!(core::mem::size_of::<GoSlice>(), 24);
    }

    #[test]
    fn test_zero_itab_never_matches() {
        let mut host = MockHost::new();
        let info = GoProcInfo::new(go_version(1, 20, 0));
        // unreadable and zero itabs both decode to 0
        assert!(!is_recognized_wrapper(&host, 0x2000, &info));
        host.memory.write(0x2000, &GoInterface { itab: 0, data: 0x3000 });
        assert!(!is_recognized_wrapper(&host, 0x2000, &info));

        let mut info = info;
        info.credentials_syscall_conn_itab = 0x4a_0000;
        host.memory.write(0x2000, &GoInterface { itab: 0x4a_0000, data: 0x3000 });
        assert!(is_recognized_wrapper(&host, 0x2000, &info));
        host.memory.write(0x2000, &GoInterface { itab: 0x4b_0000, data: 0x3000 });
        assert!(!is_recognized_wrapper(&host, 0x2000, &info));
    }

    #[test]
    fn test_denied_interface_read_is_zero() {
        let host = MockHost::new();
        assert_eq!(decode_interface(&host, 0x1000), GoInterface::default());
    }

    #[test]
    fn test_goroutine_id_from_r14() {
        let mut host = MockHost::new();
        let info = GoProcInfo::new(go_version(1, 21, 0)).with_offset(OffsetId::RuntimeGGoid, 152);
        host.memory.write_u64(0xc000_0000 + 152, 4242);
        let ctx = MockCall::new(0).with_register(Register::R14, 0xc000_0000);
        assert_eq!(current_goroutine_id(&ctx, &host, &info), 4242);

        let legacy = GoProcInfo::new(go_version(1, 16, 0)).with_offset(OffsetId::RuntimeGGoid, 152);
        assert_eq!(current_goroutine_id(&ctx, &host, &legacy), 0);
    }
}
