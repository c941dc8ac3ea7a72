//! Go calling convention decoding
//!
//! From Go 1.17 on amd64, integer argument words are passed in
//! RAX, RBX, RCX, RDI, RSI, R8, R9, R10, R11. Before that every argument lives
//! on the stack, starting one word above the return address. Each call site
//! declares where its arguments live under both conventions as [`ArgSlot`]s;
//! the only runtime decision is the version check.

use crate::host::{CallContext, Register, UserMemory};
use crate::proc_info::GoProcInfo;

/// Location of one argument word under each calling convention
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgSlot {
    pub register: Register,
    /// Byte offset from the stack pointer at function entry
    pub stack_offset: u64,
}

impl ArgSlot {
    #[must_use]
    pub const fn new(register: Register, stack_offset: u64) -> Self {
        Self { register, stack_offset }
    }
}

/// The receiver (or first argument) of a method call
pub const RECEIVER: ArgSlot = ArgSlot::new(Register::Rax, 8);

/// Read one argument word. A denied stack read yields 0.
#[inline(always)]
pub fn read_arg<C, M>(ctx: &C, mem: &M, info: &GoProcInfo, slot: ArgSlot) -> u64
where
    C: CallContext,
    M: UserMemory,
{
    if info.uses_register_abi() {
        ctx.register(slot.register)
    } else {
        mem.read_user::<u64>(ctx.stack_pointer().wrapping_add(slot.stack_offset)).unwrap_or(0)
    }
}

/// Read the receiver of the probed method
#[inline(always)]
pub fn first_argument<C, M>(ctx: &C, mem: &M, info: &GoProcInfo) -> u64
where
    C: CallContext,
    M: UserMemory,
{
    read_arg(ctx, mem, info, RECEIVER)
}
