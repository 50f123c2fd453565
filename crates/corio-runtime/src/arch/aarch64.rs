//! aarch64 context switching implementation
//!
//! Preserves x19-x29, sp, lr and the callee-saved low halves d8-d15 per
//! the AAPCS64 calling convention. The resume address is the suspended
//! call's link register, so switching back continues right after the
//! `context_switch` call site.

use std::arch::naked_asm;

/// Callee-saved register block for a suspended coroutine.
///
/// Field order is load-bearing: the assembly below addresses these
/// by fixed byte offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    pub sp: u64,
    pub pc: u64,        // resume address (saved lr, or the trampoline)
    pub x: [u64; 10],   // x19..x28
    pub fp: u64,        // x29
    pub d: [u64; 8],    // d8..d15
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        Self { sp: 0, pc: 0, x: [0; 10], fp: 0, d: [0; 8] }
    }
}

/// Initialize a coroutine's context so that the first switch into it
/// enters `entry_fn(entry_arg)` on the supplied stack.
///
/// # Safety
///
/// `regs` must point to valid `SavedContext` memory and `stack_top` must be
/// the one-past-the-end address of a live stack block.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // sp must stay 16-byte aligned at all times on aarch64
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    *regs = SavedContext::zeroed();
    regs.sp = aligned_sp as u64;
    regs.pc = entry_trampoline as usize as u64;
    regs.x[0] = entry_fn as u64;  // x19
    regs.x[1] = entry_arg as u64; // x20
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function never returns (a finished coroutine parks itself
/// by yielding), so falling through is a hard fault.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0",
    );
}

/// Symmetric context swap.
///
/// Saves callee-saved registers to `old_regs` and loads from `new_regs`.
/// Returns (to the resumed side) when somebody later switches back into
/// `old_regs`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _old_regs: *mut SavedContext,
    _new_regs: *const SavedContext,
) {
    naked_asm!(
        // Save to old_regs (x0)
        "mov x2, sp",
        "str x2,  [x0, #0x00]",
        "str x30, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "str x29, [x0, #0x60]",
        "stp d8,  d9,  [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new_regs (x1)
        "ldr x2,  [x1, #0x00]",
        "mov sp, x2",
        "ldr x30, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldr x29, [x1, #0x60]",
        "ldp d8,  d9,  [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // Jump to the resume address
        "ret",
    );
}
