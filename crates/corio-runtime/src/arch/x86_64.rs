//! x86_64 context switching implementation
//!
//! Uses naked inline assembly for the register swap (stable since 1.88).
//! Only callee-saved registers plus stack/resume pointers are preserved;
//! everything else is clobbered by the switch, which is exactly the
//! System V AMD64 contract for an ordinary function call.

use std::arch::naked_asm;

/// Callee-saved register block for a suspended coroutine.
///
/// Field order is load-bearing: the assembly below addresses these
/// by fixed byte offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        Self { rsp: 0, rip: 0, rbx: 0, rbp: 0, r12: 0, r13: 0, r14: 0, r15: 0 }
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
    // 16-byte aligned at the trampoline, whose own `call` then gives the
    // entry function the standard System V AMD64 entry alignment.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function never returns (a finished coroutine parks itself
/// by yielding), so falling through is a hard fault.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
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
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
