//! The stack switch primitive.
//!
//! `weft_fiber_switch(save, resume)` pushes the callee-saved register set
//! onto the current stack, stores the stack pointer into `*save`, installs
//! the stack pointer from `*resume` and pops the register set found there.
//! A freshly seeded stack (see `stack::seed`) resumes into `fiber_entry`.

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber switching is only implemented for x86_64 and aarch64");

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".text",
    ".globl weft_fiber_switch",
    ".hidden weft_fiber_switch",
    ".type weft_fiber_switch, @function",
    ".balign 16",
    "weft_fiber_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov qword ptr [rdi], rsp",
    "mov rsp, qword ptr [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size weft_fiber_switch, . - weft_fiber_switch",
);

#[cfg(target_arch = "aarch64")]
std::arch::global_asm!(
    ".text",
    ".globl weft_fiber_switch",
    ".hidden weft_fiber_switch",
    ".type weft_fiber_switch, @function",
    ".balign 16",
    "weft_fiber_switch:",
    "sub sp, sp, #160",
    "stp x29, x30, [sp]",
    "stp x19, x20, [sp, #16]",
    "stp x21, x22, [sp, #32]",
    "stp x23, x24, [sp, #48]",
    "stp x25, x26, [sp, #64]",
    "stp x27, x28, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "ldr x9, [x1]",
    "mov sp, x9",
    "ldp x29, x30, [sp]",
    "ldp x19, x20, [sp, #16]",
    "ldp x21, x22, [sp, #32]",
    "ldp x23, x24, [sp, #48]",
    "ldp x25, x26, [sp, #64]",
    "ldp x27, x28, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
    ".size weft_fiber_switch, . - weft_fiber_switch",
);

unsafe extern "C" {
    /// # Safety
    ///
    /// `save` must point to a writable stack-pointer slot. `resume` must
    /// hold a stack pointer previously written by this function or by
    /// `stack::seed`, whose stack is not currently executing anywhere.
    pub(super) fn weft_fiber_switch(save: *mut usize, resume: *const usize);
}

/// Number of callee-saved machine words the switch pushes before storing
/// the stack pointer. Used by the stack seeding code.
#[cfg(target_arch = "x86_64")]
pub(super) const SWITCH_FRAME_WORDS: usize = 6;

#[cfg(target_arch = "aarch64")]
pub(super) const SWITCH_FRAME_WORDS: usize = 20;
