//! The context-switch primitives.
//!
//! Four naked routines with hand-written prologues move control between
//! the live coroutine, the storage area, and the host:
//!
//! - `ring_start`: saves the host continuation, spawns the pending
//!   coroutines, and enters the last-spawned one.
//! - `ring_yield`: parks the live frame at the bottom of the storage area
//!   and enters the image at the top.
//! - `enter_next`: opens the scratch gap, materializes the top image onto
//!   the thread stack, loads the argument-register file, and returns into
//!   it.
//! - `cleanup`: the return address of every coroutine entry point; picks
//!   the next image, or pops the host continuation when the ring is empty.
//!
//! The prologue layout IS the platform contract: every push below mirrors
//! a slot in the image layout built by `image.rs`, and the restore tail
//! pops them in exact reverse. Adding or removing a push without updating
//! `SAVED_REGS` corrupts every restored coroutine.

use std::arch::naked_asm;

use crate::Word;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("ringlet only supports x86_64");

/// Arguments passed in registers before the rest go on the stack.
#[cfg(not(windows))]
pub(super) const IN_REGISTER_ARGS: usize = 6; // rdi, rsi, rdx, rcx, r8, r9
#[cfg(windows)]
pub(super) const IN_REGISTER_ARGS: usize = 4; // rcx, rdx, r8, r9

/// Callee-saved registers captured per image, rbp excluded.
///
/// The full ABI set, not a narrow rbx(/rdi/rsi) set: coroutine bodies are
/// arbitrary compiled code and may hold live values in any callee-saved
/// register across a yield.
#[cfg(not(windows))]
pub(super) const SAVED_REGS: usize = 5; // rbx, r12..r15
#[cfg(windows)]
pub(super) const SAVED_REGS: usize = 7; // rbx, rsi, rdi, r12..r15

/// Shadow space words the Microsoft x64 ABI reserves above a call.
#[cfg(not(windows))]
pub(super) const SHADOW_WORDS: usize = 0;
#[cfg(windows)]
pub(super) const SHADOW_WORDS: usize = 4;

/// Saved registers + ring-base word + entry word + cleanup word.
pub(super) const FIXED_WORDS: usize = SAVED_REGS + 3;

/// Offset from an image's bottom to its first argument word. Also where
/// the ABI expects on-stack arguments, so excess-argument relocation is a
/// move down to this same offset on both platforms.
pub(super) const ARG_OFFSET: usize = FIXED_WORDS + SHADOW_WORDS;

/// Scratch margin, in words, between the materialized image and the
/// restore machinery's own frames.
pub(super) const EXTRA_STACK: usize = 96;

/// Recognizable fill for shadow-space words in virgin images.
#[cfg(windows)]
pub(super) const SHADOW_FILL: Word = 0x5555_5555_5555_5555;

// TODO: preserve xmm6..xmm15 on Windows so floating-point locals survive a
// yield; until then floats may not be held across a yield point.

/// Register file the restore tail loads before entering an image.
///
/// `rsp` is the image bottom: the tail pops the callee-saved slots and the
/// frame pointer from it, then returns into the entry (virgin) or resume
/// address. The argument slots are loaded unconditionally; they only carry
/// meaning for a virgin image, and land in dead caller-saved registers for
/// a resumed one.
#[repr(C)]
pub(super) struct Resume {
    pub(super) rsp: *mut Word,
    pub(super) args: [Word; 6],
}

impl Resume {
    pub(super) fn idle() -> Self {
        Resume {
            rsp: std::ptr::null_mut(),
            args: [0; 6],
        }
    }
}

/// Return address planted in every virgin image. No offset arithmetic is
/// needed: `cleanup` is naked, so it runs with the retiring coroutine's
/// stack untouched.
pub(super) fn cleanup_entry() -> Word {
    cleanup as usize as Word
}

#[cfg(not(windows))]
#[unsafe(naked)]
pub(super) unsafe extern "C" fn ring_start() {
    naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // host continuation: rsp now points at the saved r15
        "mov rdi, rsp",
        "and rsp, -16",
        "call {begin}",
        "jmp {enter}",
        begin = sym super::begin_ring,
        enter = sym enter_next,
    )
}

#[cfg(not(windows))]
#[unsafe(naked)]
pub(super) unsafe extern "C" fn ring_yield() {
    naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rbp",
        "and rsp, -16",
        "call {park}",
        "jmp {enter}",
        park = sym super::park_current,
        enter = sym enter_next,
    )
}

#[cfg(not(windows))]
#[unsafe(naked)]
unsafe extern "C" fn enter_next() -> ! {
    naked_asm!(
        "and rsp, -16",
        "call {peek}",
        // open the scratch gap below the incoming image
        "lea rax, [rax + {extra}]",
        "shl rax, 3",
        "sub rsp, rax",
        "and rsp, -16",
        "call {materialize}",
        // rax -> Resume { rsp, args[6] }
        "mov rdi, [rax + 8]",
        "mov rsi, [rax + 16]",
        "mov rdx, [rax + 24]",
        "mov rcx, [rax + 32]",
        "mov r8, [rax + 40]",
        "mov r9, [rax + 48]",
        "mov rsp, [rax]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        peek = sym super::peek_next_words,
        materialize = sym super::materialize_next,
        extra = const EXTRA_STACK,
    )
}

#[cfg(not(windows))]
#[unsafe(naked)]
unsafe extern "C" fn cleanup() -> ! {
    naked_asm!(
        "call {retire}",
        "test rax, rax",
        "jz {enter}",
        // last coroutine retired: pop the host continuation
        "mov rsp, [rax]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        retire = sym super::retire_current,
        enter = sym enter_next,
    )
}

#[cfg(windows)]
#[unsafe(naked)]
pub(super) unsafe extern "C" fn ring_start() {
    naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "push rbx",
        "push rsi",
        "push rdi",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rcx, rsp",
        "and rsp, -16",
        "sub rsp, 32",
        "call {begin}",
        "jmp {enter}",
        begin = sym super::begin_ring,
        enter = sym enter_next,
    )
}

#[cfg(windows)]
#[unsafe(naked)]
pub(super) unsafe extern "C" fn ring_yield() {
    naked_asm!(
        "push rbp",
        "mov rbp, rsp",
        "push rbx",
        "push rsi",
        "push rdi",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rcx, rbp",
        "and rsp, -16",
        "sub rsp, 32",
        "call {park}",
        "jmp {enter}",
        park = sym super::park_current,
        enter = sym enter_next,
    )
}

#[cfg(windows)]
#[unsafe(naked)]
unsafe extern "C" fn enter_next() -> ! {
    naked_asm!(
        "and rsp, -16",
        "sub rsp, 32",
        "call {peek}",
        "lea rax, [rax + {extra}]",
        "shl rax, 3",
        "sub rsp, rax",
        "and rsp, -16",
        "sub rsp, 32",
        "call {materialize}",
        "mov rcx, [rax + 8]",
        "mov rdx, [rax + 16]",
        "mov r8, [rax + 24]",
        "mov r9, [rax + 32]",
        "mov rsp, [rax]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rdi",
        "pop rsi",
        "pop rbx",
        "pop rbp",
        "ret",
        peek = sym super::peek_next_words,
        materialize = sym super::materialize_next,
        extra = const EXTRA_STACK,
    )
}

#[cfg(windows)]
#[unsafe(naked)]
unsafe extern "C" fn cleanup() -> ! {
    naked_asm!(
        "sub rsp, 32",
        "call {retire}",
        "test rax, rax",
        "jz {enter}",
        "mov rsp, [rax]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rdi",
        "pop rsi",
        "pop rbx",
        "pop rbp",
        "ret",
        retire = sym super::retire_current,
        enter = sym enter_next,
    )
}
