//! Ring 3 support: the saved trap frame, the int 0x80 syscall entry shim
//! and `do_iret`, which launches (or resumes) a user context.

use core::arch::naked_asm;

/// Registers saved on every user → kernel transition, in stack order:
/// the general-purpose block our shim pushes, then the iretq frame the
/// CPU pushed. `do_iret` consumes the same layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // iretq frame
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// IF set plus the always-one reserved bit.
pub const RFLAGS_USER: u64 = 0x202;

impl TrapFrame {
    /// A frame that will enter Ring 3 with interrupts enabled.
    /// rip/rsp are filled in by the loader.
    pub fn new_user() -> TrapFrame {
        let mut frame = TrapFrame::default();
        frame.cs = super::gdt::user_code_selector().0 as u64;
        frame.ss = super::gdt::user_data_selector().0 as u64;
        frame.rflags = RFLAGS_USER;
        frame
    }
}

/// int 0x80 entry, reachable from Ring 3 (DPL=3 gate).
///
/// The CPU has pushed SS, RSP, RFLAGS, CS, RIP. We push the remaining
/// general-purpose registers so RSP points at a complete `TrapFrame`,
/// hand it to the dispatcher, and unwind the same way. The dispatcher
/// writes the syscall result into the frame's rax slot.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // rsp now points at the TrapFrame; 16-byte aligned here, so the
        // call below gives the dispatcher a standard SysV entry stack.
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        dispatch = sym crate::syscalls::dispatch,
    );
}

/// Launch the context stored in a trap frame and never return.
///
/// Used to enter a fresh user program (exec), to resume a forked child in
/// its copied parent frame, and by the page-fault path when rebuilding a
/// context is pointless.
#[unsafe(naked)]
pub unsafe extern "C" fn do_iret(frame: *const TrapFrame) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    );
}
