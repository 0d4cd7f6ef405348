use core::arch::naked_asm;

/// CPU register context saved and restored by the low-level switch.
/// Callee-saved registers of the System V AMD64 ABI plus rip.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Empty context; filled in when the owner is first switched away from.
    pub fn empty() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
        }
    }

    /// Context for a thread that has never run. The first switch lands in
    /// `thread_startup`, which moves r12/r13 into the argument registers
    /// and enters the kernel-thread prologue.
    pub fn for_kernel_thread(entry: fn(usize), arg: usize, stack_top: u64) -> Self {
        // 16-byte alignment minus the return-address slot, per the ABI.
        let aligned_sp = (stack_top - 8) & !0xF;
        Context {
            rsp: aligned_sp,
            rbp: 0,
            rbx: 0,
            r12: entry as usize as u64,
            r13: arg as u64,
            r14: 0,
            r15: 0,
            rip: thread_startup as usize as u64,
        }
    }
}

/// First instructions of every new thread. The entry function and its
/// argument ride in through callee-saved registers because the switch
/// preserves nothing else.
#[unsafe(naked)]
extern "C" fn thread_startup() {
    naked_asm!(
        "mov rdi, r12",
        "mov rsi, r13",
        "call {main}",
        main = sym super::kernel_thread_main,
    );
}

/// Switch from `old` to `new`: save callee-saved registers and the resume
/// address into `old`, restore from `new`, and continue wherever `new`
/// last left off.
///
/// Must be called with interrupts disabled. Between the saves and the
/// final jump no stack memory outside the incoming thread's page is
/// touched.
///
/// # Safety
/// Both pointers must reference valid contexts with live stacks.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
    naked_asm!(
        // Save callee-saved registers into `old` (rdi).
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // Restore from `new` (rsi) and jump to its saved rip.
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        // Resume point when this context is switched back to.
        "2:",
        "ret",
    );
}

/// Restore `new` without saving the outgoing context. Used when the
/// outgoing thread is dying and will never be resumed.
///
/// # Safety
/// The context pointer must be valid.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(new: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp [rdi + 0x38]",
    );
}
