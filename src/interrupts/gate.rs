//! The interrupt gate: the kernel's one mutual-exclusion primitive for its
//! own data structures. Every ready/sleep-queue mutation and every thread
//! status transition happens with interrupts off.

use x86_64::instructions::interrupts;

/// Disable interrupts and return the prior state.
/// Idempotent; callers restore the saved state on every exit path.
pub fn disable() -> bool {
    let was_enabled = interrupts::are_enabled();
    interrupts::disable();
    was_enabled
}

/// Restore a state previously returned by `disable`.
pub fn restore(was_enabled: bool) {
    if was_enabled {
        interrupts::enable();
    }
}

pub fn enabled() -> bool {
    interrupts::are_enabled()
}

/// Run a short critical section with interrupts off.
pub fn with_disabled<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = disable();
    let result = f();
    restore(was_enabled);
    result
}
