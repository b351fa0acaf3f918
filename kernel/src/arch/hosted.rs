//! Hosted architecture doubles.
//!
//! Compiled on every non-`riscv64` target so the kernel's subsystem logic
//! can run under the host test harness. Machine state that would live in
//! CSRs is modeled with atomics: the time counter only advances when a test
//! advances it, the timer-comparator write is recorded for inspection, and
//! the translation root is a shadow cell. The two context primitives cannot
//! be modeled in a hosted process and panic if reached; tests exercise the
//! scheduler's bookkeeping, not the switch itself.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Interrupt enable state
// ---------------------------------------------------------------------------

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable interrupts, returning the previous enable state.
pub fn disable_interrupts() -> bool {
    INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst)
}

/// Restore the enable state returned by [`disable_interrupts`].
pub fn restore_interrupts(was_enabled: bool) {
    INTERRUPTS_ENABLED.store(was_enabled, Ordering::SeqCst);
}

/// Unconditionally enable interrupts.
pub fn enable_interrupts() {
    INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
}

/// Current interrupt enable state.
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::SeqCst)
}

/// Idle until the next interrupt. A hosted no-op.
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

static TICKS: AtomicU64 = AtomicU64::new(0);
static TIMER_COMPARE: AtomicU64 = AtomicU64::new(u64::MAX);
static TIMER_IRQ_ENABLED: AtomicBool = AtomicBool::new(false);

/// Read the monotonic time counter.
pub fn read_time() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Program the timer comparator.
pub fn set_timer_compare(ticks: u64) {
    TIMER_COMPARE.store(ticks, Ordering::Relaxed);
}

/// Enable the timer interrupt source.
pub fn enable_timer_interrupt() {
    TIMER_IRQ_ENABLED.store(true, Ordering::Relaxed);
}

/// Disable the timer interrupt source.
pub fn disable_timer_interrupt() {
    TIMER_IRQ_ENABLED.store(false, Ordering::Relaxed);
}

/// Advance the hosted time counter (test control).
pub fn advance_time(ticks: u64) {
    TICKS.fetch_add(ticks, Ordering::Relaxed);
}

/// Last value written to the comparator (test inspection).
pub fn timer_compare() -> u64 {
    TIMER_COMPARE.load(Ordering::Relaxed)
}

/// Whether the timer interrupt source is enabled (test inspection).
pub fn timer_interrupt_enabled() -> bool {
    TIMER_IRQ_ENABLED.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Address translation root
// ---------------------------------------------------------------------------

static SATP_SHADOW: AtomicU64 = AtomicU64::new(0);

/// Install a new translation root, returning the previous one.
pub fn write_translation_root(tag: u64) -> u64 {
    SATP_SHADOW.swap(tag, Ordering::SeqCst)
}

/// Read the installed translation root.
pub fn read_translation_root() -> u64 {
    SATP_SHADOW.load(Ordering::SeqCst)
}

/// Allow supervisor access to user pages. A hosted no-op.
pub fn enable_user_memory_access() {}

// ---------------------------------------------------------------------------
// Context primitives
// ---------------------------------------------------------------------------

/// Saved callee-saved register state of a suspended kernel thread.
///
/// Layout matches the bare-metal switch assembly: s0..s11, then ra, then sp.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ThreadContext {
    pub s: [usize; 12],
    pub ra: usize,
    pub sp: usize,
}

impl ThreadContext {
    pub const fn zeroed() -> Self {
        Self {
            s: [0; 12],
            ra: 0,
            sp: 0,
        }
    }
}

/// Address of the spawn trampoline that new thread contexts return into.
pub fn thread_startup_addr() -> usize {
    // Never executed on a hosted target; a recognizable poison value.
    0xdead_0000
}

/// Save the current context into `old` and resume `new`.
///
/// # Safety
/// Both pointers must reference valid, distinct contexts. Not available on
/// hosted targets.
pub unsafe fn context_switch(_old: *mut ThreadContext, _new: *const ThreadContext) {
    unimplemented!("context switch requires bare-metal target");
}

/// Enter user mode through `frame`, with `anchor` installed in `sscratch`.
///
/// # Safety
/// Not available on hosted targets.
pub unsafe fn user_jump(_frame: &super::TrapFrame, _anchor: usize) -> ! {
    unimplemented!("user-mode entry requires bare-metal target");
}

/// Stop the machine.
pub fn halt() -> ! {
    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        std::process::exit(0);
    }
    #[cfg(target_os = "none")]
    loop {
        core::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

pub mod console {
    use core::fmt;

    /// Back end for the `print!`/`println!` macros.
    pub fn _print(args: fmt::Arguments) {
        #[cfg(not(target_os = "none"))]
        {
            extern crate std;
            use std::io::Write;
            let _ = std::io::stdout().write_fmt(args);
        }
        #[cfg(target_os = "none")]
        let _ = args;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_advances_monotonically() {
        let before = read_time();
        advance_time(5);
        assert!(read_time() >= before + 5);
    }
}
