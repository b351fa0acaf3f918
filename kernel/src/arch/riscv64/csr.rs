//! Supervisor CSR access.

use core::arch::asm;

use riscv::register::{sie, sstatus};

/// Disable supervisor interrupts, returning the previous enable state.
pub fn disable_interrupts() -> bool {
    let was = sstatus::read().sie();
    unsafe { sstatus::clear_sie() };
    was
}

/// Restore the enable state returned by [`disable_interrupts`].
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        unsafe { sstatus::set_sie() };
    }
}

/// Unconditionally enable supervisor interrupts.
pub fn enable_interrupts() {
    unsafe { sstatus::set_sie() };
}

/// Current supervisor interrupt enable state.
pub fn interrupts_enabled() -> bool {
    sstatus::read().sie()
}

/// Idle until the next interrupt.
pub fn wait_for_interrupt() {
    riscv::asm::wfi();
}

/// Read the `time` CSR.
pub fn read_time() -> u64 {
    riscv::register::time::read64()
}

/// Enable the supervisor timer interrupt source.
pub fn enable_timer_interrupt() {
    unsafe { sie::set_stimer() };
}

/// Disable the supervisor timer interrupt source.
pub fn disable_timer_interrupt() {
    unsafe { sie::clear_stimer() };
}

/// Install a new translation root in `satp`, returning the previous value.
///
/// Issues `sfence.vma` so stale translations never outlive the switch.
pub fn write_translation_root(tag: u64) -> u64 {
    let prev: u64;
    unsafe {
        asm!("csrrw {prev}, satp, {new}", prev = out(reg) prev, new = in(reg) tag);
        asm!("sfence.vma");
    }
    prev
}

/// Read the current `satp` value.
pub fn read_translation_root() -> u64 {
    let value: u64;
    unsafe {
        asm!("csrr {0}, satp", out(reg) value);
    }
    value
}

/// Set `sstatus.SUM` so supervisor code can touch user pages.
pub fn enable_user_memory_access() {
    unsafe {
        asm!("csrs sstatus, {0}", in(reg) super::super::SSTATUS_SUM);
    }
}
