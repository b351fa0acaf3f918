//! KtOS kernel library.
//!
//! A small cooperative kernel for a single-hart RISC-V Sv39 machine:
//! chunked physical allocator, three-level page tables with clone/reset
//! for fork and exec, an intrusive-list thread core with condition
//! variables and reentrant locks, a sorted alarm queue over one timer
//! comparator, a unified I/O object layer (memory buffers, seekable
//! streams, pipes), an LRU block cache, the KTFS filesystem, and the
//! process/syscall surface on top.
//!
//! The crate is `no_std`. On bare metal the kernel heap comes from
//! `linked_list_allocator`; on a hosted target the crate links `std`'s
//! system allocator instead, so the whole subsystem logic runs under the
//! ordinary test harness.

#![no_std]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the boot heap region to the allocator.
#[cfg(target_os = "none")]
pub fn heap_init(start: usize, size: usize) {
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) };
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod io;
pub mod log_service;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod timer;

pub use error::{KernelError, KernelResult};
