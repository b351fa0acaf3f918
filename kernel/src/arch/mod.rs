//! Architecture support.
//!
//! Everything the portable kernel needs from the machine goes through this
//! module: interrupt enable state, the timer (`time` CSR and comparator),
//! the address-translation root (`satp`), the console, and the two context
//! primitives the thread and process cores are built on (kernel context
//! switch, user-mode entry through a trap frame).
//!
//! On `riscv64` bare metal these are the real CSR/asm implementations. On
//! any other target they are deterministic software doubles so the kernel's
//! subsystem logic can be exercised by the host test harness: time is an
//! atomic tick counter, the comparator write is recorded, and `satp` is a
//! shadow cell.

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
pub use riscv64::*;

#[cfg(not(target_arch = "riscv64"))]
pub mod hosted;

#[cfg(not(target_arch = "riscv64"))]
pub use hosted::*;

/// Saved user-mode register state at a privileged entry.
///
/// `x[0]` is hardwired zero and stored only to keep the indexing natural.
/// The layout is fixed: the user-entry assembly restores registers by
/// offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// General-purpose registers x0..x31.
    pub x: [usize; 32],
    /// Saved `sstatus` to install on `sret`.
    pub sstatus: usize,
    /// Saved `sepc`: the PC to resume at.
    pub sepc: usize,
}

/// Register-file indices for the named RISC-V registers.
pub const REG_RA: usize = 1;
pub const REG_SP: usize = 2;
pub const REG_A0: usize = 10;
pub const REG_A7: usize = 17;

impl TrapFrame {
    /// An all-zero frame.
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 32],
            sstatus: 0,
            sepc: 0,
        }
    }

    /// Syscall argument register `a0 + n` (n in 0..=5).
    pub fn arg(&self, n: usize) -> usize {
        debug_assert!(n <= 5);
        self.x[REG_A0 + n]
    }

    /// Syscall number register `a7`.
    pub fn syscall_number(&self) -> usize {
        self.x[REG_A7]
    }

    /// Result register `a0`.
    pub fn set_result(&mut self, value: i64) {
        self.x[REG_A0] = value as usize;
    }
}

/// `sstatus.SPP`: previous privilege was supervisor.
pub const SSTATUS_SPP: usize = 1 << 8;
/// `sstatus.SIE`: supervisor interrupt enable.
pub const SSTATUS_SIE: usize = 1 << 1;
/// `sstatus.SPIE`: interrupt enable to install on `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// `sstatus.SUM`: supervisor access to user pages.
pub const SSTATUS_SUM: usize = 1 << 18;
