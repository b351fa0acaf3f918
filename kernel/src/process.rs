//! Process lifecycle.
//!
//! A process is an address space plus a table of I/O descriptors, owned
//! by one kernel thread. The bootstrap thread becomes process 0 on the
//! main address space; everything else is born by fork and replaced by
//! exec. Descriptors are `Arc` references into the unified I/O layer:
//! dup adds a reference, close drops one, and exit drops the table.

use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch::{TrapFrame, REG_A0, REG_SP};
use crate::error::{KernelError, KernelResult};
use crate::mm::{self, phys, Mtag, PteFlags, PAGE_SIZE, UMEM_END_VMA};
use crate::sched::{self, sync::Condition, Tid};
use crate::io::IoRef;

/// Maximum number of processes.
pub const NPROC: usize = 16;
/// I/O descriptors per process.
pub const PROCESS_IOMAX: usize = 16;

/// A user process.
pub struct Process {
    idx: usize,
    tid: Tid,
    mtag: Mtag,
    iotab: Mutex<[Option<IoRef>; PROCESS_IOMAX]>,
}

lazy_static! {
    static ref PROC_TABLE: Mutex<[Option<Arc<Process>>; NPROC]> = {
        const NONE: Option<Arc<Process>> = None;
        Mutex::new([NONE; NPROC])
    };
}

impl Process {
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The process's address-space tag.
    pub fn mtag(&self) -> Mtag {
        self.mtag
    }

    /// Look up an open descriptor.
    pub fn descriptor(&self, fd: i64) -> KernelResult<IoRef> {
        if !(0..PROCESS_IOMAX as i64).contains(&fd) {
            return Err(KernelError::BadDescriptor);
        }
        self.iotab.lock()[fd as usize]
            .clone()
            .ok_or(KernelError::BadDescriptor)
    }

    /// Install `io` at `fd`, or at the lowest free slot when `fd == -1`.
    /// Returns the descriptor number used.
    pub fn install_descriptor(&self, fd: i64, io: IoRef) -> KernelResult<i64> {
        let mut table = self.iotab.lock();
        if fd == -1 {
            let slot = table
                .iter()
                .position(|d| d.is_none())
                .ok_or(KernelError::TooManyOpen)?;
            table[slot] = Some(io);
            return Ok(slot as i64);
        }
        if !(0..PROCESS_IOMAX as i64).contains(&fd) || table[fd as usize].is_some() {
            return Err(KernelError::BadDescriptor);
        }
        table[fd as usize] = Some(io);
        Ok(fd)
    }

    /// Drop the reference held at `fd`.
    pub fn close_descriptor(&self, fd: i64) -> KernelResult<()> {
        if !(0..PROCESS_IOMAX as i64).contains(&fd) {
            return Err(KernelError::BadDescriptor);
        }
        self.iotab.lock()[fd as usize]
            .take()
            .map(|_| ())
            .ok_or(KernelError::BadDescriptor)
    }

    /// Duplicate `oldfd` onto `newfd` (or the lowest free slot when
    /// `newfd == -1`), closing any previous occupant. Duplicating a
    /// descriptor onto itself returns it unchanged.
    pub fn dup_descriptor(&self, oldfd: i64, newfd: i64) -> KernelResult<i64> {
        let mut table = self.iotab.lock();
        if !(0..PROCESS_IOMAX as i64).contains(&oldfd) {
            return Err(KernelError::BadDescriptor);
        }
        let old = table[oldfd as usize]
            .clone()
            .ok_or(KernelError::BadDescriptor)?;

        if newfd == oldfd {
            return Ok(oldfd);
        }
        let newfd = if newfd == -1 {
            table
                .iter()
                .position(|d| d.is_none())
                .ok_or(KernelError::TooManyOpen)? as i64
        } else {
            newfd
        };
        if !(0..PROCESS_IOMAX as i64).contains(&newfd) {
            return Err(KernelError::BadDescriptor);
        }
        // An occupied target is closed first, then given the added
        // reference.
        table[newfd as usize] = Some(old);
        Ok(newfd)
    }

    fn clone_iotab(&self) -> [Option<IoRef>; PROCESS_IOMAX] {
        self.iotab.lock().clone()
    }

    fn clear_iotab(&self) {
        let mut table = self.iotab.lock();
        for slot in table.iter_mut() {
            *slot = None;
        }
    }
}

/// Bind the bootstrap thread to process 0 on the active address space.
pub fn init() {
    let proc = Arc::new(Process {
        idx: 0,
        tid: sched::current(),
        mtag: mm::active_mspace(),
        iotab: Mutex::new(Default::default()),
    });
    let mut table = PROC_TABLE.lock();
    assert!(table[0].is_none(), "process manager initialized twice");
    table[0] = Some(proc.clone());
    drop(table);
    sched::set_process(proc.tid, proc);
    log::info!("proc: main process online");
}

/// The calling thread's process.
pub fn current() -> KernelResult<Arc<Process>> {
    sched::current_process().ok_or(KernelError::Invalid)
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

/// Marshal `args` into a fresh user stack page.
///
/// Layout, at the top of the page: the rebased `argv[]` pointer array
/// (argc + 1 entries, NUL-terminated) followed by the string bytes, the
/// whole frame rounded up to 16 bytes per the RISC-V ABI. Returns the
/// frame size.
fn build_stack(page: NonNull<u8>, args: &[String]) -> KernelResult<usize> {
    let argc = args.len();
    if argc + 1 > PAGE_SIZE / core::mem::size_of::<usize>() {
        return Err(KernelError::NoMemory);
    }

    let mut stksz = (argc + 1) * core::mem::size_of::<usize>();
    for arg in args {
        let need = arg.len() + 1;
        if PAGE_SIZE - stksz < need {
            return Err(KernelError::NoMemory);
        }
        stksz += need;
    }
    stksz = mm::round_up(stksz, 16);
    debug_assert!(stksz <= PAGE_SIZE);

    // The stack page will sit at the very top of user memory; pointers
    // written into argv[] must name addresses in that final mapping.
    let stack_vma = UMEM_END_VMA - PAGE_SIZE;
    let base = page.as_ptr() as usize;
    let argv_off = PAGE_SIZE - stksz;

    unsafe {
        let argv = (base + argv_off) as *mut usize;
        let mut str_off = argv_off + (argc + 1) * core::mem::size_of::<usize>();
        for (i, arg) in args.iter().enumerate() {
            *argv.add(i) = stack_vma + str_off;
            let dst = (base + str_off) as *mut u8;
            core::ptr::copy_nonoverlapping(arg.as_ptr(), dst, arg.len());
            *dst.add(arg.len()) = 0;
            str_off += arg.len() + 1;
        }
        *argv.add(argc) = 0;
    }
    Ok(stksz)
}

/// Everything `exec` does short of the jump to user mode.
///
/// On success the active address space holds the new image and the
/// returned trap frame is ready to enter it. Failures before the address
/// space is reset are reported to the caller; afterwards the process
/// cannot continue and is terminated here.
pub(crate) fn exec_prepare(exeio: &IoRef, args: &[String]) -> KernelResult<TrapFrame> {
    let stack_page = phys::alloc_page()?;
    unsafe {
        core::ptr::write_bytes(stack_page.as_ptr(), 0, PAGE_SIZE);
    }
    let stksz = match build_stack(stack_page, args) {
        Ok(n) => n,
        Err(e) => {
            unsafe { phys::free_page(stack_page) };
            return Err(e);
        }
    };

    // Point of no return: the old user image is gone.
    mm::reset_active_mspace();

    let entry = match crate::elf::load(exeio) {
        Ok(entry) => entry,
        Err(e) => {
            unsafe { phys::free_page(stack_page) };
            log::warn!("exec: load failed: {}", e);
            exit();
        }
    };

    let stack_vma = UMEM_END_VMA - PAGE_SIZE;
    if mm::map_page(
        stack_vma,
        stack_page,
        PteFlags::R | PteFlags::W | PteFlags::U,
    )
    .is_err()
    {
        unsafe { phys::free_page(stack_page) };
        log::warn!("exec: user stack mapping failed");
        exit();
    }

    let mut frame = TrapFrame::zeroed();
    frame.x[REG_SP] = UMEM_END_VMA - stksz;
    frame.x[REG_A0] = args.len();
    frame.x[REG_A0 + 1] = UMEM_END_VMA - stksz;
    frame.sepc = entry;
    // SPP and SIE clear: sret drops to user mode, with interrupts coming
    // back on through SPIE.
    frame.sstatus = crate::arch::SSTATUS_SPIE;
    Ok(frame)
}

/// Replace the current process image. Does not return on success.
pub fn exec(exeio: &IoRef, args: &[String]) -> KernelResult<()> {
    let frame = exec_prepare(exeio, args)?;
    unsafe { crate::arch::user_jump(&frame, sched::current_stack_anchor()) }
}

// ---------------------------------------------------------------------------
// fork
// ---------------------------------------------------------------------------

fn fork_entry(frame_raw: usize, cond_raw: usize) {
    // Reclaim ownership of the two allocations the parent leaked to us.
    let frame = unsafe { Box::from_raw(frame_raw as *mut TrapFrame) };
    let forked = unsafe { Arc::from_raw(cond_raw as *const Condition) };

    let proc = current().expect("forked thread has no process");
    mm::switch_mspace(proc.mtag());
    forked.broadcast();

    let frame = *frame;
    drop(forked);
    unsafe { crate::arch::user_jump(&frame, sched::current_stack_anchor()) }
}

/// Everything `fork` does short of waiting for the child to take over
/// its trap frame: clone the space, the descriptor table, and the frame
/// (child `a0` = 0), and spawn the child thread.
pub(crate) fn fork_prepare(tfr: &TrapFrame) -> KernelResult<(Tid, Arc<Condition>)> {
    let parent = current()?;
    let child_mtag = mm::clone_active_mspace()?;

    let idx = {
        let table = PROC_TABLE.lock();
        match table.iter().position(|p| p.is_none()) {
            Some(idx) => idx,
            None => {
                discard_space(child_mtag);
                return Err(KernelError::NoMemory);
            }
        }
    };

    let mut frame = Box::new(*tfr);
    frame.x[REG_A0] = 0;
    let forked = Arc::new(Condition::new("forked"));

    let frame_raw = Box::into_raw(frame) as usize;
    let cond_raw = Arc::into_raw(forked.clone()) as usize;
    let tid = match sched::spawn("forked", fork_entry, frame_raw, cond_raw) {
        Ok(tid) => tid,
        Err(e) => {
            // Take the leaked handles back before unwinding the rest.
            unsafe {
                drop(Box::from_raw(frame_raw as *mut TrapFrame));
                drop(Arc::from_raw(cond_raw as *const Condition));
            }
            discard_space(child_mtag);
            return Err(e);
        }
    };

    let child = Arc::new(Process {
        idx,
        tid,
        mtag: child_mtag,
        iotab: Mutex::new(parent.clone_iotab()),
    });
    PROC_TABLE.lock()[idx] = Some(child.clone());
    sched::set_process(tid, child);
    Ok((tid, forked))
}

/// Fork the current process. The parent gets the child's thread id; the
/// child resumes in user mode from the copied trap frame with `a0` = 0.
pub fn fork(tfr: &TrapFrame) -> KernelResult<Tid> {
    let (tid, forked) = fork_prepare(tfr)?;
    // The child confirms once it is running on its own space.
    forked.wait();
    Ok(tid)
}

/// Tear down a half-built child space.
fn discard_space(tag: Mtag) {
    let prev = mm::switch_mspace(tag);
    mm::reset_active_mspace();
    mm::switch_mspace(prev);
}

/// Terminate the current process: discard its address space, drop every
/// descriptor, release the table slot, and exit the thread.
pub fn exit() -> ! {
    if let Ok(proc) = current() {
        assert!(proc.idx != 0, "main process exited");
        mm::discard_active_mspace();
        proc.clear_iotab();
        PROC_TABLE.lock()[proc.idx] = None;
    }
    sched::exit();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Drop a process-table slot (test cleanup).
    pub fn clear_slot(idx: usize) {
        PROC_TABLE.lock()[idx] = None;
    }

    /// Whether a slot is occupied.
    pub fn slot_used(idx: usize) -> bool {
        PROC_TABLE.lock()[idx].is_some()
    }
}
