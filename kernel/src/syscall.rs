//! System call dispatch.
//!
//! The trap handler lands here with the saved user frame: `a7` selects
//! the call, `a0..a5` carry arguments, and the result (or a negative
//! [`KernelError`] code) is placed back in `a0`. User pointers are
//! validated against the active address space and transferred through
//! the mm user-copy helpers; nothing dereferences user memory directly.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::TrapFrame;
use crate::error::{KernelError, KernelResult};
use crate::io::IoRef;
use crate::mm::{self, PteFlags};
use crate::process::{self, PROCESS_IOMAX};
use crate::sched;
use crate::timer;
use crate::{drivers, fs};

pub const SYSCALL_EXIT: usize = 0;
pub const SYSCALL_EXEC: usize = 1;
pub const SYSCALL_FORK: usize = 2;
pub const SYSCALL_WAIT: usize = 3;
pub const SYSCALL_PRINT: usize = 4;
pub const SYSCALL_USLEEP: usize = 5;
pub const SYSCALL_DEVOPEN: usize = 6;
pub const SYSCALL_FSOPEN: usize = 7;
pub const SYSCALL_FSCREATE: usize = 8;
pub const SYSCALL_FSDELETE: usize = 9;
pub const SYSCALL_CLOSE: usize = 10;
pub const SYSCALL_READ: usize = 11;
pub const SYSCALL_WRITE: usize = 12;
pub const SYSCALL_IOCTL: usize = 13;
pub const SYSCALL_PIPE: usize = 14;
pub const SYSCALL_IODUP: usize = 15;

/// Control-operation numbers for the `ioctl` syscall.
pub const IOCTL_GETBLKSZ: usize = 0;
pub const IOCTL_GETEND: usize = 1;
pub const IOCTL_SETEND: usize = 2;
pub const IOCTL_GETPOS: usize = 3;
pub const IOCTL_SETPOS: usize = 4;

/// Supervisor `scause` values routed here.
const CAUSE_ECALL_FROM_U: usize = 8;
const CAUSE_INSTR_PAGE_FAULT: usize = 12;
const CAUSE_LOAD_PAGE_FAULT: usize = 13;
const CAUSE_STORE_PAGE_FAULT: usize = 15;

/// Route a user-mode exception: `ecall` into the syscall dispatcher,
/// data-access page faults into the lazy user-memory backer. Anything
/// else ends the faulting process.
pub fn handle_user_trap(tfr: &mut TrapFrame, scause: usize, stval: usize) {
    match scause {
        CAUSE_ECALL_FROM_U => handle_syscall(tfr),
        CAUSE_LOAD_PAGE_FAULT | CAUSE_STORE_PAGE_FAULT => {
            if !mm::handle_user_page_fault(stval) {
                log::warn!("unbacked user page fault at {:#x}", stval);
                process::exit();
            }
        }
        CAUSE_INSTR_PAGE_FAULT => {
            log::warn!("user jumped to unmapped {:#x}", stval);
            process::exit();
        }
        _ => panic!("unexpected user trap: scause {:#x}", scause),
    }
}

/// Entry from the trap handler: advance past the `ecall`, dispatch, and
/// store the result in `a0`.
pub fn handle_syscall(tfr: &mut TrapFrame) {
    tfr.sepc += 4;
    let result = dispatch(tfr);
    tfr.set_result(match result {
        Ok(value) => value,
        Err(e) => e.code(),
    });
}

fn dispatch(tfr: &TrapFrame) -> KernelResult<i64> {
    match tfr.syscall_number() {
        SYSCALL_EXIT => process::exit(),
        SYSCALL_EXEC => sys_exec(
            tfr.arg(0) as i64,
            tfr.arg(1) as i64,
            tfr.arg(2),
        ),
        SYSCALL_FORK => process::fork(tfr).map(|tid| tid as i64),
        SYSCALL_WAIT => sys_wait(tfr.arg(0) as i64),
        SYSCALL_PRINT => sys_print(tfr.arg(0)),
        SYSCALL_USLEEP => {
            timer::sleep_us(tfr.arg(0) as u64);
            Ok(0)
        }
        SYSCALL_DEVOPEN => sys_devopen(tfr.arg(0) as i64, tfr.arg(1), tfr.arg(2)),
        SYSCALL_FSOPEN => sys_fsopen(tfr.arg(0) as i64, tfr.arg(1)),
        SYSCALL_FSCREATE => sys_fscreate(tfr.arg(0)),
        SYSCALL_FSDELETE => sys_fsdelete(tfr.arg(0)),
        SYSCALL_CLOSE => sys_close(tfr.arg(0) as i64),
        SYSCALL_READ => sys_read(tfr.arg(0) as i64, tfr.arg(1), tfr.arg(2)),
        SYSCALL_WRITE => sys_write(tfr.arg(0) as i64, tfr.arg(1), tfr.arg(2)),
        SYSCALL_IOCTL => sys_ioctl(tfr.arg(0) as i64, tfr.arg(1), tfr.arg(2)),
        SYSCALL_PIPE => sys_pipe(tfr.arg(0), tfr.arg(1)),
        SYSCALL_IODUP => sys_iodup(tfr.arg(0) as i64, tfr.arg(1) as i64),
        _ => Err(KernelError::NotSupported),
    }
}

/// Read a NUL-terminated, user-readable string argument.
fn user_str(vma: usize) -> KernelResult<String> {
    mm::read_user_str(vma, PteFlags::U | PteFlags::R)
}

/// Read a little-endian u64 from user memory.
fn user_u64(vma: usize) -> KernelResult<u64> {
    let mut raw = [0u8; 8];
    mm::copy_from_range(vma, &mut raw, PteFlags::U | PteFlags::R)?;
    Ok(u64::from_le_bytes(raw))
}

/// Write a little-endian u64 into user memory.
fn put_user_u64(vma: usize, value: u64) -> KernelResult<()> {
    mm::copy_to_range(vma, &value.to_le_bytes(), PteFlags::U | PteFlags::W)
}

fn sys_exec(fd: i64, argc: i64, argv_vma: usize) -> KernelResult<i64> {
    if argc < 0 {
        return Err(KernelError::Invalid);
    }
    let proc = process::current()?;
    let exeio = proc.descriptor(fd)?;

    // Marshal argv out of the old image before it is torn down.
    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc as usize {
        let slot = argv_vma + i * core::mem::size_of::<usize>();
        let ptr = user_u64(slot)? as usize;
        args.push(user_str(ptr)?);
    }

    process::exec(&exeio, &args)?;
    unreachable!("exec returned on success");
}

fn sys_wait(tid: i64) -> KernelResult<i64> {
    if tid < 0 {
        return Err(KernelError::Invalid);
    }
    sched::join(tid as usize).map(|tid| tid as i64)
}

fn sys_print(msg_vma: usize) -> KernelResult<i64> {
    let msg = user_str(msg_vma)?;
    let tid = sched::current();
    crate::println!(
        "Thread <{}:{}> says: {}",
        sched::thread_name(tid).unwrap_or("?"),
        tid,
        msg
    );
    Ok(0)
}

fn sys_devopen(fd: i64, name_vma: usize, instno: usize) -> KernelResult<i64> {
    let name = user_str(name_vma)?;
    let io = drivers::open_device(&name, instno)?;
    install(fd, io)
}

fn sys_fsopen(fd: i64, name_vma: usize) -> KernelResult<i64> {
    let name = user_str(name_vma)?;
    let io = fs::open(&name)?;
    install(fd, io)
}

/// Place a fresh I/O reference in the caller's descriptor table; the
/// reference is dropped again if no slot fits.
fn install(fd: i64, io: IoRef) -> KernelResult<i64> {
    let proc = process::current()?;
    proc.install_descriptor(fd, io)
}

fn sys_fscreate(name_vma: usize) -> KernelResult<i64> {
    let name = user_str(name_vma)?;
    fs::create(&name)?;
    Ok(0)
}

fn sys_fsdelete(name_vma: usize) -> KernelResult<i64> {
    let name = user_str(name_vma)?;
    fs::delete(&name)?;
    Ok(0)
}

fn sys_close(fd: i64) -> KernelResult<i64> {
    let proc = process::current()?;
    proc.close_descriptor(fd)?;
    Ok(0)
}

fn sys_read(fd: i64, buf_vma: usize, len: usize) -> KernelResult<i64> {
    if len == 0 {
        return Err(KernelError::BadDescriptor);
    }
    let proc = process::current()?;
    let io = proc.descriptor(fd)?;

    mm::validate_vptr(buf_vma, len, PteFlags::U | PteFlags::W)?;
    let mut bounce = vec![0u8; len];
    let n = io.read(&mut bounce)?;
    mm::copy_to_range(buf_vma, &bounce[..n], PteFlags::U | PteFlags::W)?;
    Ok(n as i64)
}

fn sys_write(fd: i64, buf_vma: usize, len: usize) -> KernelResult<i64> {
    if !(0..PROCESS_IOMAX as i64).contains(&fd) {
        return Err(KernelError::BadDescriptor);
    }
    if len == 0 {
        return Ok(0);
    }
    let proc = process::current()?;
    let io = proc.descriptor(fd)?;

    mm::validate_vptr(buf_vma, len, PteFlags::U | PteFlags::R)?;
    let mut bounce = vec![0u8; len];
    mm::copy_from_range(buf_vma, &mut bounce, PteFlags::U | PteFlags::R)?;
    io.write(&bounce).map(|n| n as i64)
}

fn sys_ioctl(fd: i64, cmd: usize, arg_vma: usize) -> KernelResult<i64> {
    let proc = process::current()?;
    let io = proc.descriptor(fd)?;

    match cmd {
        IOCTL_GETBLKSZ => Ok(io.block_size() as i64),
        IOCTL_GETEND => {
            put_user_u64(arg_vma, io.end()?)?;
            Ok(0)
        }
        IOCTL_SETEND => {
            io.set_end(user_u64(arg_vma)?)?;
            Ok(0)
        }
        IOCTL_GETPOS => {
            put_user_u64(arg_vma, io.position()?)?;
            Ok(0)
        }
        IOCTL_SETPOS => {
            io.set_position(user_u64(arg_vma)?)?;
            Ok(0)
        }
        _ => Err(KernelError::NotSupported),
    }
}

fn sys_pipe(wfd_vma: usize, rfd_vma: usize) -> KernelResult<i64> {
    let proc = process::current()?;

    let mut raw = [0u8; 4];
    mm::copy_from_range(wfd_vma, &mut raw, PteFlags::U | PteFlags::R)?;
    let wfd_req = i32::from_le_bytes(raw) as i64;
    mm::copy_from_range(rfd_vma, &mut raw, PteFlags::U | PteFlags::R)?;
    let rfd_req = i32::from_le_bytes(raw) as i64;

    // The two ends may never share a slot.
    if wfd_req == rfd_req && wfd_req >= 0 {
        return Err(KernelError::BadDescriptor);
    }
    if wfd_req >= PROCESS_IOMAX as i64 || rfd_req >= PROCESS_IOMAX as i64 {
        return Err(KernelError::BadDescriptor);
    }

    let (writer, reader) = crate::io::create_pipe();
    let wfd = proc.install_descriptor(wfd_req.max(-1), writer)?;
    let rfd = match proc.install_descriptor(rfd_req.max(-1), reader) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = proc.close_descriptor(wfd);
            return Err(e);
        }
    };

    mm::copy_to_range(wfd_vma, &(wfd as i32).to_le_bytes(), PteFlags::U | PteFlags::W)?;
    mm::copy_to_range(rfd_vma, &(rfd as i32).to_le_bytes(), PteFlags::U | PteFlags::W)?;
    Ok(0)
}

fn sys_iodup(oldfd: i64, newfd: i64) -> KernelResult<i64> {
    let proc = process::current()?;
    proc.dup_descriptor(oldfd, newfd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{REG_A0, REG_A7};
    use crate::sched::MAIN_TID;
    use crate::testing;

    /// Build a trap frame for syscall `number` with up to three args.
    fn frame(number: usize, args: &[usize]) -> TrapFrame {
        let mut tfr = TrapFrame::zeroed();
        tfr.x[REG_A7] = number;
        for (i, &arg) in args.iter().enumerate() {
            tfr.x[REG_A0 + i] = arg;
        }
        tfr.sepc = 0xC000_0000;
        tfr
    }

    fn call(number: usize, args: &[usize]) -> i64 {
        let mut tfr = frame(number, args);
        handle_syscall(&mut tfr);
        tfr.x[REG_A0] as i64
    }

    /// Copy a NUL-terminated string into the user scratch page and return
    /// its address.
    fn user_string(offset: usize, s: &str) -> usize {
        let vma = testing::user_scratch() + offset;
        let mut bytes = alloc::vec::Vec::from(s.as_bytes());
        bytes.push(0);
        mm::copy_to_range(vma, &bytes, PteFlags::U).unwrap();
        vma
    }

    fn close_all() {
        let proc = process::current().unwrap();
        for fd in 0..PROCESS_IOMAX as i64 {
            let _ = proc.close_descriptor(fd);
        }
    }

    #[test]
    fn test_unknown_syscall_not_supported() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();

        let mut tfr = frame(999, &[]);
        let sepc = tfr.sepc;
        handle_syscall(&mut tfr);
        assert_eq!(tfr.x[REG_A0] as i64, KernelError::NotSupported.code());
        // sepc advanced past the ecall.
        assert_eq!(tfr.sepc, sepc + 4);
    }

    #[test]
    fn test_wait_rejects_negative_tid() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();
        let code = call(SYSCALL_WAIT, &[(-5i64) as usize]);
        assert_eq!(code, KernelError::Invalid.code());
    }

    #[test]
    fn test_file_lifecycle_through_syscalls() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();
        close_all();

        let name = user_string(0, "sys-file");

        assert_eq!(call(SYSCALL_FSCREATE, &[name]), 0);
        // Creating the same name again is busy.
        assert_eq!(
            call(SYSCALL_FSCREATE, &[name]),
            KernelError::BusyOrExists.code()
        );

        let fd = call(SYSCALL_FSOPEN, &[(-1i64) as usize, name]);
        assert!(fd >= 0);

        // Grow to 600 bytes through ioctl SETEND.
        let arg = testing::user_scratch() + 0x100;
        mm::copy_to_range(arg, &600u64.to_le_bytes(), PteFlags::U).unwrap();
        assert_eq!(call(SYSCALL_IOCTL, &[fd as usize, IOCTL_SETEND, arg]), 0);

        // GETEND reports it back through user memory.
        mm::copy_to_range(arg, &0u64.to_le_bytes(), PteFlags::U).unwrap();
        assert_eq!(call(SYSCALL_IOCTL, &[fd as usize, IOCTL_GETEND, arg]), 0);
        let mut raw = [0u8; 8];
        mm::copy_from_range(arg, &mut raw, PteFlags::U).unwrap();
        assert_eq!(u64::from_le_bytes(raw), 600);

        // Write then read back through user buffers.
        let buf = testing::user_scratch() + 0x200;
        mm::copy_to_range(buf, b"payload through syscalls", PteFlags::U).unwrap();
        assert_eq!(call(SYSCALL_WRITE, &[fd as usize, buf, 24]), 24);

        mm::copy_to_range(arg, &0u64.to_le_bytes(), PteFlags::U).unwrap();
        assert_eq!(call(SYSCALL_IOCTL, &[fd as usize, IOCTL_SETPOS, arg]), 0);
        let out = testing::user_scratch() + 0x300;
        assert_eq!(call(SYSCALL_READ, &[fd as usize, out, 24]), 24);
        let mut back = [0u8; 24];
        mm::copy_from_range(out, &mut back, PteFlags::U).unwrap();
        assert_eq!(&back, b"payload through syscalls");

        assert_eq!(call(SYSCALL_CLOSE, &[fd as usize]), 0);
        assert_eq!(
            call(SYSCALL_CLOSE, &[fd as usize]),
            KernelError::BadDescriptor.code()
        );
        assert_eq!(call(SYSCALL_FSDELETE, &[name]), 0);
        assert_eq!(
            call(SYSCALL_FSOPEN, &[(-1i64) as usize, name]),
            KernelError::NotFound.code()
        );
    }

    #[test]
    fn test_descriptor_bounds_checked() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();

        let buf = testing::user_scratch();
        assert_eq!(
            call(SYSCALL_READ, &[99, buf, 8]),
            KernelError::BadDescriptor.code()
        );
        assert_eq!(
            call(SYSCALL_WRITE, &[(-3i64) as usize, buf, 8]),
            KernelError::BadDescriptor.code()
        );
        assert_eq!(
            call(SYSCALL_CLOSE, &[PROCESS_IOMAX]),
            KernelError::BadDescriptor.code()
        );
    }

    #[test]
    fn test_read_rejects_unmapped_user_buffer() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();
        close_all();

        let name = user_string(0x20, "unmapped");
        assert_eq!(call(SYSCALL_FSCREATE, &[name]), 0);
        let fd = call(SYSCALL_FSOPEN, &[(-1i64) as usize, name]);
        assert!(fd >= 0);

        // A buffer far outside any mapping fails validation, not the
        // kernel.
        let code = call(SYSCALL_READ, &[fd as usize, 0xF000_0000, 8]);
        assert_eq!(code, KernelError::Invalid.code());

        assert_eq!(call(SYSCALL_CLOSE, &[fd as usize]), 0);
        assert_eq!(call(SYSCALL_FSDELETE, &[name]), 0);
    }

    #[test]
    fn test_pipe_through_syscalls() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();
        close_all();

        let wfd_ptr = testing::user_scratch() + 0x400;
        let rfd_ptr = testing::user_scratch() + 0x404;
        mm::copy_to_range(wfd_ptr, &(-1i32).to_le_bytes(), PteFlags::U).unwrap();
        mm::copy_to_range(rfd_ptr, &(-1i32).to_le_bytes(), PteFlags::U).unwrap();
        assert_eq!(call(SYSCALL_PIPE, &[wfd_ptr, rfd_ptr]), 0);

        let mut raw = [0u8; 4];
        mm::copy_from_range(wfd_ptr, &mut raw, PteFlags::U).unwrap();
        let wfd = i32::from_le_bytes(raw);
        mm::copy_from_range(rfd_ptr, &mut raw, PteFlags::U).unwrap();
        let rfd = i32::from_le_bytes(raw);
        assert!(wfd >= 0 && rfd >= 0 && wfd != rfd);

        let buf = testing::user_scratch() + 0x500;
        mm::copy_to_range(buf, b"pipe bytes", PteFlags::U).unwrap();
        assert_eq!(call(SYSCALL_WRITE, &[wfd as usize, buf, 10]), 10);

        let out = testing::user_scratch() + 0x600;
        assert_eq!(call(SYSCALL_READ, &[rfd as usize, out, 10]), 10);
        let mut back = [0u8; 10];
        mm::copy_from_range(out, &mut back, PteFlags::U).unwrap();
        assert_eq!(&back, b"pipe bytes");

        // Requesting both ends in one slot is rejected.
        mm::copy_to_range(wfd_ptr, &3i32.to_le_bytes(), PteFlags::U).unwrap();
        mm::copy_to_range(rfd_ptr, &3i32.to_le_bytes(), PteFlags::U).unwrap();
        assert_eq!(
            call(SYSCALL_PIPE, &[wfd_ptr, rfd_ptr]),
            KernelError::BadDescriptor.code()
        );
        close_all();
    }

    #[test]
    fn test_iodup_through_syscalls() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();
        close_all();

        let name = user_string(0x40, "dup-me");
        assert_eq!(call(SYSCALL_FSCREATE, &[name]), 0);
        let fd = call(SYSCALL_FSOPEN, &[(-1i64) as usize, name]);
        assert!(fd >= 0);

        // Same-fd dup returns the fd unchanged.
        assert_eq!(
            call(SYSCALL_IODUP, &[fd as usize, fd as usize]),
            fd
        );
        // Dup to a chosen slot, then close both.
        assert_eq!(call(SYSCALL_IODUP, &[fd as usize, 9]), 9);
        assert_eq!(call(SYSCALL_CLOSE, &[9]), 0);
        assert_eq!(call(SYSCALL_CLOSE, &[fd as usize]), 0);
        assert_eq!(call(SYSCALL_FSDELETE, &[name]), 0);
    }

    #[test]
    fn test_devopen_through_registry() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();
        close_all();

        let _ = drivers::register_device("scratchblk", 0, crate::drivers::RamDisk::new(4));
        let name = user_string(0x60, "scratchblk");
        let fd = call(SYSCALL_DEVOPEN, &[(-1i64) as usize, name, 0]);
        assert!(fd >= 0);

        // The device speaks the block contract.
        assert_eq!(
            call(SYSCALL_IOCTL, &[fd as usize, IOCTL_GETBLKSZ, 0]),
            512
        );
        assert_eq!(call(SYSCALL_CLOSE, &[fd as usize]), 0);

        let missing = user_string(0x80, "nodev");
        assert_eq!(
            call(SYSCALL_DEVOPEN, &[(-1i64) as usize, missing, 0]),
            KernelError::NotFound.code()
        );
    }

    #[test]
    fn test_print_requires_valid_user_string() {
        let _guard = testing::kernel_lock();
        testing::enter_kernel_env();

        let msg = user_string(0x700, "hello from userspace");
        assert_eq!(call(SYSCALL_PRINT, &[msg]), 0);
        assert_eq!(
            call(SYSCALL_PRINT, &[0xF800_0000]),
            KernelError::Invalid.code()
        );
        // Keep the main thread's identity intact for other tests.
        assert_eq!(sched::current(), MAIN_TID);
    }
}
