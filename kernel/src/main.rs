//! Bare-metal kernel entry.
//!
//! A thin shell over the library: set up a boot stack, bring the
//! subsystems online in dependency order, attach the boot block device,
//! and idle. On hosted targets this binary is a stub; the library's test
//! suite is the way to run the kernel logic there.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::arch::global_asm;

    use ktos_kernel::{drivers, fs, log_service, mm, process, sched, timer};

    global_asm!(
        r#"
        .section .text.boot
        .global _start
    _start:
        la   sp, __boot_stack_top
        call kmain
    1:  wfi
        j    1b

        .section .bss
        .align 4
        .global __boot_stack
    __boot_stack:
        .space 16384
    __boot_stack_top:
    "#
    );

    /// Number of blocks in the boot RAM disk.
    const BOOT_DISK_BLOCKS: usize = 4096;

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        log_service::init();
        log::info!("ktos: booting");

        mm::init();
        sched::init();
        timer::init();
        process::init();
        timer::start_interrupter();

        // Until a VirtIO transport is attached, the boot volume is a
        // formatted RAM disk.
        let disk: ktos_kernel::io::IoRef = drivers::RamDisk::new(BOOT_DISK_BLOCKS);
        if let Err(e) = fs::Ktfs::format(&disk, 8).and_then(|_| fs::mount(disk.clone())) {
            log::warn!("ktos: no filesystem: {}", e);
        }
        let _ = drivers::register_device("blk", 0, disk);

        log::info!("ktos: boot complete");
        loop {
            sched::yield_now();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        ktos_kernel::println!("kernel panic: {}", info);
        ktos_kernel::arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("ktos-kernel is a bare-metal image; run `cargo test` on a host.");
}
