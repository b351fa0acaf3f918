//! Physical and virtual memory management.
//!
//! Three layers, leaves first:
//! - [`phys`]: the chunked free-page allocator over raw RAM.
//! - [`paging`]: Sv39 page-table entries, tables, and range mapping.
//! - [`mspace`]: whole address spaces (tags, switch, clone, reset,
//!   user-fault backing, pointer validation, user-range copies).

pub mod mspace;
pub mod paging;
pub mod phys;

pub use mspace::{
    active_mspace, alloc_and_map_range, clone_active_mspace, copy_from_range, copy_to_range,
    discard_active_mspace, handle_user_page_fault, main_mspace, map_page, map_range,
    read_user_str, reset_active_mspace, set_range_flags, switch_mspace, unmap_and_free_range,
    validate_vptr, validate_vstr, zero_range, Mtag,
};
pub use paging::{Mapper, PageTable, Pte, PteFlags};

/// Log2 of the page size.
pub const PAGE_ORDER: usize = 12;
/// Size of one page (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_ORDER;
/// Entries per page table.
pub const PTE_CNT: usize = 512;
/// Size of a level-1 leaf mapping (2 MiB megapage).
pub const MEGA_SIZE: usize = PTE_CNT * PAGE_SIZE;
/// Size of a level-2 leaf mapping (1 GiB gigapage).
pub const GIGA_SIZE: usize = PTE_CNT * MEGA_SIZE;

/// Physical address where RAM begins.
pub const RAM_START_PMA: usize = 0x8000_0000;
/// RAM size.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
/// One past the last RAM address.
pub const RAM_END_PMA: usize = RAM_START_PMA + RAM_SIZE;

/// Start of the user virtual-memory window.
pub const UMEM_START_VMA: usize = 0xC000_0000;
/// End (exclusive) of the user virtual-memory window.
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

/// Size of the boot kernel heap carved out ahead of the page pool.
#[cfg(target_arch = "riscv64")]
const HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Round `n` up to a multiple of `k` (power of two).
pub(crate) const fn round_up(n: usize, k: usize) -> usize {
    (n + k - 1) & !(k - 1)
}

/// Round `n` down to a multiple of `k` (power of two).
pub(crate) const fn round_down(n: usize, k: usize) -> usize {
    n & !(k - 1)
}

/// Boot-time memory initialization.
///
/// Builds the main page tables with the identity mapping the rest of the
/// kernel relies on, enables paging, carves the kernel heap out of the
/// space after the kernel image, and hands the remaining RAM to the page
/// pool:
///
/// - `[0, RAM_START)` as RW global gigapages (MMIO region),
/// - the kernel image with fine-grained permissions (text RX, rodata R,
///   data/bss RW, all global),
/// - the rest of the first 2 MiB of RAM as RW global pages,
/// - remaining RAM as RW global megapages.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    use paging::{PageTable, Pte, PteFlags};

    extern "C" {
        static _kimg_start: u8;
        static _kimg_text_start: u8;
        static _kimg_text_end: u8;
        static _kimg_rodata_start: u8;
        static _kimg_rodata_end: u8;
        static _kimg_data_start: u8;
        static _kimg_end: u8;
    }

    static mut MAIN_PT2: PageTable = PageTable::new();
    static mut MAIN_PT1: PageTable = PageTable::new();
    static mut MAIN_PT0: PageTable = PageTable::new();

    let (text_start, text_end, rodata_start, rodata_end, data_start, kimg_start, kimg_end) = unsafe {
        (
            core::ptr::addr_of!(_kimg_text_start) as usize,
            core::ptr::addr_of!(_kimg_text_end) as usize,
            core::ptr::addr_of!(_kimg_rodata_start) as usize,
            core::ptr::addr_of!(_kimg_rodata_end) as usize,
            core::ptr::addr_of!(_kimg_data_start) as usize,
            core::ptr::addr_of!(_kimg_start) as usize,
            core::ptr::addr_of!(_kimg_end) as usize,
        )
    };

    assert_eq!(kimg_start, RAM_START_PMA);
    // The kernel image must fit inside one 2 MiB megapage.
    assert!(kimg_end - kimg_start <= MEGA_SIZE);

    let rw = PteFlags::R | PteFlags::W | PteFlags::G;

    unsafe {
        let pt2 = &mut *core::ptr::addr_of_mut!(MAIN_PT2);
        let pt1 = &mut *core::ptr::addr_of_mut!(MAIN_PT1);
        let pt0 = &mut *core::ptr::addr_of_mut!(MAIN_PT0);

        // Identity map the MMIO region as gigapages.
        let mut pma = 0usize;
        while pma < RAM_START_PMA {
            pt2[paging::vpn(2, pma)] = Pte::leaf(pma, rw);
            pma += GIGA_SIZE;
        }

        // The gigarange holding RAM gets a second-level subtable; its first
        // megarange gets a third level so the image can be mapped page by
        // page.
        pt2[paging::vpn(2, RAM_START_PMA)] = Pte::table(pt1 as *const PageTable as usize, true);
        pt1[paging::vpn(1, RAM_START_PMA)] = Pte::table(pt0 as *const PageTable as usize, true);

        let mut pp = text_start;
        while pp < text_end {
            pt0[paging::vpn(0, pp)] = Pte::leaf(pp, PteFlags::R | PteFlags::X | PteFlags::G);
            pp += PAGE_SIZE;
        }
        let mut pp = rodata_start;
        while pp < rodata_end {
            pt0[paging::vpn(0, pp)] = Pte::leaf(pp, PteFlags::R | PteFlags::G);
            pp += PAGE_SIZE;
        }
        let mut pp = data_start;
        while pp < RAM_START_PMA + MEGA_SIZE {
            pt0[paging::vpn(0, pp)] = Pte::leaf(pp, rw);
            pp += PAGE_SIZE;
        }

        // Remaining RAM as megapages.
        let mut pp = RAM_START_PMA + MEGA_SIZE;
        while pp < RAM_END_PMA {
            pt1[paging::vpn(1, pp)] = Pte::leaf(pp, rw);
            pp += MEGA_SIZE;
        }

        let main_tag = Mtag::for_root(core::ptr::addr_of!(MAIN_PT2) as usize, 0);
        mspace::install_main_mspace(main_tag);

        // Kernel heap directly after the image, page pool after the heap.
        let heap_start = round_up(kimg_end, PAGE_SIZE);
        let heap_end = heap_start + HEAP_SIZE;
        assert!(heap_end <= RAM_END_PMA);
        crate::heap_init(heap_start, HEAP_SIZE);
        phys::add_free_region(heap_end, RAM_END_PMA);
    }

    // Supervisor access to user memory stays enabled; user copies are
    // validated explicitly instead.
    crate::arch::enable_user_memory_access();

    log::info!(
        "mm: RAM [{:#x},{:#x}), {} pages free",
        RAM_START_PMA,
        RAM_END_PMA,
        phys::free_page_count()
    );
}
