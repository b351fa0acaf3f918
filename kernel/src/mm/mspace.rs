//! Address spaces.
//!
//! An address space is named by an [`Mtag`]: the paging mode, an ASID, and
//! the physical page number of its root table, in `satp` layout. The main
//! kernel space is built at boot and never torn down; every user process
//! owns a space whose user-window leaves are non-global, so they can be
//! cloned for fork and discarded on exit while all global kernel mappings
//! are shared untouched.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::mm::paging::{alloc_table, wellformed, Mapper, PageTable, Pte, PteFlags};
use crate::mm::{phys, round_down, PAGE_SIZE, PTE_CNT, UMEM_END_VMA, UMEM_START_VMA};

const SATP_MODE_SV39: u64 = 8 << 60;
const SATP_ASID_SHIFT: u64 = 44;
const SATP_PPN_MASK: u64 = (1 << 44) - 1;

/// Opaque address-space tag: paging mode, ASID, and root-table PPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mtag(u64);

impl Mtag {
    /// The null tag; no space carries it.
    pub const NULL: Mtag = Mtag(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Tag for the root table at physical address `root`.
    pub fn for_root(root: usize, asid: u16) -> Self {
        debug_assert_eq!(root % PAGE_SIZE, 0);
        Self(SATP_MODE_SV39 | ((asid as u64) << SATP_ASID_SHIFT) | (root as u64 >> 12))
    }

    /// Physical pointer to the root page table.
    pub fn root(self) -> *mut PageTable {
        (((self.0 & SATP_PPN_MASK) << 12) as usize) as *mut PageTable
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

static MAIN_MTAG: AtomicU64 = AtomicU64::new(0);

/// Record the boot-built main space and make it active.
pub(crate) fn install_main_mspace(tag: Mtag) {
    MAIN_MTAG.store(tag.bits(), Ordering::SeqCst);
    switch_mspace(tag);
}

/// The main kernel address space. Immutable after boot.
pub fn main_mspace() -> Mtag {
    Mtag::from_bits(MAIN_MTAG.load(Ordering::SeqCst))
}

/// Tag of the currently active address space.
pub fn active_mspace() -> Mtag {
    Mtag::from_bits(arch::read_translation_root())
}

/// Install `tag` as the active space, returning the previous tag.
/// Issues a TLB flush on hardware.
pub fn switch_mspace(tag: Mtag) -> Mtag {
    Mtag::from_bits(arch::write_translation_root(tag.bits()))
}

/// A mapper over the active space's root table.
fn active_mapper() -> Mapper {
    unsafe { Mapper::new(active_mspace().root()) }
}

/// Map one frame into the active space. See [`Mapper::map_page`].
pub fn map_page(vma: usize, pp: core::ptr::NonNull<u8>, flags: PteFlags) -> KernelResult<()> {
    active_mapper().map_page(vma, pp, flags)
}

/// Map a contiguous physical range into the active space.
pub fn map_range(
    vma: usize,
    size: usize,
    pp: core::ptr::NonNull<u8>,
    flags: PteFlags,
) -> KernelResult<()> {
    active_mapper().map_range(vma, size, pp, flags)
}

/// Allocate and map zeroed frames over a virtual range of the active space.
pub fn alloc_and_map_range(vma: usize, size: usize, flags: PteFlags) -> KernelResult<()> {
    active_mapper().alloc_and_map_range(vma, size, flags)
}

/// Rewrite leaf flags over a range of the active space.
pub fn set_range_flags(vma: usize, size: usize, flags: PteFlags) {
    active_mapper().set_range_flags(vma, size, flags)
}

/// Unmap a range of the active space, freeing the frames.
pub fn unmap_and_free_range(vma: usize, size: usize) {
    active_mapper().unmap_and_free_range(vma, size)
}

/// Deep-copy the active space.
///
/// Huge-page and global entries are shared with the child; non-global
/// leaves get a freshly allocated frame with the parent's contents and
/// flags. On allocation failure everything built so far is torn down and
/// `NoMemory` is returned with the caller's space untouched.
pub fn clone_active_mspace() -> KernelResult<Mtag> {
    let old_root = active_mspace().root();
    let new_root = alloc_table()?;

    let result = unsafe { clone_tables(old_root, new_root) };
    match result {
        Ok(()) => Ok(Mtag::for_root(new_root as usize, 0)),
        Err(e) => {
            unsafe { free_owned_space(new_root) };
            Err(e)
        }
    }
}

unsafe fn clone_tables(old_pt2: *mut PageTable, new_pt2: *mut PageTable) -> KernelResult<()> {
    unsafe {
        for i2 in 0..PTE_CNT {
            let pte2 = (&(*old_pt2))[i2];
            if !pte2.is_valid() {
                continue;
            }
            // Gigapages and global subtrees are shared with the child.
            if pte2.is_leaf() || pte2.is_global() {
                (&mut (*new_pt2))[i2] = pte2;
                continue;
            }

            let old_pt1 = pte2.page_addr() as *mut PageTable;
            let new_pt1 = alloc_table()?;
            (&mut (*new_pt2))[i2] = Pte::table(new_pt1 as usize, false);

            for i1 in 0..PTE_CNT {
                let pte1 = (&(*old_pt1))[i1];
                if !pte1.is_valid() {
                    continue;
                }
                if pte1.is_leaf() || pte1.is_global() {
                    (&mut (*new_pt1))[i1] = pte1;
                    continue;
                }

                let old_pt0 = pte1.page_addr() as *mut PageTable;
                let new_pt0 = alloc_table()?;
                (&mut (*new_pt1))[i1] = Pte::table(new_pt0 as usize, false);

                for i0 in 0..PTE_CNT {
                    let pte0 = (&(*old_pt0))[i0];
                    if !pte0.is_valid() {
                        continue;
                    }
                    if pte0.is_global() {
                        (&mut (*new_pt0))[i0] = pte0;
                    } else {
                        // Private copy of the user frame.
                        let frame = phys::alloc_page()?;
                        core::ptr::copy_nonoverlapping(
                            pte0.page_addr() as *const u8,
                            frame.as_ptr(),
                            PAGE_SIZE,
                        );
                        (&mut (*new_pt0))[i0] = Pte::leaf(frame.as_ptr() as usize, pte0.flags());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Free every table and non-global leaf frame owned by `root`.
///
/// Shared (global) subtrees and shared leaves are left alone. Used to back
/// out of a failed clone.
unsafe fn free_owned_space(root: *mut PageTable) {
    unsafe {
        for i2 in 0..PTE_CNT {
            let pte2 = (&(*root))[i2];
            if !pte2.is_valid() || pte2.is_leaf() || pte2.is_global() {
                continue;
            }
            let pt1 = pte2.page_addr() as *mut PageTable;
            for i1 in 0..PTE_CNT {
                let pte1 = (&(*pt1))[i1];
                if !pte1.is_valid() || pte1.is_leaf() || pte1.is_global() {
                    continue;
                }
                let pt0 = pte1.page_addr() as *mut PageTable;
                for i0 in 0..PTE_CNT {
                    let pte0 = (&(*pt0))[i0];
                    if pte0.is_valid() && pte0.is_leaf() && !pte0.is_global() {
                        phys::free_page(core::ptr::NonNull::new_unchecked(
                            pte0.page_addr() as *mut u8,
                        ));
                    }
                }
                phys::free_page(core::ptr::NonNull::new_unchecked(pt0 as *mut u8));
            }
            phys::free_page(core::ptr::NonNull::new_unchecked(pt1 as *mut u8));
        }
        phys::free_page(core::ptr::NonNull::new_unchecked(root as *mut u8));
    }
}

/// Free every non-global leaf frame of the active space and clear its PTE.
///
/// Intermediate tables and global mappings stay intact, so the space can be
/// refilled (exec) without rebuilding the kernel half.
pub fn reset_active_mspace() {
    let root = active_mspace().root();
    unsafe {
        for i2 in 0..PTE_CNT {
            let pte2 = (&(*root))[i2];
            if !pte2.is_valid() || pte2.is_leaf() {
                continue;
            }
            let pt1 = pte2.page_addr() as *mut PageTable;
            for i1 in 0..PTE_CNT {
                let pte1 = (&(*pt1))[i1];
                if !pte1.is_valid() || pte1.is_leaf() {
                    continue;
                }
                let pt0 = pte1.page_addr() as *mut PageTable;
                for i0 in 0..PTE_CNT {
                    let pte0 = (&(*pt0))[i0];
                    if pte0.is_valid() && pte0.is_leaf() && !pte0.is_global() {
                        phys::free_page(core::ptr::NonNull::new_unchecked(
                            pte0.page_addr() as *mut u8,
                        ));
                        (&mut (*pt0))[i0].clear();
                    }
                }
            }
        }
    }
}

/// Reset the active space and switch back to the main kernel space.
pub fn discard_active_mspace() -> Mtag {
    reset_active_mspace();
    let main = main_mspace();
    switch_mspace(main);
    main
}

/// Back a user-mode page fault with a fresh zeroed frame.
///
/// The faulting address is aligned down to its page. Handled (true) only
/// for pages inside the user window; the new mapping is R+W+U.
pub fn handle_user_page_fault(vma: usize) -> bool {
    if !wellformed(vma) {
        return false;
    }
    let page = round_down(vma, PAGE_SIZE);
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&page) {
        return false;
    }
    let frame = match phys::alloc_page() {
        Ok(f) => f,
        Err(_) => return false,
    };
    unsafe {
        core::ptr::write_bytes(frame.as_ptr(), 0, PAGE_SIZE);
    }
    let flags = PteFlags::R | PteFlags::W | PteFlags::U;
    if map_page(page, frame, flags).is_err() {
        unsafe { phys::free_page(frame) };
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// User-pointer validation and copies
// ---------------------------------------------------------------------------

/// Longest user string the kernel will walk.
const USER_STR_MAX: usize = 8192;

/// Check that every page of `[vma, vma + len)` is mapped by a leaf whose
/// flags include all of `required`.
///
/// `Invalid` for an empty or non-canonical range or a missing mapping;
/// `AccessDenied` when a page is present but under-privileged.
pub fn validate_vptr(vma: usize, len: usize, required: PteFlags) -> KernelResult<()> {
    if len == 0 {
        return Err(KernelError::Invalid);
    }
    let end = vma.checked_add(len).ok_or(KernelError::Invalid)?;
    if !wellformed(vma) || !wellformed(end - 1) {
        return Err(KernelError::Invalid);
    }

    let mapper = active_mapper();
    let mut va = vma;
    while va < end {
        let pte = mapper.translate(va).ok_or(KernelError::Invalid)?;
        if !pte.flags().contains(required) {
            return Err(KernelError::AccessDenied);
        }
        va = round_down(va, PAGE_SIZE) + PAGE_SIZE;
    }
    Ok(())
}

/// Walk a NUL-terminated user string, validating each byte's mapping.
///
/// Fails with `Invalid` if no terminator appears within the first 8192
/// bytes.
pub fn validate_vstr(vma: usize, required: PteFlags) -> KernelResult<()> {
    walk_user_str(vma, required, |_| {})
}

/// Copy a NUL-terminated user string into a kernel `String`.
pub fn read_user_str(vma: usize, required: PteFlags) -> KernelResult<String> {
    let mut bytes = Vec::new();
    walk_user_str(vma, required, |b| bytes.push(b))?;
    String::from_utf8(bytes).map_err(|_| KernelError::Invalid)
}

fn walk_user_str(
    vma: usize,
    required: PteFlags,
    mut visit: impl FnMut(u8),
) -> KernelResult<()> {
    if !wellformed(vma) {
        return Err(KernelError::Invalid);
    }
    let mapper = active_mapper();
    for i in 0..USER_STR_MAX {
        let va = vma.checked_add(i).ok_or(KernelError::Invalid)?;
        let pte = mapper.translate(va).ok_or(KernelError::Invalid)?;
        if !pte.flags().contains(required) {
            return Err(KernelError::AccessDenied);
        }
        let byte = unsafe { *((pte.page_addr() + va % PAGE_SIZE) as *const u8) };
        if byte == 0 {
            return Ok(());
        }
        visit(byte);
    }
    Err(KernelError::Invalid)
}

/// Copy `data` into the active space at `vma`, page by page through the
/// identity-mapped frames. Every touched page must carry `required`.
pub fn copy_to_range(vma: usize, data: &[u8], required: PteFlags) -> KernelResult<()> {
    validate_vptr(vma, data.len().max(1), required)?;
    let mapper = active_mapper();
    let mut done = 0;
    while done < data.len() {
        let va = vma + done;
        let pte = mapper.translate(va).ok_or(KernelError::Invalid)?;
        let offset = va % PAGE_SIZE;
        let chunk = (PAGE_SIZE - offset).min(data.len() - done);
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(done),
                (pte.page_addr() + offset) as *mut u8,
                chunk,
            );
        }
        done += chunk;
    }
    Ok(())
}

/// Copy from the active space at `vma` into `buf`.
pub fn copy_from_range(vma: usize, buf: &mut [u8], required: PteFlags) -> KernelResult<()> {
    validate_vptr(vma, buf.len().max(1), required)?;
    let mapper = active_mapper();
    let mut done = 0;
    while done < buf.len() {
        let va = vma + done;
        let pte = mapper.translate(va).ok_or(KernelError::Invalid)?;
        let offset = va % PAGE_SIZE;
        let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
        unsafe {
            core::ptr::copy_nonoverlapping(
                (pte.page_addr() + offset) as *const u8,
                buf.as_mut_ptr().add(done),
                chunk,
            );
        }
        done += chunk;
    }
    Ok(())
}

/// Zero `len` bytes of the active space at `vma`.
pub fn zero_range(vma: usize, len: usize, required: PteFlags) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    validate_vptr(vma, len, required)?;
    let mapper = active_mapper();
    let mut done = 0;
    while done < len {
        let va = vma + done;
        let pte = mapper.translate(va).ok_or(KernelError::Invalid)?;
        let offset = va % PAGE_SIZE;
        let chunk = (PAGE_SIZE - offset).min(len - done);
        unsafe {
            core::ptr::write_bytes((pte.page_addr() + offset) as *mut u8, 0, chunk);
        }
        done += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    /// Fresh space with one global "kernel" page and one user page holding
    /// `fill`. Returns (tag, global page vma, user vma).
    fn build_space(fill: u8) -> (Mtag, usize, usize) {
        testing::init_phys_pool();
        let root = alloc_table().unwrap();
        let mut mapper = unsafe { Mapper::new(root) };

        let kernel_page = phys::alloc_page().unwrap();
        let kvma = 0xC000_0000;
        mapper
            .map_page(kvma, kernel_page, PteFlags::R | PteFlags::W | PteFlags::G)
            .unwrap();

        let user_page = phys::alloc_page().unwrap();
        unsafe { core::ptr::write_bytes(user_page.as_ptr(), fill, PAGE_SIZE) };
        let uvma = 0xC010_0000;
        mapper
            .map_page(uvma, user_page, PteFlags::R | PteFlags::W | PteFlags::U)
            .unwrap();

        (Mtag::for_root(root as usize, 0), kvma, uvma)
    }

    #[test]
    fn test_clone_shares_global_and_copies_user() {
        let _guard = testing::kernel_lock();
        let (tag, kvma, uvma) = build_space(0xAB);
        let prev = switch_mspace(tag);

        let child = clone_active_mspace().unwrap();
        assert_ne!(child.root(), tag.root());

        let parent_map = unsafe { Mapper::new(tag.root()) };
        let child_map = unsafe { Mapper::new(child.root()) };

        // Global leaf shared: same frame.
        assert_eq!(
            parent_map.translate(kvma).unwrap().page_addr(),
            child_map.translate(kvma).unwrap().page_addr()
        );

        // User leaf copied: fresh frame, same bytes, same flags.
        let p = parent_map.translate(uvma).unwrap();
        let c = child_map.translate(uvma).unwrap();
        assert_ne!(p.page_addr(), c.page_addr());
        assert_eq!(p.flags(), c.flags());
        let byte = unsafe { *(c.page_addr() as *const u8) };
        assert_eq!(byte, 0xAB);

        // Child is a snapshot: parent writes stay private.
        unsafe { *(p.page_addr() as *mut u8) = 0x11 };
        let byte = unsafe { *(c.page_addr() as *const u8) };
        assert_eq!(byte, 0xAB);

        switch_mspace(prev);
    }

    #[test]
    fn test_reset_frees_only_nonglobal_leaves() {
        let _guard = testing::kernel_lock();
        let (tag, kvma, uvma) = build_space(0);
        let prev = switch_mspace(tag);

        let before = phys::free_page_count();
        reset_active_mspace();
        assert_eq!(phys::free_page_count(), before + 1);

        let mapper = unsafe { Mapper::new(tag.root()) };
        assert!(mapper.translate(kvma).is_some());
        assert!(mapper.translate(uvma).is_none());

        switch_mspace(prev);
    }

    #[test]
    fn test_page_fault_backs_user_window_only() {
        let _guard = testing::kernel_lock();
        testing::init_phys_pool();
        let root = alloc_table().unwrap();
        let tag = Mtag::for_root(root as usize, 0);
        let prev = switch_mspace(tag);

        assert!(handle_user_page_fault(UMEM_START_VMA + 0x1234));
        let mapper = unsafe { Mapper::new(root) };
        let pte = mapper.translate(UMEM_START_VMA + 0x1000).unwrap();
        assert!(pte
            .flags()
            .contains(PteFlags::R | PteFlags::W | PteFlags::U));
        // First touch observes zeroed memory.
        let byte = unsafe { *(pte.page_addr() as *const u8) };
        assert_eq!(byte, 0);

        // Outside the window: not handled.
        assert!(!handle_user_page_fault(UMEM_START_VMA - PAGE_SIZE));
        assert!(!handle_user_page_fault(UMEM_END_VMA));

        switch_mspace(prev);
    }

    #[test]
    fn test_present_user_leaves_carry_u() {
        let _guard = testing::kernel_lock();
        testing::init_phys_pool();
        let root = alloc_table().unwrap();
        let tag = Mtag::for_root(root as usize, 0);
        let prev = switch_mspace(tag);

        for vma in [UMEM_START_VMA, UMEM_START_VMA + 0x7000] {
            assert!(handle_user_page_fault(vma));
        }
        let mapper = unsafe { Mapper::new(root) };
        let mut vma = UMEM_START_VMA;
        while vma < UMEM_START_VMA + 0x10000 {
            if let Some(pte) = mapper.translate(vma) {
                assert!(pte.flags().contains(PteFlags::U));
            }
            vma += PAGE_SIZE;
        }

        switch_mspace(prev);
    }

    #[test]
    fn test_validate_and_copy_round_trip() {
        let _guard = testing::kernel_lock();
        let (tag, _kvma, uvma) = build_space(0);
        let prev = switch_mspace(tag);

        let user = PteFlags::U;
        copy_to_range(uvma + 10, b"hello user", user | PteFlags::W).unwrap();
        let mut back = [0u8; 10];
        copy_from_range(uvma + 10, &mut back, user | PteFlags::R).unwrap();
        assert_eq!(&back, b"hello user");

        // Execute permission was never granted.
        assert_eq!(
            validate_vptr(uvma, 8, PteFlags::U | PteFlags::X),
            Err(KernelError::AccessDenied)
        );
        // Unmapped range.
        assert_eq!(
            validate_vptr(uvma + 0x8000, 8, PteFlags::U),
            Err(KernelError::Invalid)
        );

        switch_mspace(prev);
    }

    #[test]
    fn test_user_string_walk() {
        let _guard = testing::kernel_lock();
        let (tag, _kvma, uvma) = build_space(0);
        let prev = switch_mspace(tag);

        copy_to_range(uvma, b"init\0", PteFlags::U | PteFlags::W).unwrap();
        validate_vstr(uvma, PteFlags::U | PteFlags::R).unwrap();
        assert_eq!(read_user_str(uvma, PteFlags::U).unwrap(), "init");

        // A page full of non-NUL bytes runs off the mapping: invalid.
        zero_range(uvma, PAGE_SIZE, PteFlags::U).unwrap();
        copy_to_range(uvma, &[b'x'; PAGE_SIZE], PteFlags::U | PteFlags::W).unwrap();
        assert!(read_user_str(uvma, PteFlags::U).is_err());

        switch_mspace(prev);
    }
}
