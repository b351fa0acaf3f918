//! Physical page allocator.
//!
//! Free pages are kept in a linked list of *chunks*, each a run of
//! contiguous page frames. The chunk header (next pointer and page count)
//! lives in the first bytes of the chunk's first frame, so the free list
//! costs no memory beyond the free pages themselves. Initially all free
//! pages form a single large chunk.
//!
//! Allocation is best-fit: the smallest chunk that can satisfy the request
//! is found and the request is split off its tail, leaving a smaller chunk
//! in place. Freeing pushes the run onto the head of the list without
//! coalescing; long alloc/free churn can therefore fragment the pool. That
//! is an accepted limitation of this allocator.

use core::ptr::NonNull;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::PAGE_SIZE;

/// Header at the start of every free chunk.
#[repr(C)]
struct PageChunk {
    next: Option<NonNull<PageChunk>>,
    pagecnt: usize,
}

/// A free list of page chunks.
pub(crate) struct FreeList {
    head: Option<NonNull<PageChunk>>,
}

// The list owns the raw chunk memory it links through.
unsafe impl Send for FreeList {}

static FREE_LIST: Mutex<FreeList> = Mutex::new(FreeList { head: None });

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    /// Add the page-aligned region `[start, end)` to the list as one chunk.
    ///
    /// # Safety
    /// The region must be unused, writable memory not overlapping any
    /// chunk already on the list.
    pub(crate) unsafe fn add_region(&mut self, start: usize, end: usize) {
        assert_eq!(start % PAGE_SIZE, 0);
        assert_eq!(end % PAGE_SIZE, 0);
        if end <= start {
            return;
        }
        let chunk = start as *mut PageChunk;
        unsafe {
            (*chunk).next = self.head;
            (*chunk).pagecnt = (end - start) / PAGE_SIZE;
        }
        self.head = NonNull::new(chunk);
    }

    /// Allocate `cnt` contiguous pages, best-fit.
    fn alloc(&mut self, cnt: usize) -> KernelResult<NonNull<u8>> {
        if cnt == 0 {
            return Err(KernelError::Invalid);
        }

        // Find the smallest chunk that fits, remembering the link that
        // points at it so exact fits can be unlinked.
        let mut best: Option<(*mut Option<NonNull<PageChunk>>, NonNull<PageChunk>)> = None;
        let mut link: *mut Option<NonNull<PageChunk>> = &mut self.head;
        unsafe {
            while let Some(chunk) = *link {
                let pagecnt = (*chunk.as_ptr()).pagecnt;
                if pagecnt >= cnt {
                    let better = match best {
                        None => true,
                        Some((_, b)) => pagecnt < (*b.as_ptr()).pagecnt,
                    };
                    if better {
                        best = Some((link, chunk));
                    }
                }
                link = &mut (*chunk.as_ptr()).next;
            }

            let (link, chunk) = best.ok_or(KernelError::NoMemory)?;
            let remaining = (*chunk.as_ptr()).pagecnt - cnt;
            if remaining == 0 {
                *link = (*chunk.as_ptr()).next;
                Ok(chunk.cast())
            } else {
                // Split the request off the tail; the shrunk chunk stays
                // in place.
                (*chunk.as_ptr()).pagecnt = remaining;
                let base = chunk.as_ptr() as usize + remaining * PAGE_SIZE;
                Ok(NonNull::new_unchecked(base as *mut u8))
            }
        }
    }

    /// Push `cnt` pages starting at `pp` as a new head chunk. No coalescing.
    unsafe fn free(&mut self, pp: NonNull<u8>, cnt: usize) {
        if cnt == 0 {
            return;
        }
        let chunk = pp.as_ptr() as *mut PageChunk;
        unsafe {
            (*chunk).next = self.head;
            (*chunk).pagecnt = cnt;
        }
        self.head = NonNull::new(chunk);
    }

    /// Total free pages on the list.
    fn page_count(&self) -> usize {
        let mut cnt = 0;
        let mut cursor = self.head;
        while let Some(chunk) = cursor {
            unsafe {
                cnt += (*chunk.as_ptr()).pagecnt;
                cursor = (*chunk.as_ptr()).next;
            }
        }
        cnt
    }
}

/// Hand the page-aligned region `[start, end)` to the global page pool.
///
/// # Safety
/// The region must be unused, writable memory owned by the caller and
/// never handed to the pool before.
pub unsafe fn add_free_region(start: usize, end: usize) {
    unsafe { FREE_LIST.lock().add_region(start, end) }
}

/// Allocate one physical page.
pub fn alloc_page() -> KernelResult<NonNull<u8>> {
    alloc_pages(1)
}

/// Allocate `cnt` contiguous physical pages.
pub fn alloc_pages(cnt: usize) -> KernelResult<NonNull<u8>> {
    FREE_LIST.lock().alloc(cnt)
}

/// Free one physical page.
///
/// # Safety
/// `pp` must have come from [`alloc_page`]/[`alloc_pages`] and must not be
/// referenced afterwards.
pub unsafe fn free_page(pp: NonNull<u8>) {
    unsafe { free_pages(pp, 1) }
}

/// Free `cnt` contiguous physical pages starting at `pp`.
///
/// # Safety
/// The run must have come from the allocator and must not be referenced
/// afterwards.
pub unsafe fn free_pages(pp: NonNull<u8>, cnt: usize) {
    unsafe { FREE_LIST.lock().free(pp, cnt) }
}

/// Total free pages in the global pool.
pub fn free_page_count() -> usize {
    FREE_LIST.lock().page_count()
}
