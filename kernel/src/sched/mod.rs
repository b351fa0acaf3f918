//! Cooperative thread core.
//!
//! Single hart, voluntary scheduling. Threads live in a fixed arena of
//! [`NTHR`] slots; the ready list and every condition wait list are
//! intrusive singly-linked lists threaded through each slot's `link_next`
//! index, so list membership needs no allocation and a thread can be on at
//! most one list at a time.
//!
//! The bootstrap thread occupies slot 0 and the idle thread slot
//! `NTHR - 1`. A thread suspends only voluntarily: in [`yield_now`], in
//! [`sync::Condition::wait`], in contended [`sync::Lock::acquire`], or in
//! an alarm sleep. The suspension path picks the next Ready thread
//! (falling back to idle), switches address spaces when the incoming
//! thread belongs to a process, and performs the context switch.

pub mod sync;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch::{self, ThreadContext};
use crate::error::{KernelError, KernelResult};
use crate::mm::{self, phys, PAGE_SIZE};
use crate::process::Process;
use sync::Condition;

/// Maximum number of threads.
pub const NTHR: usize = 16;
/// Thread id of the bootstrap thread.
pub const MAIN_TID: Tid = 0;
/// Thread id of the idle thread.
pub const IDLE_TID: Tid = NTHR - 1;

/// Dense thread id: an index into the thread arena.
pub type Tid = usize;

/// Thread entry function: two opaque arguments, no return value.
pub type ThreadEntry = fn(usize, usize);

/// Thread lifecycle states. Running is unique per hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Waiting,
    Running,
    Ready,
    Exited,
}

/// Small struct at the very top of each kernel stack: the thread self
/// pointer the trap entry path recovers through `sscratch`.
#[repr(C)]
pub struct StackAnchor {
    pub ktp: usize,
    pub kgp: usize,
}

struct Thread {
    id: Tid,
    state: ThreadState,
    name: &'static str,
    parent: Tid,
    /// Next thread on whichever list this thread is on.
    link_next: Option<Tid>,
    /// Lowest address of the kernel stack page, `None` for the bootstrap
    /// thread (it runs on the boot stack).
    stack_lowest: Option<NonNull<u8>>,
    /// Address of the stack anchor, 0 when there is no owned stack.
    stack_anchor: usize,
    ctx: ThreadContext,
    /// Broadcast when this thread exits; parents join on it.
    child_exit: Arc<Condition>,
    /// Owning process, if any. A freshly spawned thread has none until
    /// `set_process`; the scheduler treats that as "do not switch spaces".
    proc: Option<Arc<Process>>,
}

// Raw stack pointers are owned by the arena.
unsafe impl Send for Thread {}

/// Head/tail of an intrusive thread list; the links live in the arena.
pub(crate) struct ThreadList {
    pub(crate) head: Option<Tid>,
    pub(crate) tail: Option<Tid>,
}

impl ThreadList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

struct Scheduler {
    threads: [Option<Box<Thread>>; NTHR],
    ready: ThreadList,
}

impl Scheduler {
    fn new() -> Self {
        const NONE: Option<Box<Thread>> = None;
        let mut sched = Scheduler {
            threads: [NONE; NTHR],
            ready: ThreadList::new(),
        };
        sched.threads[MAIN_TID] = Some(Box::new(Thread {
            id: MAIN_TID,
            state: ThreadState::Running,
            name: "main",
            parent: MAIN_TID,
            link_next: None,
            stack_lowest: None,
            stack_anchor: 0,
            ctx: ThreadContext::zeroed(),
            child_exit: Arc::new(Condition::new("main.child_exit")),
            proc: None,
        }));
        sched
    }

    fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(tid).and_then(|t| t.as_deref())
    }

    fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(tid).and_then(|t| t.as_deref_mut())
    }

    /// Append `tid` to the ready list.
    fn ready_push(&mut self, tid: Tid) {
        self.thread_mut(tid).expect("pushing dead thread").link_next = None;
        match self.ready.tail {
            Some(tail) => {
                self.thread_mut(tail).expect("broken list tail").link_next = Some(tid);
            }
            None => self.ready.head = Some(tid),
        }
        self.ready.tail = Some(tid);
    }

    /// Pop the head of the ready list.
    fn ready_pop(&mut self) -> Option<Tid> {
        let head = self.ready.head?;
        let next = self.thread(head).expect("broken list head").link_next;
        self.ready.head = next;
        if next.is_none() {
            self.ready.tail = None;
        }
        self.thread_mut(head).unwrap().link_next = None;
        Some(head)
    }
}

lazy_static! {
    static ref SCHED: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

static CURRENT: AtomicUsize = AtomicUsize::new(MAIN_TID);

/// Id of the running thread.
pub fn current() -> Tid {
    CURRENT.load(Ordering::Relaxed)
}

/// Name of a live thread.
pub fn thread_name(tid: Tid) -> Option<&'static str> {
    SCHED.lock().thread(tid).map(|t| t.name)
}

/// Initialize the thread manager: seed the idle thread and start the
/// scheduler clock of slot ownership.
pub fn init() {
    let irq = arch::disable_interrupts();
    {
        let mut sched = SCHED.lock();
        assert!(sched.threads[IDLE_TID].is_none());
        let mut idle = Box::new(Thread {
            id: IDLE_TID,
            state: ThreadState::Ready,
            name: "idle",
            parent: MAIN_TID,
            link_next: None,
            stack_lowest: None,
            stack_anchor: 0,
            ctx: ThreadContext::zeroed(),
            child_exit: Arc::new(Condition::new("idle.child_exit")),
            proc: None,
        });
        if let Ok(stack) = phys::alloc_page() {
            seed_context(&mut idle, stack, idle_thread_entry, 0, 0);
        }
        sched.threads[IDLE_TID] = Some(idle);
        sched.ready_push(IDLE_TID);
    }
    arch::restore_interrupts(irq);
    log::info!("sched: thread manager ready ({} slots)", NTHR);
}

/// Point a fresh thread's saved context at the startup trampoline with its
/// kernel stack and entry arguments in place.
fn seed_context(thread: &mut Thread, stack: NonNull<u8>, entry: ThreadEntry, a0: usize, a1: usize) {
    let anchor_addr =
        stack.as_ptr() as usize + PAGE_SIZE - core::mem::size_of::<StackAnchor>();
    let anchor = anchor_addr as *mut StackAnchor;
    unsafe {
        (*anchor).ktp = thread as *const Thread as usize;
        (*anchor).kgp = 0;
    }
    thread.stack_lowest = Some(stack);
    thread.stack_anchor = anchor_addr;
    thread.ctx = ThreadContext::zeroed();
    thread.ctx.sp = anchor_addr;
    thread.ctx.ra = arch::thread_startup_addr();
    thread.ctx.s[0] = a0;
    thread.ctx.s[1] = a1;
    thread.ctx.s[2] = entry as usize;
}

/// Spawn a kernel thread.
///
/// Allocates a slot and one physical page of kernel stack, seeds the saved
/// context so the first activation runs `entry(a0, a1)`, and queues the
/// thread Ready at the tail of the ready list. The caller becomes the
/// parent.
pub fn spawn(name: &'static str, entry: ThreadEntry, a0: usize, a1: usize) -> KernelResult<Tid> {
    let stack = phys::alloc_page()?;

    let irq = arch::disable_interrupts();
    let result = {
        let mut sched = SCHED.lock();
        let slot = (1..NTHR).find(|&tid| sched.threads[tid].is_none());
        match slot {
            None => Err(KernelError::TooManyThreads),
            Some(tid) => {
                let mut thread = Box::new(Thread {
                    id: tid,
                    state: ThreadState::Ready,
                    name,
                    parent: current(),
                    link_next: None,
                    stack_lowest: None,
                    stack_anchor: 0,
                    ctx: ThreadContext::zeroed(),
                    child_exit: Arc::new(Condition::new("child_exit")),
                    proc: None,
                });
                seed_context(&mut thread, stack, entry, a0, a1);
                sched.threads[tid] = Some(thread);
                sched.ready_push(tid);
                Ok(tid)
            }
        }
    };
    arch::restore_interrupts(irq);

    if result.is_err() {
        unsafe { phys::free_page(stack) };
    }
    result
}

/// Terminate the running thread. Never returns.
///
/// The bootstrap thread halts the machine instead. Anyone joined on this
/// thread is woken; the slot lingers until a join reclaims it.
pub fn exit() -> ! {
    let tid = current();
    if tid == MAIN_TID {
        arch::halt();
    }

    let child_exit = {
        let irq = arch::disable_interrupts();
        let cond = {
            let mut sched = SCHED.lock();
            let thread = sched.thread_mut(tid).expect("running thread missing");
            thread.state = ThreadState::Exited;
            thread.child_exit.clone()
        };
        arch::restore_interrupts(irq);
        cond
    };
    child_exit.broadcast();

    suspend();
    unreachable!("exited thread resumed");
}

/// Voluntarily give up the hart.
pub fn yield_now() {
    suspend();
}

/// Wait for a child to exit and reclaim it.
///
/// `tid == 0` waits for *any* child (failing with `Invalid` when there is
/// none); otherwise `tid` must be a live child of the caller. Returns the
/// reclaimed thread's id.
pub fn join(tid: Tid) -> KernelResult<Tid> {
    if tid >= NTHR {
        return Err(KernelError::Invalid);
    }
    let me = current();

    if tid == 0 {
        loop {
            let mut wait_on: Option<Arc<Condition>> = None;
            {
                let sched = SCHED.lock();
                let mut have_children = false;
                for i in 1..NTHR {
                    if let Some(child) = sched.thread(i) {
                        if child.parent != me || i == me {
                            continue;
                        }
                        have_children = true;
                        if child.state == ThreadState::Exited {
                            drop(sched);
                            reclaim(i);
                            return Ok(i);
                        }
                        if wait_on.is_none() {
                            wait_on = Some(child.child_exit.clone());
                        }
                    }
                }
                if !have_children {
                    return Err(KernelError::Invalid);
                }
            }
            if let Some(cond) = wait_on {
                cond.wait();
            }
        }
    }

    let (cond, exited) = {
        let sched = SCHED.lock();
        let child = sched.thread(tid).ok_or(KernelError::Invalid)?;
        if child.parent != me {
            return Err(KernelError::Invalid);
        }
        (child.child_exit.clone(), child.state == ThreadState::Exited)
    };

    if !exited {
        cond.wait();
    }
    reclaim(tid);
    Ok(tid)
}

/// Reclaim an exited thread: reparent its children to its own parent, free
/// its kernel stack, release the slot.
fn reclaim(tid: Tid) {
    assert!(tid != MAIN_TID && tid < NTHR);
    let irq = arch::disable_interrupts();
    let thread = {
        let mut sched = SCHED.lock();
        let thread = sched.threads[tid].take().expect("reclaiming empty slot");
        assert_eq!(thread.state, ThreadState::Exited);
        let new_parent = thread.parent;
        for i in 1..NTHR {
            if let Some(other) = sched.thread_mut(i) {
                if other.parent == tid {
                    other.parent = new_parent;
                }
            }
        }
        thread
    };
    arch::restore_interrupts(irq);

    if let Some(stack) = thread.stack_lowest {
        unsafe { phys::free_page(stack) };
    }
}

/// Suspend the running thread and resume the next Ready one.
///
/// If the caller is still Running it is moved to the ready tail first, so
/// a plain yield round-robins. The incoming thread's address space is
/// installed when it belongs to a process. Returns when the caller is next
/// scheduled.
pub(crate) fn suspend() {
    arch::disable_interrupts();

    let (old_ctx, new_ctx, mspace) = {
        let mut sched = SCHED.lock();
        let cur = current();

        if let Some(thread) = sched.thread_mut(cur) {
            if thread.state == ThreadState::Running {
                thread.state = ThreadState::Ready;
                sched.ready_push(cur);
            }
        }

        let next = sched.ready_pop().unwrap_or(IDLE_TID);
        let mspace = {
            let thread = sched.thread_mut(next).expect("ready thread missing");
            thread.state = ThreadState::Running;
            thread.proc.as_ref().map(|p| p.mtag())
        };

        let old_ctx = {
            let thread = sched.thread_mut(cur).expect("current thread missing");
            &mut thread.ctx as *mut ThreadContext
        };
        let new_ctx = {
            let thread = sched.thread(next).unwrap();
            &thread.ctx as *const ThreadContext
        };
        CURRENT.store(next, Ordering::Relaxed);
        (old_ctx, new_ctx, mspace)
    };

    if let Some(tag) = mspace {
        mm::switch_mspace(tag);
    }
    arch::enable_interrupts();
    unsafe { arch::context_switch(old_ctx, new_ctx) };
}

/// True when at least one thread is Ready.
fn ready_nonempty() -> bool {
    !SCHED.lock().ready.is_empty()
}

fn idle_thread_entry(_a0: usize, _a1: usize) {
    // Yield to runnable threads; otherwise sleep until an interrupt. The
    // ready check is repeated with interrupts disabled so an ISR cannot
    // mark a thread ready between the check and the wait.
    loop {
        while ready_nonempty() {
            yield_now();
        }
        arch::disable_interrupts();
        if !ready_nonempty() {
            arch::wait_for_interrupt();
        }
        arch::enable_interrupts();
    }
}

/// Bind a process to a thread. Called after spawn, so a new thread briefly
/// has no process.
pub fn set_process(tid: Tid, proc: Arc<Process>) {
    if let Some(thread) = SCHED.lock().thread_mut(tid) {
        thread.proc = Some(proc);
    }
}

/// The process a thread belongs to.
pub fn thread_process(tid: Tid) -> Option<Arc<Process>> {
    SCHED.lock().thread(tid).and_then(|t| t.proc.clone())
}

/// The process of the running thread.
pub fn current_process() -> Option<Arc<Process>> {
    thread_process(current())
}

/// Stack anchor address of the running thread (0 for the boot stack).
pub fn current_stack_anchor() -> usize {
    SCHED
        .lock()
        .thread(current())
        .map(|t| t.stack_anchor)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Wait-list plumbing used by sync::Condition
// ---------------------------------------------------------------------------

/// Mark the caller Waiting and push it onto a condition's wait list.
/// The caller must immediately [`suspend`].
pub(crate) fn park_current(list: &mut ThreadList) {
    let tid = current();
    let irq = arch::disable_interrupts();
    {
        let mut sched = SCHED.lock();
        let thread = sched.thread_mut(tid).expect("parking dead thread");
        assert_eq!(thread.state, ThreadState::Running);
        thread.state = ThreadState::Waiting;
        thread.link_next = None;
        match list.tail {
            Some(tail) => {
                sched.thread_mut(tail).expect("broken wait list").link_next = Some(tid);
            }
            None => list.head = Some(tid),
        }
        list.tail = Some(tid);
    }
    arch::restore_interrupts(irq);
}

/// Splice an entire wait list onto the ready tail, marking each thread
/// Ready.
pub(crate) fn wake_all(list: &mut ThreadList) {
    let irq = arch::disable_interrupts();
    {
        let mut sched = SCHED.lock();
        let mut cursor = list.head.take();
        list.tail = None;
        while let Some(tid) = cursor {
            cursor = sched.thread(tid).expect("broken wait list").link_next;
            let thread = sched.thread_mut(tid).unwrap();
            thread.state = ThreadState::Ready;
            sched.ready_push(tid);
        }
    }
    arch::restore_interrupts(irq);
}

// ---------------------------------------------------------------------------
// Test plumbing
// ---------------------------------------------------------------------------
