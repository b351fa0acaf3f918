//! Condition variables and reentrant sleeping locks.
//!
//! A [`Condition`] is a named intrusive wait list with no counter: wakeups
//! not awaited are lost, so every waiter re-checks its predicate. A
//! [`Lock`] is a reentrant mutual-exclusion lock built on a condition;
//! contended acquirers sleep rather than spin, which is what a cooperative
//! single-hart kernel needs to make progress.

use spin::Mutex;

use super::{current, park_current, suspend, wake_all, ThreadList, Tid};

/// Condition variable: a name plus an intrusive list of waiting threads.
pub struct Condition {
    name: &'static str,
    waiters: Mutex<ThreadList>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Mutex::new(ThreadList::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the calling thread until the next [`broadcast`](Self::broadcast).
    ///
    /// The caller is moved to Waiting on this condition's list and the hart
    /// is given away; returns once a broadcast has made the caller Ready
    /// and the scheduler has resumed it.
    pub fn wait(&self) {
        {
            let mut list = self.waiters.lock();
            park_current(&mut list);
        }
        suspend();
    }

    /// Wake every thread waiting on this condition.
    ///
    /// The whole wait list is spliced onto the tail of the ready list.
    /// Safe to call from interrupt handlers; never blocks.
    pub fn broadcast(&self) {
        let mut list = self.waiters.lock();
        wake_all(&mut list);
    }

    /// Whether any thread is currently waiting.
    pub fn has_waiters(&self) -> bool {
        self.waiters.lock().head.is_some()
    }
}

struct LockState {
    holder: Option<Tid>,
    count: usize,
}

/// Reentrant sleeping lock.
///
/// The holder may re-acquire freely; each acquire must be paired with a
/// release, and the lock is handed off once the count returns to zero.
/// Invariant: `count == 0` iff `holder == None`.
pub struct Lock {
    state: Mutex<LockState>,
    released: Condition,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                holder: None,
                count: 0,
            }),
            released: Condition::new("released"),
        }
    }

    /// Acquire the lock, sleeping while another thread holds it.
    pub fn acquire(&self) {
        let me = current();
        loop {
            {
                let mut state = self.state.lock();
                match state.holder {
                    Some(holder) if holder == me => {
                        state.count += 1;
                        return;
                    }
                    None => {
                        state.holder = Some(me);
                        state.count = 1;
                        return;
                    }
                    Some(_) => {}
                }
            }
            self.released.wait();
        }
    }

    /// Release one level of the lock. Only the holder may release; when the
    /// count reaches zero the lock is dropped and sleepers are woken.
    pub fn release(&self) {
        let me = current();
        let wake = {
            let mut state = self.state.lock();
            if state.holder != Some(me) {
                return;
            }
            state.count -= 1;
            if state.count == 0 {
                state.holder = None;
                true
            } else {
                false
            }
        };
        if wake {
            self.released.broadcast();
        }
    }

    /// Whether the calling thread holds the lock.
    pub fn held_by_current(&self) -> bool {
        self.state.lock().holder == Some(current())
    }

    /// Current recursion depth (0 when free).
    pub fn depth(&self) -> usize {
        self.state.lock().count
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Park a specific (non-running) thread on a condition, as its own call to
/// [`Condition::wait`] would. Test-only plumbing.
#[cfg(test)]
pub(crate) fn park_for_test(cond: &Condition, tid: Tid) {
    super::test_support::make_waiting(tid);
    let mut list = cond.waiters.lock();
    super::test_support::append_link(&mut list, tid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support;
    use crate::sched::{spawn, ThreadState, MAIN_TID};
    use crate::testing;

    fn noop_entry(_: usize, _: usize) {}

    #[test]
    fn test_lock_reentrant_counting() {
        let _guard = testing::kernel_lock();
        let lock = Lock::new();

        assert_eq!(lock.depth(), 0);
        lock.acquire();
        lock.acquire();
        assert!(lock.held_by_current());
        assert_eq!(lock.depth(), 2);

        lock.release();
        assert!(lock.held_by_current());
        lock.release();
        assert!(!lock.held_by_current());
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_release_by_non_holder_ignored() {
        let _guard = testing::kernel_lock();
        let lock = Lock::new();
        // Nobody holds it; a stray release must not underflow.
        lock.release();
        assert_eq!(lock.depth(), 0);
        lock.acquire();
        assert_eq!(lock.depth(), 1);
        lock.release();
    }

    #[test]
    fn test_broadcast_moves_waiters_to_ready_tail() {
        let _guard = testing::kernel_lock();
        testing::init_phys_pool();

        let a = spawn("cond-a", noop_entry, 0, 0).unwrap();
        let b = spawn("cond-b", noop_entry, 0, 0).unwrap();

        let cond = Condition::new("test-cond");
        // Park both spawned threads on the condition without running them.
        park_for_test(&cond, a);
        park_for_test(&cond, b);
        assert!(cond.has_waiters());
        assert_eq!(test_support::state(a), Some(ThreadState::Waiting));
        assert!(!test_support::ready_order().contains(&a));

        cond.broadcast();
        assert!(!cond.has_waiters());
        assert_eq!(test_support::state(a), Some(ThreadState::Ready));
        assert_eq!(test_support::state(b), Some(ThreadState::Ready));

        // FIFO: a woke ahead of b at the ready tail.
        let order = test_support::ready_order();
        let ia = order.iter().position(|&t| t == a).unwrap();
        let ib = order.iter().position(|&t| t == b).unwrap();
        assert!(ia < ib);

        test_support::scrub(a);
        test_support::scrub(b);
    }

    #[test]
    fn test_broadcast_without_waiters_is_noop() {
        let _guard = testing::kernel_lock();
        let cond = Condition::new("empty");
        cond.broadcast();
        assert!(!cond.has_waiters());
        assert_eq!(test_support::state(MAIN_TID), Some(ThreadState::Running));
    }
}
