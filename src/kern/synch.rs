//! Synchronization primitives
//!
//! Counting semaphores, locks with priority donation, and condition
//! variables, all built on `thread::block`/`thread::unblock` under the
//! interrupts-off discipline. Waiter lists are priority-ordered: whenever a
//! single slot opens, the highest-priority waiter gets it, FIFO among
//! equals.
//!
//! Donation runs only under the default policy. A thread blocked on a lock
//! lends its effective priority to the holder, transitively along the
//! chain of holders the holder itself is blocked on; MLFQS suppresses the
//! whole mechanism.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Reverse;
use spin::Mutex;

use crate::intr;
use crate::kern::sched;
use crate::kern::thread::{self, Status, Thread};

/// Bound on the donation chain walk. Deeper nesting than this does not
/// occur in practice.
const DONATION_DEPTH_MAX: usize = 8;

// ============================================================================
// Semaphore
// ============================================================================

struct SemaState {
    value: u32,
    waiters: Vec<Arc<Thread>>,
}

/// A counting semaphore. Handles are cheap clones sharing one state.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Mutex<SemaState>>,
}

impl Semaphore {
    pub fn new(value: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SemaState {
                value,
                waiters: Vec::new(),
            })),
        }
    }

    /// Down or "P": waits for the value to become positive, then decrements
    /// it. May block, so not for interrupt handlers.
    pub fn down(&self) {
        assert!(!intr::context());

        let old = intr::disable();
        loop {
            {
                let mut state = self.inner.lock();
                if state.value > 0 {
                    state.value -= 1;
                    break;
                }
                let cur = thread::current();
                let priority = cur.priority();
                // Ordered by descending priority, after equals.
                let pos = state
                    .waiters
                    .iter()
                    .position(|t| t.priority() < priority)
                    .unwrap_or(state.waiters.len());
                state.waiters.insert(pos, cur);
            }
            thread::block();
        }
        intr::set_level(old);
    }

    /// Down without waiting; returns whether the decrement happened.
    pub fn try_down(&self) -> bool {
        let old = intr::disable();
        let ok = {
            let mut state = self.inner.lock();
            if state.value > 0 {
                state.value -= 1;
                true
            } else {
                false
            }
        };
        intr::set_level(old);
        ok
    }

    /// Up or "V": increments the value and wakes the highest-priority
    /// waiter, preempting if the woken thread outranks the caller. Safe in
    /// interrupt handlers.
    pub fn up(&self) {
        let old = intr::disable();
        let woken = {
            let mut state = self.inner.lock();
            // Donation may have changed priorities while they slept.
            state.waiters.sort_by_key(|t| Reverse(t.priority()));
            let woken = if state.waiters.is_empty() {
                None
            } else {
                Some(state.waiters.remove(0))
            };
            state.value += 1;
            woken
        };
        if let Some(t) = woken {
            thread::unblock(&t);
        }
        intr::set_level(old);
        sched::preempt();
    }

    #[cfg(test)]
    fn value(&self) -> u32 {
        self.inner.lock().value
    }
}

// ============================================================================
// Lock
// ============================================================================

struct LockInner {
    holder: Mutex<Option<Arc<Thread>>>,
    sema: Semaphore,
}

/// A mutual-exclusion lock: a binary semaphore plus a holder, which makes
/// it the conduit for priority donation. Handles are cheap clones.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockInner {
                holder: Mutex::new(None),
                sema: Semaphore::new(1),
            }),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Lock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The thread currently holding this lock.
    pub fn holder(&self) -> Option<Arc<Thread>> {
        self.inner.holder.lock().clone()
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.holder()
            .is_some_and(|h| Arc::ptr_eq(&h, &thread::current()))
    }

    /// Acquires the lock, sleeping until it is available. While blocked
    /// behind a lower-priority holder, the caller donates its effective
    /// priority along the chain of holders.
    pub fn acquire(&self) {
        assert!(!intr::context());
        assert!(!self.held_by_current_thread(), "recursive lock acquire");

        let old = intr::disable();
        let cur = thread::current();

        if !sched::mlfqs_enabled() {
            if let Some(holder) = self.holder() {
                *cur.wait_on_lock.lock() = Some(self.clone());
                holder.donations.lock().push(cur.clone());
                donate_chain(&cur);
            }
        }

        self.inner.sema.down();

        *cur.wait_on_lock.lock() = None;
        *self.inner.holder.lock() = Some(cur);
        intr::set_level(old);
    }

    /// Acquires without waiting. No donation happens on failure.
    pub fn try_acquire(&self) -> bool {
        assert!(!intr::context());

        let ok = self.inner.sema.try_down();
        if ok {
            *self.inner.holder.lock() = Some(thread::current());
        }
        ok
    }

    /// Releases the lock. Donations received through it are returned and
    /// the holder's effective priority recomputed before the next waiter is
    /// woken. Must be called by the holder; not for interrupt handlers.
    pub fn release(&self) {
        assert!(!intr::context());
        assert!(self.held_by_current_thread(), "lock released by non-holder");

        let old = intr::disable();
        let cur = thread::current();

        if !sched::mlfqs_enabled() {
            cur.donations.lock().retain(|donor| {
                let waits_on = donor.wait_on_lock.lock();
                !waits_on.as_ref().is_some_and(|l| l.ptr_eq(self))
            });
            refresh_priority(&cur);
        }

        *self.inner.holder.lock() = None;
        self.inner.sema.up();
        intr::set_level(old);
    }
}

// ============================================================================
// Priority Donation
// ============================================================================

/// Propagates `donor`'s effective priority along the waits-for chain:
/// through the lock it blocks on, into that lock's holder, and onward if
/// the holder is itself blocked. Bounded at [`DONATION_DEPTH_MAX`] links.
/// Cycles cannot form: closing one would require the closing acquirer to
/// already be blocked.
fn donate_chain(donor: &Arc<Thread>) {
    let mut t = donor.clone();
    for _ in 0..DONATION_DEPTH_MAX {
        let lock = t.wait_on_lock.lock().clone();
        let Some(lock) = lock else { break };
        let Some(holder) = lock.holder() else { break };

        if holder.priority() < t.priority() {
            holder.set_effective_priority(t.priority());
            // A boosted thread sitting in the ready queue must move up to
            // its new position.
            if holder.status() == Status::Ready {
                sched::with(|s| {
                    if s.ready.remove(&holder) {
                        s.ready.insert_ordered(holder.clone());
                    }
                });
            }
        }
        t = holder;
    }
}

/// Recomputes a thread's effective priority as the maximum of its base
/// priority and the priorities of its remaining donors.
pub(crate) fn refresh_priority(thread: &Arc<Thread>) {
    let mut priority = thread.original_priority();
    for donor in thread.donations.lock().iter() {
        priority = priority.max(donor.priority());
    }
    thread.set_effective_priority(priority);
}

// ============================================================================
// Condition Variable
// ============================================================================

struct CondWaiter {
    sema: Semaphore,
    owner: Arc<Thread>,
}

/// A condition variable. Each waiter sleeps on a private semaphore so that
/// `signal` can hand the wakeup to the highest-priority waiter.
#[derive(Clone)]
pub struct Condvar {
    waiters: Arc<Mutex<Vec<CondWaiter>>>,
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Atomically releases `lock` and waits to be signaled, then re-acquires
    /// `lock` before returning. The monitor lock must be held.
    pub fn wait(&self, lock: &Lock) {
        assert!(!intr::context());
        assert!(lock.held_by_current_thread());

        let waiter = Semaphore::new(0);
        self.waiters.lock().push(CondWaiter {
            sema: waiter.clone(),
            owner: thread::current(),
        });
        lock.release();
        waiter.down();
        lock.acquire();
    }

    /// Wakes the waiter whose owner has the highest current priority, FIFO
    /// among equals. The monitor lock must be held.
    pub fn signal(&self, lock: &Lock) {
        assert!(!intr::context());
        assert!(lock.held_by_current_thread());

        let woken = {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                None
            } else {
                let mut best = 0;
                for (i, w) in waiters.iter().enumerate() {
                    if w.owner.priority() > waiters[best].owner.priority() {
                        best = i;
                    }
                }
                Some(waiters.remove(best))
            }
        };
        if let Some(w) = woken {
            w.sema.up();
        }
    }

    /// Wakes every waiter. The monitor lock must be held.
    pub fn broadcast(&self, lock: &Lock) {
        while !self.waiters.lock().is_empty() {
            self.signal(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::sched::BootParams;
    use crate::kern::thread::priority;
    use crate::machine::sim;

    #[test]
    fn test_semaphore_counts() {
        let _sim = sim::boot(BootParams::default());

        let sema = Semaphore::new(2);
        assert!(sema.try_down());
        assert!(sema.try_down());
        assert!(!sema.try_down());
        sema.up();
        assert!(sema.try_down());
        sema.up();
        sema.up();
        assert_eq!(sema.value(), 2);
    }

    #[test]
    fn test_semaphore_fifo_among_equals() {
        let _sim = sim::boot(BootParams::default());

        let sema = Semaphore::new(0);
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let (s, log) = (sema.clone(), order.clone());
            // Equal priorities, above main: each runs at creation and
            // blocks on the semaphore in creation order.
            thread::create("waiter", 40, move || {
                s.down();
                log.lock().push(i);
            })
            .unwrap();
        }
        assert!(order.lock().is_empty());

        for _ in 0..4 {
            sema.up();
        }
        assert_eq!(order.lock().as_slice(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_semaphore_wakes_highest_priority() {
        let _sim = sim::boot(BootParams::default());

        let sema = Semaphore::new(0);
        let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

        for pri in [33, 35, 34] {
            let (s, log) = (sema.clone(), order.clone());
            thread::create("waiter", pri, move || {
                s.down();
                log.lock().push(pri);
            })
            .unwrap();
        }

        for _ in 0..3 {
            sema.up();
        }
        assert_eq!(order.lock().as_slice(), &[35, 34, 33]);
    }

    #[test]
    fn test_lock_basics() {
        let _sim = sim::boot(BootParams::default());

        let lock = Lock::new();
        assert!(!lock.held_by_current_thread());
        lock.acquire();
        assert!(lock.held_by_current_thread());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    #[should_panic(expected = "lock released by non-holder")]
    fn test_release_requires_holder() {
        let _sim = sim::boot(BootParams::default());

        let lock = Lock::new();
        lock.release();
    }

    #[test]
    fn test_donation_single() {
        let _sim = sim::boot(BootParams::default());

        let lock = Lock::new();
        lock.acquire();

        let l = lock.clone();
        // Blocks on our lock and donates 40 to us.
        thread::create("contender", 40, move || {
            l.acquire();
            l.release();
        })
        .unwrap();

        assert_eq!(thread::get_priority(), 40);
        lock.release();
        // The donation went back with the lock.
        assert_eq!(thread::get_priority(), priority::DEFAULT);
    }

    #[test]
    fn test_donation_multiple_locks() {
        let _sim = sim::boot(BootParams::default());

        // Main (31) holds a and b. A medium thread blocks on b, a high
        // thread on a; releasing each lock sheds exactly its donation.
        let a = Lock::new();
        let b = Lock::new();
        a.acquire();
        b.acquire();

        let lb = b.clone();
        thread::create("medium", 32, move || {
            lb.acquire();
            lb.release();
        })
        .unwrap();
        assert_eq!(thread::get_priority(), 32);

        let la = a.clone();
        thread::create("high", 34, move || {
            la.acquire();
            la.release();
        })
        .unwrap();
        assert_eq!(thread::get_priority(), 34);

        a.release();
        assert_eq!(thread::get_priority(), 32);
        b.release();
        assert_eq!(thread::get_priority(), priority::DEFAULT);
    }

    #[test]
    fn test_donation_nested_chain() {
        let _sim = sim::boot(BootParams::default());

        let l1 = Lock::new();
        let l2 = Lock::new();
        l1.acquire();

        let (l1m, l2m) = (l1.clone(), l2.clone());
        // Mid holds l2 and blocks on l1: main inherits 32.
        thread::create("mid", 32, move || {
            l2m.acquire();
            l1m.acquire();
            l1m.release();
            l2m.release();
        })
        .unwrap();
        assert_eq!(thread::get_priority(), 32);

        let l2h = l2.clone();
        // High blocks on l2; the donation rides the chain through mid down
        // to main.
        thread::create("high", 33, move || {
            l2h.acquire();
            l2h.release();
        })
        .unwrap();
        assert_eq!(thread::get_priority(), 33);

        l1.release();
        // Chain unwinds: mid runs with 33 until it releases l2, then
        // everyone drains and main is back at its base.
        assert_eq!(thread::get_priority(), priority::DEFAULT);
    }

    #[test]
    fn test_set_priority_keeps_donation() {
        let _sim = sim::boot(BootParams::default());

        let lock = Lock::new();
        lock.acquire();
        let l = lock.clone();
        thread::create("contender", 40, move || {
            l.acquire();
            l.release();
        })
        .unwrap();
        assert_eq!(thread::get_priority(), 40);

        // Lowering the base priority cannot shed a live donation.
        thread::set_priority(10);
        assert_eq!(thread::get_priority(), 40);
        lock.release();
        assert_eq!(thread::get_priority(), 10);
        thread::set_priority(priority::DEFAULT);
    }

    #[test]
    fn test_condvar_signals_highest_priority() {
        let _sim = sim::boot(BootParams::default());

        let lock = Lock::new();
        let cond = Condvar::new();
        let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

        for pri in [33, 35, 34] {
            let (l, c, log) = (lock.clone(), cond.clone(), order.clone());
            thread::create("waiter", pri, move || {
                l.acquire();
                c.wait(&l);
                log.lock().push(pri);
                l.release();
            })
            .unwrap();
        }
        assert!(order.lock().is_empty());

        lock.acquire();
        cond.signal(&lock);
        lock.release();
        assert_eq!(order.lock().as_slice(), &[35]);

        lock.acquire();
        cond.broadcast(&lock);
        lock.release();
        assert_eq!(order.lock().as_slice(), &[35, 34, 33]);
    }

    #[test]
    fn test_lock_handoff_priority_invariant() {
        let _sim = sim::boot(BootParams::default());

        let lock = Lock::new();
        lock.acquire();
        let l = lock.clone();
        thread::create("waiter", 45, move || {
            l.acquire();
            l.release();
        })
        .unwrap();

        // With a waiter present the holder's priority has risen to match.
        let holder = lock.holder().unwrap();
        assert!(holder.priority() >= 45);
        lock.release();
    }
}
