//! Sleep queue
//!
//! Threads waiting out a timed sleep, ordered by wakeup tick so the timer
//! interrupt drains exactly the due prefix each tick. Members are BLOCKED
//! and their `wakeup_tick` is the absolute deadline; the field is cleared
//! on wakeup.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::intr;
use crate::kern::thread::{self, priority, Thread};
use crate::kern::{sched, timer};

static SLEEPERS: Mutex<VecDeque<Arc<Thread>>> = Mutex::new(VecDeque::new());

/// Resets the sleep queue at boot.
pub(crate) fn init() {
    SLEEPERS.lock().clear();
}

/// Blocks the current thread for `ticks` timer ticks. A non-positive count
/// is a no-op. Use `timer::sleep` rather than calling this directly.
pub(crate) fn thread_sleep(ticks: i64) {
    assert!(!intr::context());
    if ticks <= 0 {
        return;
    }

    let old = intr::disable();
    let cur = thread::current();
    cur.set_wakeup_tick(timer::ticks() + ticks);
    {
        let mut sleepers = SLEEPERS.lock();
        let wakeup = cur.wakeup_tick();
        // Sorted insert: after any earlier or equal deadlines.
        let pos = sleepers
            .iter()
            .position(|t| t.wakeup_tick() > wakeup)
            .unwrap_or(sleepers.len());
        sleepers.insert(pos, cur);
    }
    thread::block();
    intr::set_level(old);
}

/// Wakes every sleeper whose deadline has passed. Runs in the timer
/// interrupt; requests a yield on return when a woken thread outranks the
/// interrupted one. The queue order makes this O(k) in woken threads.
pub(crate) fn awake(now: i64) {
    let due: Vec<Arc<Thread>> = {
        let mut sleepers = SLEEPERS.lock();
        let mut due = Vec::new();
        while sleepers
            .front()
            .is_some_and(|t| t.wakeup_tick() <= now)
        {
            due.push(sleepers.pop_front().unwrap());
        }
        due
    };

    if due.is_empty() {
        return;
    }

    let mut top = priority::MIN - 1;
    for t in due {
        t.set_wakeup_tick(0);
        top = cmp::max(top, t.priority());
        thread::unblock(&t);
    }

    if intr::context() && top > sched::current().priority() {
        intr::yield_on_return();
    }
}

/// Number of threads currently in the sleep queue.
#[cfg(test)]
pub(crate) fn sleeper_count() -> usize {
    SLEEPERS.lock().len()
}
