//! Multi-level feedback queue scheduling
//!
//! The alternative policy selected at boot. Priorities are not set by
//! threads but recomputed continuously from accounting state the tick
//! handler maintains: `recent_cpu` grows while a thread runs and decays
//! against the system load average once a second; priorities follow every
//! four ticks. Donation is suppressed entirely in this mode.
//!
//! The formulas live in pure helpers; the `recalculate_*` entry points
//! apply them across the all-threads list from the timer interrupt.

use core::sync::atomic::{AtomicI32, Ordering};

use alloc::sync::Arc;

use crate::kern::fixed_point::Fixed;
use crate::kern::sched;
use crate::kern::thread::{priority, Thread};

/// System load average, raw 17.14. Estimates the number of threads ready
/// to run over the last minute.
static LOAD_AVG: AtomicI32 = AtomicI32::new(0);

/// Resets the load average at boot.
pub(crate) fn init() {
    LOAD_AVG.store(0, Ordering::SeqCst);
}

/// The current system load average.
pub fn load_avg() -> Fixed {
    Fixed::from_raw(LOAD_AVG.load(Ordering::SeqCst))
}

// ============================================================================
// Feedback Formulas
// ============================================================================

/// `priority = PRI_MAX - recent_cpu/4 - nice*2`, clamped to the valid range.
pub(crate) fn priority_for(recent_cpu: Fixed, nice: i32) -> i32 {
    let fp = Fixed::from_int(priority::MAX) - recent_cpu.div_int(4) - Fixed::from_int(nice * 2);
    fp.to_int().clamp(priority::MIN, priority::MAX)
}

/// `recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice`.
pub(crate) fn decayed_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: i32) -> Fixed {
    let twice = load_avg.mul_int(2);
    let coefficient = twice.div(twice.add_int(1));
    coefficient.mul(recent_cpu) + Fixed::from_int(nice)
}

/// `load_avg = (59/60)*load_avg + (1/60)*ready_threads`.
pub(crate) fn next_load_avg(load_avg: Fixed, ready_threads: i32) -> Fixed {
    Fixed::from_int(59).div(Fixed::from_int(60)).mul(load_avg)
        + Fixed::from_int(ready_threads).div(Fixed::from_int(60))
}

// ============================================================================
// Per-Tick and Batch Updates
// ============================================================================

fn is_idle(s: &crate::kern::sched::Sched, t: &Arc<Thread>) -> bool {
    s.idle.as_ref().is_some_and(|i| Arc::ptr_eq(i, t))
}

/// Charges the running thread one tick of CPU. The idle thread is exempt.
pub(crate) fn increment_recent_cpu() {
    sched::with(|s| {
        let cur = s.current.clone();
        if !is_idle(s, &cur) {
            cur.set_recent_cpu(cur.recent_cpu().add_int(1));
        }
    });
}

/// Once a second: recomputes the load average from the number of threads
/// ready or running (the idle thread does not count).
pub(crate) fn recalculate_load_avg() {
    sched::with(|s| {
        let mut ready_threads = s.ready.len() as i32;
        let cur = s.current.clone();
        if !is_idle(s, &cur) {
            ready_threads += 1;
        }
        LOAD_AVG.store(
            next_load_avg(load_avg(), ready_threads).raw(),
            Ordering::SeqCst,
        );
    });
}

/// Once a second: decays every thread's `recent_cpu` against the load
/// average.
pub(crate) fn recalculate_recent_cpu() {
    let la = load_avg();
    sched::with(|s| {
        let idle = s.idle.clone();
        for t in s.all.values() {
            if idle.as_ref().is_some_and(|i| Arc::ptr_eq(i, t)) {
                continue;
            }
            t.set_recent_cpu(decayed_recent_cpu(t.recent_cpu(), la, t.nice()));
        }
    });
}

/// Every four ticks: recomputes every thread's priority from the feedback
/// formula, then restores the ready queue's order with one re-sort.
pub(crate) fn recalculate_priorities() {
    sched::with(|s| {
        let idle = s.idle.clone();
        for t in s.all.values() {
            if idle.as_ref().is_some_and(|i| Arc::ptr_eq(i, t)) {
                continue;
            }
            t.set_effective_priority(priority_for(t.recent_cpu(), t.nice()));
        }
        s.ready.resort();
    });
}
