//! Scheduler core
//!
//! Owns the ready queue, the running thread, the idle thread, the
//! destruction queue, and tick accounting. All state lives behind one lock
//! that is never held across a context switch: every operation computes the
//! transition, drops the lock, then calls [`machine::Machine::launch`].
//!
//! Entry to the scheduler always happens with interrupts off. Selection is
//! "highest-priority ready thread, else idle"; preemption happens whenever
//! an operation makes a ready thread outrank the running one, and on
//! quantum expiry regardless of priority.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::intr;
use crate::kern::runq::ReadyQueue;
use crate::kern::thread::{self, priority, Status, Thread};
use crate::kern::{mlfqs, sleep, synch};
use crate::machine;
use crate::types::Tid;

/// Timer ticks each thread gets before forced preemption.
pub const TIME_SLICE: u32 = 4;

// ============================================================================
// Boot Parameters
// ============================================================================

/// Boot-time scheduling options, from the kernel command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootParams {
    /// Use the multi-level feedback queue scheduler instead of
    /// priority scheduling with donation.
    pub mlfqs: bool,
}

static MLFQS: AtomicBool = AtomicBool::new(false);

/// Whether the MLFQS policy was selected at boot.
pub fn mlfqs_enabled() -> bool {
    MLFQS.load(Ordering::SeqCst)
}

// ============================================================================
// Scheduler State
// ============================================================================

/// Tick accounting. At any moment after boot the three buckets sum to the
/// tick counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    /// Ticks spent in the idle thread.
    pub idle_ticks: i64,
    /// Ticks spent in kernel threads.
    pub kernel_ticks: i64,
    /// Ticks spent in threads owning an address space.
    pub user_ticks: i64,
}

pub(crate) struct Sched {
    pub ready: ReadyQueue,
    pub current: Arc<Thread>,
    pub idle: Option<Arc<Thread>>,
    initial: Arc<Thread>,
    /// Every initialized, not-yet-destroyed thread; the MLFQS all-list.
    pub all: BTreeMap<Tid, Arc<Thread>>,
    /// Dying threads whose pages the next scheduler entry reclaims.
    destruction: Vec<Arc<Thread>>,
    /// Ticks since the running thread was scheduled.
    thread_ticks: u32,
    next_tid: u64,
    stats: TickStats,
}

static SCHED: Mutex<Option<Sched>> = Mutex::new(None);

/// Runs `f` with the scheduler state borrowed. The lock is internal to this
/// module's operations; it is never held across `launch`.
pub(crate) fn with<R>(f: impl FnOnce(&mut Sched) -> R) -> R {
    let mut guard = SCHED.lock();
    f(guard.as_mut().expect("threading system not initialized"))
}

/// Initializes the scheduler by transforming the running code into the
/// initial thread `main`. Interrupts must still be off.
pub(crate) fn init(params: BootParams) {
    assert_eq!(intr::get_level(), intr::Level::Off);
    MLFQS.store(params.mlfqs, Ordering::SeqCst);

    let initial = Arc::new(Thread::bootstrap(Tid(1), "main"));
    let mut all = BTreeMap::new();
    all.insert(initial.tid(), initial.clone());

    *SCHED.lock() = Some(Sched {
        ready: ReadyQueue::new(),
        current: initial.clone(),
        idle: None,
        initial,
        all,
        destruction: Vec::new(),
        thread_ticks: 0,
        next_tid: 2,
        stats: TickStats::default(),
    });
    sleep::init();
    mlfqs::init();
}

/// Starts preemptive scheduling: creates the idle thread, then enables
/// interrupts and waits for it to come up.
pub(crate) fn start() {
    let started = synch::Semaphore::new(0);
    let handshake = started.clone();
    thread::create("idle", priority::MIN, move || idle_loop(handshake))
        .expect("failed to create the idle thread");

    log::info!("scheduler started ({})", if mlfqs_enabled() { "mlfqs" } else { "priority" });
    intr::enable();
    started.down();
}

/// The idle thread. Runs only when the ready queue is empty: it is the
/// fallback returned by selection and never appears in the queue itself.
fn idle_loop(started: synch::Semaphore) {
    with(|s| s.idle = Some(s.current.clone()));
    started.up();

    loop {
        // Let someone else run.
        intr::disable();
        thread::block();

        // Re-enabling interrupts and halting must be atomic; otherwise an
        // interrupt slipping in between wastes up to a full tick.
        machine::ops().wait_for_interrupt();
    }
}

// ============================================================================
// Thread Table
// ============================================================================

pub(crate) fn allocate_tid() -> Tid {
    with(|s| {
        let tid = Tid(s.next_tid);
        s.next_tid += 1;
        tid
    })
}

pub(crate) fn register(thread: Arc<Thread>) {
    with(|s| s.all.insert(thread.tid(), thread));
}

/// The running thread, without validity checks.
pub(crate) fn current() -> Arc<Thread> {
    with(|s| s.current.clone())
}

// ============================================================================
// Scheduling
// ============================================================================

/// Chooses the next thread to run: the ready-queue head, else idle.
fn next_thread_to_run(s: &mut Sched) -> Arc<Thread> {
    s.ready
        .pop_front()
        .unwrap_or_else(|| s.idle.clone().expect("nothing to run and no idle thread"))
}

/// Switches to the next thread. At entry interrupts are off and the running
/// thread's status has already been changed away from RUNNING.
pub(crate) fn schedule() {
    assert_eq!(intr::get_level(), intr::Level::Off);

    let (prev, next, prev_finished) = with(|s| {
        assert_ne!(s.current.status(), Status::Running);

        let next = next_thread_to_run(s);
        next.set_status(Status::Running);
        // Start a new time slice.
        s.thread_ticks = 0;

        let prev = core::mem::replace(&mut s.current, next.clone());
        let prev_finished = prev.status() == Status::Dying;
        // A dying thread cannot free its own stack: queue the page for the
        // next scheduler entry. The initial thread never owned one.
        if prev_finished && !Arc::ptr_eq(&prev, &s.initial) {
            s.destruction.push(prev.clone());
        }
        (prev, next, prev_finished)
    });

    let aspace = next.address_space();
    if aspace != 0 {
        machine::ops().activate_address_space(aspace);
    }

    if !Arc::ptr_eq(&prev, &next) {
        machine::ops().launch(prev.tid(), next.tid(), prev_finished);
    }
}

/// Reaps earlier victims, marks the running thread with `status`, and
/// schedules its successor.
fn do_schedule(status: Status) {
    assert_eq!(intr::get_level(), intr::Level::Off);
    assert_eq!(with(|s| s.current.status()), Status::Running);

    let victims = with(|s| {
        let victims: Vec<Arc<Thread>> = s.destruction.drain(..).collect();
        for victim in &victims {
            s.all.remove(&victim.tid());
        }
        victims
    });
    for victim in victims {
        victim.release_stack();
    }

    with(|s| s.current.set_status(status));
    schedule();
}

/// Yields the CPU; the current thread goes back into the ready queue at its
/// priority and may be picked again immediately.
pub(crate) fn yield_now() {
    assert!(!intr::context());

    let old = intr::disable();
    with(|s| {
        let cur = s.current.clone();
        let is_idle = s.idle.as_ref().is_some_and(|i| Arc::ptr_eq(i, &cur));
        if !is_idle {
            s.ready.insert_ordered(cur);
        }
    });
    do_schedule(Status::Ready);
    intr::set_level(old);
}

/// Marks the current thread DYING and schedules its successor. The page is
/// reclaimed at the next scheduler entry.
pub(crate) fn exit_current() -> ! {
    assert!(!intr::context());

    let cur = current();
    log::debug!("thread '{}' (tid {}) exiting", cur.name(), cur.tid());
    drop(cur);

    intr::disable();
    do_schedule(Status::Dying);
    unreachable!("a dying thread was rescheduled");
}

/// Yields if the head of the ready queue outranks the running thread; in an
/// interrupt handler the yield is deferred to handler return.
pub(crate) fn preempt() {
    let old = intr::disable();
    let should_yield = with(|s| {
        let cur = &s.current;
        let cur_is_idle = s.idle.as_ref().is_some_and(|i| Arc::ptr_eq(i, cur));
        match s.ready.front_priority() {
            Some(head) => !cur_is_idle && cur.priority() < head,
            None => false,
        }
    });
    intr::set_level(old);

    if should_yield {
        if intr::context() {
            intr::yield_on_return();
        } else {
            yield_now();
        }
    }
}

/// Per-tick scheduler work, called from the timer interrupt: accounting
/// buckets, stack-overflow detection, and quantum enforcement.
pub(crate) fn tick() {
    let quantum_expired = with(|s| {
        let cur = &s.current;
        assert!(
            cur.stack_cookie_intact(),
            "thread '{}' overflowed its stack",
            cur.name()
        );

        if s.idle.as_ref().is_some_and(|i| Arc::ptr_eq(i, cur)) {
            s.stats.idle_ticks += 1;
        } else if cur.address_space() != 0 {
            s.stats.user_ticks += 1;
        } else {
            s.stats.kernel_ticks += 1;
        }

        s.thread_ticks += 1;
        s.thread_ticks >= TIME_SLICE
    });

    if quantum_expired {
        intr::yield_on_return();
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// A snapshot of the tick accounting buckets.
pub fn tick_stats() -> TickStats {
    with(|s| s.stats)
}

/// Logs thread statistics.
pub fn print_stats() {
    let stats = tick_stats();
    log::info!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        stats.idle_ticks,
        stats.kernel_ticks,
        stats.user_ticks
    );
}
