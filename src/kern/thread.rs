//! Thread management
//!
//! The thread descriptor and its lifecycle operations. A thread is RUNNING,
//! READY, BLOCKED, or DYING; transitions happen with interrupts off and go
//! through the scheduler in [`super::sched`]. Each thread owns one kernel
//! stack page with a magic cookie at its base for overflow detection.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::intr;
use crate::kern::fixed_point::Fixed;
use crate::kern::{mlfqs, sched, synch};
use crate::machine;
use crate::types::Tid;

// ============================================================================
// Priority Levels
// ============================================================================

/// Thread priority levels. Higher values run first.
pub mod priority {
    /// Minimum priority; the idle thread runs here.
    pub const MIN: i32 = 0;
    /// Default priority
    pub const DEFAULT: i32 = 31;
    /// Maximum priority
    pub const MAX: i32 = 63;
}

/// Bounds for the MLFQS `nice` value.
pub const NICE_MIN: i32 = -20;
pub const NICE_DEFAULT: i32 = 0;
pub const NICE_MAX: i32 = 20;

/// Maximum thread name length.
pub const NAME_MAX: usize = 16;

/// Random value stored in every descriptor and at the base of its stack
/// page. A clobbered cookie means the stack grew into the descriptor.
const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

// ============================================================================
// Thread Status
// ============================================================================

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Currently executing on the CPU.
    Running = 0,
    /// Runnable, waiting in the ready queue.
    Ready = 1,
    /// Suspended until unblocked.
    Blocked = 2,
    /// Exited; descriptor awaiting destruction.
    Dying = 3,
}

impl Status {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Ready,
            2 => Self::Blocked,
            3 => Self::Dying,
            _ => unreachable!("corrupt thread status"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures a caller can recover from. Everything else in the threading core
/// is a contract violation and halts the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// No page available for the new thread.
    OutOfMemory,
}

impl core::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

// ============================================================================
// Stack Page
// ============================================================================

/// An owned kernel stack page with the overflow cookie written at its base.
pub(crate) struct StackPage {
    base: *mut u8,
}

impl StackPage {
    fn alloc() -> Option<Self> {
        let base = machine::ops().alloc_page()?;
        // SAFETY: the machine hands out PAGE_SIZE bytes; the cookie fits.
        unsafe {
            base.cast::<u32>().write(THREAD_MAGIC);
        }
        Some(Self { base })
    }

    fn cookie_intact(&self) -> bool {
        // SAFETY: base points at our live page.
        unsafe { self.base.cast::<u32>().read() == THREAD_MAGIC }
    }

    #[cfg(test)]
    pub(crate) fn clobber_cookie(&self) {
        // SAFETY: test-only corruption of our own page.
        unsafe {
            self.base.cast::<u32>().write(!THREAD_MAGIC);
        }
    }
}

impl Drop for StackPage {
    fn drop(&mut self) {
        // SAFETY: base came from alloc_page and is dropped exactly once.
        unsafe {
            machine::ops().free_page(self.base);
        }
    }
}

// SAFETY: the page is exclusively owned by its thread descriptor.
unsafe impl Send for StackPage {}
unsafe impl Sync for StackPage {}

// ============================================================================
// Thread Descriptor
// ============================================================================

/// A kernel thread.
///
/// Scheduling fields are atomics because other threads read and write them
/// during the donation walk and MLFQS recomputation; all such access happens
/// under interrupts-off.
pub struct Thread {
    tid: Tid,
    name: heapless::String<NAME_MAX>,
    magic: u32,

    status: AtomicU32,
    /// Effective priority: the one scheduling decisions use.
    priority: AtomicI32,
    /// Base priority, donation mode only.
    original_priority: AtomicI32,

    /// MLFQS niceness, in [NICE_MIN, NICE_MAX].
    nice: AtomicI32,
    /// MLFQS CPU-usage estimate, raw 17.14.
    recent_cpu: AtomicI32,

    /// Absolute tick to wake at; valid only while in the sleep queue.
    wakeup_tick: AtomicI64,

    /// Address-space handle, 0 for pure kernel threads.
    aspace: AtomicUsize,

    /// The lock this thread is currently blocked acquiring.
    pub(crate) wait_on_lock: Mutex<Option<synch::Lock>>,
    /// Threads donating their priority to this one.
    pub(crate) donations: Mutex<Vec<Arc<Thread>>>,

    /// None only for the adopted initial thread, which runs on the boot
    /// stack and is never reaped.
    stack: Mutex<Option<StackPage>>,
}

impl Thread {
    fn new(
        tid: Tid,
        name: &str,
        priority: i32,
        status: Status,
        nice: i32,
        recent_cpu: Fixed,
        stack: Option<StackPage>,
    ) -> Self {
        assert!((priority::MIN..=priority::MAX).contains(&priority));
        Self {
            tid,
            name: truncated_name(name),
            magic: THREAD_MAGIC,
            status: AtomicU32::new(status as u32),
            priority: AtomicI32::new(priority),
            original_priority: AtomicI32::new(priority),
            nice: AtomicI32::new(nice),
            recent_cpu: AtomicI32::new(recent_cpu.raw()),
            wakeup_tick: AtomicI64::new(0),
            aspace: AtomicUsize::new(0),
            wait_on_lock: Mutex::new(None),
            donations: Mutex::new(Vec::new()),
            stack: Mutex::new(stack),
        }
    }

    /// Descriptor for the boot context adopted by `sched::init`.
    pub(crate) fn bootstrap(tid: Tid, name: &str) -> Self {
        Self::new(
            tid,
            name,
            priority::DEFAULT,
            Status::Running,
            NICE_DEFAULT,
            Fixed::ZERO,
            None,
        )
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u32, Ordering::SeqCst);
    }

    /// Effective priority.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_effective_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    pub(crate) fn original_priority(&self) -> i32 {
        self.original_priority.load(Ordering::SeqCst)
    }

    pub(crate) fn set_original_priority(&self, priority: i32) {
        self.original_priority.store(priority, Ordering::SeqCst);
    }

    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::SeqCst)
    }

    pub(crate) fn set_nice_raw(&self, nice: i32) {
        self.nice.store(nice, Ordering::SeqCst);
    }

    pub fn recent_cpu(&self) -> Fixed {
        Fixed::from_raw(self.recent_cpu.load(Ordering::SeqCst))
    }

    pub(crate) fn set_recent_cpu(&self, value: Fixed) {
        self.recent_cpu.store(value.raw(), Ordering::SeqCst);
    }

    pub(crate) fn wakeup_tick(&self) -> i64 {
        self.wakeup_tick.load(Ordering::SeqCst)
    }

    pub(crate) fn set_wakeup_tick(&self, tick: i64) {
        self.wakeup_tick.store(tick, Ordering::SeqCst);
    }

    /// Address-space handle activated on context switch; 0 means none.
    pub fn address_space(&self) -> usize {
        self.aspace.load(Ordering::SeqCst)
    }

    pub fn set_address_space(&self, handle: usize) {
        self.aspace.store(handle, Ordering::SeqCst);
    }

    /// True while the cookie at the stack base is unclobbered. Threads
    /// without an owned page (the initial thread) always pass.
    pub(crate) fn stack_cookie_intact(&self) -> bool {
        self.magic == THREAD_MAGIC
            && self
                .stack
                .lock()
                .as_ref()
                .map_or(true, |page| page.cookie_intact())
    }

    /// Releases the stack page during destruction.
    pub(crate) fn release_stack(&self) {
        *self.stack.lock() = None;
    }

    fn is_thread(&self) -> bool {
        self.magic == THREAD_MAGIC
    }

    #[cfg(test)]
    pub(crate) fn stub_for_test(name: &str, priority: i32) -> Self {
        Self::new(
            Tid::NULL,
            name,
            priority,
            Status::Ready,
            NICE_DEFAULT,
            Fixed::ZERO,
            None,
        )
    }

    #[cfg(test)]
    pub(crate) fn clobber_stack_cookie(&self) {
        self.stack
            .lock()
            .as_ref()
            .expect("thread has no stack page")
            .clobber_cookie();
    }
}

fn truncated_name(name: &str) -> heapless::String<NAME_MAX> {
    let mut out = heapless::String::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

// ============================================================================
// Lifecycle Operations
// ============================================================================

/// Creates a new kernel thread named `name` at `priority`, executing `f`,
/// and adds it to the ready queue. The creator's `nice` and `recent_cpu`
/// are inherited. The new thread may run, and even exit, before this
/// returns; it may also preempt the creator immediately.
pub fn create(
    name: &str,
    priority: i32,
    f: impl FnOnce() + Send + 'static,
) -> Result<Tid, ThreadError> {
    assert!((priority::MIN..=priority::MAX).contains(&priority));

    let stack = StackPage::alloc().ok_or(ThreadError::OutOfMemory)?;
    let creator = current();
    let tid = sched::allocate_tid();
    let thread = Arc::new(Thread::new(
        tid,
        name,
        priority,
        Status::Blocked,
        creator.nice(),
        creator.recent_cpu(),
        Some(stack),
    ));

    sched::register(thread.clone());
    machine::ops().prepare_thread(tid, Box::new(f));
    log::debug!("created thread '{}' (tid {})", thread.name(), tid);

    unblock(&thread);
    sched::preempt();
    Ok(tid)
}

/// First code run in a fresh thread context. The scheduler hands threads
/// off with interrupts disabled.
pub(crate) fn kernel_entry(f: machine::ThreadEntry) {
    intr::enable();
    f();
    exit();
}

/// Puts the current thread to sleep until [`unblock`]. Interrupts must be
/// off; the synchronization primitives are usually the better interface.
pub fn block() {
    assert!(!intr::context());
    assert_eq!(intr::get_level(), intr::Level::Off);
    sched::current().set_status(Status::Blocked);
    sched::schedule();
}

/// Transitions a blocked thread to ready. Does not preempt the running
/// thread: callers decide whether the wakeup warrants a yield, and a caller
/// that disabled interrupts may unblock and update other state atomically.
pub fn unblock(thread: &Arc<Thread>) {
    assert!(thread.is_thread());
    assert_eq!(thread.status(), Status::Blocked, "unblock of a non-blocked thread");

    let old = intr::disable();
    sched::with(|s| s.ready.insert_ordered(thread.clone()));
    thread.set_status(Status::Ready);
    intr::set_level(old);
}

/// Yields the CPU. The current thread is re-queued at its priority and may
/// be scheduled again immediately.
pub fn yield_now() {
    sched::yield_now();
}

/// Deschedules and destroys the current thread. Never returns.
pub fn exit() -> ! {
    sched::exit_current()
}

/// The running thread. Panics if the descriptor looks corrupt, which in
/// practice means the thread overflowed its stack.
pub fn current() -> Arc<Thread> {
    let t = sched::current();
    assert!(t.is_thread(), "stack overflow smashed the thread descriptor");
    assert_eq!(t.status(), Status::Running);
    t
}

/// The running thread's id.
pub fn tid() -> Tid {
    current().tid()
}

// ============================================================================
// Priority and MLFQS Accessors
// ============================================================================

/// Sets the current thread's base priority and recomputes its effective
/// priority, which stays elevated while donations outrank the new base.
/// Yields if the head of the ready queue now outranks the caller. Ignored
/// under MLFQS.
pub fn set_priority(new_priority: i32) {
    if sched::mlfqs_enabled() {
        return;
    }
    assert!((priority::MIN..=priority::MAX).contains(&new_priority));

    let old = intr::disable();
    let cur = current();
    cur.set_original_priority(new_priority);
    synch::refresh_priority(&cur);
    intr::set_level(old);
    sched::preempt();
}

/// The current thread's effective priority.
pub fn get_priority() -> i32 {
    current().priority()
}

/// Sets the current thread's `nice` and immediately recomputes its
/// priority, yielding if it no longer outranks the ready queue's head.
pub fn set_nice(nice: i32) {
    assert!((NICE_MIN..=NICE_MAX).contains(&nice));

    let old = intr::disable();
    let cur = current();
    cur.set_nice_raw(nice);
    if sched::mlfqs_enabled() {
        cur.set_effective_priority(mlfqs::priority_for(cur.recent_cpu(), nice));
    }
    intr::set_level(old);
    sched::preempt();
}

/// The current thread's `nice`.
pub fn get_nice() -> i32 {
    let old = intr::disable();
    let nice = current().nice();
    intr::set_level(old);
    nice
}

/// 100 times the system load average, rounded to nearest.
pub fn get_load_avg() -> i32 {
    let old = intr::disable();
    let value = mlfqs::load_avg().mul_int(100).to_int_round();
    intr::set_level(old);
    value
}

/// 100 times the current thread's `recent_cpu`, rounded to nearest.
pub fn get_recent_cpu() -> i32 {
    let old = intr::disable();
    let value = current().recent_cpu().mul_int(100).to_int_round();
    intr::set_level(old);
    value
}

/// Per-tick accounting, run by the timer interrupt handler.
pub(crate) fn tick() {
    sched::tick();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::sched::BootParams;
    use crate::machine::sim;

    #[test]
    fn test_create_runs_and_inherits() {
        let _sim = sim::boot(BootParams::default());

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        // Higher priority than main: runs to completion inside create().
        let tid = create("worker", 40, move || {
            *flag.lock() = true;
            assert_eq!(get_priority(), 40);
        })
        .unwrap();
        assert!(!tid.is_null());
        assert!(*ran.lock());
    }

    #[test]
    fn test_create_out_of_memory() {
        let sim = sim::boot(BootParams::default());

        sim.machine().fail_next_page_alloc();
        let err = create("doomed", priority::DEFAULT, || {}).unwrap_err();
        assert_eq!(err, ThreadError::OutOfMemory);
    }

    #[test]
    fn test_name_truncated_to_sixteen() {
        let _sim = sim::boot(BootParams::default());

        let seen = Arc::new(Mutex::new(alloc::string::String::new()));
        let out = seen.clone();
        create("a-name-that-is-way-too-long", 40, move || {
            out.lock().push_str(current().name());
        })
        .unwrap();
        assert_eq!(seen.lock().as_str(), "a-name-that-is-w");
    }

    #[test]
    fn test_initial_thread_identity() {
        let _sim = sim::boot(BootParams::default());

        let main = current();
        assert_eq!(main.name(), "main");
        assert_eq!(main.status(), Status::Running);
        assert_eq!(main.priority(), priority::DEFAULT);
        assert!(main.stack_cookie_intact());
    }

    #[test]
    fn test_stack_cookie_detects_overflow() {
        let _sim = sim::boot(BootParams::default());

        // Low priority: stays READY, never runs, so we can poke at it.
        let tid = create("victim", priority::MIN, || {}).unwrap();
        let victim = sched::with(|s| s.all.get(&tid).cloned()).unwrap();

        assert!(victim.stack_cookie_intact());
        victim.clobber_stack_cookie();
        assert!(!victim.stack_cookie_intact());
    }

    #[test]
    #[should_panic(expected = "unblock of a non-blocked thread")]
    fn test_unblock_requires_blocked() {
        let _sim = sim::boot(BootParams::default());

        let tid = create("ready", priority::MIN, || {}).unwrap();
        let t = sched::with(|s| s.all.get(&tid).cloned()).unwrap();
        assert_eq!(t.status(), Status::Ready);
        unblock(&t);
    }

    #[test]
    fn test_set_priority_idempotent() {
        let _sim = sim::boot(BootParams::default());

        set_priority(45);
        let first = get_priority();
        set_priority(45);
        assert_eq!(get_priority(), first);
        assert_eq!(first, 45);
        set_priority(priority::DEFAULT);
    }

    #[test]
    fn test_priority_scheduling_order() {
        let _sim = sim::boot(BootParams::default());

        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());

        // Equal to main: queued, does not preempt.
        create("alpha", 31, move || a.lock().push("alpha")).unwrap();
        assert!(order.lock().is_empty());

        // Outranks main: preempts immediately. Main lands in the ready
        // queue behind alpha, so alpha also finishes before create returns.
        create("beta", 32, move || b.lock().push("beta")).unwrap();
        assert_eq!(order.lock().as_slice(), &["beta", "alpha"]);
    }

    #[test]
    fn test_round_robin_among_equals() {
        let _sim = sim::boot(BootParams::default());

        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let burner = |name: &'static str, log: Arc<Mutex<Vec<&'static str>>>| {
            move || {
                for _ in 0..2 {
                    log.lock().push(name);
                    // Burn one quantum; the tick handler forces the yield.
                    for _ in 0..crate::kern::TIME_SLICE {
                        sim::fire_tick();
                    }
                }
            }
        };

        // Keep main above the pair while setting them up.
        set_priority(40);
        create("even", 32, burner("even", order.clone())).unwrap();
        create("odd", 32, burner("odd", order.clone())).unwrap();
        set_priority(20);

        // Both finished before main runs again at priority 20.
        assert_eq!(order.lock().as_slice(), &["even", "odd", "even", "odd"]);
        set_priority(priority::DEFAULT);
    }
}
