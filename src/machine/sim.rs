//! Hosted machine for the test suite
//!
//! Implements the [`Machine`] boundary on top of the host's threads. Each
//! kernel thread is backed by one host thread that parks until the
//! scheduler launches it; a single-CPU baton guarantees that exactly one
//! context executes kernel code at a time, which preserves the
//! interrupts-off concurrency model the kernel is written against.
//!
//! Virtual time is explicit: a timer interrupt fires only when a test calls
//! [`fire_tick`] (or [`Sim::tick_many`]) or when the idle thread halts, so
//! every scenario is deterministic.
//!
//! Boots serialize on a process-wide lock; the boot sequence re-runs the
//! kernel's own `init` path, so each test gets a fresh kernel. Contexts
//! left blocked by a previous test stay parked on their old machine and
//! never interfere.

use std::alloc::Layout;
use std::sync::{Condvar, Mutex as HostMutex, MutexGuard, PoisonError};
use std::thread as host;
use std::vec::Vec;

use crate::machine::{self, Machine, ThreadEntry, PAGE_SIZE};
use crate::types::Tid;
use crate::{intr, kern};

/// One hosted boot at a time per test process.
static BOOT_LOCK: HostMutex<()> = HostMutex::new(());

/// The machine of the current boot, for contexts spawned within it.
static CURRENT: spin::Mutex<Option<&'static SimMachine>> = spin::Mutex::new(None);

fn current_machine() -> &'static SimMachine {
    let machine = *CURRENT.lock();
    machine.expect("no hosted machine booted")
}

/// Fires one timer interrupt on the calling context, exactly as IRQ 0
/// would land on the running thread. Interrupts must be on.
pub fn fire_tick() {
    intr::dispatch(kern::timer::TIMER_VECTOR);
}

// ============================================================================
// The Machine
// ============================================================================

struct Cpu {
    /// Which context owns the CPU.
    running: Tid,
}

pub struct SimMachine {
    intr_on: core::sync::atomic::AtomicBool,
    cpu: HostMutex<Cpu>,
    switched: Condvar,
    port_log: HostMutex<Vec<(u16, u8)>>,
    fail_next_page: core::sync::atomic::AtomicBool,
}

impl SimMachine {
    fn new() -> Self {
        Self {
            intr_on: core::sync::atomic::AtomicBool::new(false),
            cpu: HostMutex::new(Cpu { running: Tid::NULL }),
            switched: Condvar::new(),
            port_log: HostMutex::new(Vec::new()),
            fail_next_page: core::sync::atomic::AtomicBool::new(false),
        }
    }

    fn lock_cpu(&self) -> MutexGuard<'_, Cpu> {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until_running(&self, tid: Tid) {
        let mut cpu = self.lock_cpu();
        while cpu.running != tid {
            cpu = self
                .switched
                .wait(cpu)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Every byte written to an I/O port, in order.
    pub fn port_writes(&self) -> Vec<(u16, u8)> {
        self.port_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes the next page allocation fail, to exercise the out-of-memory
    /// path.
    pub fn fail_next_page_alloc(&self) {
        self.fail_next_page
            .store(true, core::sync::atomic::Ordering::SeqCst);
    }
}

fn page_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

impl Machine for SimMachine {
    fn intr_enabled(&self) -> bool {
        self.intr_on.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn set_intr(&self, enabled: bool) {
        self.intr_on
            .store(enabled, core::sync::atomic::Ordering::SeqCst);
    }

    fn out_byte(&self, port: u16, value: u8) {
        self.port_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((port, value));
    }

    fn alloc_page(&self) -> Option<*mut u8> {
        if self
            .fail_next_page
            .swap(false, core::sync::atomic::Ordering::SeqCst)
        {
            return None;
        }
        // SAFETY: PAGE_SIZE is nonzero and a valid alignment.
        let page = unsafe { std::alloc::alloc_zeroed(page_layout()) };
        if page.is_null() {
            None
        } else {
            Some(page)
        }
    }

    unsafe fn free_page(&self, page: *mut u8) {
        std::alloc::dealloc(page, page_layout());
    }

    fn prepare_thread(&self, tid: Tid, entry: ThreadEntry) {
        let machine = current_machine();
        host::Builder::new()
            .name(std::format!("ctx-{tid}"))
            .spawn(move || {
                machine.wait_until_running(tid);
                kern::thread::kernel_entry(entry);
            })
            .expect("failed to spawn a hosted context");
    }

    fn launch(&self, prev: Tid, next: Tid, prev_finished: bool) {
        let mut cpu = self.lock_cpu();
        cpu.running = next;
        self.switched.notify_all();

        if prev_finished {
            // The dying context is never resumed; park its host thread
            // for good.
            loop {
                cpu = self
                    .switched
                    .wait(cpu)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        while cpu.running != prev {
            cpu = self
                .switched
                .wait(cpu)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_for_interrupt(&self) {
        // "sti; hlt": with a tick always pending, halting delivers the
        // next timer interrupt immediately.
        self.set_intr(true);
        fire_tick();
    }

    fn activate_address_space(&self, _handle: usize) {
        // Nothing to switch on the host.
    }
}

// ============================================================================
// Boot
// ============================================================================

/// A booted hosted kernel. Holds the process-wide boot lock; dropping it
/// lets the next test boot.
pub struct Sim {
    machine: &'static SimMachine,
    _boot: MutexGuard<'static, ()>,
}

impl Sim {
    /// The machine, for fault injection and port-write inspection.
    pub fn machine(&self) -> &'static SimMachine {
        self.machine
    }

    /// Fires one timer interrupt from the calling thread.
    pub fn tick(&self) {
        fire_tick();
    }

    /// Fires `n` timer interrupts.
    pub fn tick_many(&self, n: u64) {
        for _ in 0..n {
            self.tick();
        }
    }
}

/// Boots a fresh kernel on a fresh hosted machine, adopting the calling
/// test thread as the initial thread, and runs the normal bring-up
/// sequence through `kern::init` and `kern::start`.
pub fn boot(params: kern::BootParams) -> Sim {
    let guard = BOOT_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let machine: &'static SimMachine = Box::leak(Box::new(SimMachine::new()));
    *CURRENT.lock() = Some(machine);
    machine::install(machine);

    // The boot context owns the CPU with interrupts off, like a real
    // entry from the loader.
    machine.set_intr(false);
    machine.lock_cpu().running = Tid(1);

    kern::init(params);
    kern::start();

    Sim {
        machine,
        _boot: guard,
    }
}
