//! Kern subsystem - the threading core
//!
//! Contains the thread scheduler, the timed-sleep facility, blocking
//! synchronization primitives with priority donation, and the MLFQS
//! scheduling policy, together with the fixed-point arithmetic the
//! feedback formulas run on.

pub mod fixed_point;
pub mod mlfqs;
pub mod runq;
pub mod sched;
pub mod sleep;
pub mod synch;
pub mod thread;
pub mod timer;

pub use crate::types::Tid;
pub use fixed_point::Fixed;
pub use sched::{BootParams, TIME_SLICE};
pub use synch::{Condvar, Lock, Semaphore};
pub use thread::{Thread, ThreadError};

use crate::intr;

/// Initialize the threading core. The machine must already be installed and
/// interrupts must be off; the calling context is adopted as the initial
/// thread.
pub fn init(params: BootParams) {
    intr::init();
    sched::init(params);
    timer::init();
}

/// Start preemptive scheduling: creates the idle thread and enables
/// interrupts. Returns once the idle thread is up.
pub fn start() {
    sched::start();
}
