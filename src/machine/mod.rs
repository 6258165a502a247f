//! Machine boundary - collaborator interfaces consumed by the threading core
//!
//! Everything the scheduler needs from the hardware layer goes through this
//! trait: the CPU interrupt flag, port I/O for programming the interval
//! timer, the page allocator that backs thread stacks, context preparation
//! and the low-level switch, and the idle thread's halt.
//!
//! Exactly one implementation is installed per boot. The crate's own tests
//! install the hosted machine in [`sim`]; a real port installs its
//! architecture layer before `kern::init`.

use alloc::boxed::Box;

use crate::types::Tid;

/// Size of a thread's kernel stack page.
pub const PAGE_SIZE: usize = 4096;

/// A thread's entry function, boxed so the machine can stash it until the
/// thread is first launched.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

pub trait Machine: Sync {
    /// Read the CPU interrupt-enable flag.
    fn intr_enabled(&self) -> bool;

    /// Write the CPU interrupt-enable flag.
    fn set_intr(&self, enabled: bool);

    /// Write one byte to an I/O port.
    fn out_byte(&self, port: u16, value: u8);

    /// Allocate one zero-filled page of [`PAGE_SIZE`] bytes, or `None` when
    /// memory is exhausted.
    fn alloc_page(&self) -> Option<*mut u8>;

    /// Return a page obtained from [`Machine::alloc_page`].
    ///
    /// # Safety
    ///
    /// `page` must have come from `alloc_page` on this machine and must not
    /// be used afterwards.
    unsafe fn free_page(&self, page: *mut u8);

    /// Arrange for `kern::thread::kernel_entry(entry)` to run in a fresh
    /// context the first time `tid` is launched.
    fn prepare_thread(&self, tid: Tid, entry: ThreadEntry);

    /// The low-level context switch: save the caller's context as `prev` and
    /// resume `next`. When `prev_finished` is set, `prev` is never resumed
    /// and this call does not return.
    fn launch(&self, prev: Tid, next: Tid, prev_finished: bool);

    /// Atomically enable interrupts and halt until the next one arrives.
    /// Interrupts are enabled when this returns.
    fn wait_for_interrupt(&self);

    /// Activate the address space identified by `handle` on behalf of the
    /// thread about to run.
    fn activate_address_space(&self, handle: usize);
}

static MACHINE: spin::Mutex<Option<&'static dyn Machine>> = spin::Mutex::new(None);

/// Install the machine for this boot. Must precede `kern::init`.
pub fn install(machine: &'static dyn Machine) {
    *MACHINE.lock() = Some(machine);
}

/// The installed machine.
pub fn ops() -> &'static dyn Machine {
    let machine = *MACHINE.lock();
    machine.expect("no machine installed")
}

#[cfg(test)]
pub mod sim;
