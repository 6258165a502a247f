//! Interrupt control
//!
//! Interrupt level management, the external-handler table, and the
//! yield-on-return flag that interrupt handlers use to request preemption.
//!
//! Disabling interrupts is the kernel's one mutual-exclusion mechanism:
//! every critical section over shared scheduler state saves the current
//! level, disables, operates, and restores. Handler code runs with
//! interrupts off and must never block; to preempt, it sets the
//! yield-on-return flag, which is consumed after the handler completes.

use core::sync::atomic::{compiler_fence, AtomicBool, Ordering};
use spin::Mutex;

use crate::machine;

// ============================================================================
// Interrupt Level
// ============================================================================

/// Interrupt state of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Interrupts disabled.
    Off,
    /// Interrupts enabled.
    On,
}

/// First external interrupt vector (IRQ 0 after PIC remapping).
pub const EXT_VEC_BASE: u8 = 0x20;
/// One past the last external interrupt vector.
pub const EXT_VEC_LIMIT: u8 = 0x30;

/// Returns the current interrupt level.
pub fn get_level() -> Level {
    if machine::ops().intr_enabled() {
        Level::On
    } else {
        Level::Off
    }
}

/// Disables interrupts and returns the previous level.
pub fn disable() -> Level {
    let old = get_level();
    machine::ops().set_intr(false);
    compiler_fence(Ordering::SeqCst);
    old
}

/// Enables interrupts and returns the previous level.
///
/// Must not be called from an external handler: handlers run to completion
/// with interrupts off.
pub fn enable() -> Level {
    assert!(!context(), "interrupts enabled inside an external handler");
    let old = get_level();
    compiler_fence(Ordering::SeqCst);
    machine::ops().set_intr(true);
    old
}

/// Sets the interrupt level and returns the previous one.
pub fn set_level(level: Level) -> Level {
    match level {
        Level::On => enable(),
        Level::Off => disable(),
    }
}

// ============================================================================
// External Handler Context
// ============================================================================

/// True while an external interrupt handler is running.
static IN_EXTERNAL: AtomicBool = AtomicBool::new(false);

/// Set by handlers that want the interrupted thread to yield on return.
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

/// Returns true during processing of an external interrupt.
pub fn context() -> bool {
    IN_EXTERNAL.load(Ordering::SeqCst)
}

/// Asks the interrupted thread to yield once the handler completes.
/// May only be called from an external handler.
pub fn yield_on_return() {
    assert!(context(), "yield_on_return outside an external handler");
    YIELD_ON_RETURN.store(true, Ordering::SeqCst);
}

// ============================================================================
// Handler Registration and Dispatch
// ============================================================================

/// An external interrupt handler.
pub type Handler = fn();

struct Registration {
    handler: Handler,
    name: &'static str,
}

const NO_REGISTRATION: Option<Registration> = None;

static HANDLERS: Mutex<[Option<Registration>; (EXT_VEC_LIMIT - EXT_VEC_BASE) as usize]> =
    Mutex::new([NO_REGISTRATION; (EXT_VEC_LIMIT - EXT_VEC_BASE) as usize]);

/// Resets interrupt bookkeeping at boot.
pub fn init() {
    *HANDLERS.lock() = [NO_REGISTRATION; (EXT_VEC_LIMIT - EXT_VEC_BASE) as usize];
    IN_EXTERNAL.store(false, Ordering::SeqCst);
    YIELD_ON_RETURN.store(false, Ordering::SeqCst);
}

/// Registers `handler` for external vector `vec`. Registration happens at
/// boot, with interrupts still off.
pub fn register_ext(vec: u8, handler: Handler, name: &'static str) {
    assert!(
        (EXT_VEC_BASE..EXT_VEC_LIMIT).contains(&vec),
        "vector {vec:#x} is not an external interrupt"
    );
    assert_eq!(get_level(), Level::Off);

    let mut handlers = HANDLERS.lock();
    let slot = &mut handlers[(vec - EXT_VEC_BASE) as usize];
    assert!(slot.is_none(), "vector {vec:#x} registered twice");
    *slot = Some(Registration { handler, name });
}

/// Entry point invoked by the machine when external vector `vec` fires.
///
/// Runs the registered handler with interrupts off, then honors a pending
/// yield request on behalf of the interrupted thread.
pub(crate) fn dispatch(vec: u8) {
    assert_eq!(get_level(), Level::On, "external interrupt with interrupts off");
    machine::ops().set_intr(false);
    IN_EXTERNAL.store(true, Ordering::SeqCst);

    let handler = {
        let handlers = HANDLERS.lock();
        let reg = handlers[(vec - EXT_VEC_BASE) as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("unexpected interrupt {vec:#x}"));
        log::trace!("interrupt {:#x} ({})", vec, reg.name);
        reg.handler
    };
    handler();

    IN_EXTERNAL.store(false, Ordering::SeqCst);
    if YIELD_ON_RETURN.swap(false, Ordering::SeqCst) {
        crate::kern::thread::yield_now();
    }
    machine::ops().set_intr(true);
}
