//! System timer
//!
//! Owns the monotonic tick counter, programs the 8254 interval timer
//! through the machine boundary, calibrates the busy-wait loop constant,
//! and provides the timed-sleep entry points. The tick interrupt drives
//! everything periodic in the threading core: accounting, MLFQS feedback,
//! sleep-queue wakeups, and quantum preemption.

use core::sync::atomic::{compiler_fence, AtomicI64, AtomicU64, Ordering};

use crate::intr;
use crate::kern::{mlfqs, sched, sleep, thread};
use crate::machine;

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

// See the 8254 datasheet: the divisor must fit 16 bits and the output
// period must stay meaningful.
const _: () = assert!(TIMER_FREQ >= 19, "8254 timer requires TIMER_FREQ >= 19");
const _: () = assert!(TIMER_FREQ <= 1000, "TIMER_FREQ <= 1000 recommended");

/// 8254 input clock in Hz.
const PIT_HZ: i64 = 1_193_180;
/// Control-word port.
const PIT_PORT_CONTROL: u16 = 0x43;
/// Counter 0 data port.
const PIT_PORT_COUNTER0: u16 = 0x40;
/// CW: counter 0, LSB then MSB, mode 2, binary.
const PIT_CONTROL_WORD: u8 = 0x34;
/// IRQ 0 lands here after PIC remapping.
pub(crate) const TIMER_VECTOR: u8 = 0x20;

/// Timer ticks since boot.
static TICKS: AtomicI64 = AtomicI64::new(0);

/// Busy-wait iterations per tick, established by [`calibrate`].
static LOOPS_PER_TICK: AtomicU64 = AtomicU64::new(0);

/// Programs the interval timer to interrupt [`TIMER_FREQ`] times per second
/// and registers the tick handler.
pub(crate) fn init() {
    // 8254 input frequency divided by TIMER_FREQ, rounded to nearest.
    let count = ((PIT_HZ + TIMER_FREQ / 2) / TIMER_FREQ) as u16;

    let m = machine::ops();
    m.out_byte(PIT_PORT_CONTROL, PIT_CONTROL_WORD);
    m.out_byte(PIT_PORT_COUNTER0, (count & 0xff) as u8);
    m.out_byte(PIT_PORT_COUNTER0, (count >> 8) as u8);

    intr::register_ext(TIMER_VECTOR, timer_interrupt, "8254 Timer");

    TICKS.store(0, Ordering::SeqCst);
    LOOPS_PER_TICK.store(0, Ordering::SeqCst);
}

/// Number of timer ticks since boot. Monotonic; the SeqCst load doubles as
/// the reordering barrier the contract asks for.
pub fn ticks() -> i64 {
    TICKS.load(Ordering::SeqCst)
}

/// Ticks elapsed since `then`, a value previously returned by [`ticks`].
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

// ============================================================================
// Calibration
// ============================================================================

/// Calibrates `loops_per_tick`, used for sub-tick delays. Needs a live tick
/// source, so it runs once at boot with interrupts on.
pub fn calibrate() {
    assert_eq!(intr::get_level(), intr::Level::On);
    log::info!("Calibrating timer...");

    let loops_per_tick = calibrate_with(too_many_loops);
    LOOPS_PER_TICK.store(loops_per_tick, Ordering::SeqCst);
    log::info!("{} loops/s", loops_per_tick as u64 * TIMER_FREQ as u64);
}

/// The calibration search: the largest power of two that still fits in a
/// tick, then eight more bits refined high to low. `too_many` reports
/// whether a candidate loop count overruns one tick.
fn calibrate_with(mut too_many: impl FnMut(u64) -> bool) -> u64 {
    // Approximate loops_per_tick as the largest power of two still less
    // than one timer tick.
    let mut loops_per_tick: u64 = 1 << 10;
    while !too_many(loops_per_tick << 1) {
        loops_per_tick <<= 1;
        assert!(loops_per_tick != 0);
    }

    // Refine the next 8 bits of loops_per_tick.
    let high_bit = loops_per_tick;
    let mut test_bit = high_bit >> 1;
    while test_bit != high_bit >> 10 {
        if !too_many(high_bit | test_bit) {
            loops_per_tick |= test_bit;
        }
        test_bit >>= 1;
    }

    loops_per_tick
}

/// Whether `loops` iterations of the busy-wait loop span more than one
/// timer tick.
fn too_many_loops(loops: u64) -> bool {
    // Wait for a tick boundary.
    let start = ticks();
    while ticks() == start {
        core::hint::spin_loop();
    }

    let start = ticks();
    busy_wait(loops as i64);

    // If the tick count changed, we iterated too long.
    compiler_fence(Ordering::SeqCst);
    start != ticks()
}

/// Spins for `loops` iterations.
///
/// Never inlined: code alignment affects timing enough that inlining it
/// differently at different call sites would make results unpredictable.
#[inline(never)]
fn busy_wait(mut loops: i64) {
    while loops > 0 {
        loops -= 1;
        compiler_fence(Ordering::SeqCst);
    }
}

// ============================================================================
// Sleeping
// ============================================================================

/// Suspends execution for approximately `t` timer ticks. Non-positive
/// counts return immediately.
pub fn sleep(t: i64) {
    assert_eq!(intr::get_level(), intr::Level::On);
    if t > 0 {
        sleep::thread_sleep(t);
    }
}

/// Suspends execution for approximately `ms` milliseconds.
pub fn msleep(ms: i64) {
    real_time_sleep(ms, 1000);
}

/// Suspends execution for approximately `us` microseconds.
pub fn usleep(us: i64) {
    real_time_sleep(us, 1000 * 1000);
}

/// Suspends execution for approximately `ns` nanoseconds.
pub fn nsleep(ns: i64) {
    real_time_sleep(ns, 1000 * 1000 * 1000);
}

/// Sleep for approximately `num`/`denom` seconds.
fn real_time_sleep(num: i64, denom: i64) {
    // Convert to timer ticks, rounding down:
    //   (num / denom) s * (TIMER_FREQ ticks / 1 s) = num * TIMER_FREQ / denom.
    let t = num * TIMER_FREQ / denom;

    assert_eq!(intr::get_level(), intr::Level::On);
    if t > 0 {
        // At least one full tick: let the scheduler have the CPU.
        sleep(t);
    } else {
        // Sub-tick delay: busy-wait for finer grain. Scale the numerator
        // and denominator down by 1000 to avoid overflow.
        assert!(denom % 1000 == 0);
        busy_wait(
            LOOPS_PER_TICK.load(Ordering::SeqCst) as i64 * num / 1000 * TIMER_FREQ
                / (denom / 1000),
        );
    }
}

// ============================================================================
// Tick Interrupt
// ============================================================================

/// The timer interrupt handler.
fn timer_interrupt() {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    thread::tick();

    if sched::mlfqs_enabled() {
        mlfqs::increment_recent_cpu();
        if now % TIMER_FREQ == 0 {
            // Every second: refresh the load average, then decay
            // everyone's recent_cpu against it.
            mlfqs::recalculate_load_avg();
            mlfqs::recalculate_recent_cpu();
        }
        if now % 4 == 0 {
            mlfqs::recalculate_priorities();
        }
    }

    sleep::awake(now);
}

/// Logs timer statistics.
pub fn print_stats() {
    log::info!("Timer: {} ticks", ticks());
}
