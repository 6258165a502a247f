//! Minos - the threading core of a small teaching kernel
//!
//! This crate provides the scheduler, the timed-sleep facility, blocking
//! synchronization primitives with priority donation, and a multi-level
//! feedback queue scheduling policy, all on a single-CPU preemptive model
//! where interrupts-off is the one mutual-exclusion mechanism.
//!
//! The hardware underneath (interrupt flag, port I/O, page allocation, the
//! low-level context switch) is consumed through the [`machine`] boundary;
//! a hosted machine backs the test suite.

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod types;

// Hardware boundary and interrupt control
pub mod intr;
pub mod machine;

// The threading subsystem
pub mod kern;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Minos";
