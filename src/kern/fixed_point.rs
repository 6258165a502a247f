//! 17.14 fixed-point arithmetic
//!
//! Signed Q-format with 17 integer bits and 14 fraction bits, used by the
//! MLFQS feedback computations (`load_avg`, `recent_cpu`, priorities) and
//! their reporters. Products and quotients go through 64-bit intermediates
//! so the feedback formulas cannot overflow at realistic magnitudes.

use core::ops::{Add, Sub};

/// Number of fraction bits.
pub const FRACTION_BITS: u32 = 14;

/// The scale factor, 2^14.
const F: i32 = 1 << FRACTION_BITS;

/// A signed 17.14 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Self = Self(0);

    /// Converts an integer to fixed point.
    pub const fn from_int(n: i32) -> Self {
        Self(n * F)
    }

    /// Reconstructs a value from its raw 17.14 representation.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw 17.14 representation.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Converts to integer, truncating toward zero.
    pub const fn to_int(self) -> i32 {
        self.0 / F
    }

    /// Converts to integer, rounding to nearest (ties away from zero).
    pub const fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    /// Fixed-point product.
    pub fn mul(self, other: Self) -> Self {
        Self(((self.0 as i64 * other.0 as i64) >> FRACTION_BITS) as i32)
    }

    /// Fixed-point quotient.
    pub fn div(self, other: Self) -> Self {
        Self((((self.0 as i64) << FRACTION_BITS) / other.0 as i64) as i32)
    }

    pub fn add_int(self, n: i32) -> Self {
        Self(self.0 + n * F)
    }

    pub fn sub_int(self, n: i32) -> Self {
        Self(self.0 - n * F)
    }

    pub fn mul_int(self, n: i32) -> Self {
        Self((self.0 as i64 * n as i64) as i32)
    }

    pub fn div_int(self, n: i32) -> Self {
        Self(self.0 / n)
    }
}

impl Add for Fixed {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl Sub for Fixed {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}
