// vim: tw=80
//! Common utility functions used throughout zraid

use crate::types::*;
use std::ops::{Add, Div, Sub};

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + RoundupAble +
             Sub<Output=T> {
    (dividend + divisor - T::from(1u8)) / divisor

}

// LCOV_EXCL_STOP
