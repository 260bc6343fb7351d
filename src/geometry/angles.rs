//! Angle wrapping for yaw-only pose arithmetic.

use std::f64::consts::PI;

/// Wrap an angle to the half-open interval `(-π, π]`.
///
/// The upper bound is inclusive so that a disagreement of exactly π has a
/// well-defined sign after wrapping.
pub fn wrap_angle(a: f64) -> f64 {
    let r = a.rem_euclid(2.0 * PI);
    if r > PI {
        r - 2.0 * PI
    } else {
        r
    }
}

/// Shortest signed difference `a - b`, wrapped to `(-π, π]`.
pub fn angle_diff(a: f64, b: f64) -> f64 {
    wrap_angle(a - b)
}
