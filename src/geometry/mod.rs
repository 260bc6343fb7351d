//! Geometry utilities: SE(3) transforms and angle wrapping.

pub mod angles;
pub mod se3;

pub use angles::{angle_diff, wrap_angle};
pub use se3::SE3;
