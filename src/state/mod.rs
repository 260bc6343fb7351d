//! Estimator state: identifiers, keyframes, landmarks, the sliding window,
//! and the IMU sample buffer.

pub mod imu;
pub mod window;

use nalgebra::Vector3;

use crate::geometry::SE3;

/// Identifier of an agent (drone) participating in the swarm.
pub type DroneId = u32;

/// Globally unique keyframe identifier (unique across agents).
pub type FrameId = u64;

/// Globally unique camera identifier.
pub type CamId = u32;

/// Globally unique landmark identifier.
pub type LandmarkId = u64;

/// A keyframe state inside the sliding window.
///
/// Only the subset of per-frame state the consensus core touches is kept
/// here; image data and feature tracks stay in the front-end.
#[derive(Debug, Clone)]
pub struct VinsFrame {
    pub frame_id: FrameId,
    /// The agent that produced this frame; it is the solver-owner of the
    /// frame's pose and speed-bias parameters.
    pub drone_id: DroneId,
    /// Timestamp in seconds since epoch.
    pub stamp: f64,
    pub pose: SE3,
    /// Velocity in the world frame.
    pub velocity: Vector3<f64>,
    /// Accelerometer bias.
    pub ba: Vector3<f64>,
    /// Gyroscope bias.
    pub bg: Vector3<f64>,
    pub is_keyframe: bool,
}

impl VinsFrame {
    /// Pack velocity and biases into the 9-scalar speed-bias block layout
    /// `[v; ba; bg]`.
    pub fn speed_bias(&self) -> [f64; 9] {
        [
            self.velocity.x,
            self.velocity.y,
            self.velocity.z,
            self.ba.x,
            self.ba.y,
            self.ba.z,
            self.bg.x,
            self.bg.y,
            self.bg.z,
        ]
    }

    /// Unpack a 9-scalar speed-bias block.
    pub fn set_speed_bias(&mut self, v: &[f64]) {
        debug_assert!(v.len() >= 9);
        self.velocity = Vector3::new(v[0], v[1], v[2]);
        self.ba = Vector3::new(v[3], v[4], v[5]);
        self.bg = Vector3::new(v[6], v[7], v[8]);
    }
}

/// One observation of a landmark from a frame/camera pair.
#[derive(Debug, Clone, Copy)]
pub struct LandmarkObs {
    pub frame_id: FrameId,
    pub cam_id: CamId,
}

/// An inverse-depth landmark tracked across the window.
#[derive(Debug, Clone)]
pub struct Landmark {
    pub landmark_id: LandmarkId,
    /// Agent that first observed the landmark.
    pub first_observer: DroneId,
    /// Inverse depth in the anchor camera of the first observation.
    pub inv_depth: f64,
    pub track: Vec<LandmarkObs>,
}

impl Landmark {
    /// True when the track spans frames of more than one agent; such
    /// landmarks couple the agents' optimizations together.
    pub fn is_cross_agent(&self, frame_owner: impl Fn(FrameId) -> Option<DroneId>) -> bool {
        self.track
            .iter()
            .filter_map(|obs| frame_owner(obs.frame_id))
            .any(|owner| owner != self.first_observer)
    }
}
