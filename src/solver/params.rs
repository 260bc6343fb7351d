//! Parameter registry: interns every optimization variable touched by a
//! residual, classifies it, and owns the canonical storage buffers read and
//! written by the inner solver.

use std::collections::BTreeMap;

use crate::state::{CamId, DroneId, FrameId, LandmarkId};

/// Kind of an optimization variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Full SE(3) pose, stored as `[t; qx,qy,qz,qw]`.
    Se3Pose,
    /// Position plus heading, stored as `[t; yaw]`.
    YawPose,
    /// Inverse-depth landmark (single scalar).
    InvDepthLandmark,
    /// Unstructured euclidean block of the given size.
    Euclidean(usize),
    /// Velocity and IMU biases, `[v; ba; bg]`.
    SpeedBias,
    /// Camera-IMU time offset.
    TimeOffset,
    /// Camera extrinsic, same layout as `Se3Pose`.
    Extrinsic,
}

impl ParamKind {
    /// Ambient storage size in scalars.
    pub fn size(&self) -> usize {
        match self {
            ParamKind::Se3Pose | ParamKind::Extrinsic => 7,
            ParamKind::YawPose => 4,
            ParamKind::InvDepthLandmark => 1,
            ParamKind::Euclidean(n) => *n,
            ParamKind::SpeedBias => 9,
            ParamKind::TimeOffset => 1,
        }
    }

    /// Effective tangent-space size: 6 for SE(3), 4 for yaw-pose, otherwise
    /// equal to the ambient size.
    pub fn tangent_size(&self) -> usize {
        match self {
            ParamKind::Se3Pose | ParamKind::Extrinsic => 6,
            _ => self.size(),
        }
    }
}

/// Stable identity of a parameter.
///
/// Long-lived maps are keyed on this identity; storage is derived from the
/// registry on demand, never from raw buffer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    FramePose(FrameId),
    SpeedBias(FrameId),
    Extrinsic(CamId),
    Landmark(LandmarkId),
    TimeOffset(DroneId),
    /// Reference-coordinate alignment toward another agent's map origin.
    RelativeCoord(DroneId),
}

/// Classification of a registered parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamInfo {
    pub key: ParamKey,
    pub kind: ParamKind,
    /// Authoritative owner: the drone that produced the frame for pose-like
    /// parameters, the first observer for most others. `None` marks internal
    /// parameters (landmarks) that never take part in consensus.
    pub owner: Option<DroneId>,
}

struct ParamBlock {
    info: ParamInfo,
    value: Vec<f64>,
}

/// Owns every registered parameter and its canonical storage buffer.
pub struct ParameterRegistry {
    self_id: DroneId,
    blocks: BTreeMap<ParamKey, ParamBlock>,
}

impl ParameterRegistry {
    pub fn new(self_id: DroneId) -> Self {
        Self {
            self_id,
            blocks: BTreeMap::new(),
        }
    }

    pub fn self_id(&self) -> DroneId {
        self.self_id
    }

    /// Register a parameter with its initial value. Idempotent: the first
    /// registration records kind, size, and owner; later calls are no-ops.
    pub fn register(&mut self, info: ParamInfo, initial: &[f64]) {
        assert_eq!(
            initial.len(),
            info.kind.size(),
            "initial value size does not match kind for {:?}",
            info.key
        );
        if let Some(existing) = self.blocks.get(&info.key) {
            debug_assert_eq!(
                existing.info.kind, info.kind,
                "parameter {:?} re-registered with a different kind",
                info.key
            );
            return;
        }
        self.blocks.insert(
            info.key,
            ParamBlock {
                info,
                value: initial.to_vec(),
            },
        );
    }

    pub fn contains(&self, key: ParamKey) -> bool {
        self.blocks.contains_key(&key)
    }

    pub fn info(&self, key: ParamKey) -> Option<ParamInfo> {
        self.blocks.get(&key).map(|b| b.info)
    }

    /// Iterate over every registered parameter in key order.
    pub fn iter(&self) -> impl Iterator<Item = &ParamInfo> {
        self.blocks.values().map(|b| &b.info)
    }

    /// Solver-owner of the parameter; `None` for internal parameters.
    pub fn owner(&self, key: ParamKey) -> Option<DroneId> {
        self.blocks.get(&key).and_then(|b| b.info.owner)
    }

    /// True iff the parameter is owned by another agent.
    pub fn is_remote(&self, key: ParamKey) -> bool {
        match self.owner(key) {
            Some(owner) => owner != self.self_id,
            None => false,
        }
    }

    /// Canonical value buffer. Panics if the parameter is unregistered: a
    /// residual referencing an unknown parameter is a caller bug.
    pub fn value(&self, key: ParamKey) -> &[f64] {
        &self
            .blocks
            .get(&key)
            .unwrap_or_else(|| panic!("parameter {key:?} is not registered"))
            .value
    }

    pub fn value_mut(&mut self, key: ParamKey) -> &mut [f64] {
        &mut self
            .blocks
            .get_mut(&key)
            .unwrap_or_else(|| panic!("parameter {key:?} is not registered"))
            .value
    }

    pub fn set_value(&mut self, key: ParamKey, value: &[f64]) {
        let buf = self.value_mut(key);
        assert_eq!(buf.len(), value.len());
        buf.copy_from_slice(value);
    }

    /// Remove a parameter whose last referencing residual is gone.
    pub fn remove(&mut self, key: ParamKey) {
        self.blocks.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
