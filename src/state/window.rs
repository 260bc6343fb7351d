//! Sliding-window state: per-drone keyframe windows, landmarks, extrinsics,
//! time offsets, and reference-coordinate alignments.
//!
//! The window creates registry entries for everything it tracks and reads
//! the optimized values back after a successful round; the registry remains
//! the canonical storage the inner solver works on.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::config::AgentConfig;
use crate::geometry::SE3;
use crate::solver::params::{ParamInfo, ParamKey, ParamKind, ParameterRegistry};
use crate::solver::prior::PriorFactor;
use crate::solver::problem::{Manifold, Problem};
use crate::state::{CamId, DroneId, FrameId, Landmark, LandmarkId, LandmarkObs, VinsFrame};

pub struct WindowState {
    self_id: DroneId,
    /// Window membership per drone, oldest first.
    windows: BTreeMap<DroneId, Vec<FrameId>>,
    frames: HashMap<FrameId, VinsFrame>,
    landmarks: BTreeMap<LandmarkId, Landmark>,
    /// Camera id to owning drone; the extrinsic value lives in the registry.
    cameras: BTreeMap<CamId, DroneId>,
    /// Drones with a registered time-offset parameter.
    time_offsets: BTreeSet<DroneId>,
    /// Peers with a registered reference-coordinate alignment.
    relative_coords: BTreeSet<DroneId>,
    /// Prior carried over from the last marginalization.
    prior: Option<PriorFactor>,
}

impl WindowState {
    pub fn new(self_id: DroneId) -> Self {
        Self {
            self_id,
            windows: BTreeMap::new(),
            frames: HashMap::new(),
            landmarks: BTreeMap::new(),
            cameras: BTreeMap::new(),
            time_offsets: BTreeSet::new(),
            relative_coords: BTreeSet::new(),
            prior: None,
        }
    }

    pub fn self_id(&self) -> DroneId {
        self.self_id
    }

    /// Append a keyframe and register its pose and speed-bias parameters.
    pub fn add_frame(&mut self, frame: VinsFrame, registry: &mut ParameterRegistry) {
        let drone_id = frame.drone_id;
        let frame_id = frame.frame_id;
        registry.register(
            ParamInfo {
                key: ParamKey::FramePose(frame_id),
                kind: ParamKind::Se3Pose,
                owner: Some(drone_id),
            },
            &frame.pose.to_array(),
        );
        registry.register(
            ParamInfo {
                key: ParamKey::SpeedBias(frame_id),
                kind: ParamKind::SpeedBias,
                owner: Some(drone_id),
            },
            &frame.speed_bias(),
        );
        self.windows.entry(drone_id).or_default().push(frame_id);
        self.frames.insert(frame_id, frame);
    }

    /// Record a landmark observation; the landmark parameter (inverse depth
    /// in the anchor camera) is registered as internal on first sight.
    pub fn observe_landmark(
        &mut self,
        landmark_id: LandmarkId,
        frame_id: FrameId,
        cam_id: CamId,
        initial_inv_depth: f64,
        registry: &mut ParameterRegistry,
    ) {
        let frame = self
            .frames
            .get(&frame_id)
            .unwrap_or_else(|| panic!("observation references unknown frame {frame_id}"));
        let lm = self.landmarks.entry(landmark_id).or_insert_with(|| {
            registry.register(
                ParamInfo {
                    key: ParamKey::Landmark(landmark_id),
                    kind: ParamKind::InvDepthLandmark,
                    owner: None,
                },
                &[initial_inv_depth],
            );
            Landmark {
                landmark_id,
                first_observer: frame.drone_id,
                inv_depth: initial_inv_depth,
                track: Vec::new(),
            }
        });
        lm.track.push(LandmarkObs { frame_id, cam_id });
    }

    /// Register a camera extrinsic owned by `drone_id`.
    pub fn set_extrinsic(
        &mut self,
        cam_id: CamId,
        drone_id: DroneId,
        pose: &SE3,
        registry: &mut ParameterRegistry,
    ) {
        registry.register(
            ParamInfo {
                key: ParamKey::Extrinsic(cam_id),
                kind: ParamKind::Extrinsic,
                owner: Some(drone_id),
            },
            &pose.to_array(),
        );
        self.cameras.insert(cam_id, drone_id);
    }

    /// Register the camera-IMU time offset for `drone_id`.
    pub fn set_time_offset(
        &mut self,
        drone_id: DroneId,
        td: f64,
        registry: &mut ParameterRegistry,
    ) {
        registry.register(
            ParamInfo {
                key: ParamKey::TimeOffset(drone_id),
                kind: ParamKind::TimeOffset,
                owner: Some(drone_id),
            },
            &[td],
        );
        self.time_offsets.insert(drone_id);
    }

    /// Register the yaw-only alignment of this agent's map toward `peer`'s.
    pub fn set_relative_coord(
        &mut self,
        peer: DroneId,
        value: [f64; 4],
        registry: &mut ParameterRegistry,
    ) {
        registry.register(
            ParamInfo {
                key: ParamKey::RelativeCoord(peer),
                kind: ParamKind::YawPose,
                owner: Some(self.self_id),
            },
            &value,
        );
        self.relative_coords.insert(peer);
    }

    pub fn frame(&self, frame_id: FrameId) -> Option<&VinsFrame> {
        self.frames.get(&frame_id)
    }

    pub fn frame_owner(&self, frame_id: FrameId) -> Option<DroneId> {
        self.frames.get(&frame_id).map(|f| f.drone_id)
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    /// Drones with at least one frame in the window.
    pub fn available_drones(&self) -> BTreeSet<DroneId> {
        let mut drones: BTreeSet<DroneId> = self
            .windows
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(d, _)| *d)
            .collect();
        drones.insert(self.self_id);
        drones
    }

    pub fn window_len(&self, drone_id: DroneId) -> usize {
        self.windows.get(&drone_id).map(|w| w.len()).unwrap_or(0)
    }

    pub fn window(&self, drone_id: DroneId) -> &[FrameId] {
        self.windows
            .get(&drone_id)
            .map(|w| w.as_slice())
            .unwrap_or(&[])
    }

    pub fn first_frame(&self, drone_id: DroneId) -> Option<FrameId> {
        self.windows.get(&drone_id).and_then(|w| w.first().copied())
    }

    pub fn last_frame(&self, drone_id: DroneId) -> Option<&VinsFrame> {
        self.windows
            .get(&drone_id)
            .and_then(|w| w.last())
            .and_then(|id| self.frames.get(id))
    }

    pub fn prior(&self) -> Option<&PriorFactor> {
        self.prior.as_ref()
    }

    pub fn set_prior(&mut self, prior: Option<PriorFactor>) {
        self.prior = prior;
    }

    /// True when this agent's problem is coupled to another agent: a remote
    /// frame sits in the window, or a landmark is observed from frames of
    /// more than one drone. Without coupling the agent opts out of consensus
    /// (NON_DIST).
    pub fn has_cross_agent_coupling(&self) -> bool {
        if self
            .frames
            .values()
            .any(|f| f.drone_id != self.self_id)
        {
            return true;
        }
        self.landmarks.values().any(|lm| {
            lm.is_cross_agent(|frame_id| self.frame_owner(frame_id))
        })
    }

    /// Frames to marginalize before the next round: the oldest frame of any
    /// drone whose window overflows. Marginalizing a remote frame optionally
    /// drags the self window base along with it.
    pub fn frames_to_marginalize(&self, config: &AgentConfig) -> HashSet<FrameId> {
        let mut out = HashSet::new();
        for (&drone_id, window) in &self.windows {
            if window.len() <= config.max_sld_win_size {
                continue;
            }
            if let Some(&oldest) = window.first() {
                out.insert(oldest);
                if drone_id != self.self_id && config.remove_base_when_margin_remote {
                    if let Some(base) = self.first_frame(self.self_id) {
                        out.insert(base);
                    }
                }
            }
        }
        out
    }

    /// Drop frames and every state hanging off them; landmark tracks lose
    /// their observations, and landmarks left with fewer than two
    /// observations leave the problem entirely.
    pub fn remove_frames(&mut self, remove: &HashSet<FrameId>, registry: &mut ParameterRegistry) {
        if remove.is_empty() {
            return;
        }
        for window in self.windows.values_mut() {
            window.retain(|id| !remove.contains(id));
        }
        for frame_id in remove {
            self.frames.remove(frame_id);
            registry.remove(ParamKey::FramePose(*frame_id));
            registry.remove(ParamKey::SpeedBias(*frame_id));
        }
        let mut dead = Vec::new();
        for (id, lm) in self.landmarks.iter_mut() {
            lm.track.retain(|obs| !remove.contains(&obs.frame_id));
            if lm.track.len() < 2 {
                dead.push(*id);
            }
        }
        for id in dead {
            self.landmarks.remove(&id);
            registry.remove(ParamKey::Landmark(id));
        }
        debug!(
            self_id = self.self_id,
            removed = remove.len(),
            "window trimmed"
        );
    }

    /// Configure manifolds, bounds, and frozen blocks for one inner solve.
    pub fn configure_problem(
        &self,
        problem: &mut Problem<'_>,
        registry: &ParameterRegistry,
        config: &AgentConfig,
    ) {
        for info in registry.iter() {
            match info.kind {
                ParamKind::Se3Pose | ParamKind::Extrinsic => {
                    problem.set_manifold(info.key, Manifold::Se3TangentSpace);
                }
                ParamKind::YawPose => {
                    problem.set_manifold(info.key, Manifold::YawAngleWrap);
                }
                _ => {}
            }
        }

        for &lm_id in self.landmarks.keys() {
            problem.set_parameter_lower_bound(ParamKey::Landmark(lm_id), 0, config.min_inv_dep);
        }

        for (&cam_id, &drone_id) in &self.cameras {
            let saturated = self.window_len(drone_id) + 1 >= config.max_sld_win_size;
            if !config.estimate_extrinsic || !saturated {
                problem.freeze_parameter(ParamKey::Extrinsic(cam_id));
            }
        }

        for &drone_id in &self.time_offsets {
            let saturated = self.window_len(drone_id) >= config.max_sld_win_size;
            if !config.estimate_td || !saturated {
                problem.freeze_parameter(ParamKey::TimeOffset(drone_id));
            }
        }

        if self.prior.is_none() || config.always_fixed_first_pose {
            if let Some(first) = self.first_frame(self.self_id) {
                problem.freeze_parameter(ParamKey::FramePose(first));
            }
        }
    }

    /// Read solved values back from the registry into the window state; only
    /// called after a successful round.
    pub fn sync_from_registry(&mut self, registry: &ParameterRegistry) {
        for (frame_id, frame) in self.frames.iter_mut() {
            if registry.contains(ParamKey::FramePose(*frame_id)) {
                frame.pose = SE3::from_array(registry.value(ParamKey::FramePose(*frame_id)));
            }
            if registry.contains(ParamKey::SpeedBias(*frame_id)) {
                frame.set_speed_bias(registry.value(ParamKey::SpeedBias(*frame_id)));
            }
        }
        for (lm_id, lm) in self.landmarks.iter_mut() {
            if registry.contains(ParamKey::Landmark(*lm_id)) {
                lm.inv_depth = registry.value(ParamKey::Landmark(*lm_id))[0];
            }
        }
    }

    /// Assemble the round broadcast: every window frame's primal pose, plus
    /// extrinsics and reference coordinates owned by this agent.
    pub fn build_broadcast(
        &self,
        registry: &ParameterRegistry,
        token: u64,
        iteration: u64,
        stamp: f64,
    ) -> crate::sync::SolverStateMsg {
        let mut msg = crate::sync::SolverStateMsg::new(self.self_id, token, iteration, stamp);
        for window in self.windows.values() {
            for &frame_id in window {
                let key = ParamKey::FramePose(frame_id);
                if registry.contains(key) {
                    msg.push_frame(frame_id, &SE3::from_array(registry.value(key)));
                }
            }
        }
        for (&cam_id, &drone_id) in &self.cameras {
            if drone_id == self.self_id {
                let key = ParamKey::Extrinsic(cam_id);
                if registry.contains(key) {
                    msg.push_extrinsic(cam_id, &SE3::from_array(registry.value(key)));
                }
            }
        }
        for &peer in &self.relative_coords {
            let key = ParamKey::RelativeCoord(peer);
            if registry.contains(key) {
                let v = registry.value(key);
                msg.push_relative_coordinate(peer, [v[0], v[1], v[2], v[3]]);
            }
        }
        msg
    }
}
