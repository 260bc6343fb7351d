//! On-the-wire payloads and their encoding.
//!
//! # Wire format
//!
//! ```text
//! [version: u8][payload: bincode-encoded SolverStateMsg]
//! ```
//!
//! Sync signals (READY / START / NON_DIST) travel beside the data payloads as
//! small fixed records handled by the transport itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::SE3;
use crate::state::{CamId, DroneId, FrameId};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Errors raised while encoding or decoding a data payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("message too short")]
    MessageTooShort,

    #[error("payload decode error: {0}")]
    Decode(String),

    #[error("payload encode error: {0}")]
    Encode(String),
}

/// Round-negotiation signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncSignal {
    /// Sender is ready for the next round.
    Ready,
    /// Token adopted; begin the round (emitted by the main agent).
    Start,
    /// Sender opts out of consensus this round and solves locally.
    NonDist,
}

/// One agent's per-round broadcast: local primal values for every shared
/// parameter, keyed by frame / camera / peer id.
///
/// Poses encode as 7 scalars `[tx,ty,tz,qx,qy,qz,qw]`; relative coordinates
/// as 4 scalars `[tx,ty,tz,yaw]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverStateMsg {
    /// Seconds since epoch.
    pub stamp: f64,
    pub drone_id: DroneId,
    pub solver_token: u64,
    pub iteration_count: u64,

    pub frame_ids: Vec<FrameId>,
    pub frame_poses: Vec<[f64; 7]>,

    pub cam_ids: Vec<CamId>,
    pub extrinsics: Vec<[f64; 7]>,

    pub remote_drone_ids: Vec<DroneId>,
    pub relative_coordinates: Vec<[f64; 4]>,
}

impl SolverStateMsg {
    pub fn new(drone_id: DroneId, solver_token: u64, iteration_count: u64, stamp: f64) -> Self {
        Self {
            stamp,
            drone_id,
            solver_token,
            iteration_count,
            frame_ids: Vec::new(),
            frame_poses: Vec::new(),
            cam_ids: Vec::new(),
            extrinsics: Vec::new(),
            remote_drone_ids: Vec::new(),
            relative_coordinates: Vec::new(),
        }
    }

    pub fn push_frame(&mut self, frame_id: FrameId, pose: &SE3) {
        self.frame_ids.push(frame_id);
        self.frame_poses.push(pose.to_array());
    }

    pub fn push_extrinsic(&mut self, cam_id: CamId, pose: &SE3) {
        self.cam_ids.push(cam_id);
        self.extrinsics.push(pose.to_array());
    }

    pub fn push_relative_coordinate(&mut self, peer: DroneId, value: [f64; 4]) {
        self.remote_drone_ids.push(peer);
        self.relative_coordinates.push(value);
    }
}

/// Encode a data payload to wire bytes.
pub fn encode_message(msg: &SolverStateMsg) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(msg).map_err(|e| CodecError::Encode(e.to_string()))?;
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.extend(payload);
    Ok(bytes)
}

/// Decode wire bytes back into a data payload.
pub fn decode_message(data: &[u8]) -> Result<SolverStateMsg, CodecError> {
    if data.is_empty() {
        return Err(CodecError::MessageTooShort);
    }
    let version = data[0];
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    bincode::deserialize(&data[1..]).map_err(|e| CodecError::Decode(e.to_string()))
}
