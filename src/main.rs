//! Two-agent consensus demo over the in-process bus.
//!
//! Each agent runs its own node (estimator + receiver threads). Agent 2
//! starts with a one-meter-biased belief of agent 1's keyframe pose; the
//! consensus rounds pull the shared pose back into agreement without either
//! agent exchanging raw measurements.

use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;

use swarm_vio::config::AgentConfig;
use swarm_vio::estimator::FactorSource;
use swarm_vio::geometry::SE3;
use swarm_vio::solver::{
    CostFunction, LevenbergMarquardt, ParamKey, ParameterRegistry, ResidualBlock, ResidualKind,
};
use swarm_vio::state::imu::ImuSample;
use swarm_vio::state::window::WindowState;
use swarm_vio::state::{DroneId, FrameId, VinsFrame};
use swarm_vio::sync::MemoryBus;
use swarm_vio::system::AgentNode;

/// Pulls a pose block toward a fixed target in tangent space.
struct PoseAnchor {
    target: SE3,
    weight: f64,
}

impl CostFunction for PoseAnchor {
    fn num_residuals(&self) -> usize {
        6
    }
    fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool {
        let x = SE3::from_array(params[0]);
        let err = SE3::delta(&self.target, &x).tangent() * self.weight;
        residuals.copy_from_slice(err.as_slice());
        true
    }
}

/// Stand-in front-end: anchors each window frame at this agent's private
/// belief, strongly for own frames and weakly for remote ones.
struct BeliefAnchors {
    beliefs: Vec<(FrameId, SE3, f64)>,
}

impl FactorSource for BeliefAnchors {
    fn build_residuals(
        &mut self,
        _window: &WindowState,
        _registry: &ParameterRegistry,
    ) -> Vec<ResidualBlock> {
        self.beliefs
            .iter()
            .map(|(frame_id, target, weight)| {
                ResidualBlock::new(
                    ResidualKind::Prior,
                    Box::new(PoseAnchor {
                        target: *target,
                        weight: *weight,
                    }),
                    Default::default(),
                    vec![ParamKey::FramePose(*frame_id)],
                )
            })
            .collect()
    }
}

fn keyframe(frame_id: FrameId, drone_id: DroneId, stamp: f64, pose: SE3) -> VinsFrame {
    VinsFrame {
        frame_id,
        drone_id,
        stamp,
        pose,
        velocity: Vector3::zeros(),
        ba: Vector3::zeros(),
        bg: Vector3::zeros(),
        is_keyframe: true,
    }
}

fn spawn_agent(bus: &MemoryBus, self_id: DroneId, beliefs: Vec<(FrameId, SE3, f64)>) -> Result<AgentNode> {
    let (endpoint, rx) = bus.join(self_id);
    let config = AgentConfig {
        self_id,
        consensus_sync_to_start: false,
        min_solve_frames: 1,
        ..AgentConfig::default()
    };
    AgentNode::spawn(
        config,
        Box::new(endpoint),
        rx,
        Box::new(LevenbergMarquardt::new()),
        Box::new(BeliefAnchors { beliefs }),
        None,
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let bus = MemoryBus::new();

    let pose_1 = SE3::identity();
    let pose_2 = SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 2.0, 0.0));
    let bias = Vector3::new(1.0, 0.0, 0.0);
    let pose_1_biased = SE3::new(pose_1.rotation, pose_1.translation + bias);

    // Agent 1 believes both keyframes correctly; agent 2 starts with a
    // one-meter bias on agent 1's keyframe.
    let mut agent_1 = spawn_agent(
        &bus,
        1,
        vec![(1, pose_1, 10.0), (2, pose_2, 0.01)],
    )?;
    let mut agent_2 = spawn_agent(
        &bus,
        2,
        vec![(2, pose_2, 10.0), (1, pose_1_biased, 0.01)],
    )?;

    // IMU feeds run ahead of the frames.
    for node in [&agent_1, &agent_2] {
        for i in 0..50 {
            node.input_imu(ImuSample {
                stamp: i as f64 * 0.01,
                accel: Vector3::new(0.0, 0.0, 9.81),
                gyro: Vector3::zeros(),
            });
        }
    }

    // Both agents see both keyframes; agent 2's copy of frame 1 carries the
    // biased initial guess.
    agent_1.input_frame(keyframe(1, 1, 0.10, pose_1))?;
    agent_1.input_frame(keyframe(2, 2, 0.20, pose_2))?;
    agent_2.input_frame(keyframe(1, 1, 0.10, pose_1_biased))?;
    agent_2.input_frame(keyframe(2, 2, 0.20, pose_2))?;

    // Let the consensus rounds run.
    std::thread::sleep(std::time::Duration::from_millis(500));

    let p1 = agent_1.with_estimator(|e| e.pose(1)).expect("agent 1 frame 1");
    let p2 = agent_2.with_estimator(|e| e.pose(1)).expect("agent 2 frame 1");
    let disagreement = (p1.translation - p2.translation).norm();

    info!(
        agent_1 = ?p1.translation.as_slice(),
        agent_2 = ?p2.translation.as_slice(),
        disagreement_m = disagreement,
        "shared pose after consensus (started 1.00 m apart)"
    );

    agent_1.shutdown();
    agent_2.shutdown();

    if disagreement < 0.05 {
        info!("agents converged");
        Ok(())
    } else {
        anyhow::bail!("agents failed to converge: {disagreement} m apart")
    }
}
