//! ARock consensus solver: asynchronous relaxed operator splitting over the
//! agents' shared parameters.
//!
//! Each outer iteration drains received peer state, lazily creates dual
//! states for newly seen remote parameters, rebuilds the consensus penalty
//! residuals, runs one bounded inner solve, applies the relaxed dual update,
//! and broadcasts the result. Primary residuals stay pinned across
//! iterations; only the consensus residuals are rebuilt.

use std::time::{Duration, Instant};

use nalgebra::DVector;
use thiserror::Error;
use tracing::debug;

use crate::config::AgentConfig;
use crate::geometry::{wrap_angle, SE3};
use crate::solver::consensus::{
    EuclideanConsensusFactor, Se3ConsensusFactor, YawPoseConsensusFactor,
};
use crate::solver::dual::DualStateStore;
use crate::solver::params::{ParamKey, ParamKind, ParameterRegistry};
use crate::solver::problem::{InnerSolver, Problem, SolverOptions};
use crate::solver::residual::{Loss, ResidualBlock, ResidualKind};
use crate::state::DroneId;

/// Configuration slice of `AgentConfig` consumed by the ARock loop.
#[derive(Debug, Clone)]
pub struct ArockConfig {
    pub self_id: DroneId,
    pub rho_frame_t: f64,
    pub rho_frame_theta: f64,
    pub rho_landmark: f64,
    pub eta_k: f64,
    pub max_steps: usize,
    pub max_wait_steps: usize,
    pub skip_iteration: Duration,
    pub solver: SolverOptions,
}

impl From<&AgentConfig> for ArockConfig {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            self_id: cfg.self_id,
            rho_frame_t: cfg.rho_frame_t,
            rho_frame_theta: cfg.rho_frame_theta,
            rho_landmark: cfg.rho_landmark,
            eta_k: cfg.eta_k,
            max_steps: cfg.max_steps,
            max_wait_steps: cfg.max_wait_steps,
            skip_iteration: cfg.skip_iteration,
            solver: cfg.solver.clone(),
        }
    }
}

/// Aggregate outcome of one outer solve.
#[derive(Debug, Clone, Default)]
pub struct SolverReport {
    pub total_iterations: usize,
    pub outer_iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub total_time: Duration,
}

/// Failure of an outer solve; no partial primals were published.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("inner solver failed after {outer_iterations} rounds: {message}")]
    InnerSolver {
        message: String,
        outer_iterations: usize,
    },
}

/// Environment callbacks the ARock loop needs from its host estimator.
///
/// This replaces the virtual-method seam of classic designs with a trait the
/// estimator implements over its coordinator and window state.
pub trait ConsensusHooks {
    /// Drain received broadcasts into the dual store. Returns true when new
    /// data arrived since the last call.
    fn receive_all(&mut self, registry: &ParameterRegistry, duals: &mut DualStateStore) -> bool;

    /// A remote value retained before the parameter was registered; used to
    /// initialize a freshly created dual instead of the local primal.
    fn buffered_remote(&mut self, peer: DroneId, key: ParamKey) -> Option<Vec<f64>>;

    /// Configure manifolds, bounds, and frozen parameters on the assembled
    /// problem.
    fn set_state_properties(&mut self, problem: &mut Problem<'_>, registry: &ParameterRegistry);

    /// Publish the round's primals to the peers.
    fn broadcast(
        &mut self,
        registry: &ParameterRegistry,
        duals: &DualStateStore,
        token: u64,
        iteration: u64,
    );
}

pub struct ArockSolver {
    config: ArockConfig,
    /// Primary residuals, pinned for the lifetime of the outer solve.
    residuals: Vec<ResidualBlock>,
    duals: DualStateStore,
    /// New residuals or received data since the last inner solve.
    updated: bool,
    token: u64,
}

impl ArockSolver {
    pub fn new(config: ArockConfig) -> Self {
        Self {
            config,
            residuals: Vec::new(),
            duals: DualStateStore::new(),
            updated: false,
            token: 0,
        }
    }

    /// Discard residuals and consensus memory ahead of a new outer solve.
    pub fn reset(&mut self) {
        self.residuals.clear();
        self.duals.clear();
        self.updated = false;
    }

    /// Pin a primary residual for the coming rounds. Every referenced
    /// parameter must already be registered; anything else is a caller bug.
    pub fn add_residual(&mut self, block: ResidualBlock, registry: &ParameterRegistry) {
        for key in block.params_list() {
            assert!(
                registry.contains(*key),
                "residual references unregistered parameter {key:?}"
            );
        }
        self.residuals.push(block);
        self.updated = true;
    }

    pub fn residuals(&self) -> &[ResidualBlock] {
        &self.residuals
    }

    pub fn duals(&self) -> &DualStateStore {
        &self.duals
    }

    pub fn set_token(&mut self, token: u64) {
        self.token = token;
    }

    /// Create a dual state for every remote parameter referenced by a
    /// residual, initialized from a buffered remote value when one exists,
    /// otherwise from the current primal. Dead duals are pruned.
    fn scan_and_create_duals(
        &mut self,
        registry: &ParameterRegistry,
        hooks: &mut dyn ConsensusHooks,
    ) {
        let mut live: Vec<(DroneId, ParamKey)> = Vec::new();
        for block in &self.residuals {
            for &key in block.params_list() {
                if !registry.is_remote(key) {
                    continue;
                }
                let owner = registry.owner(key).expect("remote params have an owner");
                live.push((owner, key));
            }
        }

        self.duals.retain(|peer, key| {
            live.iter().any(|&(p, k)| p == peer && k == key)
        });

        for (owner, key) in live {
            if self.duals.contains(owner, key) {
                continue;
            }
            let initial = hooks
                .buffered_remote(owner, key)
                .unwrap_or_else(|| registry.value(key).to_vec());
            self.duals.ensure(owner, key, &initial);
            self.updated = true;
        }
    }

    /// Materialize one consensus penalty per (peer, parameter) dual, pulling
    /// the primal toward the received remote dual.
    fn build_consensus_blocks(&self, registry: &ParameterRegistry) -> Vec<ResidualBlock> {
        let mut blocks = Vec::with_capacity(self.duals.len());
        for (_peer, key, pair) in self.duals.pairs() {
            let kind = registry.info(key).expect("dual over registered param").kind;
            let cost: Box<dyn crate::solver::residual::CostFunction> = match kind {
                ParamKind::Se3Pose | ParamKind::Extrinsic => Box::new(Se3ConsensusFactor::new(
                    SE3::from_array(pair.remote.as_slice()),
                    self.config.rho_frame_t,
                    self.config.rho_frame_theta,
                )),
                ParamKind::YawPose => {
                    let mut dual = [0.0; 4];
                    dual.copy_from_slice(pair.remote.as_slice());
                    Box::new(YawPoseConsensusFactor::new(
                        dual,
                        self.config.rho_frame_t,
                        self.config.rho_frame_theta,
                    ))
                }
                _ => Box::new(EuclideanConsensusFactor::new(
                    pair.remote.clone(),
                    self.config.rho_landmark,
                )),
            };
            blocks.push(ResidualBlock::new(
                ResidualKind::Consensus,
                cost,
                Loss::Trivial,
                vec![key],
            ));
        }
        blocks
    }

    /// Relaxed fixed-point step on the consensus operator: move each local
    /// dual toward the average of the two duals, referenced to the current
    /// primal, damped by η.
    fn update_dual_states(&mut self, registry: &ParameterRegistry) {
        let eta = self.config.eta_k;
        for (_peer, key, pair) in self.duals.pairs_mut() {
            let kind = registry.info(key).expect("dual over registered param").kind;
            let primal = registry.value(key);
            match kind {
                ParamKind::Se3Pose | ParamKind::Extrinsic => {
                    let z_l = SE3::from_array(pair.local.as_slice());
                    let z_r = SE3::from_array(pair.remote.as_slice());
                    let x = SE3::from_array(primal);
                    let z_avg = SE3::average(&z_r, &z_l);
                    let err = SE3::delta(&x, &z_avg).tangent();
                    let z_new = z_l.retract(&(-(eta * err)));
                    pair.local = DVector::from_column_slice(&z_new.to_array());
                }
                ParamKind::YawPose => {
                    let mut delta = [0.0; 4];
                    for i in 0..4 {
                        let avg = 0.5 * (pair.local[i] + pair.remote[i]);
                        delta[i] = eta * (avg - primal[i]);
                    }
                    delta[3] = wrap_angle(delta[3]);
                    for i in 0..4 {
                        pair.local[i] -= delta[i];
                    }
                    pair.local[3] = wrap_angle(pair.local[3]);
                }
                _ => {
                    let avg = (&pair.local + &pair.remote) * 0.5;
                    let x = DVector::from_column_slice(primal);
                    let delta = (avg - x) * eta;
                    pair.local -= delta;
                }
            }
        }
    }

    /// Run the outer consensus loop. On inner-solver failure the round is
    /// aborted and no primals are published.
    pub fn solve(
        &mut self,
        registry: &mut ParameterRegistry,
        inner: &dyn InnerSolver,
        hooks: &mut dyn ConsensusHooks,
    ) -> Result<SolverReport, SolveError> {
        let start = Instant::now();
        let mut report = SolverReport::default();
        let mut iter_cnt = 0usize;
        let mut total_cnt = 0usize;

        while iter_cnt < self.config.max_steps {
            self.updated |= hooks.receive_all(registry, &mut self.duals);
            if !self.updated {
                debug!(
                    self_id = self.config.self_id,
                    iter_cnt, total_cnt, "no new data, skipping step"
                );
                std::thread::sleep(self.config.skip_iteration);
                total_cnt += 1;
                if total_cnt > self.config.max_wait_steps + self.config.max_steps {
                    debug!(
                        self_id = self.config.self_id,
                        total_cnt, "wait budget exhausted, leaving outer loop"
                    );
                    break;
                }
                continue;
            }

            self.scan_and_create_duals(registry, hooks);
            let consensus = self.build_consensus_blocks(registry);

            let summary = {
                let mut problem = Problem::new();
                for block in &self.residuals {
                    problem.add_residual_block(block, registry);
                }
                for block in &consensus {
                    problem.add_residual_block(block, registry);
                }
                hooks.set_state_properties(&mut problem, registry);
                inner.solve(&problem, registry, &self.config.solver)
            };
            self.updated = false;

            if !summary.success {
                return Err(SolveError::InnerSolver {
                    message: summary.message,
                    outer_iterations: iter_cnt,
                });
            }

            self.update_dual_states(registry);
            hooks.broadcast(registry, &self.duals, self.token, iter_cnt as u64);

            if iter_cnt == 0 {
                report.initial_cost = summary.initial_cost;
            }
            report.final_cost = summary.final_cost;
            report.total_iterations += summary.iterations;
            debug!(
                self_id = self.config.self_id,
                iter_cnt,
                initial_cost = summary.initial_cost,
                final_cost = summary.final_cost,
                steps = summary.iterations,
                "consensus substep"
            );
            iter_cnt += 1;
            total_cnt += 1;
        }

        report.outer_iterations = iter_cnt;
        report.total_time = start.elapsed();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::levenberg::LevenbergMarquardt;
    use crate::solver::params::ParamInfo;
    use crate::solver::problem::Manifold;
    use crate::solver::residual::CostFunction;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};
    use std::f64::consts::PI;

    /// Hooks that never receive anything and never publish.
    struct NullHooks;

    impl ConsensusHooks for NullHooks {
        fn receive_all(&mut self, _: &ParameterRegistry, _: &mut DualStateStore) -> bool {
            false
        }
        fn buffered_remote(&mut self, _: DroneId, _: ParamKey) -> Option<Vec<f64>> {
            None
        }
        fn set_state_properties(&mut self, problem: &mut Problem<'_>, registry: &ParameterRegistry) {
            for info in registry.iter() {
                if matches!(info.kind, ParamKind::Se3Pose | ParamKind::Extrinsic) {
                    problem.set_manifold(info.key, Manifold::Se3TangentSpace);
                }
            }
        }
        fn broadcast(&mut self, _: &ParameterRegistry, _: &DualStateStore, _: u64, _: u64) {}
    }

    fn test_config() -> ArockConfig {
        ArockConfig {
            self_id: 1,
            rho_frame_t: 0.1,
            rho_frame_theta: 0.1,
            rho_landmark: 0.1,
            eta_k: 0.9,
            max_steps: 3,
            max_wait_steps: 2,
            skip_iteration: Duration::from_micros(10),
            solver: SolverOptions {
                max_iterations: 20,
                max_solver_time: Duration::from_millis(200),
            },
        }
    }

    fn register_pose(reg: &mut ParameterRegistry, frame: u64, owner: DroneId, pose: &SE3) {
        reg.register(
            ParamInfo {
                key: ParamKey::FramePose(frame),
                kind: ParamKind::Se3Pose,
                owner: Some(owner),
            },
            &pose.to_array(),
        );
    }

    /// 6-D tangent prior anchoring a pose block.
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

    fn anchor_block(frame: u64, target: SE3, weight: f64) -> ResidualBlock {
        ResidualBlock::new(
            ResidualKind::Prior,
            Box::new(PoseAnchor { target, weight }),
            Loss::Trivial,
            vec![ParamKey::FramePose(frame)],
        )
    }

    #[test]
    fn no_peers_means_no_consensus_factors_and_one_inner_solve() {
        let mut reg = ParameterRegistry::new(1);
        let target = SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));
        register_pose(&mut reg, 1, 1, &SE3::identity());

        let mut solver = ArockSolver::new(test_config());
        solver.add_residual(anchor_block(1, target, 1.0), &reg);
        assert!(solver.duals().is_empty());

        let report = solver
            .solve(&mut reg, &LevenbergMarquardt::new(), &mut NullHooks)
            .unwrap();

        // One productive round, then the wait budget drains.
        assert_eq!(report.outer_iterations, 1);
        assert!(solver.duals().is_empty());
        let solved = SE3::from_array(reg.value(ParamKey::FramePose(1)));
        assert_relative_eq!(solved.translation, target.translation, epsilon = 1e-5);
    }

    #[test]
    fn scan_creates_duals_for_remote_params_only() {
        let mut reg = ParameterRegistry::new(1);
        register_pose(&mut reg, 1, 1, &SE3::identity());
        register_pose(&mut reg, 2, 2, &SE3::identity());

        let mut solver = ArockSolver::new(test_config());
        solver.add_residual(anchor_block(1, SE3::identity(), 1.0), &reg);
        solver.add_residual(anchor_block(2, SE3::identity(), 1.0), &reg);
        solver.scan_and_create_duals(&reg, &mut NullHooks);

        assert_eq!(solver.duals().len(), 1);
        assert!(solver.duals().contains(2, ParamKey::FramePose(2)));
    }

    #[test]
    fn dual_liveness_follows_residual_set() {
        let mut reg = ParameterRegistry::new(1);
        register_pose(&mut reg, 2, 2, &SE3::identity());

        let mut solver = ArockSolver::new(test_config());
        solver.add_residual(anchor_block(2, SE3::identity(), 1.0), &reg);
        solver.scan_and_create_duals(&reg, &mut NullHooks);
        assert_eq!(solver.duals().len(), 1);

        // Residual gone: the dual must die at the next scan.
        solver.residuals.clear();
        solver.scan_and_create_duals(&reg, &mut NullHooks);
        assert!(solver.duals().is_empty());
    }

    #[test]
    fn euclidean_dual_update_matches_relaxation_formula() {
        let mut reg = ParameterRegistry::new(1);
        reg.register(
            ParamInfo {
                key: ParamKey::Landmark(1),
                kind: ParamKind::InvDepthLandmark,
                owner: Some(2),
            },
            &[2.0],
        );
        let mut solver = ArockSolver::new(test_config());
        solver.duals.ensure(2, ParamKey::Landmark(1), &[1.0]);
        solver
            .duals
            .set_remote(2, ParamKey::Landmark(1), &[3.0]);

        solver.update_dual_states(&reg);

        // z_l' = z_l - η((z_l + z_r)/2 - x) = 1 - 0.9*(2 - 2) = 1
        let z = solver.duals.get_local(2, ParamKey::Landmark(1)).unwrap();
        assert_relative_eq!(z[0], 1.0, epsilon = 1e-12);

        // Move the primal and the dual must chase it.
        reg.set_value(ParamKey::Landmark(1), &[1.0]);
        solver.update_dual_states(&reg);
        let z = solver.duals.get_local(2, ParamKey::Landmark(1)).unwrap();
        assert_relative_eq!(z[0], 1.0 - 0.9 * (2.0 - 1.0), epsilon = 1e-12);
    }

    #[test]
    fn se3_dual_update_contracts_and_stays_on_manifold() {
        let mut reg = ParameterRegistry::new(1);
        let x = SE3::identity();
        register_pose(&mut reg, 2, 2, &x);

        let mut solver = ArockSolver::new(test_config());
        let z0 = SE3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0));
        solver.duals.ensure(2, ParamKey::FramePose(2), &z0.to_array());

        let mut disagreement = (z0.translation - x.translation).norm();
        for _ in 0..20 {
            solver.update_dual_states(&reg);
            let z = SE3::from_array(
                solver
                    .duals
                    .get_local(2, ParamKey::FramePose(2))
                    .unwrap()
                    .as_slice(),
            );
            let d = (z.translation - x.translation).norm();
            assert!(d <= disagreement + 1e-12, "dual disagreement must contract");
            disagreement = d;
            assert_relative_eq!(z.rotation.quaternion().norm(), 1.0, epsilon = 1e-9);
        }
        // Geometric contraction toward the primal.
        assert!(disagreement < 1e-3);
    }

    #[test]
    fn yaw_dual_update_wraps_into_range() {
        let mut reg = ParameterRegistry::new(1);
        reg.register(
            ParamInfo {
                key: ParamKey::RelativeCoord(2),
                kind: ParamKind::YawPose,
                owner: Some(2),
            },
            &[0.0, 0.0, 0.0, PI - 0.05],
        );
        let mut solver = ArockSolver::new(test_config());
        solver
            .duals
            .ensure(2, ParamKey::RelativeCoord(2), &[0.0, 0.0, 0.0, PI - 0.01]);
        solver
            .duals
            .set_remote(2, ParamKey::RelativeCoord(2), &[0.0, 0.0, 0.0, -PI + 0.01]);

        for _ in 0..5 {
            solver.update_dual_states(&reg);
            let yaw = solver.duals.get_local(2, ParamKey::RelativeCoord(2)).unwrap()[3];
            assert!(yaw > -PI && yaw <= PI, "yaw {yaw} escaped (-pi, pi]");
        }
    }

    #[test]
    fn consensus_blocks_target_received_remote_dual() {
        let mut reg = ParameterRegistry::new(1);
        register_pose(&mut reg, 2, 2, &SE3::identity());
        let mut solver = ArockSolver::new(test_config());
        solver.duals.ensure(2, ParamKey::FramePose(2), &SE3::identity().to_array());
        let remote = SE3::new(UnitQuaternion::identity(), Vector3::new(0.5, 0.0, 0.0));
        solver
            .duals
            .set_remote(2, ParamKey::FramePose(2), &remote.to_array());

        let blocks = solver.build_consensus_blocks(&reg);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, ResidualKind::Consensus);

        // Residual vanishes at the remote dual, not the local one.
        let storage = remote.to_array();
        let mut r = [0.0; 6];
        assert!(blocks[0].cost.evaluate(&[&storage], &mut r));
        for v in r {
            assert_relative_eq!(v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    #[should_panic(expected = "unregistered parameter")]
    fn unregistered_residual_param_is_fatal() {
        let reg = ParameterRegistry::new(1);
        let mut solver = ArockSolver::new(test_config());
        solver.add_residual(anchor_block(9, SE3::identity(), 1.0), &reg);
    }
}
