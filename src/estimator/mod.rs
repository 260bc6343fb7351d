//! Per-agent estimator: drives one outer consensus solve per drained
//! keyframe, wiring the sliding window, the parameter registry, the sync
//! coordinator, and the ARock loop together.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::{AgentConfig, ConfigError};
use crate::geometry::SE3;
use crate::solver::arock::{ArockSolver, ConsensusHooks, SolveError, SolverReport};
use crate::solver::dual::DualStateStore;
use crate::solver::params::{ParamKey, ParameterRegistry};
use crate::solver::prior::Marginalizer;
use crate::solver::problem::{InnerSolver, Problem};
use crate::solver::residual::{ResidualBlock, ResidualKind};
use crate::state::window::WindowState;
use crate::state::{CamId, DroneId, FrameId, LandmarkId, VinsFrame};
use crate::sync::coordinator::{RoundStart, SyncCoordinator};

/// Producer of primary residual blocks for the current window.
///
/// Residual formation (reprojection, IMU, depth) happens in the front-end;
/// the core only schedules whatever blocks this seam returns.
pub trait FactorSource: Send {
    fn build_residuals(
        &mut self,
        window: &WindowState,
        registry: &ParameterRegistry,
    ) -> Vec<ResidualBlock>;
}

/// Ready-poll budget multiplier: each `max_wait_steps` unit spends this many
/// READY polls before the negotiation times out.
const NEGOTIATION_POLLS_PER_WAIT_STEP: usize = 100;

fn now_stamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Hooks the ARock loop calls back into, borrowing the estimator's pieces.
struct RoundHooks<'a> {
    coordinator: &'a mut SyncCoordinator,
    window: &'a WindowState,
    config: &'a AgentConfig,
}

impl ConsensusHooks for RoundHooks<'_> {
    fn receive_all(&mut self, registry: &ParameterRegistry, duals: &mut DualStateStore) -> bool {
        self.coordinator.receive_all(registry, duals)
    }

    fn buffered_remote(&mut self, peer: DroneId, key: ParamKey) -> Option<Vec<f64>> {
        self.coordinator.take_buffered(peer, key)
    }

    fn set_state_properties(&mut self, problem: &mut Problem<'_>, registry: &ParameterRegistry) {
        self.window.configure_problem(problem, registry, self.config);
    }

    fn broadcast(
        &mut self,
        registry: &ParameterRegistry,
        _duals: &DualStateStore,
        token: u64,
        iteration: u64,
    ) {
        let msg = self
            .window
            .build_broadcast(registry, token, iteration, now_stamp());
        self.coordinator.broadcast_state(&msg);
    }
}

pub struct Estimator {
    config: AgentConfig,
    registry: ParameterRegistry,
    window: WindowState,
    solver: ArockSolver,
    inner: Box<dyn InnerSolver>,
    coordinator: SyncCoordinator,
    factor_source: Box<dyn FactorSource>,
    marginalizer: Option<Box<dyn Marginalizer>>,

    /// New frames since the last solve.
    updated: bool,
    solve_count: usize,
    sum_time: f64,
    sum_iterations: usize,
}

impl Estimator {
    pub fn new(
        config: AgentConfig,
        coordinator: SyncCoordinator,
        inner: Box<dyn InnerSolver>,
        factor_source: Box<dyn FactorSource>,
        marginalizer: Option<Box<dyn Marginalizer>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let self_id = config.self_id;
        Ok(Self {
            solver: ArockSolver::new((&config).into()),
            registry: ParameterRegistry::new(self_id),
            window: WindowState::new(self_id),
            config,
            inner,
            coordinator,
            factor_source,
            marginalizer,
            updated: false,
            solve_count: 0,
            sum_time: 0.0,
            sum_iterations: 0,
        })
    }

    pub fn window(&self) -> &WindowState {
        &self.window
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn arock(&self) -> &ArockSolver {
        &self.solver
    }

    /// Current estimate of a frame pose.
    pub fn pose(&self, frame_id: FrameId) -> Option<SE3> {
        self.window.frame(frame_id).map(|f| f.pose)
    }

    pub fn add_frame(&mut self, frame: VinsFrame) {
        self.window.add_frame(frame, &mut self.registry);
        self.updated = true;
    }

    pub fn observe_landmark(
        &mut self,
        landmark_id: LandmarkId,
        frame_id: FrameId,
        cam_id: CamId,
        initial_inv_depth: f64,
    ) {
        self.window.observe_landmark(
            landmark_id,
            frame_id,
            cam_id,
            initial_inv_depth,
            &mut self.registry,
        );
    }

    pub fn set_extrinsic(&mut self, cam_id: CamId, drone_id: DroneId, pose: &SE3) {
        self.window
            .set_extrinsic(cam_id, drone_id, pose, &mut self.registry);
    }

    pub fn set_time_offset(&mut self, drone_id: DroneId, td: f64) {
        self.window.set_time_offset(drone_id, td, &mut self.registry);
    }

    /// Run one outer solve if the window is ready. Returns `None` when the
    /// window is still too short or nothing changed.
    pub fn solve(&mut self) -> Result<Option<SolverReport>, SolveError> {
        if self.window.window_len(self.config.self_id) < self.config.min_solve_frames
            || !self.updated
        {
            return Ok(None);
        }
        self.updated = false;

        self.marginalize_outgoing();

        // Fresh residual set for this solve; the blocks stay pinned across
        // the outer iterations inside.
        self.solver.reset();
        let blocks = self
            .factor_source
            .build_residuals(&self.window, &self.registry);
        for block in blocks {
            self.solver.add_residual(block, &self.registry);
        }
        if let Some(prior) = self.window.prior() {
            let keys = prior.keys().to_vec();
            self.solver.add_residual(
                ResidualBlock::new(
                    ResidualKind::Prior,
                    Box::new(prior.clone()),
                    Default::default(),
                    keys,
                ),
                &self.registry,
            );
        }

        self.coordinator
            .set_participants(self.window.available_drones());

        let coupled = self.window.has_cross_agent_coupling();
        let report = if !coupled {
            // No cross-agent coupling: opt out of this round and solve
            // locally.
            self.coordinator.announce_non_dist();
            self.solve_non_distributed()?
        } else if self.config.consensus_sync_to_start {
            let max_polls = self.config.max_wait_steps * NEGOTIATION_POLLS_PER_WAIT_STEP;
            match self.coordinator.negotiate_round(max_polls) {
                RoundStart::Go(token) => {
                    debug!(
                        self_id = self.config.self_id,
                        token, "round negotiated, solving"
                    );
                    self.solver.set_token(token);
                    self.solve_distributed()?
                }
                RoundStart::Timeout => {
                    // Participant timeout: terminate the round early but
                    // still publish a local estimate.
                    warn!(
                        self_id = self.config.self_id,
                        "negotiation timed out, solving locally"
                    );
                    self.solve_non_distributed()?
                }
            }
        } else {
            debug!(self_id = self.config.self_id, "asynchronous solve");
            self.solver.set_token(self.coordinator.token());
            self.solve_distributed()?
        };

        self.window.sync_from_registry(&self.registry);

        self.solve_count += 1;
        self.sum_time += report.total_time.as_secs_f64();
        self.sum_iterations += report.total_iterations;
        info!(
            self_id = self.config.self_id,
            solve_count = self.solve_count,
            final_cost = report.final_cost,
            avg_time_ms = self.sum_time * 1000.0 / self.solve_count as f64,
            avg_iterations = self.sum_iterations as f64 / self.solve_count as f64,
            "solve finished"
        );
        Ok(Some(report))
    }

    fn marginalize_outgoing(&mut self) {
        let remove = self.window.frames_to_marginalize(&self.config);
        if remove.is_empty() {
            return;
        }
        if let Some(marginalizer) = self.marginalizer.as_mut() {
            let prior = marginalizer.marginalize(&self.registry, &remove, self.solver.residuals());
            self.window.set_prior(prior);
        } else {
            self.window.set_prior(None);
        }
        self.window.remove_frames(&remove, &mut self.registry);
    }

    fn solve_distributed(&mut self) -> Result<SolverReport, SolveError> {
        let Self {
            ref mut solver,
            ref mut registry,
            ref mut coordinator,
            ref window,
            ref config,
            ref inner,
            ..
        } = *self;
        let mut hooks = RoundHooks {
            coordinator,
            window,
            config,
        };
        solver.solve(registry, inner.as_ref(), &mut hooks)
    }

    /// Single inner solve without consensus residuals; used for uncoupled
    /// agents and negotiation timeouts.
    fn solve_non_distributed(&mut self) -> Result<SolverReport, SolveError> {
        let summary = {
            let mut problem = Problem::new();
            for block in self.solver.residuals() {
                problem.add_residual_block(block, &self.registry);
            }
            self.window
                .configure_problem(&mut problem, &self.registry, &self.config);
            self.inner
                .solve(&problem, &mut self.registry, &self.config.solver)
        };
        if !summary.success {
            return Err(SolveError::InnerSolver {
                message: summary.message,
                outer_iterations: 0,
            });
        }
        Ok(SolverReport {
            total_iterations: summary.iterations,
            outer_iterations: 1,
            initial_cost: summary.initial_cost,
            final_cost: summary.final_cost,
            total_time: summary.time,
        })
    }
}
