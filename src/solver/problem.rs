//! The per-iteration nonlinear problem handed to the inner solver.
//!
//! The inner solver is a black box behind the `InnerSolver` trait; the core
//! only assembles problems (residual blocks, manifolds, bounds, frozen
//! parameters) and reads back a summary.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::solver::params::{ParamKey, ParameterRegistry};
use crate::solver::residual::ResidualBlock;

/// Local parameterization applied to a block during the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifold {
    Euclidean,
    /// SE(3) right-perturbation in the 6-D tangent space.
    Se3TangentSpace,
    /// Euclidean update with the heading component wrapped to (-π, π].
    YawAngleWrap,
}

/// Bounded-effort options forwarded to the inner solver.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub max_solver_time: Duration,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_solver_time: Duration::from_millis(50),
        }
    }
}

/// Outcome of one inner solve.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub time: Duration,
    pub success: bool,
    pub message: String,
}

/// A nonlinear least-squares problem over registry-owned parameters.
///
/// Residual blocks are borrowed: primary residuals stay pinned in the outer
/// solver across iterations while consensus residuals are rebuilt fresh, so
/// the problem itself is cheap to reassemble.
pub struct Problem<'a> {
    blocks: Vec<&'a ResidualBlock>,
    manifolds: HashMap<ParamKey, Manifold>,
    lower_bounds: HashMap<(ParamKey, usize), f64>,
    frozen: HashSet<ParamKey>,
}

impl<'a> Problem<'a> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            manifolds: HashMap::new(),
            lower_bounds: HashMap::new(),
            frozen: HashSet::new(),
        }
    }

    /// Add a residual block. Every referenced parameter must already be
    /// registered; a missing parameter is a caller bug.
    pub fn add_residual_block(&mut self, block: &'a ResidualBlock, registry: &ParameterRegistry) {
        for key in block.params_list() {
            assert!(
                registry.contains(*key),
                "residual references unregistered parameter {key:?}"
            );
        }
        self.blocks.push(block);
    }

    pub fn set_manifold(&mut self, key: ParamKey, manifold: Manifold) {
        self.manifolds.insert(key, manifold);
    }

    pub fn manifold(&self, key: ParamKey) -> Manifold {
        self.manifolds
            .get(&key)
            .copied()
            .unwrap_or(Manifold::Euclidean)
    }

    /// Lower-bound one scalar of a parameter block.
    pub fn set_parameter_lower_bound(&mut self, key: ParamKey, dim: usize, bound: f64) {
        self.lower_bounds.insert((key, dim), bound);
    }

    pub fn lower_bounds(&self) -> impl Iterator<Item = (&(ParamKey, usize), &f64)> {
        self.lower_bounds.iter()
    }

    /// Hold a parameter constant during the solve.
    pub fn freeze_parameter(&mut self, key: ParamKey) {
        self.frozen.insert(key);
    }

    pub fn is_frozen(&self, key: ParamKey) -> bool {
        self.frozen.contains(&key)
    }

    pub fn blocks(&self) -> &[&'a ResidualBlock] {
        &self.blocks
    }

    /// Parameters referenced by at least one block, deduplicated in first-use
    /// order.
    pub fn referenced_params(&self) -> Vec<ParamKey> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for block in &self.blocks {
            for key in block.params_list() {
                if seen.insert(*key) {
                    out.push(*key);
                }
            }
        }
        out
    }

    /// Free (non-frozen) parameters in first-use order.
    pub fn free_params(&self) -> Vec<ParamKey> {
        self.referenced_params()
            .into_iter()
            .filter(|k| !self.frozen.contains(k))
            .collect()
    }

    pub fn num_residuals(&self) -> usize {
        self.blocks.iter().map(|b| b.cost.num_residuals()).sum()
    }
}

impl<'a> Default for Problem<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// The black-box nonlinear least-squares solver consumed by the core.
pub trait InnerSolver: Send + Sync {
    /// Minimize the problem in place, writing updated primal values back into
    /// the registry buffers. Implementations must respect frozen parameters,
    /// manifolds, lower bounds, and the option budgets.
    fn solve(
        &self,
        problem: &Problem<'_>,
        registry: &mut ParameterRegistry,
        options: &SolverOptions,
    ) -> SolverSummary;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::params::{ParamInfo, ParamKind};
    use crate::solver::residual::{CostFunction, Loss, ResidualKind};

    struct UnitCost;

    impl CostFunction for UnitCost {
        fn num_residuals(&self) -> usize {
            1
        }
        fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool {
            residuals[0] = params[0][0];
            true
        }
    }

    #[test]
    fn referenced_params_deduplicate_in_order() {
        let mut reg = ParameterRegistry::new(0);
        for id in [1u64, 2, 3] {
            reg.register(
                ParamInfo {
                    key: ParamKey::Landmark(id),
                    kind: ParamKind::InvDepthLandmark,
                    owner: None,
                },
                &[1.0],
            );
        }
        let b1 = ResidualBlock::new(
            ResidualKind::Depth,
            Box::new(UnitCost),
            Loss::Trivial,
            vec![ParamKey::Landmark(2), ParamKey::Landmark(1)],
        );
        let b2 = ResidualBlock::new(
            ResidualKind::Depth,
            Box::new(UnitCost),
            Loss::Trivial,
            vec![ParamKey::Landmark(1), ParamKey::Landmark(3)],
        );
        let mut problem = Problem::new();
        problem.add_residual_block(&b1, &reg);
        problem.add_residual_block(&b2, &reg);
        assert_eq!(
            problem.referenced_params(),
            vec![
                ParamKey::Landmark(2),
                ParamKey::Landmark(1),
                ParamKey::Landmark(3)
            ]
        );
        problem.freeze_parameter(ParamKey::Landmark(1));
        assert_eq!(
            problem.free_params(),
            vec![ParamKey::Landmark(2), ParamKey::Landmark(3)]
        );
    }

    #[test]
    #[should_panic(expected = "unregistered parameter")]
    fn adding_block_with_unknown_param_panics() {
        let reg = ParameterRegistry::new(0);
        let block = ResidualBlock::new(
            ResidualKind::Depth,
            Box::new(UnitCost),
            Loss::Trivial,
            vec![ParamKey::Landmark(99)],
        );
        let mut problem = Problem::new();
        problem.add_residual_block(&block, &reg);
    }
}
