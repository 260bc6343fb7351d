//! Reference Levenberg-Marquardt implementation of the `InnerSolver` trait.
//!
//! Works on arbitrary residual blocks: Jacobians are computed by central
//! finite differences in each parameter's tangent space, so cost functions
//! only need to evaluate residuals. Deployments with stronger requirements
//! can substitute any other `InnerSolver`.

use std::collections::HashMap;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};

use crate::geometry::{wrap_angle, SE3};
use crate::solver::params::{ParamKey, ParameterRegistry};
use crate::solver::problem::{InnerSolver, Manifold, Problem, SolverOptions, SolverSummary};

/// Finite-difference step in tangent space.
const FD_STEP: f64 = 1e-6;

/// Initial LM damping and its adaptation factors.
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;

/// Convergence tolerances.
const GRADIENT_TOLERANCE: f64 = 1e-10;
const STEP_TOLERANCE: f64 = 1e-10;

pub struct LevenbergMarquardt;

struct FreeParam {
    key: ParamKey,
    manifold: Manifold,
    tangent_offset: usize,
    tangent_dim: usize,
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self
    }

    /// Apply a tangent-space step to one parameter value in place.
    fn retract(manifold: Manifold, value: &mut [f64], delta: &[f64]) {
        match manifold {
            Manifold::Euclidean => {
                for (v, d) in value.iter_mut().zip(delta) {
                    *v += d;
                }
            }
            Manifold::Se3TangentSpace => {
                let pose = SE3::from_array(value);
                let step = nalgebra::Vector6::from_row_slice(delta);
                pose.retract(&step).write_to(value);
            }
            Manifold::YawAngleWrap => {
                for (v, d) in value.iter_mut().zip(delta) {
                    *v += d;
                }
                value[3] = wrap_angle(value[3]);
            }
        }
    }

    /// Evaluate the full loss-weighted residual vector; `None` when any cost
    /// function reports an invalid evaluation or produces non-finite values.
    fn residual_vector(
        problem: &Problem<'_>,
        values: &HashMap<ParamKey, Vec<f64>>,
        registry: &ParameterRegistry,
        out: &mut DVector<f64>,
    ) -> bool {
        let mut offset = 0;
        let mut scratch = Vec::new();
        for block in problem.blocks() {
            let n = block.cost.num_residuals();
            scratch.resize(n, 0.0);
            let params: Vec<&[f64]> = block
                .params_list()
                .iter()
                .map(|k| {
                    values
                        .get(k)
                        .map(|v| v.as_slice())
                        .unwrap_or_else(|| registry.value(*k))
                })
                .collect();
            if !block.cost.evaluate(&params, &mut scratch) {
                return false;
            }
            let norm = scratch.iter().map(|r| r * r).sum::<f64>().sqrt();
            let w = block.loss.weight(norm).sqrt();
            for (i, r) in scratch.iter().enumerate() {
                let v = w * r;
                if !v.is_finite() {
                    return false;
                }
                out[offset + i] = v;
            }
            offset += n;
        }
        true
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl InnerSolver for LevenbergMarquardt {
    fn solve(
        &self,
        problem: &Problem<'_>,
        registry: &mut ParameterRegistry,
        options: &SolverOptions,
    ) -> SolverSummary {
        let start = Instant::now();

        // Lay the free parameters out in one tangent vector.
        let mut free = Vec::new();
        let mut tangent_len = 0;
        for key in problem.free_params() {
            let manifold = problem.manifold(key);
            let kind = registry
                .info(key)
                .unwrap_or_else(|| panic!("parameter {key:?} is not registered"))
                .kind;
            let dim = match manifold {
                Manifold::Se3TangentSpace => 6,
                _ => kind.size(),
            };
            free.push(FreeParam {
                key,
                manifold,
                tangent_offset: tangent_len,
                tangent_dim: dim,
            });
            tangent_len += dim;
        }

        let num_residuals = problem.num_residuals();
        let fail = |message: &str, cost: f64, iterations: usize| SolverSummary {
            initial_cost: cost,
            final_cost: cost,
            iterations,
            time: start.elapsed(),
            success: false,
            message: message.to_string(),
        };

        if num_residuals == 0 || tangent_len == 0 {
            return SolverSummary {
                initial_cost: 0.0,
                final_cost: 0.0,
                iterations: 0,
                time: start.elapsed(),
                success: true,
                message: "empty problem".to_string(),
            };
        }

        // Working copies of every referenced parameter value.
        let mut current: HashMap<ParamKey, Vec<f64>> = problem
            .referenced_params()
            .into_iter()
            .map(|k| (k, registry.value(k).to_vec()))
            .collect();

        let mut residuals = DVector::zeros(num_residuals);
        if !Self::residual_vector(problem, &current, registry, &mut residuals) {
            return fail("invalid residual evaluation at initial point", f64::NAN, 0);
        }
        let initial_cost = 0.5 * residuals.norm_squared();

        let mut cost = initial_cost;
        let mut lambda = LAMBDA_INIT;
        let mut iterations = 0;
        let mut message = "converged".to_string();
        let mut success = true;

        let mut jacobian = DMatrix::zeros(num_residuals, tangent_len);
        let mut perturbed = DVector::zeros(num_residuals);

        for iter in 0..options.max_iterations {
            if start.elapsed() >= options.max_solver_time {
                message = format!("time budget exhausted after {iter} iterations");
                break;
            }
            iterations = iter + 1;

            // Central-difference Jacobian in tangent space.
            for fp in &free {
                let base = current[&fp.key].clone();
                for j in 0..fp.tangent_dim {
                    let mut delta = vec![0.0; fp.tangent_dim];

                    delta[j] = FD_STEP;
                    let mut plus = base.clone();
                    Self::retract(fp.manifold, &mut plus, &delta);
                    current.insert(fp.key, plus);
                    if !Self::residual_vector(problem, &current, registry, &mut perturbed) {
                        current.insert(fp.key, base);
                        return fail("invalid residual evaluation in jacobian", cost, iterations);
                    }
                    let r_plus = perturbed.clone();

                    delta[j] = -FD_STEP;
                    let mut minus = base.clone();
                    Self::retract(fp.manifold, &mut minus, &delta);
                    current.insert(fp.key, minus);
                    if !Self::residual_vector(problem, &current, registry, &mut perturbed) {
                        current.insert(fp.key, base);
                        return fail("invalid residual evaluation in jacobian", cost, iterations);
                    }

                    let col = fp.tangent_offset + j;
                    for row in 0..num_residuals {
                        jacobian[(row, col)] = (r_plus[row] - perturbed[row]) / (2.0 * FD_STEP);
                    }
                }
                current.insert(fp.key, base);
            }

            let gradient = jacobian.transpose() * &residuals;
            if gradient.norm() < GRADIENT_TOLERANCE {
                message = format!("gradient tolerance reached after {iter} iterations");
                break;
            }

            let jtj = jacobian.transpose() * &jacobian;
            let mut stepped = false;
            while lambda <= MAX_LAMBDA {
                let mut damped = jtj.clone();
                for i in 0..tangent_len {
                    damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
                }
                let Some(step) = damped.lu().solve(&(-&gradient)) else {
                    lambda *= LAMBDA_UP;
                    continue;
                };

                if step.norm() < STEP_TOLERANCE {
                    break;
                }

                // Trial update on copies of the free parameters.
                let mut trial = current.clone();
                for fp in &free {
                    let delta = step
                        .rows(fp.tangent_offset, fp.tangent_dim)
                        .iter()
                        .copied()
                        .collect::<Vec<_>>();
                    let value = trial.get_mut(&fp.key).expect("free param in working set");
                    Self::retract(fp.manifold, value, &delta);
                }
                for (&(key, dim), &bound) in problem.lower_bounds() {
                    if let Some(value) = trial.get_mut(&key) {
                        if value[dim] < bound {
                            value[dim] = bound;
                        }
                    }
                }

                if !Self::residual_vector(problem, &trial, registry, &mut perturbed) {
                    lambda *= LAMBDA_UP;
                    continue;
                }
                let trial_cost = 0.5 * perturbed.norm_squared();
                if trial_cost < cost {
                    current = trial;
                    residuals.copy_from(&perturbed);
                    cost = trial_cost;
                    lambda = (lambda * LAMBDA_DOWN).max(MIN_LAMBDA);
                    stepped = true;
                    break;
                }
                lambda *= LAMBDA_UP;
            }

            if !stepped {
                message = format!("no acceptable step after {} iterations", iter + 1);
                break;
            }
        }

        if !cost.is_finite() {
            success = false;
            message = "non-finite cost".to_string();
        }

        // Publish the accepted values back into the canonical buffers.
        if success {
            for (key, value) in &current {
                registry.set_value(*key, value);
            }
        }

        SolverSummary {
            initial_cost,
            final_cost: cost,
            iterations,
            time: start.elapsed(),
            success,
            message,
        }
    }
}
