//! Consensus penalty residuals.
//!
//! One factor per (peer, shared parameter) pulls the local primal toward the
//! dual state received from the owning peer, with per-kind geometry and
//! square-root-information weights.

use nalgebra::DVector;

use crate::geometry::{angle_diff, SE3};
use crate::solver::residual::CostFunction;

/// 6-D penalty `r = [ρ_T·t_e ; ρ_θ·Log(R_e)]` with `E = X_dual⁻¹ ∘ X`.
pub struct Se3ConsensusFactor {
    dual: SE3,
    rho_t: f64,
    rho_theta: f64,
}

impl Se3ConsensusFactor {
    pub fn new(dual: SE3, rho_t: f64, rho_theta: f64) -> Self {
        Self {
            dual,
            rho_t,
            rho_theta,
        }
    }
}

impl CostFunction for Se3ConsensusFactor {
    fn num_residuals(&self) -> usize {
        6
    }

    fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool {
        let x = SE3::from_array(params[0]);
        let err = SE3::delta(&self.dual, &x).tangent();
        for i in 0..3 {
            residuals[i] = self.rho_t * err[i];
            residuals[i + 3] = self.rho_theta * err[i + 3];
        }
        true
    }
}

/// 4-D penalty on a yaw-only pose; the heading difference is wrapped to
/// (-π, π].
pub struct YawPoseConsensusFactor {
    dual: [f64; 4],
    rho_t: f64,
    rho_theta: f64,
}

impl YawPoseConsensusFactor {
    pub fn new(dual: [f64; 4], rho_t: f64, rho_theta: f64) -> Self {
        Self {
            dual,
            rho_t,
            rho_theta,
        }
    }
}

impl CostFunction for YawPoseConsensusFactor {
    fn num_residuals(&self) -> usize {
        4
    }

    fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool {
        let x = params[0];
        for i in 0..3 {
            residuals[i] = self.rho_t * (x[i] - self.dual[i]);
        }
        residuals[3] = self.rho_theta * angle_diff(x[3], self.dual[3]);
        true
    }
}

/// Identity square-root information scaled by ρ: `r = ρ·(X - X_dual)`.
pub struct EuclideanConsensusFactor {
    dual: DVector<f64>,
    rho: f64,
}

impl EuclideanConsensusFactor {
    pub fn new(dual: DVector<f64>, rho: f64) -> Self {
        Self { dual, rho }
    }
}

impl CostFunction for EuclideanConsensusFactor {
    fn num_residuals(&self) -> usize {
        self.dual.len()
    }

    fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool {
        for (i, x) in params[0].iter().enumerate() {
            residuals[i] = self.rho * (x - self.dual[i]);
        }
        true
    }
}
