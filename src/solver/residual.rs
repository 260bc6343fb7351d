//! Residual blocks: a cost function bound to an ordered list of parameters.
//!
//! The set of residual shapes is fixed, so the kind is a closed tag rather
//! than an open hierarchy; it is used only for marginalization relevance and
//! diagnostics.

use std::collections::HashSet;

use crate::solver::params::ParamKey;
use crate::state::FrameId;

/// A black-box cost term evaluated by the inner solver.
///
/// `evaluate` fills `residuals` (length `num_residuals`) from the parameter
/// values in `params` (one slice per parameter, in block order) and returns
/// false when the evaluation is invalid (e.g. a degenerate configuration).
pub trait CostFunction: Send + Sync {
    fn num_residuals(&self) -> usize;
    fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool;
}

/// Robust loss applied to a residual block.
#[derive(Debug, Clone, Copy, Default)]
pub enum Loss {
    #[default]
    Trivial,
    /// Huber loss with the given threshold on the residual norm.
    Huber(f64),
}

impl Loss {
    /// Reweighting factor `w` such that the effective residual is `√w · r`,
    /// evaluated at residual norm `r_norm`.
    pub fn weight(&self, r_norm: f64) -> f64 {
        match self {
            Loss::Trivial => 1.0,
            Loss::Huber(delta) => {
                if r_norm <= *delta || r_norm == 0.0 {
                    1.0
                } else {
                    delta / r_norm
                }
            }
        }
    }
}

/// Closed set of residual shapes handled by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualKind {
    Imu,
    TwoFrameOneCam,
    TwoFrameTwoCam,
    OneFrameTwoCam,
    Depth,
    Prior,
    Consensus,
}

/// A cost function together with the parameters it touches.
pub struct ResidualBlock {
    pub kind: ResidualKind,
    pub cost: Box<dyn CostFunction>,
    pub loss: Loss,
    params: Vec<ParamKey>,
}

impl ResidualBlock {
    pub fn new(
        kind: ResidualKind,
        cost: Box<dyn CostFunction>,
        loss: Loss,
        params: Vec<ParamKey>,
    ) -> Self {
        Self {
            kind,
            cost,
            loss,
            params,
        }
    }

    /// Ordered parameter list, matching the slices handed to `evaluate`.
    pub fn params_list(&self) -> &[ParamKey] {
        &self.params
    }

    /// True when the block touches the pose or speed-bias of any frame in
    /// `frames`; drives marginalization relevance.
    pub fn relevant_to(&self, frames: &HashSet<FrameId>) -> bool {
        self.params.iter().any(|p| match p {
            ParamKey::FramePose(id) | ParamKey::SpeedBias(id) => frames.contains(id),
            _ => false,
        })
    }
}
