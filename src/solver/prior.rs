//! Marginalization seam: the prior factor produced when frames leave the
//! sliding window, and the trait the external marginalizer implements.
//!
//! The core never performs Schur elimination itself; it hands the outgoing
//! frames and the residuals relevant to them to a `Marginalizer` and re-adds
//! the returned prior as an ordinary residual in the next round.

use std::collections::HashSet;

use nalgebra::{DMatrix, DVector};

use crate::geometry::{angle_diff, SE3};
use crate::solver::params::{ParamKey, ParamKind, ParameterRegistry};
use crate::solver::residual::{CostFunction, ResidualBlock};
use crate::state::FrameId;

/// A Gaussian prior over the kept parameters, linearized at the values the
/// parameters held when the marginalization was computed.
///
/// The residual is `sqrt_info · (x ⊟ x_lin)` with the difference taken in
/// each parameter's tangent space (SE(3) blocks contribute 6 rows, yaw poses
/// wrap their heading).
#[derive(Clone)]
pub struct PriorFactor {
    keys: Vec<ParamKey>,
    kinds: Vec<ParamKind>,
    linearization: Vec<Vec<f64>>,
    sqrt_info: DMatrix<f64>,
}

impl PriorFactor {
    /// Build a prior over `keys`, linearized at their current registry
    /// values. `sqrt_info` is square with one row per tangent dimension.
    pub fn new(keys: Vec<ParamKey>, registry: &ParameterRegistry, sqrt_info: DMatrix<f64>) -> Self {
        let kinds: Vec<ParamKind> = keys
            .iter()
            .map(|k| {
                registry
                    .info(*k)
                    .unwrap_or_else(|| panic!("prior references unregistered parameter {k:?}"))
                    .kind
            })
            .collect();
        let linearization = keys.iter().map(|k| registry.value(*k).to_vec()).collect();
        let dim: usize = kinds.iter().map(|k| k.tangent_size()).sum();
        assert_eq!(sqrt_info.nrows(), dim, "sqrt_info rows must match tangent dim");
        assert_eq!(sqrt_info.ncols(), dim);
        Self {
            keys,
            kinds,
            linearization,
            sqrt_info,
        }
    }

    /// Diagonal prior with one weight per parameter block.
    pub fn diagonal(
        keys: Vec<ParamKey>,
        registry: &ParameterRegistry,
        weights: &[f64],
    ) -> Self {
        assert_eq!(keys.len(), weights.len());
        let dims: Vec<usize> = keys
            .iter()
            .map(|k| registry.info(*k).expect("registered").kind.tangent_size())
            .collect();
        let total: usize = dims.iter().sum();
        let mut sqrt_info = DMatrix::zeros(total, total);
        let mut offset = 0;
        for (dim, w) in dims.iter().zip(weights) {
            for i in 0..*dim {
                sqrt_info[(offset + i, offset + i)] = *w;
            }
            offset += dim;
        }
        Self::new(keys, registry, sqrt_info)
    }

    pub fn keys(&self) -> &[ParamKey] {
        &self.keys
    }

    pub fn tangent_dim(&self) -> usize {
        self.sqrt_info.nrows()
    }
}

impl CostFunction for PriorFactor {
    fn num_residuals(&self) -> usize {
        self.sqrt_info.nrows()
    }

    fn evaluate(&self, params: &[&[f64]], residuals: &mut [f64]) -> bool {
        let mut dx = DVector::zeros(self.tangent_dim());
        let mut offset = 0;
        for ((kind, lin), value) in self.kinds.iter().zip(&self.linearization).zip(params) {
            match kind {
                ParamKind::Se3Pose | ParamKind::Extrinsic => {
                    let err =
                        SE3::delta(&SE3::from_array(lin), &SE3::from_array(value)).tangent();
                    dx.rows_mut(offset, 6).copy_from(&err);
                }
                ParamKind::YawPose => {
                    for i in 0..3 {
                        dx[offset + i] = value[i] - lin[i];
                    }
                    dx[offset + 3] = angle_diff(value[3], lin[3]);
                }
                _ => {
                    for (i, (v, l)) in value.iter().zip(lin).enumerate() {
                        dx[offset + i] = v - l;
                    }
                }
            }
            offset += kind.tangent_size();
        }
        let r = &self.sqrt_info * dx;
        residuals.copy_from_slice(r.as_slice());
        true
    }
}

/// External producer of priors for outgoing keyframes.
pub trait Marginalizer: Send {
    /// Summarize `removed_frames` into a prior over the kept parameters.
    /// `blocks` are the current primary residuals; implementations select the
    /// relevant ones via `ResidualBlock::relevant_to`.
    fn marginalize(
        &mut self,
        registry: &ParameterRegistry,
        removed_frames: &HashSet<FrameId>,
        blocks: &[ResidualBlock],
    ) -> Option<PriorFactor>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::params::ParamInfo;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn prior_vanishes_at_linearization_point() {
        let mut reg = ParameterRegistry::new(0);
        let key = ParamKey::FramePose(1);
        let pose = SE3::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(0.1, 0.0, 0.2)),
            Vector3::new(1.0, 2.0, 3.0),
        );
        reg.register(
            ParamInfo {
                key,
                kind: ParamKind::Se3Pose,
                owner: Some(0),
            },
            &pose.to_array(),
        );
        let prior = PriorFactor::diagonal(vec![key], &reg, &[10.0]);
        let storage = pose.to_array();
        let mut r = [0.0; 6];
        assert!(prior.evaluate(&[&storage], &mut r));
        for v in r {
            assert_relative_eq!(v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn prior_penalizes_tangent_deviation() {
        let mut reg = ParameterRegistry::new(0);
        let key = ParamKey::FramePose(1);
        reg.register(
            ParamInfo {
                key,
                kind: ParamKind::Se3Pose,
                owner: Some(0),
            },
            &SE3::identity().to_array(),
        );
        let prior = PriorFactor::diagonal(vec![key], &reg, &[2.0]);
        let moved = SE3::new(UnitQuaternion::identity(), Vector3::new(0.5, 0.0, 0.0));
        let storage = moved.to_array();
        let mut r = [0.0; 6];
        prior.evaluate(&[&storage], &mut r);
        assert_relative_eq!(r[0], 1.0, epsilon = 1e-9);
    }
}
