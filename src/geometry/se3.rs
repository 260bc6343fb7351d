//! SE(3) rigid-body transform with the tangent-space operations used by the
//! consensus solver.
//!
//! Poses are stored as a unit quaternion plus a translation. Tangent vectors
//! are 6-D `[δt; δθ]` with the rotational part in so(3) (axis-angle), and all
//! perturbations are applied on the right: `X ⊞ δ = X ∘ Exp(δ)`.

use nalgebra::{Quaternion, UnitQuaternion, Vector3, Vector6};

/// A rigid-body transform in SE(3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Compose two transforms: `self ∘ other`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    /// Inverse transform.
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Relative transform from `a` to `b`: `a⁻¹ ∘ b`.
    ///
    /// This is the right-perturbation local-frame error used by the consensus
    /// residuals and the dual update.
    pub fn delta(a: &SE3, b: &SE3) -> SE3 {
        a.inverse().compose(b)
    }

    /// Map to the 6-D tangent vector `[t; Log(R)]`.
    ///
    /// The translational and rotational parts are decoupled, matching the
    /// split weighting of the consensus penalty.
    pub fn tangent(&self) -> Vector6<f64> {
        let phi = self.rotation.scaled_axis();
        Vector6::new(
            self.translation.x,
            self.translation.y,
            self.translation.z,
            phi.x,
            phi.y,
            phi.z,
        )
    }

    /// Build a transform from a 6-D tangent vector `[t; φ]`.
    pub fn from_tangent(v: &Vector6<f64>) -> SE3 {
        let t = Vector3::new(v[0], v[1], v[2]);
        let phi = Vector3::new(v[3], v[4], v[5]);
        SE3 {
            rotation: UnitQuaternion::from_scaled_axis(phi),
            translation: t,
        }
    }

    /// Right-perturbation retraction: `self ∘ Exp(δ)`.
    pub fn retract(&self, delta: &Vector6<f64>) -> SE3 {
        self.compose(&SE3::from_tangent(delta))
    }

    /// Average of two poses: quaternion slerp at the midpoint and the
    /// arithmetic mean of the translations.
    pub fn average(a: &SE3, b: &SE3) -> SE3 {
        let rotation = a
            .rotation
            .try_slerp(&b.rotation, 0.5, 1e-9)
            .unwrap_or(a.rotation);
        SE3 {
            rotation,
            translation: (a.translation + b.translation) * 0.5,
        }
    }

    /// Serialize to the 7-scalar wire/storage layout `[tx,ty,tz,qx,qy,qz,qw]`.
    pub fn to_array(&self) -> [f64; 7] {
        let q = self.rotation.quaternion().coords;
        [
            self.translation.x,
            self.translation.y,
            self.translation.z,
            q[0],
            q[1],
            q[2],
            q[3],
        ]
    }

    /// Parse from the 7-scalar layout `[tx,ty,tz,qx,qy,qz,qw]`.
    ///
    /// The quaternion is renormalized so that round-trips through raw solver
    /// buffers stay on the manifold.
    pub fn from_array(v: &[f64]) -> SE3 {
        debug_assert!(v.len() >= 7, "SE3 storage needs 7 scalars");
        SE3 {
            rotation: UnitQuaternion::from_quaternion(Quaternion::new(v[6], v[3], v[4], v[5])),
            translation: Vector3::new(v[0], v[1], v[2]),
        }
    }

    /// Write into a 7-scalar storage slice.
    pub fn write_to(&self, out: &mut [f64]) {
        out[..7].copy_from_slice(&self.to_array());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(0.2, -0.1, 0.3)),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn compose_with_inverse_is_identity() {
        let x = sample_pose();
        let e = x.compose(&x.inverse());
        assert_relative_eq!(e.translation.norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(e.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn tangent_round_trip() {
        let x = sample_pose();
        let v = x.tangent();
        let y = SE3::from_tangent(&v);
        assert_relative_eq!(x.translation, y.translation, epsilon = 1e-12);
        assert_relative_eq!(x.rotation.angle_to(&y.rotation), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn retraction_stays_on_manifold() {
        let mut x = sample_pose();
        for _ in 0..100 {
            x = x.retract(&Vector6::new(0.01, -0.02, 0.005, 0.03, -0.01, 0.02));
        }
        assert_relative_eq!(x.rotation.quaternion().norm(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn average_of_equal_poses_is_fixed_point() {
        let x = sample_pose();
        let avg = SE3::average(&x, &x);
        assert_relative_eq!(avg.translation, x.translation, epsilon = 1e-12);
        assert_relative_eq!(avg.rotation.angle_to(&x.rotation), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn average_translation_is_midpoint() {
        let a = SE3::identity();
        let b = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(2.0, 0.0, 0.0),
        };
        let avg = SE3::average(&a, &b);
        assert_relative_eq!(avg.translation.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn array_round_trip_preserves_pose() {
        let x = sample_pose();
        let y = SE3::from_array(&x.to_array());
        assert_relative_eq!(x.translation, y.translation, epsilon = 1e-12);
        assert_relative_eq!(x.rotation.angle_to(&y.rotation), 0.0, epsilon = 1e-12);
    }
}
