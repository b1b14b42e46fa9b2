//! # Planar surface derivative
//!
//! Derivative of the predicted local position of a straight track segment on a plane with
//! respect to a small rigid motion of the plane.
//!
//! Local frame: `(u, v)` span the plane, `w` is its normal. Near the surface the track is a
//! line with local slopes `tu = du/dw`, `tv = dv/dw`. Moving the plane by a local translation
//! `δ = (δu, δv, δw)` and a local rotation vector `ω = (α, β, γ)` about its centre moves the
//! intersection, to first order, to
//!
//! ```text
//! u' = u − δu + tu·δw + tu·v·α − tu·u·β + v·γ
//! v' = v − δv + tv·δw + tv·v·α − tv·u·β − u·γ
//! ```
//!
//! The alignment parameters are global: the centre shift is expressed in the global frame
//! (`δ = Rᵀ·δc`) and the rotation parameters are increments of the Z-Y-X Euler angles, mapped
//! onto a local rotation vector through [`euler_zyx_rate_axes`] (`ω = Rᵀ·E·δθ`).
//!
//! Only the local position rows are filled; the direction, momentum and time rows stay zero.

use nalgebra::{Isometry3, Matrix2x3, Vector3};

use crate::{
    constants::{
        AlignmentToBoundMatrix, BoundVector, ALIGNMENT_CENTER_0, ALIGNMENT_ROTATION_0,
        BOUND_LOC_0, BOUND_LOC_1, BOUND_PHI, BOUND_THETA,
    },
    geometry::{euler_angles_zyx, euler_zyx_rate_axes},
};

use super::AlignmentDerivative;

#[derive(Debug, Clone, Copy)]
pub struct PlaneSurfaceDerivative {
    /// Minimum `|cos|` between the track direction and the plane normal; below it the track
    /// is treated as parallel to the plane and the derivative is zero.
    pub min_normal_cosine: f64,
}

impl Default for PlaneSurfaceDerivative {
    fn default() -> Self {
        PlaneSurfaceDerivative {
            min_normal_cosine: 1e-6,
        }
    }
}

impl AlignmentDerivative for PlaneSurfaceDerivative {
    fn alignment_to_bound(
        &self,
        transform: &Isometry3<f64>,
        parameters: &BoundVector,
    ) -> AlignmentToBoundMatrix {
        let mut jacobian = AlignmentToBoundMatrix::zeros();

        let (phi, theta) = (parameters[BOUND_PHI], parameters[BOUND_THETA]);
        let direction = Vector3::new(
            phi.cos() * theta.sin(),
            phi.sin() * theta.sin(),
            theta.cos(),
        );
        let local_direction = transform.rotation.inverse_transform_vector(&direction);
        if local_direction.z.abs() < self.min_normal_cosine {
            return jacobian;
        }

        let tu = local_direction.x / local_direction.z;
        let tv = local_direction.y / local_direction.z;
        let (u, v) = (parameters[BOUND_LOC_0], parameters[BOUND_LOC_1]);

        let to_local = transform.rotation.to_rotation_matrix().into_inner().transpose();
        let rate_axes = euler_zyx_rate_axes(&euler_angles_zyx(&transform.rotation));

        let translation = Matrix2x3::new(-1.0, 0.0, tu, 0.0, -1.0, tv) * to_local;
        let rotation =
            Matrix2x3::new(tu * v, -tu * u, v, tv * v, -tv * u, -u) * to_local * rate_axes;

        jacobian
            .fixed_view_mut::<2, 3>(BOUND_LOC_0, ALIGNMENT_CENTER_0)
            .copy_from(&translation);
        jacobian
            .fixed_view_mut::<2, 3>(BOUND_LOC_0, ALIGNMENT_ROTATION_0)
            .copy_from(&rotation);

        jacobian
    }
}
