//! # Detector geometry seam
//!
//! The alignment engine does not own any geometry. It only needs to:
//!
//! 1. identify the reference surface of a track state ([`SurfaceId`]),
//! 2. read the current placement of an alignable detector element
//!    ([`DetectorElement::transform`]),
//! 3. know the kind of surface so that the right residual derivative can be selected
//!    ([`SurfaceKind`]).
//!
//! Placements are rigid transforms ([`Isometry3`]) mapping surface-local coordinates to
//! global coordinates. Rotations are parameterized by **Z-Y-X Euler angles**:
//!
//! ```text
//! R = Rz(θz) · Ry(θy) · Rx(θx)
//! ```
//!
//! Both the residual derivative and the transform update go through
//! [`euler_angles_zyx`] / [`rotation_from_euler_zyx`], so the angle branch used to read
//! a rotation is the same one used to write it back.

use std::fmt;

use nalgebra::{Isometry3, Matrix3, UnitQuaternion, Vector3};

/// Stable identity of a detector surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shape family of a surface, used to select a residual derivative strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Plane,
    Disc,
    Cylinder,
    Other,
}

/// Conditions under which the geometry is read and written (e.g. an interval of validity).
///
/// The engine never interprets it; it is handed through to the detector elements and to the
/// transform updater.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct GeometryContext {
    pub iov: u64,
}

/// A detector element whose placement may be aligned.
///
/// Implementors are responsible for their own interior mutability: the engine only reads
/// the placement through this trait and writes it through a
/// [`TransformUpdater`](crate::solver::TransformUpdater).
pub trait DetectorElement {
    /// Identity of the surface carried by this element.
    fn surface_id(&self) -> SurfaceId;

    /// Shape of the surface carried by this element.
    fn surface_kind(&self) -> SurfaceKind {
        SurfaceKind::Plane
    }

    /// Current local-to-global placement.
    fn transform(&self, gctx: &GeometryContext) -> Isometry3<f64>;

    /// Current centre of the surface in global coordinates.
    fn center(&self, gctx: &GeometryContext) -> Vector3<f64> {
        self.transform(gctx).translation.vector
    }
}

/// Decompose a rotation into Z-Y-X Euler angles, returned as `(rotZ, rotY, rotX)`.
pub fn euler_angles_zyx(rotation: &UnitQuaternion<f64>) -> Vector3<f64> {
    let (roll, pitch, yaw) = rotation.euler_angles();
    Vector3::new(yaw, pitch, roll)
}

/// Rebuild `Rz(θz) · Ry(θy) · Rx(θx)` from angles stored as `(rotZ, rotY, rotX)`.
pub fn rotation_from_euler_zyx(angles: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(angles.z, angles.y, angles.x)
}

/// Global rotation axes generated by small increments of the Z-Y-X Euler angles.
///
/// For `R = Rz · Ry · Rx`, an increment `(δx, δy, δz)` of the angles around x, y and z
/// rotates the frame by the global rotation vector
///
/// ```text
/// ω = (Rz·Ry·ex)·δx + (Rz·ey)·δy + ez·δz
/// ```
///
/// The returned matrix holds these three axes as columns, ordered like the alignment
/// rotation parameters `(r0, r1, r2)`.
pub fn euler_zyx_rate_axes(angles: &Vector3<f64>) -> Matrix3<f64> {
    let rot_z = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angles.x);
    let rot_y = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angles.y);

    let axis_x = rot_z * rot_y * Vector3::x();
    let axis_y = rot_z * Vector3::y();
    let axis_z = Vector3::z();

    Matrix3::from_columns(&[axis_x, axis_y, axis_z])
}

/// Placement obtained by adding a translation and Euler-angle increments to `transform`.
///
/// `delta_rotation` is ordered `(δx, δy, δz)`, like the alignment rotation parameters.
pub fn shifted_transform(
    transform: &Isometry3<f64>,
    delta_center: &Vector3<f64>,
    delta_rotation: &Vector3<f64>,
) -> Isometry3<f64> {
    let old_angles = euler_angles_zyx(&transform.rotation);
    let new_angles = Vector3::new(
        old_angles.x + delta_rotation.z,
        old_angles.y + delta_rotation.y,
        old_angles.z + delta_rotation.x,
    );
    let new_center = transform.translation.vector + delta_center;

    Isometry3::from_parts(new_center.into(), rotation_from_euler_zyx(&new_angles))
}
