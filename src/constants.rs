//! # Constants and type definitions for trackalign
//!
//! This module centralizes the **parameter-space sizes**, **index constants**, **unit factors**,
//! and **fixed-size type aliases** used throughout the alignment engine.
//!
//! ## Overview
//!
//! - Size of the bound track-parameter vector and of the per-surface alignment vector
//! - Positions of the individual parameters inside those vectors
//! - Length units (the internal unit is the millimetre)
//! - Fixed-size `nalgebra` aliases for the quantities whose dimension is known at compile time
//!
//! Quantities that scale with the track content (measurement dimension, number of
//! measurement states, number of alignable surfaces) are stored in dynamically sized
//! [`nalgebra::DMatrix`] / [`nalgebra::DVector`] instead.

use nalgebra::{Matrix6, Vector6};

// -------------------------------------------------------------------------------------------------
// Parameter-space sizes
// -------------------------------------------------------------------------------------------------

/// Number of bound track parameters on a surface: `(loc0, loc1, phi, theta, q/p, t)`.
pub const BOUND_PARAMETERS_SIZE: usize = 6;

/// Number of rigid-body alignment parameters per surface: 3 translations + 3 rotations.
pub const ALIGNMENT_PARAMETERS_SIZE: usize = 6;

// -------------------------------------------------------------------------------------------------
// Bound parameter indices
// -------------------------------------------------------------------------------------------------

/// First local coordinate on the reference surface.
pub const BOUND_LOC_0: usize = 0;
/// Second local coordinate on the reference surface.
pub const BOUND_LOC_1: usize = 1;
/// Global azimuthal angle of the momentum direction.
pub const BOUND_PHI: usize = 2;
/// Global polar angle of the momentum direction.
pub const BOUND_THETA: usize = 3;

// -------------------------------------------------------------------------------------------------
// Alignment parameter indices
// -------------------------------------------------------------------------------------------------

/// Translation of the surface centre along global x.
pub const ALIGNMENT_CENTER_0: usize = 0;
/// Translation of the surface centre along global y.
pub const ALIGNMENT_CENTER_1: usize = 1;
/// Translation of the surface centre along global z.
pub const ALIGNMENT_CENTER_2: usize = 2;
/// Increment of the Euler angle around global x.
pub const ALIGNMENT_ROTATION_0: usize = 3;
/// Increment of the Euler angle around global y.
pub const ALIGNMENT_ROTATION_1: usize = 4;
/// Increment of the Euler angle around global z.
pub const ALIGNMENT_ROTATION_2: usize = 5;

// -------------------------------------------------------------------------------------------------
// Units (internal length unit: millimetre)
// -------------------------------------------------------------------------------------------------

/// One millimetre.
pub const MM: f64 = 1.0;
/// One micrometre.
pub const UM: f64 = 1e-3 * MM;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Bound track-parameter vector.
pub type BoundVector = Vector6<f64>;
/// Covariance (or Jacobian) in bound track-parameter space.
pub type BoundMatrix = Matrix6<f64>;
/// Per-surface alignment parameter vector `(c0, c1, c2, r0, r1, r2)`.
pub type AlignmentVector = Vector6<f64>;
/// Derivative of the bound parameters with respect to the alignment parameters of one surface.
pub type AlignmentToBoundMatrix = Matrix6<f64>;
/// Index of a state within a fitted trajectory.
pub type StateIndex = usize;
