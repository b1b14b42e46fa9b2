//! # Alignment solve and transform update
//!
//! One Newton step of the alignment:
//!
//! 1. [`solve_normal_equations`] solves `H · Δ = −g` with a full-pivot LU decomposition and
//!    derives the parameter covariance `2 · H⁻¹` and the expected chi-square change
//!    `0.5 · gᵀ · Δ`. Parameters fixed by the [`AlignmentMask`] are pinned so that their
//!    correction is exactly zero.
//! 2. [`commit_alignment_delta`] turns the correction into a new placement per surface and
//!    writes it through the injected [`TransformUpdater`].
//!
//! ## No partial commit
//!
//! All new placements are computed and checked before the first write. If the updater then
//! rejects a surface, the surfaces already written in the same pass are restored to their
//! previous placement and [`AlignmentError::ParameterUpdateFailure`] is returned. Surfaces
//! whose restore is rejected as well are listed in [`AlignmentError::RollbackFailure`].
//!
//! ## Conditioning
//!
//! A solve only fails on an exactly singular system. Weakly constrained modes still solve,
//! so every solution carries [`AlignmentSolution::condition_estimate`], the ratio of the
//! largest to the smallest LU pivot, for the caller to compare with a threshold.

use nalgebra::{DMatrix, DVector, Isometry3, Vector3};

use crate::{
    alignment::AlignmentMask,
    alignment_errors::AlignmentError,
    alignment_state::AlignableSurfaces,
    constants::{
        ALIGNMENT_CENTER_0, ALIGNMENT_CENTER_1, ALIGNMENT_CENTER_2, ALIGNMENT_PARAMETERS_SIZE,
        ALIGNMENT_ROTATION_0, ALIGNMENT_ROTATION_1, ALIGNMENT_ROTATION_2,
    },
    geometry::{shifted_transform, DetectorElement, GeometryContext, SurfaceId},
};

/// Capability to commit a new placement of a detector element.
///
/// This is the only path through which the engine changes the geometry. Any closure
/// `Fn(&E, &GeometryContext, &Isometry3<f64>) -> bool` is an updater.
pub trait TransformUpdater<E: ?Sized> {
    /// Return `false` if the placement could not be written.
    fn update(&self, element: &E, gctx: &GeometryContext, transform: &Isometry3<f64>) -> bool;
}

impl<E: ?Sized, F> TransformUpdater<E> for F
where
    F: Fn(&E, &GeometryContext, &Isometry3<f64>) -> bool,
{
    fn update(&self, element: &E, gctx: &GeometryContext, transform: &Isometry3<f64>) -> bool {
        self(element, gctx, transform)
    }
}

/// Result of one solve of the normal equations.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentSolution {
    /// Correction `Δ` of the global alignment parameters.
    pub delta: DVector<f64>,
    /// `2 · H⁻¹`, zero on the rows and columns of fixed parameters.
    pub covariance: DMatrix<f64>,
    /// `0.5 · gᵀ · Δ`.
    pub delta_chi2: f64,
    /// Largest over smallest absolute pivot of the LU decomposition of the pinned `H`.
    pub condition_estimate: f64,
}

impl AlignmentSolution {
    /// Solution of a system that could not be solved: no correction, unknown covariance.
    pub fn unsolved(alignment_dof: usize) -> Self {
        AlignmentSolution {
            delta: DVector::zeros(alignment_dof),
            covariance: DMatrix::from_element(alignment_dof, alignment_dof, f64::NAN),
            delta_chi2: 0.0,
            condition_estimate: f64::INFINITY,
        }
    }
}

/// Solve `H · Δ = −g` for the alignment correction.
///
/// Arguments
/// -----------------
/// * `gradient`: chi-square gradient `g`.
/// * `hessian`: chi-square Hessian `H`, same dimension as `g`.
/// * `mask`: free parameters, applied to every surface.
///
/// Return
/// ----------
/// * The correction, its covariance, the expected chi-square change and a condition estimate
///   of `H`.
/// * [`AlignmentError::SingularSystem`] if `H` cannot be inverted or the result is not
///   finite.
/// * [`AlignmentError::InconsistentInput`] if the dimensions disagree.
pub fn solve_normal_equations(
    gradient: &DVector<f64>,
    hessian: &DMatrix<f64>,
    mask: &AlignmentMask,
) -> Result<AlignmentSolution, AlignmentError> {
    let dof = gradient.len();
    if hessian.shape() != (dof, dof) || dof % ALIGNMENT_PARAMETERS_SIZE != 0 {
        return Err(AlignmentError::InconsistentInput(format!(
            "gradient of length {dof} does not match a Hessian of shape {:?}",
            hessian.shape()
        )));
    }

    let mut gradient = gradient.clone();
    let mut hessian = hessian.clone();
    let fixed: Vec<usize> = (0..dof)
        .filter(|i| !mask.is_free(i % ALIGNMENT_PARAMETERS_SIZE))
        .collect();
    for &i in &fixed {
        gradient[i] = 0.0;
        hessian.row_mut(i).fill(0.0);
        hessian.column_mut(i).fill(0.0);
        hessian[(i, i)] = 1.0;
    }

    let lu = hessian.full_piv_lu();
    let condition_estimate = pivot_ratio(&lu.u().diagonal());
    let delta = lu.solve(&(-&gradient)).ok_or(AlignmentError::SingularSystem)?;
    let mut covariance = lu.try_inverse().ok_or(AlignmentError::SingularSystem)? * 2.0;
    if delta.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
        return Err(AlignmentError::SingularSystem);
    }
    for &i in &fixed {
        covariance.row_mut(i).fill(0.0);
        covariance.column_mut(i).fill(0.0);
    }

    let delta_chi2 = 0.5 * gradient.dot(&delta);

    Ok(AlignmentSolution {
        delta,
        covariance,
        delta_chi2,
        condition_estimate,
    })
}

fn pivot_ratio(pivots: &DVector<f64>) -> f64 {
    if pivots.is_empty() {
        return 1.0;
    }
    let pivots = pivots.abs();
    pivots.max() / pivots.min()
}

/// Apply a correction of the global alignment parameters to every aligned surface.
///
/// For the surface with global index `i`, the centre moves by `Δ[6i..6i+3]` and the Z-Y-X
/// Euler angles by `Δ[6i+3..6i+6]`. The new placement is handed to `updater`.
///
/// Return
/// ----------
/// * The committed placements, in global index order.
/// * [`AlignmentError::ParameterUpdateFailure`] if a placement is not finite or the updater
///   rejects it. Surfaces written earlier in the pass are restored first.
/// * [`AlignmentError::RollbackFailure`] if the updater also rejects one of those restores.
pub fn commit_alignment_delta<E, U>(
    gctx: &GeometryContext,
    surfaces: &AlignableSurfaces<'_, E>,
    delta: &DVector<f64>,
    updater: &U,
) -> Result<Vec<(SurfaceId, Isometry3<f64>)>, AlignmentError>
where
    E: DetectorElement,
    U: TransformUpdater<E> + ?Sized,
{
    if delta.len() != surfaces.alignment_dof() {
        return Err(AlignmentError::InconsistentInput(format!(
            "correction of length {} for {} aligned surfaces",
            delta.len(),
            surfaces.len()
        )));
    }

    let mut planned = Vec::with_capacity(surfaces.len());
    for (i, element) in surfaces.elements().iter().enumerate() {
        let segment = delta.fixed_rows::<ALIGNMENT_PARAMETERS_SIZE>(i * ALIGNMENT_PARAMETERS_SIZE);
        let previous = element.transform(gctx);
        let current = Isometry3::from_parts(element.center(gctx).into(), previous.rotation);
        let next = shifted_transform(
            &current,
            &Vector3::new(
                segment[ALIGNMENT_CENTER_0],
                segment[ALIGNMENT_CENTER_1],
                segment[ALIGNMENT_CENTER_2],
            ),
            &Vector3::new(
                segment[ALIGNMENT_ROTATION_0],
                segment[ALIGNMENT_ROTATION_1],
                segment[ALIGNMENT_ROTATION_2],
            ),
        );
        if !is_finite(&next) {
            return Err(AlignmentError::ParameterUpdateFailure {
                surface: element.surface_id(),
            });
        }
        planned.push((*element, previous, next));
    }

    for (n, (element, _, next)) in planned.iter().enumerate() {
        if !updater.update(*element, gctx, next) {
            let unrestored: Vec<SurfaceId> = planned[..n]
                .iter()
                .rev()
                .filter(|(committed, previous, _)| !updater.update(*committed, gctx, previous))
                .map(|(committed, _, _)| committed.surface_id())
                .collect();
            let surface = element.surface_id();
            return Err(if unrestored.is_empty() {
                AlignmentError::ParameterUpdateFailure { surface }
            } else {
                AlignmentError::RollbackFailure {
                    surface,
                    unrestored,
                }
            });
        }
    }

    Ok(planned
        .into_iter()
        .map(|(element, _, next)| (element.surface_id(), next))
        .collect())
}

fn is_finite(transform: &Isometry3<f64>) -> bool {
    transform
        .translation
        .vector
        .iter()
        .chain(transform.rotation.coords.iter())
        .all(|v| v.is_finite())
}
