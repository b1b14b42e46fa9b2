//! # Per-track alignment state
//!
//! For one fitted trajectory, this module extracts everything the global normal equations
//! need: residuals, the block structure of the measurement and track-parameter covariances,
//! the residual derivative with respect to the alignment parameters, and from those the
//! chi-square with its first and second derivatives.
//!
//! ## Block layout
//!
//! The trajectory is visited backwards (smoothing order) and only states carrying a
//! measurement are kept. Blocks are then laid out **chronologically**: the lowest-index
//! block belongs to the first state of the track, which is the last one visited.
//!
//! | quantity | size |
//! |---|---|
//! | measurement covariance `Σ` | `m × m`, block diagonal |
//! | track-parameter covariance `C` | `6n × 6n`, with the correlations between states |
//! | projector `H` | `m × 6n`, block diagonal |
//! | residual `r` | `m` |
//! | residual derivative `D = ∂r/∂a` | `m × 6s` |
//!
//! with `m` the total measurement dimension, `n` the number of measurement states and `s`
//! the number of distinct alignable surfaces on the track. Local surface indices follow the
//! first chronological occurrence of each surface.
//!
//! ## Chi-square derivatives
//!
//! ```text
//! V   = Σ − H·C·Hᵀ
//! χ²  = rᵀ·Σ⁻¹·r
//! ∇χ² = 2·Dᵀ·Σ⁻¹·V·Σ⁻¹·r
//! ∇²χ² = 2·Dᵀ·Σ⁻¹·V·Σ⁻¹·D
//! ```
//!
//! The residual uses the smoothed parameters of a state when present, the filtered ones
//! otherwise.

use std::collections::HashMap;

use itertools::iproduct;
use nalgebra::{DMatrix, DVector};

use crate::{
    alignment::AlignmentMask,
    alignment_errors::AlignmentError,
    constants::{StateIndex, ALIGNMENT_PARAMETERS_SIZE, BOUND_PARAMETERS_SIZE},
    derivatives::DerivativeStrategies,
    geometry::{DetectorElement, GeometryContext, SurfaceId},
    global_covariance::GlobalTrackCovariance,
    trajectory::{FittedTrajectory, Measurement, TrackState},
};

/// The detector elements whose placement is aligned, with their global index.
///
/// The global index of an element is its position in the list given at construction; the
/// alignment parameters of element `i` occupy rows `6i..6i+6` of the global system.
#[derive(Debug)]
pub struct AlignableSurfaces<'a, E> {
    elements: Vec<&'a E>,
    index: HashMap<SurfaceId, usize>,
}

impl<'a, E: DetectorElement> AlignableSurfaces<'a, E> {
    /// Return
    /// ----------
    /// * [`AlignmentError::InconsistentInput`] if two elements carry the same surface.
    pub fn new(elements: &[&'a E]) -> Result<Self, AlignmentError> {
        let mut index = HashMap::with_capacity(elements.len());
        for (i, element) in elements.iter().enumerate() {
            let surface = element.surface_id();
            if index.insert(surface, i).is_some() {
                return Err(AlignmentError::InconsistentInput(format!(
                    "surface {surface} is listed twice among the aligned elements"
                )));
            }
        }
        Ok(AlignableSurfaces {
            elements: elements.to_vec(),
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of alignment parameters of the global system.
    pub fn alignment_dof(&self) -> usize {
        self.elements.len() * ALIGNMENT_PARAMETERS_SIZE
    }

    pub fn global_index(&self, surface: SurfaceId) -> Option<usize> {
        self.index.get(&surface).copied()
    }

    pub fn element(&self, global_index: usize) -> Option<&'a E> {
        self.elements.get(global_index).copied()
    }

    pub fn elements(&self) -> &[&'a E] {
        &self.elements
    }
}

/// Alignment information extracted from one fitted track.
///
/// A state with `alignment_dof == 0` means the track touches no alignable surface and
/// contributes nothing to the global system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackAlignmentState {
    pub measurement_covariance: DMatrix<f64>,
    pub track_parameters_covariance: DMatrix<f64>,
    pub projection_matrix: DMatrix<f64>,
    pub residual: DVector<f64>,
    pub residual_covariance: DMatrix<f64>,
    pub chi2: f64,
    pub alignment_to_residual_derivative: DMatrix<f64>,
    pub alignment_to_chi2_derivative: DVector<f64>,
    pub alignment_to_chi2_second_derivative: DMatrix<f64>,
    /// Surface → (global index, index local to this track).
    pub aligned_surfaces: HashMap<SurfaceId, (usize, usize)>,
    pub measurement_dim: usize,
    pub track_parameters_dim: usize,
    pub alignment_dof: usize,
}

impl TrackAlignmentState {
    pub fn has_alignment_dof(&self) -> bool {
        self.alignment_dof > 0
    }

    /// Chi-square per measurement degree of freedom.
    pub fn chi2_ondf(&self) -> f64 {
        self.chi2 / self.measurement_dim as f64
    }
}

struct MeasuredState<'t> {
    index: StateIndex,
    state: &'t TrackState,
    measurement: &'t Measurement,
    global_surface: Option<usize>,
}

/// Build the alignment state of one fitted track.
///
/// Arguments
/// -----------------
/// * `gctx`: geometry context the current placements are read in.
/// * `trajectory`: fitted track, states in chronological order.
/// * `global_covariance`: covariance of all smoothed states of `trajectory`.
/// * `surfaces`: aligned detector elements and their global indices.
/// * `derivatives`: residual derivative strategies per surface kind.
/// * `mask`: alignment parameters free in this iteration.
///
/// Return
/// ----------
/// * The filled [`TrackAlignmentState`], or one with `alignment_dof == 0` if no measured
///   state lies on an alignable surface.
/// * [`AlignmentError::MissingCovarianceBlock`] if a measurement state has no block in
///   `global_covariance`.
/// * [`AlignmentError::SingularMeasurementCovariance`] if a measurement covariance is not
///   positive definite.
/// * [`AlignmentError::InvalidMeasurement`] if a measured state carries no fitted
///   parameters.
pub fn track_alignment_state<E: DetectorElement>(
    gctx: &GeometryContext,
    trajectory: &FittedTrajectory,
    global_covariance: &GlobalTrackCovariance,
    surfaces: &AlignableSurfaces<'_, E>,
    derivatives: &DerivativeStrategies,
    mask: &AlignmentMask,
) -> Result<TrackAlignmentState, AlignmentError> {
    let mut measured: Vec<MeasuredState<'_>> = trajectory
        .visit_backwards()
        .filter_map(|(index, state)| {
            state.measurement.as_ref().map(|measurement| MeasuredState {
                index,
                state,
                measurement,
                global_surface: surfaces.global_index(state.reference_surface),
            })
        })
        .collect();

    let measurement_dim: usize = measured.iter().map(|ms| ms.measurement.dim()).sum();
    let track_parameters_dim = measured.len() * BOUND_PARAMETERS_SIZE;

    if measured.iter().all(|ms| ms.global_surface.is_none()) {
        return Ok(TrackAlignmentState {
            measurement_dim,
            track_parameters_dim,
            ..Default::default()
        });
    }

    measured.reverse();

    let mut aligned_surfaces: HashMap<SurfaceId, (usize, usize)> = HashMap::new();
    for ms in &measured {
        if let Some(global) = ms.global_surface {
            let local = aligned_surfaces.len();
            aligned_surfaces
                .entry(ms.state.reference_surface)
                .or_insert((global, local));
        }
    }
    let alignment_dof = aligned_surfaces.len() * ALIGNMENT_PARAMETERS_SIZE;

    let mut measurement_covariance = DMatrix::zeros(measurement_dim, measurement_dim);
    let mut measurement_covariance_inverse = DMatrix::zeros(measurement_dim, measurement_dim);
    let mut projection_matrix = DMatrix::zeros(measurement_dim, track_parameters_dim);
    let mut residual = DVector::zeros(measurement_dim);
    let mut alignment_to_residual_derivative = DMatrix::zeros(measurement_dim, alignment_dof);
    let mut chi2 = 0.0;

    let mut row = 0;
    for (k, ms) in measured.iter().enumerate() {
        let dim = ms.measurement.dim();
        let col = k * BOUND_PARAMETERS_SIZE;
        let parameters = ms.state.estimated_parameters().ok_or_else(|| {
            AlignmentError::InvalidMeasurement(format!(
                "measurement state {} carries no fitted parameters",
                ms.index
            ))
        })?;

        let covariance = ms.measurement.covariance();
        let cholesky = covariance
            .clone()
            .cholesky()
            .ok_or(AlignmentError::SingularMeasurementCovariance { state: ms.index })?;
        let segment = ms.measurement.values() - ms.measurement.projector() * parameters;
        let whitened = cholesky
            .l()
            .solve_lower_triangular(&segment)
            .ok_or(AlignmentError::SingularMeasurementCovariance { state: ms.index })?;
        chi2 += whitened.norm_squared();

        measurement_covariance
            .view_mut((row, row), (dim, dim))
            .copy_from(covariance);
        measurement_covariance_inverse
            .view_mut((row, row), (dim, dim))
            .copy_from(&cholesky.inverse());
        projection_matrix
            .view_mut((row, col), (dim, BOUND_PARAMETERS_SIZE))
            .copy_from(ms.measurement.projector());
        residual.rows_mut(row, dim).copy_from(&segment);

        if let Some((_, local)) = aligned_surfaces.get(&ms.state.reference_surface) {
            if let Some(element) = ms.global_surface.and_then(|g| surfaces.element(g)) {
                let derivative = derivatives.residual_derivative(
                    element.surface_kind(),
                    &element.transform(gctx),
                    parameters,
                    ms.measurement.projector(),
                    mask,
                );
                alignment_to_residual_derivative
                    .view_mut(
                        (row, local * ALIGNMENT_PARAMETERS_SIZE),
                        (dim, ALIGNMENT_PARAMETERS_SIZE),
                    )
                    .copy_from(&derivative);
            }
        }

        row += dim;
    }

    let mut track_parameters_covariance =
        DMatrix::zeros(track_parameters_dim, track_parameters_dim);
    for ((a, row_state), (b, col_state)) in
        iproduct!(measured.iter().enumerate(), measured.iter().enumerate())
    {
        let block = global_covariance.block(row_state.index, col_state.index)?;
        track_parameters_covariance
            .fixed_view_mut::<BOUND_PARAMETERS_SIZE, BOUND_PARAMETERS_SIZE>(
                a * BOUND_PARAMETERS_SIZE,
                b * BOUND_PARAMETERS_SIZE,
            )
            .copy_from(&block);
    }

    let residual_covariance = &measurement_covariance
        - &projection_matrix * &track_parameters_covariance * projection_matrix.transpose();

    let weight =
        &measurement_covariance_inverse * &residual_covariance * &measurement_covariance_inverse;
    let derivative_t = alignment_to_residual_derivative.transpose();
    let alignment_to_chi2_derivative = (&derivative_t * &weight * &residual) * 2.0;
    let alignment_to_chi2_second_derivative =
        (&derivative_t * &weight * &alignment_to_residual_derivative) * 2.0;

    Ok(TrackAlignmentState {
        measurement_covariance,
        track_parameters_covariance,
        projection_matrix,
        residual,
        residual_covariance,
        chi2,
        alignment_to_residual_derivative,
        alignment_to_chi2_derivative,
        alignment_to_chi2_second_derivative,
        aligned_surfaces,
        measurement_dim,
        track_parameters_dim,
        alignment_dof,
    })
}
