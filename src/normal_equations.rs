//! # Global normal equations
//!
//! Accumulates the per-track chi-square derivatives into one gradient vector and one
//! Hessian matrix indexed by the global alignment parameters: the parameters of the
//! alignable surface with global index `i` occupy rows and columns `6i..6i+6`.
//!
//! Besides the derivatives, the accumulator keeps the running totals used by the
//! convergence checks: summed chi-square, summed measurement dimension, and the sum of the
//! per-track chi-square per degree of freedom together with the number of tracks that
//! contributed.

use itertools::iproduct;
use nalgebra::{DMatrix, DVector};

use crate::{alignment_state::TrackAlignmentState, constants::ALIGNMENT_PARAMETERS_SIZE};

#[derive(Debug, Clone, PartialEq)]
pub struct NormalEquations {
    gradient: DVector<f64>,
    hessian: DMatrix<f64>,
    chi2: f64,
    measurement_dim: usize,
    sum_chi2_ondf: f64,
    num_tracks: usize,
}

impl NormalEquations {
    /// Empty system for `n_surfaces` alignable surfaces.
    pub fn new(n_surfaces: usize) -> Self {
        let dof = n_surfaces * ALIGNMENT_PARAMETERS_SIZE;
        NormalEquations {
            gradient: DVector::zeros(dof),
            hessian: DMatrix::zeros(dof, dof),
            chi2: 0.0,
            measurement_dim: 0,
            sum_chi2_ondf: 0.0,
            num_tracks: 0,
        }
    }

    /// Scatter-add the contribution of one track.
    ///
    /// Return
    /// ----------
    /// * `false` if the track has no alignment degree of freedom and was ignored.
    pub fn add_track(&mut self, state: &TrackAlignmentState) -> bool {
        if !state.has_alignment_dof() {
            return false;
        }

        const N: usize = ALIGNMENT_PARAMETERS_SIZE;
        for &(global, local) in state.aligned_surfaces.values() {
            let mut segment = self.gradient.fixed_rows_mut::<N>(global * N);
            segment += state
                .alignment_to_chi2_derivative
                .fixed_rows::<N>(local * N);
        }
        for (&(row_global, row_local), &(col_global, col_local)) in iproduct!(
            state.aligned_surfaces.values(),
            state.aligned_surfaces.values()
        ) {
            let mut block = self
                .hessian
                .fixed_view_mut::<N, N>(row_global * N, col_global * N);
            block += state
                .alignment_to_chi2_second_derivative
                .fixed_view::<N, N>(row_local * N, col_local * N);
        }

        self.chi2 += state.chi2;
        self.measurement_dim += state.measurement_dim;
        self.sum_chi2_ondf += state.chi2_ondf();
        self.num_tracks += 1;
        true
    }

    pub fn gradient(&self) -> &DVector<f64> {
        &self.gradient
    }

    pub fn hessian(&self) -> &DMatrix<f64> {
        &self.hessian
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn measurement_dim(&self) -> usize {
        self.measurement_dim
    }

    pub fn sum_chi2_ondf(&self) -> f64 {
        self.sum_chi2_ondf
    }

    pub fn num_tracks(&self) -> usize {
        self.num_tracks
    }

    pub fn alignment_dof(&self) -> usize {
        self.gradient.len()
    }

    /// Mean of the per-track chi-square per degree of freedom, `None` before any track was
    /// added.
    pub fn average_chi2_ondf(&self) -> Option<f64> {
        (self.num_tracks > 0).then(|| self.sum_chi2_ondf / self.num_tracks as f64)
    }
}
