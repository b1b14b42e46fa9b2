//! # Alignment result
//!
//! [`AlignmentResult`] is created once per run, updated in place after every iteration and
//! returned to the caller when the run terminates. [`AlignmentStatus`] tells a converged run
//! from an exhausted one; running out of iterations is not an error, the last computed
//! parameters are still returned.

use std::{collections::HashMap, fmt};

use nalgebra::{DMatrix, DVector, Isometry3};

use crate::{
    alignment_errors::AlignmentError, convergence::ConvergenceCriterion, geometry::SurfaceId,
};

/// Outcome of an alignment run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlignmentStatus {
    /// The run has not terminated; `iteration` is the iteration in progress.
    Running { iteration: usize },
    Converged {
        iteration: usize,
        criterion: ConvergenceCriterion,
    },
    /// The maximum number of iterations was reached without convergence.
    Exhausted { iterations: usize },
}

impl fmt::Display for AlignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentStatus::Running { iteration } => write!(f, "running (iteration {iteration})"),
            AlignmentStatus::Converged {
                iteration,
                criterion,
            } => write!(f, "converged at iteration {iteration} ({criterion})"),
            AlignmentStatus::Exhausted { iterations } => {
                write!(f, "not converged after {iterations} iterations")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentResult {
    /// Correction computed by the last iteration, 6 parameters per aligned surface.
    pub delta_alignment_parameters: DVector<f64>,
    /// Placement of every aligned surface, filled when the run terminates.
    pub aligned_parameters: HashMap<SurfaceId, Isometry3<f64>>,
    /// `2 · H⁻¹` of the last iteration, NaN if its system could not be solved.
    pub alignment_covariance: DMatrix<f64>,
    pub chi2: f64,
    pub delta_chi2: f64,
    pub average_chi2_ondf: f64,
    /// Pivot ratio of the last solved system, infinite if it could not be solved.
    pub condition_estimate: f64,
    pub measurement_dim: usize,
    pub alignment_dof: usize,
    /// Tracks that contributed to the last iteration.
    pub num_tracks: usize,
    /// Completed iterations.
    pub iterations: usize,
    /// Iterations whose singular system was skipped, in order.
    pub singular_iterations: Vec<usize>,
    pub status: AlignmentStatus,
}

impl AlignmentResult {
    /// Empty result for a system of `alignment_dof` parameters.
    pub fn new(alignment_dof: usize) -> Self {
        AlignmentResult {
            delta_alignment_parameters: DVector::zeros(alignment_dof),
            aligned_parameters: HashMap::new(),
            alignment_covariance: DMatrix::zeros(alignment_dof, alignment_dof),
            chi2: 0.0,
            delta_chi2: 0.0,
            average_chi2_ondf: 0.0,
            condition_estimate: 1.0,
            measurement_dim: 0,
            alignment_dof,
            num_tracks: 0,
            iterations: 0,
            singular_iterations: Vec::new(),
            status: AlignmentStatus::Running { iteration: 0 },
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self.status, AlignmentStatus::Converged { .. })
    }

    /// Turn an exhausted run into [`AlignmentError::ConvergenceFailure`].
    pub fn into_result(self) -> Result<AlignmentResult, AlignmentError> {
        match self.status {
            AlignmentStatus::Exhausted { iterations } => {
                Err(AlignmentError::ConvergenceFailure { iterations })
            }
            _ => Ok(self),
        }
    }
}
