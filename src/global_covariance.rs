//! # Global track-parameter covariance
//!
//! The per-track alignment state needs the covariance of the smoothed parameters of all
//! measurement states **including their correlations**. This module defines the shape of
//! that object ([`GlobalTrackCovariance`]), the service seam that produces it
//! ([`GlobalCovarianceProvider`]) and a default provider built from the smoother gains of the
//! trajectory ([`SmoothedGainCovariance`]).
//!
//! ## Layout
//!
//! The matrix is square with `BOUND_PARAMETERS_SIZE` rows per smoothed state. The row/column
//! offset of each state is looked up through [`GlobalTrackCovariance::offset`], keyed by the
//! state index inside the trajectory.
//!
//! ## Smoother-gain correlations
//!
//! For a Rauch–Tung–Striebel smoother with gains `A_k`, the covariance between the smoothed
//! states `i < j` is
//!
//! ```text
//! Cov(x_i, x_j) = A_i · A_{i+1} · … · A_{j-1} · P_j
//! ```
//!
//! where `P_j` is the smoothed covariance of state `j`. A missing gain breaks the chain: the
//! states on either side are treated as uncorrelated.

use std::collections::HashMap;

use nalgebra::DMatrix;

use crate::{
    alignment_errors::AlignmentError,
    constants::{BoundMatrix, StateIndex, BOUND_PARAMETERS_SIZE},
    trajectory::FittedTrajectory,
};

/// Covariance of all smoothed states of one trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalTrackCovariance {
    matrix: DMatrix<f64>,
    state_offsets: HashMap<StateIndex, usize>,
}

impl GlobalTrackCovariance {
    /// Wrap a precomputed matrix and its state → row/column offset map.
    ///
    /// Return
    /// ----------
    /// * [`AlignmentError::InconsistentInput`] if the matrix is not square or an offset
    ///   points outside of it.
    pub fn new(
        matrix: DMatrix<f64>,
        state_offsets: HashMap<StateIndex, usize>,
    ) -> Result<Self, AlignmentError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(AlignmentError::InconsistentInput(format!(
                "global covariance is {}x{}, expected a square matrix",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if let Some((state, offset)) = state_offsets
            .iter()
            .find(|(_, &offset)| offset + BOUND_PARAMETERS_SIZE > matrix.nrows())
        {
            return Err(AlignmentError::InconsistentInput(format!(
                "offset {offset} of state {state} exceeds the global covariance size {}",
                matrix.nrows()
            )));
        }
        Ok(GlobalTrackCovariance {
            matrix,
            state_offsets,
        })
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Row/column offset of the block of `state`, if the state was smoothed.
    pub fn offset(&self, state: StateIndex) -> Option<usize> {
        self.state_offsets.get(&state).copied()
    }

    /// Number of smoothed states covered by the matrix.
    pub fn smoothed_states(&self) -> usize {
        self.state_offsets.len()
    }

    /// Correlation block between two smoothed states.
    pub fn block(
        &self,
        row_state: StateIndex,
        col_state: StateIndex,
    ) -> Result<BoundMatrix, AlignmentError> {
        let row = self
            .offset(row_state)
            .ok_or(AlignmentError::MissingCovarianceBlock { state: row_state })?;
        let col = self
            .offset(col_state)
            .ok_or(AlignmentError::MissingCovarianceBlock { state: col_state })?;

        Ok(self
            .matrix
            .fixed_view::<BOUND_PARAMETERS_SIZE, BOUND_PARAMETERS_SIZE>(row, col)
            .into_owned())
    }
}

/// Service computing the global smoothed covariance of a fitted trajectory.
pub trait GlobalCovarianceProvider: Sync {
    fn global_covariance(
        &self,
        trajectory: &FittedTrajectory,
    ) -> Result<GlobalTrackCovariance, AlignmentError>;
}

/// Global covariance rebuilt from the smoothed covariances and smoother gains stored on the
/// trajectory states.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothedGainCovariance;

impl GlobalCovarianceProvider for SmoothedGainCovariance {
    fn global_covariance(
        &self,
        trajectory: &FittedTrajectory,
    ) -> Result<GlobalTrackCovariance, AlignmentError> {
        let smoothed: Vec<_> = trajectory
            .states()
            .iter()
            .enumerate()
            .filter_map(|(index, ts)| ts.smoothed.as_ref().map(|s| (index, ts, &s.covariance)))
            .collect();

        let dim = smoothed.len() * BOUND_PARAMETERS_SIZE;
        let mut matrix = DMatrix::<f64>::zeros(dim, dim);
        let mut state_offsets = HashMap::with_capacity(smoothed.len());

        for (k, (index, _, covariance)) in smoothed.iter().enumerate() {
            let offset = k * BOUND_PARAMETERS_SIZE;
            state_offsets.insert(*index, offset);
            matrix
                .fixed_view_mut::<BOUND_PARAMETERS_SIZE, BOUND_PARAMETERS_SIZE>(offset, offset)
                .copy_from(*covariance);
        }

        for j in 1..smoothed.len() {
            let col = j * BOUND_PARAMETERS_SIZE;
            let mut cross: BoundMatrix = *smoothed[j].2;
            for i in (0..j).rev() {
                let Some(gain) = smoothed[i].1.smoother_gain.as_ref() else {
                    break;
                };
                cross = gain * cross;
                let row = i * BOUND_PARAMETERS_SIZE;
                matrix
                    .fixed_view_mut::<BOUND_PARAMETERS_SIZE, BOUND_PARAMETERS_SIZE>(row, col)
                    .copy_from(&cross);
                matrix
                    .fixed_view_mut::<BOUND_PARAMETERS_SIZE, BOUND_PARAMETERS_SIZE>(col, row)
                    .copy_from(&cross.transpose());
            }
        }

        GlobalTrackCovariance::new(matrix, state_offsets)
    }
}

#[cfg(test)]
mod global_covariance_test {
    use super::*;
    use crate::{
        constants::BoundVector,
        geometry::SurfaceId,
        trajectory::{BoundParameters, TrackState},
    };
    use approx::assert_relative_eq;

    fn smoothed_state(surface: u64, scale: f64) -> TrackState {
        TrackState::new(SurfaceId(surface)).with_smoothed(BoundParameters::new(
            BoundVector::zeros(),
            BoundMatrix::identity() * scale,
        ))
    }

    #[test]
    fn test_block_diagonal_without_gains() {
        let trajectory = FittedTrajectory::new(vec![
            smoothed_state(1, 1.0),
            TrackState::new(SurfaceId(2)),
            smoothed_state(3, 2.0),
        ]);
        let global = SmoothedGainCovariance.global_covariance(&trajectory).unwrap();

        assert_eq!(global.matrix().nrows(), 12);
        assert_eq!(global.smoothed_states(), 2);
        assert_eq!(global.offset(0), Some(0));
        assert_eq!(global.offset(1), None);
        assert_eq!(global.offset(2), Some(6));

        assert_relative_eq!(global.block(2, 2).unwrap(), BoundMatrix::identity() * 2.0);
        assert_relative_eq!(global.block(0, 2).unwrap(), BoundMatrix::zeros());
        assert_eq!(
            global.block(1, 0),
            Err(AlignmentError::MissingCovarianceBlock { state: 1 })
        );
    }

    #[test]
    fn test_gain_chain_correlations() {
        let a0 = BoundMatrix::identity() * 0.5;
        let a1 = BoundMatrix::identity() * 0.25;
        let trajectory = FittedTrajectory::new(vec![
            smoothed_state(1, 1.0).with_smoother_gain(a0),
            smoothed_state(2, 1.0).with_smoother_gain(a1),
            smoothed_state(3, 4.0),
        ]);
        let global = SmoothedGainCovariance.global_covariance(&trajectory).unwrap();

        // Cov(1, 2) = A1 · P2, Cov(0, 2) = A0 · A1 · P2, Cov(0, 1) = A0 · P1
        assert_relative_eq!(global.block(1, 2).unwrap(), BoundMatrix::identity() * 1.0);
        assert_relative_eq!(global.block(0, 2).unwrap(), BoundMatrix::identity() * 0.5);
        assert_relative_eq!(global.block(0, 1).unwrap(), BoundMatrix::identity() * 0.5);
        assert_relative_eq!(
            global.block(2, 0).unwrap(),
            global.block(0, 2).unwrap().transpose()
        );
        assert_relative_eq!(global.matrix().clone(), global.matrix().transpose());
    }

    #[test]
    fn test_missing_gain_breaks_chain() {
        let trajectory = FittedTrajectory::new(vec![
            smoothed_state(1, 1.0).with_smoother_gain(BoundMatrix::identity()),
            smoothed_state(2, 1.0),
            smoothed_state(3, 1.0),
        ]);
        let global = SmoothedGainCovariance.global_covariance(&trajectory).unwrap();

        assert_relative_eq!(global.block(0, 1).unwrap(), BoundMatrix::identity());
        assert_relative_eq!(global.block(1, 2).unwrap(), BoundMatrix::zeros());
        assert_relative_eq!(global.block(0, 2).unwrap(), BoundMatrix::zeros());
    }

    #[test]
    fn test_new_rejects_out_of_range_offset() {
        let offsets = HashMap::from([(0, 0), (1, 6)]);
        let err = GlobalTrackCovariance::new(DMatrix::zeros(6, 6), offsets).unwrap_err();
        assert!(matches!(err, AlignmentError::InconsistentInput(_)));
    }
}
