use thiserror::Error;

use crate::constants::StateIndex;
use crate::geometry::SurfaceId;

/// Failure reported by the external track fit service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("No measurements provided to the fit")]
    NoMeasurements,

    #[error("Propagation to surface {0} failed")]
    PropagationFailed(SurfaceId),

    #[error("Fit did not converge after {0} iterations")]
    NotConverged(usize),

    #[error("Track fit failed: {0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("Track fit failure: {0}")]
    FitFailure(#[from] FitError),

    #[error("No alignment degree of freedom on track")]
    NoAlignmentDofOnTrack,

    #[error("Chi2 second derivative matrix is singular; the alignment correction is not finite")]
    SingularSystem,

    #[error("Update of the aligned transform failed for surface {surface}")]
    ParameterUpdateFailure { surface: SurfaceId },

    /// The update of `surface` failed and the surfaces in `unrestored` kept their new placement.
    #[error("Update of the aligned transform failed for surface {surface}; surfaces {unrestored:?} could not be restored")]
    RollbackFailure {
        surface: SurfaceId,
        unrestored: Vec<SurfaceId>,
    },

    #[error("Alignment did not converge within {iterations} iterations")]
    ConvergenceFailure { iterations: usize },

    #[error("Measurement covariance of state {state} is not positive definite")]
    SingularMeasurementCovariance { state: StateIndex },

    #[error("Global track covariance has no block for smoothed state {state}")]
    MissingCovarianceBlock { state: StateIndex },

    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("Inconsistent alignment input: {0}")]
    InconsistentInput(String),

    #[error("No track contributed to the alignment")]
    NoContributingTracks,

    #[error("Invalid alignment configuration: {0}")]
    InvalidAlignmentConfig(String),

    #[error("Unable to parse the alignment configuration: {0}")]
    ConfigParsing(String),
}

impl From<serde_json::Error> for AlignmentError {
    fn from(err: serde_json::Error) -> Self {
        AlignmentError::ConfigParsing(err.to_string())
    }
}

impl AlignmentError {
    /// Return `true` for failures local to a single track.
    ///
    /// Such failures are skipped and reported by the iteration controller; every other
    /// variant aborts the current alignment run.
    pub fn is_track_local(&self) -> bool {
        matches!(
            self,
            AlignmentError::FitFailure(_)
                | AlignmentError::NoAlignmentDofOnTrack
                | AlignmentError::SingularMeasurementCovariance { .. }
                | AlignmentError::MissingCovarianceBlock { .. }
                | AlignmentError::InvalidMeasurement(_)
        )
    }
}
