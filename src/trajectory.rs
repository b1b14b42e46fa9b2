//! # Fitted trajectories
//!
//! Data model of the track-fit output consumed by the alignment engine.
//!
//! A [`FittedTrajectory`] is an ordered (chronological) list of [`TrackState`]s. Each state
//! lives on a reference surface and may carry:
//!
//! * a calibrated [`Measurement`] (value, covariance and projector onto the bound
//!   parameters),
//! * filtered and/or smoothed bound parameters with their covariance,
//! * the smoother gain linking it to the next state, used to rebuild the correlations
//!   between smoothed states (see
//!   [`SmoothedGainCovariance`](crate::global_covariance::SmoothedGainCovariance)).
//!
//! The engine visits the states backwards, in smoothing order, through
//! [`FittedTrajectory::visit_backwards`].

use nalgebra::{DMatrix, DVector};

use crate::{
    alignment_errors::AlignmentError,
    constants::{
        BoundMatrix, BoundVector, StateIndex, BOUND_LOC_0, BOUND_LOC_1, BOUND_PARAMETERS_SIZE,
    },
    geometry::SurfaceId,
};

/// A calibrated measurement on a surface.
///
/// `projector` maps the full bound parameter vector onto the measurement space, so its shape
/// is `dim × BOUND_PARAMETERS_SIZE`.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    values: DVector<f64>,
    covariance: DMatrix<f64>,
    projector: DMatrix<f64>,
}

impl Measurement {
    /// Build a measurement, checking that values, covariance and projector agree on the
    /// measurement dimension.
    ///
    /// Arguments
    /// -----------------
    /// * `values`: measured values, length `d` with `1 ≤ d ≤ BOUND_PARAMETERS_SIZE`.
    /// * `covariance`: `d × d` covariance of the values.
    /// * `projector`: `d × BOUND_PARAMETERS_SIZE` projection from bound parameters.
    ///
    /// Return
    /// ----------
    /// * The measurement, or [`AlignmentError::InvalidMeasurement`] on a shape mismatch.
    pub fn new(
        values: DVector<f64>,
        covariance: DMatrix<f64>,
        projector: DMatrix<f64>,
    ) -> Result<Self, AlignmentError> {
        let dim = values.len();
        if dim == 0 || dim > BOUND_PARAMETERS_SIZE {
            return Err(AlignmentError::InvalidMeasurement(format!(
                "measurement dimension {dim} outside 1..={BOUND_PARAMETERS_SIZE}"
            )));
        }
        if covariance.shape() != (dim, dim) {
            return Err(AlignmentError::InvalidMeasurement(format!(
                "covariance shape {:?} does not match dimension {dim}",
                covariance.shape()
            )));
        }
        if projector.shape() != (dim, BOUND_PARAMETERS_SIZE) {
            return Err(AlignmentError::InvalidMeasurement(format!(
                "projector shape {:?} does not match {dim}x{BOUND_PARAMETERS_SIZE}",
                projector.shape()
            )));
        }
        Ok(Measurement {
            values,
            covariance,
            projector,
        })
    }

    /// Two-dimensional measurement of `(loc0, loc1)` with uncorrelated resolutions.
    pub fn local_2d(loc0: f64, loc1: f64, sigma0: f64, sigma1: f64) -> Self {
        let mut projector = DMatrix::zeros(2, BOUND_PARAMETERS_SIZE);
        projector[(0, BOUND_LOC_0)] = 1.0;
        projector[(1, BOUND_LOC_1)] = 1.0;

        Measurement {
            values: DVector::from_column_slice(&[loc0, loc1]),
            covariance: DMatrix::from_diagonal(&DVector::from_column_slice(&[
                sigma0 * sigma0,
                sigma1 * sigma1,
            ])),
            projector,
        }
    }

    /// One-dimensional measurement of `loc0` (strip-like).
    pub fn local_1d(loc0: f64, sigma0: f64) -> Self {
        let mut projector = DMatrix::zeros(1, BOUND_PARAMETERS_SIZE);
        projector[(0, BOUND_LOC_0)] = 1.0;

        Measurement {
            values: DVector::from_element(1, loc0),
            covariance: DMatrix::from_element(1, 1, sigma0 * sigma0),
            projector,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn projector(&self) -> &DMatrix<f64> {
        &self.projector
    }
}

/// Bound parameters with their covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameters {
    pub parameters: BoundVector,
    pub covariance: BoundMatrix,
}

impl BoundParameters {
    pub fn new(parameters: BoundVector, covariance: BoundMatrix) -> Self {
        BoundParameters {
            parameters,
            covariance,
        }
    }
}

/// One state of a fitted trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackState {
    pub reference_surface: SurfaceId,
    pub measurement: Option<Measurement>,
    pub filtered: Option<BoundParameters>,
    pub smoothed: Option<BoundParameters>,
    /// Smoother gain `A_k` relating this state to the next one in chronological order.
    pub smoother_gain: Option<BoundMatrix>,
}

impl TrackState {
    /// State on `surface` without any attached information.
    pub fn new(surface: SurfaceId) -> Self {
        TrackState {
            reference_surface: surface,
            measurement: None,
            filtered: None,
            smoothed: None,
            smoother_gain: None,
        }
    }

    pub fn with_measurement(mut self, measurement: Measurement) -> Self {
        self.measurement = Some(measurement);
        self
    }

    pub fn with_filtered(mut self, filtered: BoundParameters) -> Self {
        self.filtered = Some(filtered);
        self
    }

    pub fn with_smoothed(mut self, smoothed: BoundParameters) -> Self {
        self.smoothed = Some(smoothed);
        self
    }

    pub fn with_smoother_gain(mut self, gain: BoundMatrix) -> Self {
        self.smoother_gain = Some(gain);
        self
    }

    pub fn has_measurement(&self) -> bool {
        self.measurement.is_some()
    }

    pub fn has_smoothed(&self) -> bool {
        self.smoothed.is_some()
    }

    /// Best available parameter estimate: smoothed if present, filtered otherwise.
    pub fn estimated_parameters(&self) -> Option<&BoundVector> {
        self.smoothed
            .as_ref()
            .or(self.filtered.as_ref())
            .map(|bound| &bound.parameters)
    }
}

/// Output of the track fit for one track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FittedTrajectory {
    states: Vec<TrackState>,
}

impl FittedTrajectory {
    /// Build a trajectory from states given in chronological order.
    pub fn new(states: Vec<TrackState>) -> Self {
        FittedTrajectory { states }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, index: StateIndex) -> Option<&TrackState> {
        self.states.get(index)
    }

    pub fn states(&self) -> &[TrackState] {
        &self.states
    }

    /// Iterate over `(index, state)` from the last state to the first.
    pub fn visit_backwards(&self) -> impl Iterator<Item = (StateIndex, &TrackState)> + '_ {
        self.states.iter().enumerate().rev()
    }

    /// Number of states carrying smoothed parameters.
    pub fn smoothed_states(&self) -> usize {
        self.states.iter().filter(|ts| ts.has_smoothed()).count()
    }

    /// Number of states carrying a measurement.
    pub fn measurement_states(&self) -> usize {
        self.states.iter().filter(|ts| ts.has_measurement()).count()
    }
}
