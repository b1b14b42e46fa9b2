//! # Track fit service
//!
//! The alignment engine treats the track fit (Kalman filter, smoother, propagation and
//! navigation) as an external service. [`TrackFitter`] is the seam: given the
//! uncalibrated measurements of one track (its *source links*), a starting estimate and the
//! opaque fit options, it returns the [`FittedTrajectory`] or a [`FitError`].
//!
//! The fitter is expected to read the **current** detector placement on every call, so
//! that each alignment iteration refits the tracks against the geometry committed by the
//! previous one.
//!
//! The trait requires `Sync` so that tracks can be fitted concurrently when
//! [`AlignmentConfig::parallel_tracks`](crate::alignment::AlignmentConfig::parallel_tracks)
//! is enabled.

use crate::{alignment_errors::FitError, trajectory::FittedTrajectory};

pub trait TrackFitter: Sync {
    /// Uncalibrated measurement handle.
    type SourceLink: Sync;
    /// Starting estimate of the track parameters.
    type StartParameters: Sync;
    /// Options steering the fit, passed through untouched by the engine.
    type Options: Sync;

    /// Fit one track.
    fn fit(
        &self,
        source_links: &[Self::SourceLink],
        start_parameters: &Self::StartParameters,
        options: &Self::Options,
    ) -> Result<FittedTrajectory, FitError>;
}

impl<T: TrackFitter> TrackFitter for &T {
    type SourceLink = T::SourceLink;
    type StartParameters = T::StartParameters;
    type Options = T::Options;

    fn fit(
        &self,
        source_links: &[Self::SourceLink],
        start_parameters: &Self::StartParameters,
        options: &Self::Options,
    ) -> Result<FittedTrajectory, FitError> {
        (**self).fit(source_links, start_parameters, options)
    }
}
