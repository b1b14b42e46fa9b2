//! # Alignment engine
//!
//! [`Alignment`] drives the fit → evaluate → accumulate → solve → update loop.
//!
//! It owns the collaborators that stay fixed during a run:
//!
//! * the [`TrackFitter`] refitting every track against the current geometry,
//! * the [`GlobalCovarianceProvider`] ([`SmoothedGainCovariance`] unless replaced),
//! * the [`DerivativeStrategies`] selecting the residual derivative per surface kind,
//! * the [`AlignmentObserver`] receiving the run events ([`TracingObserver`] unless
//!   replaced).
//!
//! The detector itself is only borrowed through [`AlignmentOptions`].
//!
//! ## Track failures
//!
//! A track whose fit or evaluation fails with a track-local error (see
//! [`AlignmentError::is_track_local`]) is skipped; a track touching no alignable surface
//! contributes nothing. Both are reported to the observer. Any other error aborts the run.
//!
//! ## Parallel evaluation
//!
//! With [`AlignmentConfig::parallel_tracks`](super::AlignmentConfig::parallel_tracks) the
//! tracks of an iteration are fitted and evaluated on the rayon thread pool. The states are
//! collected in track order and accumulated in a single serial pass, so the result does not
//! depend on the scheduling.

use std::sync::Arc;

use rayon::prelude::*;

use crate::{
    alignment::{
        AlignmentMask, AlignmentOptions, AlignmentResult, AlignmentStatus, SingularPolicy,
    },
    alignment_errors::AlignmentError,
    alignment_state::{track_alignment_state, AlignableSurfaces, TrackAlignmentState},
    constants::{AlignmentVector, ALIGNMENT_PARAMETERS_SIZE},
    convergence::ConvergenceCheck,
    derivatives::DerivativeStrategies,
    fitter::TrackFitter,
    geometry::{DetectorElement, GeometryContext},
    global_covariance::{GlobalCovarianceProvider, SmoothedGainCovariance},
    normal_equations::NormalEquations,
    observer::{AlignmentEvent, AlignmentObserver, TracingObserver},
    solver::{
        commit_alignment_delta, solve_normal_equations, AlignmentSolution, TransformUpdater,
    },
};

/// Iterative track-based alignment engine.
///
/// Generic over the track fitter `F` and the [`GlobalCovarianceProvider`] `C`. The engine is
/// stateless between runs: the geometry lives in the detector elements handed in through
/// [`AlignmentOptions`] and every run starts from their current placement.
pub struct Alignment<F, C = SmoothedGainCovariance> {
    fitter: F,
    covariance_provider: C,
    derivatives: DerivativeStrategies,
    observer: Arc<dyn AlignmentObserver>,
}

impl<F: TrackFitter> Alignment<F> {
    /// Engine with the default covariance provider, derivative strategies and observer.
    pub fn new(fitter: F) -> Self {
        Alignment {
            fitter,
            covariance_provider: SmoothedGainCovariance,
            derivatives: DerivativeStrategies::default(),
            observer: Arc::new(TracingObserver),
        }
    }
}

impl<F, C> Alignment<F, C>
where
    F: TrackFitter,
    C: GlobalCovarianceProvider,
{
    pub fn with_covariance_provider<P: GlobalCovarianceProvider>(
        self,
        covariance_provider: P,
    ) -> Alignment<F, P> {
        Alignment {
            fitter: self.fitter,
            covariance_provider,
            derivatives: self.derivatives,
            observer: self.observer,
        }
    }

    pub fn with_derivatives(mut self, derivatives: DerivativeStrategies) -> Self {
        self.derivatives = derivatives;
        self
    }

    pub fn with_observer(mut self, observer: impl AlignmentObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn fitter(&self) -> &F {
        &self.fitter
    }

    /// Fit one track and build its alignment state.
    ///
    /// Arguments
    /// -----------------
    /// * `gctx`: geometry context of the current placements.
    /// * `source_links`: measurements of the track.
    /// * `start_parameters`: starting estimate handed to the fitter.
    /// * `fit_options`: options handed to the fitter.
    /// * `surfaces`: aligned surfaces.
    /// * `mask`: free alignment parameters.
    ///
    /// Return
    /// ----------
    /// * The alignment state of the track.
    /// * [`AlignmentError::FitFailure`] if the fit failed.
    /// * [`AlignmentError::NoAlignmentDofOnTrack`] if the track touches no aligned surface.
    pub fn evaluate_track_alignment_state<E: DetectorElement>(
        &self,
        gctx: &GeometryContext,
        source_links: &[F::SourceLink],
        start_parameters: &F::StartParameters,
        fit_options: &F::Options,
        surfaces: &AlignableSurfaces<'_, E>,
        mask: &AlignmentMask,
    ) -> Result<TrackAlignmentState, AlignmentError> {
        let trajectory = self
            .fitter
            .fit(source_links, start_parameters, fit_options)?;
        let global_covariance = self.covariance_provider.global_covariance(&trajectory)?;
        let state = track_alignment_state(
            gctx,
            &trajectory,
            &global_covariance,
            surfaces,
            &self.derivatives,
            mask,
        )?;

        if !state.has_alignment_dof() {
            return Err(AlignmentError::NoAlignmentDofOnTrack);
        }
        Ok(state)
    }

    /// Run one iteration: evaluate every track, solve the normal equations and commit the
    /// correction.
    ///
    /// `result` receives the correction, its covariance and the chi-square summary of the
    /// iteration.
    ///
    /// Return
    /// ----------
    /// * [`AlignmentError::NoContributingTracks`] if no track could be used.
    /// * [`AlignmentError::SingularSystem`] if the system cannot be solved and the policy is
    ///   [`SingularPolicy::Abort`].
    /// * [`AlignmentError::ParameterUpdateFailure`] if the updater rejected a placement.
    /// * [`AlignmentError::RollbackFailure`] if the updater also rejected restoring the
    ///   placements written before the failure.
    ///
    /// With [`SingularPolicy::SkipUpdate`], a singular iteration leaves the geometry alone,
    /// is appended to `result.singular_iterations` and reports a NaN covariance.
    pub fn update_alignment_parameters<E, U>(
        &self,
        track_collection: &[Vec<F::SourceLink>],
        start_parameters: &[F::StartParameters],
        options: &AlignmentOptions<'_, E, U, F::Options>,
        surfaces: &AlignableSurfaces<'_, E>,
        iteration: usize,
        result: &mut AlignmentResult,
    ) -> Result<(), AlignmentError>
    where
        E: DetectorElement + Sync,
        U: TransformUpdater<E>,
    {
        check_track_inputs(track_collection, start_parameters)?;

        let gctx = &options.geometry_context;
        let fit_options = &options.fit_options;
        let mask = options.config.mask_for(iteration);
        self.observer
            .on_event(&AlignmentEvent::IterationStarted { iteration, mask });

        let evaluate = |source_links: &Vec<F::SourceLink>, start: &F::StartParameters| {
            self.evaluate_track_alignment_state(
                gctx,
                source_links,
                start,
                fit_options,
                surfaces,
                &mask,
            )
        };
        let states: Vec<Result<TrackAlignmentState, AlignmentError>> =
            if options.config.parallel_tracks {
                track_collection
                    .par_iter()
                    .zip(start_parameters.par_iter())
                    .map(|(source_links, start)| evaluate(source_links, start))
                    .collect()
            } else {
                track_collection
                    .iter()
                    .zip(start_parameters.iter())
                    .map(|(source_links, start)| evaluate(source_links, start))
                    .collect()
            };

        let mut equations = NormalEquations::new(surfaces.len());
        for (track, state) in states.into_iter().enumerate() {
            match state {
                Ok(state) => {
                    equations.add_track(&state);
                }
                Err(AlignmentError::NoAlignmentDofOnTrack) => {
                    self.observer
                        .on_event(&AlignmentEvent::TrackWithoutAlignmentDof { track });
                }
                Err(error) if error.is_track_local() => {
                    self.observer
                        .on_event(&AlignmentEvent::TrackSkipped { track, error });
                }
                Err(error) => return Err(error),
            }
        }

        let average_chi2_ondf = equations
            .average_chi2_ondf()
            .ok_or(AlignmentError::NoContributingTracks)?;

        let solution =
            match solve_normal_equations(equations.gradient(), equations.hessian(), &mask) {
                Ok(solution) => Some(solution),
                Err(AlignmentError::SingularSystem) => {
                    self.observer
                        .on_event(&AlignmentEvent::SingularSystem { iteration });
                    match options.config.singular_policy {
                        SingularPolicy::Abort => return Err(AlignmentError::SingularSystem),
                        SingularPolicy::SkipUpdate => None,
                    }
                }
                Err(error) => return Err(error),
            };

        let solution = match solution {
            Some(solution) => {
                if solution.condition_estimate > options.config.max_condition_number {
                    self.observer.on_event(&AlignmentEvent::IllConditionedSystem {
                        iteration,
                        condition: solution.condition_estimate,
                    });
                }
                self.commit(gctx, surfaces, &solution, &options.updater, iteration)?;
                solution
            }
            None => {
                result.singular_iterations.push(iteration);
                AlignmentSolution::unsolved(equations.alignment_dof())
            }
        };

        result.delta_alignment_parameters = solution.delta;
        result.alignment_covariance = solution.covariance;
        result.delta_chi2 = solution.delta_chi2;
        result.condition_estimate = solution.condition_estimate;
        result.chi2 = equations.chi2();
        result.average_chi2_ondf = average_chi2_ondf;
        result.measurement_dim = equations.measurement_dim();
        result.alignment_dof = equations.alignment_dof();
        result.num_tracks = equations.num_tracks();

        self.observer.on_event(&AlignmentEvent::IterationFinished {
            iteration,
            num_tracks: result.num_tracks,
            average_chi2_ondf,
            delta_chi2: result.delta_chi2,
        });
        Ok(())
    }

    fn commit<E, U>(
        &self,
        gctx: &GeometryContext,
        surfaces: &AlignableSurfaces<'_, E>,
        solution: &AlignmentSolution,
        updater: &U,
        iteration: usize,
    ) -> Result<(), AlignmentError>
    where
        E: DetectorElement,
        U: TransformUpdater<E>,
    {
        match commit_alignment_delta(gctx, surfaces, &solution.delta, updater) {
            Ok(committed) => {
                for (i, (surface, _)) in committed.into_iter().enumerate() {
                    let delta: AlignmentVector = solution
                        .delta
                        .fixed_rows::<ALIGNMENT_PARAMETERS_SIZE>(i * ALIGNMENT_PARAMETERS_SIZE)
                        .into_owned();
                    self.observer
                        .on_event(&AlignmentEvent::SurfaceUpdated { surface, delta });
                }
                Ok(())
            }
            Err(error) => {
                self.observer.on_event(&AlignmentEvent::UpdateFailed {
                    iteration,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Align the detector with a set of tracks.
    ///
    /// Iterates until the average chi-square per degree of freedom reaches the configured
    /// cutoff, plateaus, or the maximum number of iterations is spent. At the end, the
    /// placement of every aligned element is recorded in
    /// [`AlignmentResult::aligned_parameters`].
    ///
    /// Iterations skipped on a singular system are not checked for convergence, so a run
    /// that never solved its system ends [`AlignmentStatus::Exhausted`].
    ///
    /// Arguments
    /// -----------------
    /// * `track_collection`: source links of every track.
    /// * `start_parameters`: starting estimate of every track, same order.
    /// * `options`: fit options, geometry, updater, aligned elements and configuration.
    ///
    /// Return
    /// ----------
    /// * The result of the run, [`AlignmentStatus::Converged`] or
    ///   [`AlignmentStatus::Exhausted`].
    /// * An error if an iteration failed; the geometry then keeps the placements committed
    ///   by the earlier iterations.
    ///
    /// See also
    /// -----------------
    /// * [`Alignment::update_alignment_parameters`] – one iteration.
    /// * [`AlignmentResult::into_result`] – treat an exhausted run as an error.
    pub fn align<E, U>(
        &self,
        track_collection: &[Vec<F::SourceLink>],
        start_parameters: &[F::StartParameters],
        options: &AlignmentOptions<'_, E, U, F::Options>,
    ) -> Result<AlignmentResult, AlignmentError>
    where
        E: DetectorElement + Sync,
        U: TransformUpdater<E>,
    {
        let config = &options.config;
        config.validate()?;
        check_track_inputs(track_collection, start_parameters)?;
        let surfaces = AlignableSurfaces::new(&options.aligned_elements)?;

        let mut result = AlignmentResult::new(surfaces.alignment_dof());
        let mut convergence =
            ConvergenceCheck::new(config.chi2_ondf_cutoff, config.delta_chi2_ondf_cutoff);

        for iteration in 0..config.max_iterations {
            result.status = AlignmentStatus::Running { iteration };
            self.update_alignment_parameters(
                track_collection,
                start_parameters,
                options,
                &surfaces,
                iteration,
                &mut result,
            )?;
            result.iterations = iteration + 1;

            // Nothing moved, so the chi-square says nothing about convergence
            if result.singular_iterations.last() == Some(&iteration) {
                continue;
            }
            if let Some(criterion) = convergence.check(result.average_chi2_ondf) {
                result.status = AlignmentStatus::Converged {
                    iteration,
                    criterion,
                };
                self.observer.on_event(&AlignmentEvent::Converged {
                    iteration,
                    criterion,
                });
                break;
            }
        }

        if let AlignmentStatus::Running { .. } = result.status {
            result.status = AlignmentStatus::Exhausted {
                iterations: config.max_iterations,
            };
            self.observer.on_event(&AlignmentEvent::Exhausted {
                iterations: config.max_iterations,
            });
        }

        let gctx = &options.geometry_context;
        for element in surfaces.elements() {
            let surface = element.surface_id();
            let transform = element.transform(gctx);
            result.aligned_parameters.insert(surface, transform);
            self.observer
                .on_event(&AlignmentEvent::AlignedPlacement { surface, transform });
        }

        Ok(result)
    }
}

fn check_track_inputs<L, S>(
    track_collection: &[L],
    start_parameters: &[S],
) -> Result<(), AlignmentError> {
    if track_collection.len() != start_parameters.len() {
        return Err(AlignmentError::InconsistentInput(format!(
            "{} tracks but {} start parameters",
            track_collection.len(),
            start_parameters.len()
        )));
    }
    Ok(())
}
