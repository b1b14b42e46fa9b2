//! # Alignment observability
//!
//! The engine reports what happens during a run by firing [`AlignmentEvent`]s into an
//! [`AlignmentObserver`]. It never logs by itself.
//!
//! * [`TracingObserver`] (default) turns events into structured `tracing` records.
//! * [`AlignmentCounters`] counts events with atomics, for metrics and tests.
//! * [`ObserverList`] fans an event out to several observers.
//!
//! Observers are shared with the per-track workers when tracks are evaluated in parallel,
//! hence the `Send + Sync` bound.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use nalgebra::{Isometry3, Vector3};
use tracing::{debug, error, info, trace, warn};

use crate::{
    alignment::AlignmentMask,
    alignment_errors::AlignmentError,
    constants::AlignmentVector,
    convergence::ConvergenceCriterion,
    geometry::{euler_angles_zyx, SurfaceId},
};

#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentEvent {
    IterationStarted {
        iteration: usize,
        mask: AlignmentMask,
    },
    /// A track failed to fit or evaluate and was left out of the iteration.
    TrackSkipped {
        track: usize,
        error: AlignmentError,
    },
    /// A track touched no alignable surface.
    TrackWithoutAlignmentDof {
        track: usize,
    },
    /// The normal equations could not be solved.
    SingularSystem {
        iteration: usize,
    },
    /// The normal equations were solved, but the pivot ratio exceeds the configured limit.
    IllConditionedSystem {
        iteration: usize,
        condition: f64,
    },
    SurfaceUpdated {
        surface: SurfaceId,
        delta: AlignmentVector,
    },
    UpdateFailed {
        iteration: usize,
        error: AlignmentError,
    },
    IterationFinished {
        iteration: usize,
        num_tracks: usize,
        average_chi2_ondf: f64,
        delta_chi2: f64,
    },
    Converged {
        iteration: usize,
        criterion: ConvergenceCriterion,
    },
    Exhausted {
        iterations: usize,
    },
    /// Placement of an aligned surface at the end of the run.
    AlignedPlacement {
        surface: SurfaceId,
        transform: Isometry3<f64>,
    },
}

pub trait AlignmentObserver: Send + Sync {
    fn on_event(&self, event: &AlignmentEvent);
}

impl<T: AlignmentObserver + ?Sized> AlignmentObserver for Arc<T> {
    fn on_event(&self, event: &AlignmentEvent) {
        (**self).on_event(event)
    }
}

/// Observer writing every event as a `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl AlignmentObserver for TracingObserver {
    fn on_event(&self, event: &AlignmentEvent) {
        match event {
            AlignmentEvent::IterationStarted { iteration, mask } => {
                debug!(iteration, mask = %mask, "Starting alignment iteration");
            }
            AlignmentEvent::TrackSkipped { track, error } => {
                warn!(track, error = %error, "Track skipped from the alignment");
            }
            AlignmentEvent::TrackWithoutAlignmentDof { track } => {
                debug!(track, "Track touches no alignable surface");
            }
            AlignmentEvent::SingularSystem { iteration } => {
                warn!(iteration, "Alignment normal equations are singular");
            }
            AlignmentEvent::IllConditionedSystem {
                iteration,
                condition,
            } => {
                warn!(
                    iteration,
                    condition,
                    "Alignment normal equations are ill-conditioned"
                );
            }
            AlignmentEvent::SurfaceUpdated { surface, delta } => {
                trace!(
                    surface = %surface,
                    delta = ?delta.as_slice(),
                    "Alignment correction applied"
                );
            }
            AlignmentEvent::UpdateFailed { iteration, error } => {
                error!(iteration, error = %error, "Alignment parameter update failed");
            }
            AlignmentEvent::IterationFinished {
                iteration,
                num_tracks,
                average_chi2_ondf,
                delta_chi2,
            } => {
                info!(
                    iteration,
                    num_tracks,
                    average_chi2_ondf,
                    delta_chi2,
                    "Alignment iteration finished"
                );
            }
            AlignmentEvent::Converged {
                iteration,
                criterion,
            } => {
                info!(iteration, criterion = %criterion, "Alignment converged");
            }
            AlignmentEvent::Exhausted { iterations } => {
                error!(
                    iterations,
                    "Alignment did not converge within the maximum number of iterations"
                );
            }
            AlignmentEvent::AlignedPlacement { surface, transform } => {
                let center: Vector3<f64> = transform.translation.vector;
                let angles = euler_angles_zyx(&transform.rotation);
                info!(
                    surface = %surface,
                    center_x = center.x,
                    center_y = center.y,
                    center_z = center.z,
                    rot_z = angles.x,
                    rot_y = angles.y,
                    rot_x = angles.z,
                    "Aligned surface placement"
                );
            }
        }
    }
}

/// Thread-safe event counters.
#[derive(Debug, Default)]
pub struct AlignmentCounters {
    iterations: AtomicUsize,
    skipped_tracks: AtomicUsize,
    tracks_without_dof: AtomicUsize,
    singular_systems: AtomicUsize,
    ill_conditioned_systems: AtomicUsize,
    surface_updates: AtomicUsize,
    update_failures: AtomicUsize,
    converged: AtomicUsize,
    exhausted: AtomicUsize,
}

impl AlignmentCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn skipped_tracks(&self) -> usize {
        self.skipped_tracks.load(Ordering::Relaxed)
    }

    pub fn tracks_without_dof(&self) -> usize {
        self.tracks_without_dof.load(Ordering::Relaxed)
    }

    pub fn singular_systems(&self) -> usize {
        self.singular_systems.load(Ordering::Relaxed)
    }

    pub fn ill_conditioned_systems(&self) -> usize {
        self.ill_conditioned_systems.load(Ordering::Relaxed)
    }

    pub fn surface_updates(&self) -> usize {
        self.surface_updates.load(Ordering::Relaxed)
    }

    pub fn update_failures(&self) -> usize {
        self.update_failures.load(Ordering::Relaxed)
    }

    pub fn converged(&self) -> usize {
        self.converged.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> usize {
        self.exhausted.load(Ordering::Relaxed)
    }
}

impl AlignmentObserver for AlignmentCounters {
    fn on_event(&self, event: &AlignmentEvent) {
        let counter = match event {
            AlignmentEvent::IterationStarted { .. } => &self.iterations,
            AlignmentEvent::TrackSkipped { .. } => &self.skipped_tracks,
            AlignmentEvent::TrackWithoutAlignmentDof { .. } => &self.tracks_without_dof,
            AlignmentEvent::SingularSystem { .. } => &self.singular_systems,
            AlignmentEvent::IllConditionedSystem { .. } => &self.ill_conditioned_systems,
            AlignmentEvent::SurfaceUpdated { .. } => &self.surface_updates,
            AlignmentEvent::UpdateFailed { .. } => &self.update_failures,
            AlignmentEvent::Converged { .. } => &self.converged,
            AlignmentEvent::Exhausted { .. } => &self.exhausted,
            AlignmentEvent::IterationFinished { .. } | AlignmentEvent::AlignedPlacement { .. } => {
                return
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Observer forwarding every event to each of its members, in order.
#[derive(Default, Clone)]
pub struct ObserverList {
    observers: Vec<Arc<dyn AlignmentObserver>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn AlignmentObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl AlignmentObserver for ObserverList {
    fn on_event(&self, event: &AlignmentEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
