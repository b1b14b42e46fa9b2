//! # Detector alignment
//!
//! Iterative alignment of detector surfaces with fitted tracks.
//!
//! ## Overview
//!
//! Every iteration of [`Alignment::align`]:
//!
//! 1. selects the [`AlignmentMask`] of the iteration ([`AlignmentConfig::mask_for`]),
//! 2. refits every track against the current geometry and builds its
//!    [`TrackAlignmentState`](crate::alignment_state::TrackAlignmentState),
//! 3. accumulates the states into the global
//!    [`NormalEquations`](crate::normal_equations::NormalEquations),
//! 4. solves for the correction and commits it through the
//!    [`TransformUpdater`](crate::solver::TransformUpdater),
//! 5. checks convergence on the average chi-square per degree of freedom.
//!
//! The run ends [`Converged`](AlignmentStatus::Converged) or
//! [`Exhausted`](AlignmentStatus::Exhausted). Track-local failures are skipped and
//! reported through the [`AlignmentObserver`](crate::observer::AlignmentObserver); a failed
//! update or a singular system (with [`SingularPolicy::Abort`]) aborts the run.
//!
//! ## Configuration
//!
//! [`AlignmentConfig`] holds the run tunables. It is built with
//! [`AlignmentConfig::builder`] or read from JSON with [`AlignmentConfig::from_json_str`]:
//!
//! ```rust
//! use trackalign::alignment::{AlignmentConfig, AlignmentMask};
//!
//! let config = AlignmentConfig::from_json_str(
//!     r#"{
//!         "chi2_ondf_cutoff": 0.5,
//!         "max_iterations": 8,
//!         "iteration_masks": { "0": "111000", "1": "111000" }
//!     }"#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.mask_for(0), AlignmentMask::TRANSLATIONS);
//! assert_eq!(config.mask_for(2), AlignmentMask::ALL);
//! ```

use std::{
    cmp::Ordering::{Equal, Greater},
    collections::BTreeMap,
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::{alignment_errors::AlignmentError, geometry::GeometryContext};

pub mod alignment_mask;
pub mod alignment_result;
pub mod engine;

pub use alignment_mask::AlignmentMask;
pub use alignment_result::{AlignmentResult, AlignmentStatus};
pub use engine::Alignment;

/// What to do when the normal equations of an iteration cannot be solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SingularPolicy {
    /// Stop the run with [`AlignmentError::SingularSystem`].
    #[default]
    Abort,
    /// Leave the geometry untouched for this iteration and carry on.
    SkipUpdate,
}

/// Tunables of an alignment run.
///
/// Defaults
/// -----------------
/// * `chi2_ondf_cutoff`: 0.05
/// * `delta_chi2_ondf_cutoff`: (10, 1e-5)
/// * `max_iterations`: 5
/// * `iteration_masks`: empty, every parameter free
/// * `singular_policy`: [`SingularPolicy::Abort`]
/// * `parallel_tracks`: false
/// * `max_condition_number`: 1e10
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Average chi-square per degree of freedom at which the run is converged.
    pub chi2_ondf_cutoff: f64,
    /// Plateau detection: `(window, epsilon)`.
    pub delta_chi2_ondf_cutoff: (usize, f64),
    pub max_iterations: usize,
    /// Free parameters per iteration index; iterations not listed free every parameter.
    pub iteration_masks: BTreeMap<usize, AlignmentMask>,
    pub singular_policy: SingularPolicy,
    /// Fit and evaluate the tracks of an iteration on the rayon thread pool.
    pub parallel_tracks: bool,
    /// Condition estimate above which a solved system is reported as ill-conditioned.
    pub max_condition_number: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        AlignmentConfig {
            chi2_ondf_cutoff: 0.05,
            delta_chi2_ondf_cutoff: (10, 1e-5),
            max_iterations: 5,
            iteration_masks: BTreeMap::new(),
            singular_policy: SingularPolicy::Abort,
            parallel_tracks: false,
            max_condition_number: 1e10,
        }
    }
}

impl AlignmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> AlignmentConfigBuilder {
        AlignmentConfigBuilder::new()
    }

    /// Read a configuration from JSON; missing fields keep their default.
    ///
    /// Return
    /// ----------
    /// * [`AlignmentError::ConfigParsing`] on malformed JSON or mask strings.
    /// * [`AlignmentError::InvalidAlignmentConfig`] if a value fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, AlignmentError> {
        let config: AlignmentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Mask of iteration `iteration`.
    pub fn mask_for(&self, iteration: usize) -> AlignmentMask {
        self.iteration_masks
            .get(&iteration)
            .copied()
            .unwrap_or_default()
    }

    /// Check the invariants enforced by [`AlignmentConfigBuilder::build`].
    pub fn validate(&self) -> Result<(), AlignmentError> {
        if !ge0(self.chi2_ondf_cutoff) {
            return Err(AlignmentError::InvalidAlignmentConfig(
                "chi2_ondf_cutoff must be >= 0".into(),
            ));
        }
        let (window, epsilon) = self.delta_chi2_ondf_cutoff;
        if window == 0 {
            return Err(AlignmentError::InvalidAlignmentConfig(
                "plateau window must be >= 1".into(),
            ));
        }
        if !ge0(epsilon) {
            return Err(AlignmentError::InvalidAlignmentConfig(
                "plateau epsilon must be >= 0".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(AlignmentError::InvalidAlignmentConfig(
                "max_iterations must be >= 1".into(),
            ));
        }
        if !gt0(self.max_condition_number) {
            return Err(AlignmentError::InvalidAlignmentConfig(
                "max_condition_number must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Return true iff x >= 0.0 and comparable (i.e., not NaN).
#[inline]
fn ge0(x: f64) -> bool {
    matches!(x.partial_cmp(&0.0), Some(Greater) | Some(Equal))
}

#[inline]
fn gt0(x: f64) -> bool {
    matches!(x.partial_cmp(&0.0), Some(Greater))
}

impl fmt::Display for AlignmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Alignment configuration")?;
        writeln!(f, "  chi2_ondf_cutoff       = {}", self.chi2_ondf_cutoff)?;
        writeln!(
            f,
            "  delta_chi2_ondf_cutoff = ({}, {:e})",
            self.delta_chi2_ondf_cutoff.0, self.delta_chi2_ondf_cutoff.1
        )?;
        writeln!(f, "  max_iterations         = {}", self.max_iterations)?;
        for (iteration, mask) in &self.iteration_masks {
            writeln!(f, "  mask[{iteration}]                = {mask}")?;
        }
        writeln!(f, "  singular_policy        = {:?}", self.singular_policy)?;
        writeln!(f, "  parallel_tracks        = {}", self.parallel_tracks)?;
        write!(f, "  max_condition_number   = {:e}", self.max_condition_number)
    }
}

/// Builder for [`AlignmentConfig`], with validation.
#[derive(Debug, Clone, Default)]
pub struct AlignmentConfigBuilder {
    config: AlignmentConfig,
}

impl AlignmentConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chi2_ondf_cutoff(mut self, v: f64) -> Self {
        self.config.chi2_ondf_cutoff = v;
        self
    }

    pub fn delta_chi2_ondf_cutoff(mut self, window: usize, epsilon: f64) -> Self {
        self.config.delta_chi2_ondf_cutoff = (window, epsilon);
        self
    }

    pub fn max_iterations(mut self, v: usize) -> Self {
        self.config.max_iterations = v;
        self
    }

    /// Set the mask of one iteration.
    pub fn iteration_mask(mut self, iteration: usize, mask: AlignmentMask) -> Self {
        self.config.iteration_masks.insert(iteration, mask);
        self
    }

    pub fn singular_policy(mut self, v: SingularPolicy) -> Self {
        self.config.singular_policy = v;
        self
    }

    pub fn parallel_tracks(mut self, v: bool) -> Self {
        self.config.parallel_tracks = v;
        self
    }

    pub fn max_condition_number(mut self, v: f64) -> Self {
        self.config.max_condition_number = v;
        self
    }

    /// Validation rules
    /// -----------------
    /// * `chi2_ondf_cutoff >= 0`
    /// * plateau window `>= 1`, plateau epsilon `>= 0`
    /// * `max_iterations >= 1`
    /// * `max_condition_number > 0`
    ///
    /// NaN values are rejected.
    pub fn build(self) -> Result<AlignmentConfig, AlignmentError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Everything an alignment run needs besides the tracks.
///
/// The aligned elements are borrowed: the engine never owns the detector and changes it only
/// through `updater`.
pub struct AlignmentOptions<'a, E, U, O> {
    /// Passed untouched to the track fitter.
    pub fit_options: O,
    pub geometry_context: GeometryContext,
    pub updater: U,
    /// Aligned elements; the position in this list is the global surface index.
    pub aligned_elements: Vec<&'a E>,
    pub config: AlignmentConfig,
}

impl<'a, E, U, O> AlignmentOptions<'a, E, U, O> {
    pub fn new(
        fit_options: O,
        geometry_context: GeometryContext,
        updater: U,
        aligned_elements: Vec<&'a E>,
    ) -> Self {
        AlignmentOptions {
            fit_options,
            geometry_context,
            updater,
            aligned_elements,
            config: AlignmentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AlignmentConfig) -> Self {
        self.config = config;
        self
    }
}
