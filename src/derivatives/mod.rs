//! # Residual derivatives with respect to alignment parameters
//!
//! The chi-square derivatives need `∂r/∂a`, the change of the residuals of a track when the
//! rigid-body placement of an alignable surface moves. Only the prediction depends on the
//! placement, so
//!
//! ```text
//! ∂r/∂a = −H · ∂x/∂a
//! ```
//!
//! with `H` the measurement projector and `∂x/∂a` the derivative of the bound parameters at
//! the surface with respect to the six alignment parameters `(c0, c1, c2, r0, r1, r2)`.
//!
//! `∂x/∂a` is pure surface geometry and depends on the surface shape. It is provided by an
//! [`AlignmentDerivative`] strategy, selected per [`SurfaceKind`] through
//! [`DerivativeStrategies`]:
//!
//! * [`PlaneSurfaceDerivative`] – planar surfaces, small rigid motions of the plane.
//! * [`NullDerivative`] – all zeros; the fallback for shapes without a dedicated strategy.
//!   A surface handled by it contributes to the chi-square but never moves.
//!
//! Shapes other than planes (discs, cylinders, straws) need their own strategy registered
//! with [`DerivativeStrategies::with_strategy`].

use std::{collections::HashMap, fmt};

use nalgebra::{DMatrix, Isometry3};

use crate::{
    alignment::AlignmentMask,
    constants::{
        AlignmentToBoundMatrix, BoundVector, ALIGNMENT_PARAMETERS_SIZE, BOUND_PARAMETERS_SIZE,
    },
    geometry::SurfaceKind,
};

pub mod planar;

pub use planar::PlaneSurfaceDerivative;

/// Derivative of the bound parameters at a surface with respect to its alignment parameters.
pub trait AlignmentDerivative: Send + Sync {
    /// Arguments
    /// -----------------
    /// * `transform`: current local-to-global placement of the surface.
    /// * `parameters`: bound parameters of the track on the surface.
    ///
    /// Return
    /// ----------
    /// * `∂x/∂a`, rows indexed like the bound parameters, columns like the alignment
    ///   parameters.
    fn alignment_to_bound(
        &self,
        transform: &Isometry3<f64>,
        parameters: &BoundVector,
    ) -> AlignmentToBoundMatrix;
}

/// Strategy returning a zero derivative.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDerivative;

impl AlignmentDerivative for NullDerivative {
    fn alignment_to_bound(
        &self,
        _transform: &Isometry3<f64>,
        _parameters: &BoundVector,
    ) -> AlignmentToBoundMatrix {
        AlignmentToBoundMatrix::zeros()
    }
}

/// Registry of derivative strategies keyed by surface kind.
pub struct DerivativeStrategies {
    strategies: HashMap<SurfaceKind, Box<dyn AlignmentDerivative>>,
    fallback: Box<dyn AlignmentDerivative>,
}

impl DerivativeStrategies {
    /// Empty registry resolving every kind to `fallback`.
    pub fn new(fallback: impl AlignmentDerivative + 'static) -> Self {
        DerivativeStrategies {
            strategies: HashMap::new(),
            fallback: Box::new(fallback),
        }
    }

    /// Register (or replace) the strategy used for `kind`.
    pub fn with_strategy(
        mut self,
        kind: SurfaceKind,
        strategy: impl AlignmentDerivative + 'static,
    ) -> Self {
        self.strategies.insert(kind, Box::new(strategy));
        self
    }

    pub fn strategy(&self, kind: SurfaceKind) -> &dyn AlignmentDerivative {
        self.strategies
            .get(&kind)
            .map(|s| s.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }

    /// Derivative of the residual of one measurement with respect to the alignment
    /// parameters of its surface, with the columns of fixed parameters zeroed.
    ///
    /// Arguments
    /// -----------------
    /// * `kind`: shape of the measurement surface.
    /// * `transform`: current placement of the surface.
    /// * `parameters`: bound parameters used for the prediction.
    /// * `projector`: `d × BOUND_PARAMETERS_SIZE` measurement projector.
    /// * `mask`: free alignment parameters.
    ///
    /// Return
    /// ----------
    /// * `d × ALIGNMENT_PARAMETERS_SIZE` matrix `−H · ∂x/∂a`.
    pub fn residual_derivative(
        &self,
        kind: SurfaceKind,
        transform: &Isometry3<f64>,
        parameters: &BoundVector,
        projector: &DMatrix<f64>,
        mask: &AlignmentMask,
    ) -> DMatrix<f64> {
        let bound = self.strategy(kind).alignment_to_bound(transform, parameters);
        let bound = DMatrix::from_column_slice(
            BOUND_PARAMETERS_SIZE,
            ALIGNMENT_PARAMETERS_SIZE,
            bound.as_slice(),
        );

        let mut derivative = -(projector * bound);
        for dof in mask.fixed_dofs() {
            derivative.column_mut(dof).fill(0.0);
        }
        derivative
    }
}

impl Default for DerivativeStrategies {
    fn default() -> Self {
        DerivativeStrategies::new(NullDerivative)
            .with_strategy(SurfaceKind::Plane, PlaneSurfaceDerivative::default())
    }
}

impl fmt::Debug for DerivativeStrategies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivativeStrategies")
            .field("kinds", &self.strategies.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
