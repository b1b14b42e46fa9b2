//! # Convergence checks
//!
//! Two stopping criteria are evaluated after each iteration on the average chi-square per
//! degree of freedom:
//!
//! * [`ConvergenceCriterion::ChiSquareCutoff`]: the average is at or below a fixed cutoff.
//! * [`ConvergenceCriterion::Plateau`]: the average has not moved by more than `epsilon`
//!   over the last `window` iterations, tracked by a [`ChiSquareWindow`].
//!
//! The window only compares once it holds `window` values: with a constant input the
//! plateau fires on the iteration with index `window`.

use std::{collections::VecDeque, fmt};

use serde::{Deserialize, Serialize};

/// Criterion that ended an alignment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceCriterion {
    ChiSquareCutoff,
    Plateau,
}

impl fmt::Display for ConvergenceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceCriterion::ChiSquareCutoff => write!(f, "chi2/ndf cutoff"),
            ConvergenceCriterion::Plateau => write!(f, "chi2/ndf plateau"),
        }
    }
}

/// Bounded history of the most recent average chi-square per degree of freedom.
#[derive(Debug, Clone)]
pub struct ChiSquareWindow {
    window: usize,
    epsilon: f64,
    history: VecDeque<f64>,
}

impl ChiSquareWindow {
    pub fn new(window: usize, epsilon: f64) -> Self {
        ChiSquareWindow {
            window,
            epsilon,
            history: VecDeque::with_capacity(window + 1),
        }
    }

    /// Feed the value of the current iteration.
    ///
    /// Once the window is full, the oldest value is compared with `value`: if they differ by
    /// at most `epsilon` the plateau is reached and `value` is not recorded. Otherwise the
    /// oldest value is evicted and `value` appended.
    pub fn push(&mut self, value: f64) -> bool {
        if self.history.len() >= self.window {
            if let Some(&oldest) = self.history.front() {
                if (oldest - value).abs() <= self.epsilon {
                    return true;
                }
            }
            self.history.pop_front();
        }
        self.history.push_back(value);
        false
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.history.len() >= self.window
    }
}

/// Convergence state of an alignment run.
#[derive(Debug, Clone)]
pub struct ConvergenceCheck {
    chi2_ondf_cutoff: f64,
    window: ChiSquareWindow,
}

impl ConvergenceCheck {
    /// Arguments
    /// -----------------
    /// * `chi2_ondf_cutoff`: average chi-square per degree of freedom accepted as converged.
    /// * `(window, epsilon)`: plateau detection parameters.
    pub fn new(chi2_ondf_cutoff: f64, (window, epsilon): (usize, f64)) -> Self {
        ConvergenceCheck {
            chi2_ondf_cutoff,
            window: ChiSquareWindow::new(window, epsilon),
        }
    }

    /// Evaluate both criteria for the average of the current iteration, the cutoff first.
    pub fn check(&mut self, average_chi2_ondf: f64) -> Option<ConvergenceCriterion> {
        if average_chi2_ondf <= self.chi2_ondf_cutoff {
            return Some(ConvergenceCriterion::ChiSquareCutoff);
        }
        self.window
            .push(average_chi2_ondf)
            .then_some(ConvergenceCriterion::Plateau)
    }
}
