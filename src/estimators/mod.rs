//! Free energy estimators.
//!
//! Each estimator is a strategy object holding only its own configuration. Estimators take
//! their input by shared reference and never modify it, so one matrix can feed any number of
//! concurrent estimations.

use crate::errors::*;
use crate::matrix::DataWindow;
use crate::state::Lambda;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

pub mod bar;
pub mod mbar;
pub mod ti;

pub use bar::{Bar, BarBuilder, BarMethod, BarSolution};
pub use mbar::{InitialFreeEnergies, Mbar, MbarBuilder, MbarSolution};
pub use ti::{QuadratureRule, Ti, TiBuilder};

/// A free energy estimator
pub trait Estimator: Send + Sync {
    /// The data the estimator consumes
    type Input: DataWindow + Send + Sync;

    /// Estimate the free energy differences between every pair of states
    fn estimate(&self, input: &Self::Input) -> Result<FreeEnergies>;
}

/// A free energy difference between two states
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// Index of the reference state
    pub from: usize,
    /// Index of the target state
    pub to: usize,
    /// $f_\mathrm{to} - f_\mathrm{from}$ in kT
    pub delta_f: f64,
    /// Variance of `delta_f`
    pub variance: f64,
}

impl Estimate {
    /// One standard deviation of `delta_f`
    pub fn std_error(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Statistics of an iterative solve
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverReport {
    /// Iterations performed; the largest over all pairs for BAR
    pub iterations: usize,
    /// Final convergence residual
    pub residual: f64,
}

/// Dimensionless free energy differences between all pairs of states
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreeEnergies {
    states: Vec<Lambda>,
    delta_f: Array2<f64>,
    d_delta_f: Array2<f64>,
    covariance: Option<Array2<f64>>,
    report: SolverReport,
}

impl FreeEnergies {
    pub(crate) fn new(
        states: Vec<Lambda>,
        delta_f: Array2<f64>,
        d_delta_f: Array2<f64>,
        covariance: Option<Array2<f64>>,
        report: SolverReport,
    ) -> Self {
        Self {
            states,
            delta_f,
            d_delta_f,
            covariance,
            report,
        }
    }

    /// Build the full matrices from differences between adjacent states
    ///
    /// Differences between distant states are sums along the chain; their variances are sums of
    /// the adjacent variances, treating adjacent estimates as independent.
    pub(crate) fn from_adjacent(
        states: Vec<Lambda>,
        deltas: &[f64],
        variances: &[f64],
        report: SolverReport,
    ) -> Self {
        let k = deltas.len() + 1;
        let mut delta_f = Array2::zeros((k, k));
        let mut d_delta_f = Array2::zeros((k, k));
        for i in 0..k {
            for j in i + 1..k {
                let df: f64 = deltas[i..j].iter().sum();
                let var: f64 = variances[i..j].iter().sum();
                delta_f[[i, j]] = df;
                delta_f[[j, i]] = -df;
                d_delta_f[[i, j]] = var.sqrt();
                d_delta_f[[j, i]] = var.sqrt();
            }
        }
        Self::new(states, delta_f, d_delta_f, None, report)
    }

    /// Build the matrices from free energies and their covariance matrix
    pub(crate) fn from_covariance(
        states: Vec<Lambda>,
        f_k: &Array1<f64>,
        theta: Array2<f64>,
        report: SolverReport,
    ) -> Self {
        let k = f_k.len();
        let delta_f = Array2::from_shape_fn((k, k), |(i, j)| f_k[j] - f_k[i]);
        let d_delta_f = Array2::from_shape_fn((k, k), |(i, j)| {
            if i == j {
                0.0
            } else {
                (theta[[i, i]] + theta[[j, j]] - 2.0 * theta[[i, j]]).max(0.0).sqrt()
            }
        });
        Self::new(states, delta_f, d_delta_f, Some(theta), report)
    }

    /// Labels of the states, in the order used by the matrices
    pub fn states(&self) -> &[Lambda] {
        &self.states
    }

    /// Number of states
    pub fn k(&self) -> usize {
        self.states.len()
    }

    /// `delta_f[[i, j]]` is $f_j - f_i$ in kT
    pub fn delta_f(&self) -> &Array2<f64> {
        &self.delta_f
    }

    /// `d_delta_f[[i, j]]` is the standard error of `delta_f[[i, j]]`
    pub fn d_delta_f(&self) -> &Array2<f64> {
        &self.d_delta_f
    }

    /// Covariance matrix of the state free energies, if the estimator provides one
    pub fn covariance(&self) -> Option<&Array2<f64>> {
        self.covariance.as_ref()
    }

    /// Solver statistics
    pub fn report(&self) -> SolverReport {
        self.report
    }

    /// The difference from state `from` to state `to`
    pub fn estimate(&self, from: usize, to: usize) -> Estimate {
        Estimate {
            from,
            to,
            delta_f: self.delta_f[[from, to]],
            variance: self.d_delta_f[[from, to]].powi(2),
        }
    }

    /// Differences between each pair of neighbouring states
    pub fn adjacent(&self) -> Vec<Estimate> {
        (1..self.k()).map(|i| self.estimate(i - 1, i)).collect()
    }

    /// Difference between the first and last states
    pub fn total(&self) -> Estimate {
        self.estimate(0, self.k() - 1)
    }
}

/// Estimator choice for configurable pipelines
#[derive(Debug, Clone)]
pub enum EstimatorKind {
    /// Thermodynamic integration over dH/dλ
    Ti(Ti),
    /// Bennett acceptance ratio between neighbouring states
    Bar(Bar),
    /// Multistate Bennett acceptance ratio
    Mbar(Mbar),
}

impl EstimatorKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ti(_) => "TI",
            Self::Bar(_) => "BAR",
            Self::Mbar(_) => "MBAR",
        }
    }

    /// The same estimator with a different iteration cap; TI is returned unchanged
    pub fn with_maximum_iterations(&self, maximum_iterations: usize) -> Self {
        match self {
            Self::Ti(ti) => Self::Ti(ti.clone()),
            Self::Bar(bar) => Self::Bar(bar.with_maximum_iterations(maximum_iterations)),
            Self::Mbar(mbar) => Self::Mbar(mbar.with_maximum_iterations(maximum_iterations)),
        }
    }

    /// The iteration cap of iterative estimators
    pub fn maximum_iterations(&self) -> Option<usize> {
        match self {
            Self::Ti(_) => None,
            Self::Bar(bar) => Some(bar.maximum_iterations()),
            Self::Mbar(mbar) => Some(mbar.maximum_iterations()),
        }
    }
}
