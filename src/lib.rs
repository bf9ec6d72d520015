#![warn(rust_2018_idioms, missing_docs, missing_debug_implementations)]

//! Free energy differences between thermodynamic states from alchemical simulation data.
//!
//! Raw per-state timeseries are decorrelated ([`preprocessing`]), assembled into estimator
//! inputs ([`matrix`]), and passed to one of three estimators ([`estimators`]): thermodynamic
//! integration (TI), the Bennett acceptance ratio (BAR), or the multistate Bennett acceptance
//! ratio (MBAR). Results are summed into cumulative profiles ([`profile`]) and checked for
//! overlap and convergence ([`diagnostics`]). [`analysis::Analysis`] runs the whole pipeline from
//! an [`config::AnalysisConfig`].
//!
//! All energies are dimensionless, in units of kT; see [`units`] for conversion.
//!
//! Please reference the following if you use the MBAR estimator in your research:
//!
//! [1] Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
//! equilibrium states. J. Chem. Phys. 129:124105, 2008. <http://dx.doi.org/10.1063/1.2978177>

#[macro_use]
extern crate derive_builder;

pub mod analysis;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod estimators;
pub mod matrix;
pub(crate) mod numerics;
pub mod preprocessing;
pub mod profile;
pub mod state;
pub mod testsystems;
pub mod timeseries;
pub mod units;

pub use analysis::{Analysis, Dataset, Report};
pub use config::{AnalysisConfig, AnalysisConfigBuilder, EstimatorChoice};
pub use errors::{AlchemError, Result};
pub use estimators::{
    Bar, BarBuilder, Estimate, Estimator, EstimatorKind, FreeEnergies, Mbar, MbarBuilder, Ti,
    TiBuilder,
};
pub use matrix::{DataWindow, GradientAverages, GradientSet, ReducedPotentials};
pub use numerics::{logaddexp, logsumexp};
pub use state::Lambda;
