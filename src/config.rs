//! Configuration of a full analysis, buildable in code or deserialized from a settings file.

use crate::errors::*;
use crate::estimators::QuadratureRule;
use crate::preprocessing::Decorrelation;
use crate::timeseries::SeriesMethod;
use serde::{Deserialize, Serialize};

/// Which estimator an analysis runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorChoice {
    /// Thermodynamic integration; needs dH/dλ samples
    Ti,
    /// Bennett acceptance ratio; needs reduced potentials
    Bar,
    /// Multistate Bennett acceptance ratio; needs reduced potentials
    Mbar,
}

impl Default for EstimatorChoice {
    fn default() -> Self {
        Self::Mbar
    }
}

/// Settings for [`crate::analysis::Analysis`]
///
/// Missing fields take their defaults when deserializing.
///
/// # Examples
///
/// ```
/// use alchemrs::config::*;
///
/// let config = AnalysisConfig::builder()
///     .estimator(EstimatorChoice::Bar)
///     .convergence_retries(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.convergence_fractions, 10);
/// ```
#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate", error = "AlchemError"))]
#[serde(default)]
pub struct AnalysisConfig {
    /// How to choose uncorrelated samples
    #[builder(default)]
    pub decorrelation: Decorrelation,

    /// Drop the equilibration prefix before subsampling
    #[builder(default = "false")]
    pub remove_burnin: bool,

    /// Subsample at a uniform integer stride
    #[builder(default = "true")]
    pub conservative: bool,

    /// How reduced potentials are collapsed to one series for decorrelation
    #[builder(default)]
    pub series_method: SeriesMethod,

    /// Discard samples earlier than this time
    #[builder(setter(strip_option), default)]
    pub lower: Option<f64>,

    /// Discard samples later than this time
    #[builder(setter(strip_option), default)]
    pub upper: Option<f64>,

    /// Keep every `step`th sample before decorrelating
    #[builder(default = "1")]
    pub step: usize,

    /// The estimator to run
    #[builder(default)]
    pub estimator: EstimatorChoice,

    /// Convergence tolerance of BAR or MBAR; the estimator's default if unset
    #[builder(setter(strip_option), default)]
    pub tolerance: Option<f64>,

    /// Iteration cap of BAR or MBAR; the estimator's default if unset
    #[builder(setter(strip_option), default)]
    pub maximum_iterations: Option<usize>,

    /// TI quadrature rule
    #[builder(default)]
    pub quadrature: QuadratureRule,

    /// Number of data fractions for the forward/backward convergence curve; 0 skips it
    #[builder(default = "10")]
    pub convergence_fractions: usize,

    /// How many times to double the iteration cap and retry after a convergence failure
    #[builder(default = "0")]
    pub convergence_retries: usize,

    /// Compute the MBAR overlap matrix for BAR and MBAR analyses
    #[builder(default = "true")]
    pub overlap: bool,
}

impl AnalysisConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(Some(tolerance)) = self.tolerance {
            if !(tolerance > 0.0) {
                return Err("tolerance must be positive".to_string());
            }
        }
        if let Some(Some(0)) = self.maximum_iterations {
            return Err("maximum_iterations must be at least 1".to_string());
        }
        if self.step == Some(0) {
            return Err("step must be at least 1".to_string());
        }
        Ok(())
    }
}

impl AnalysisConfig {
    /// Get a new builder for the `AnalysisConfig` struct.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder::default()
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("AnalysisConfig should not fail with default params")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::InefficiencyMethod;

    #[test]
    fn defaults() {
        let config = AnalysisConfig::default();
        assert_eq!(config.estimator, EstimatorChoice::Mbar);
        assert!(config.conservative);
        assert!(!config.remove_burnin);
        assert_eq!(config.tolerance, None);
        assert_eq!(config.convergence_retries, 0);
    }

    #[test]
    fn json_round_trip() -> anyhow::Result<()> {
        let blocks = InefficiencyMethod::BlockAveraging { min_blocks: 8 };
        let config = AnalysisConfig::builder()
            .decorrelation(Decorrelation::StatisticalInefficiency(blocks))
            .estimator(EstimatorChoice::Ti)
            .quadrature(QuadratureRule::CubicSpline)
            .lower(100.0)
            .build()?;
        let json = serde_json::to_string(&config)?;
        let back: AnalysisConfig = serde_json::from_str(&json)?;
        assert_eq!(back, config);
        Ok(())
    }

    #[test]
    fn partial_json_takes_defaults() -> anyhow::Result<()> {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"estimator": "Bar", "maximum_iterations": 500}"#)?;
        assert_eq!(config.estimator, EstimatorChoice::Bar);
        assert_eq!(config.maximum_iterations, Some(500));
        assert_eq!(config.convergence_fractions, 10);
        assert_eq!(config.decorrelation, Decorrelation::default());
        Ok(())
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(AnalysisConfig::builder().tolerance(-1.0).build().is_err());
        assert!(AnalysisConfig::builder().step(0).build().is_err());
    }
}
