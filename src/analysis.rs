//! The full pipeline: preprocess, build, estimate, aggregate and diagnose one dataset.

use crate::config::{AnalysisConfig, EstimatorChoice};
use crate::diagnostics::{
    forward_backward_convergence, overlap_matrix, ConvergenceCurve, OverlapMatrix,
};
use crate::errors::*;
use crate::estimators::{Bar, Estimator, EstimatorKind, FreeEnergies, Mbar, Ti};
use crate::matrix::{GradientSet, ReducedPotentials};
use crate::preprocessing::Decorrelator;
use crate::profile::Profile;
use crate::timeseries::{GradientSamples, PotentialSamples};
use serde::Serialize;

/// Raw samples of every state, as produced by a parser
#[derive(Debug, Clone)]
pub enum Dataset {
    /// Reduced potentials, for BAR and MBAR
    Potentials(Vec<PotentialSamples>),
    /// dH/dλ, for TI
    Gradients(Vec<GradientSamples>),
}

/// Everything an analysis produces
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// The estimator that was run
    pub estimator: EstimatorChoice,
    /// Differences between all pairs of states
    pub free_energies: FreeEnergies,
    /// Cumulative profile along the states
    pub profile: Profile,
    /// MBAR overlap matrix, for reduced potential data
    pub overlap: Option<OverlapMatrix>,
    /// Forward and backward convergence curve
    pub convergence: Option<ConvergenceCurve>,
}

/// Runs an [`AnalysisConfig`] against datasets
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    config: AnalysisConfig,
}

impl Analysis {
    /// An analysis with the given settings
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    /// The settings
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// The decorrelator described by the settings
    pub fn decorrelator(&self) -> Result<Decorrelator> {
        let config = &self.config;
        let mut builder = Decorrelator::builder();
        builder
            .method(config.decorrelation)
            .remove_burnin(config.remove_burnin)
            .conservative(config.conservative)
            .series_method(config.series_method)
            .step(config.step);
        if let Some(lower) = config.lower {
            builder.lower(lower);
        }
        if let Some(upper) = config.upper {
            builder.upper(upper);
        }
        builder.build()
    }

    fn mbar(&self) -> Result<Mbar> {
        let mut builder = Mbar::builder();
        if let Some(tolerance) = self.config.tolerance {
            builder.relative_tolerance(tolerance);
        }
        if let Some(maximum_iterations) = self.config.maximum_iterations {
            builder.maximum_iterations(maximum_iterations);
        }
        builder.build()
    }

    /// The estimator described by the settings
    pub fn estimator(&self) -> Result<EstimatorKind> {
        Ok(match self.config.estimator {
            EstimatorChoice::Ti => {
                EstimatorKind::Ti(Ti::builder().quadrature(self.config.quadrature).build()?)
            }
            EstimatorChoice::Bar => {
                let mut builder = Bar::builder();
                if let Some(tolerance) = self.config.tolerance {
                    builder.relative_tolerance(tolerance);
                }
                if let Some(maximum_iterations) = self.config.maximum_iterations {
                    builder.maximum_iterations(maximum_iterations);
                }
                EstimatorKind::Bar(builder.build()?)
            }
            EstimatorChoice::Mbar => EstimatorKind::Mbar(self.mbar()?),
        })
    }

    /// Run the whole pipeline on one dataset
    pub fn run(&self, dataset: &Dataset) -> Result<Report> {
        let estimator = self.estimator()?;
        let decorrelator = self.decorrelator()?;
        log::info!("Running {} analysis", estimator.name());

        let (free_energies, overlap, convergence) = match (&estimator, dataset) {
            (EstimatorKind::Ti(ti), Dataset::Gradients(samples)) => {
                let samples = decorrelator.decorrelate_all_gradients(samples)?;
                let input = GradientSet::from_samples(&samples)?;
                log::info!("Integrating dH/dl over {} states", input.states().len());
                let free_energies = ti.estimate(&input)?;
                let convergence = self.convergence(ti, &input)?;
                (free_energies, None, convergence)
            }
            (EstimatorKind::Bar(bar), Dataset::Potentials(samples)) => {
                let input = self.potentials(&decorrelator, samples)?;
                let (estimated, overlap) = rayon::join(
                    || {
                        self.with_retries(bar.maximum_iterations(), |cap| {
                            let bar = bar.with_maximum_iterations(cap);
                            let free_energies = bar.estimate(&input)?;
                            Ok((bar, free_energies))
                        })
                    },
                    || self.config.overlap.then(|| self.bar_overlap(&input)).flatten(),
                );
                let (bar, free_energies) = estimated?;
                let convergence = self.convergence(&bar, &input)?;
                (free_energies, overlap, convergence)
            }
            (EstimatorKind::Mbar(mbar), Dataset::Potentials(samples)) => {
                let input = self.potentials(&decorrelator, samples)?;
                let (mbar, free_energies, overlap) =
                    self.with_retries(mbar.maximum_iterations(), |cap| {
                        let mbar = mbar.with_maximum_iterations(cap);
                        let solution = mbar.solve(&input)?;
                        let overlap = self.config.overlap.then(|| solution.overlap());
                        Ok((mbar, solution.free_energies()?, overlap))
                    })?;
                let convergence = self.convergence(&mbar, &input)?;
                (free_energies, overlap, convergence)
            }
            (EstimatorKind::Ti(_), Dataset::Potentials(_)) => {
                return Err(AlchemError::IncompatibleInput(
                    "TI needs dH/dl samples, not reduced potentials".to_string(),
                ))
            }
            (_, Dataset::Gradients(_)) => {
                return Err(AlchemError::IncompatibleInput(format!(
                    "{} needs reduced potentials, not dH/dl samples",
                    estimator.name()
                )))
            }
        };

        let profile = Profile::from_free_energies(&free_energies)?;
        let total = profile.total();
        log::info!(
            "{}: {:.4} +- {:.4} kT over {} states",
            estimator.name(),
            total.delta_f,
            total.std_error(),
            free_energies.k()
        );
        Ok(Report {
            estimator: self.config.estimator,
            free_energies,
            profile,
            overlap,
            convergence,
        })
    }

    fn potentials(
        &self,
        decorrelator: &Decorrelator,
        samples: &[PotentialSamples],
    ) -> Result<ReducedPotentials> {
        let samples = decorrelator.decorrelate_all_potentials(samples)?;
        let input = ReducedPotentials::from_samples(&samples)?;
        log::info!("Built u_kn for {} states and {} samples", input.k(), input.n_tot());
        Ok(input)
    }

    /// MBAR overlap for a BAR analysis; a failure here is logged and leaves the estimate intact
    fn bar_overlap(&self, input: &ReducedPotentials) -> Option<OverlapMatrix> {
        let overlap = self.mbar().and_then(|mbar| {
            self.with_retries(mbar.maximum_iterations(), |cap| {
                overlap_matrix(input, &mbar.with_maximum_iterations(cap))
            })
        });
        match overlap {
            Ok(overlap) => Some(overlap),
            Err(e) => {
                log::warn!("Skipping the overlap matrix: {}", e);
                None
            }
        }
    }

    fn convergence<E: Estimator>(
        &self,
        estimator: &E,
        input: &E::Input,
    ) -> Result<Option<ConvergenceCurve>> {
        match self.config.convergence_fractions {
            0 => Ok(None),
            num => forward_backward_convergence(estimator, input, num).map(Some),
        }
    }

    /// Run `attempt` with the iteration cap, doubling it after each convergence failure
    fn with_retries<T>(
        &self,
        cap: usize,
        mut attempt: impl FnMut(usize) -> Result<T>,
    ) -> Result<T> {
        let mut cap = cap;
        let mut retries = 0;
        loop {
            match attempt(cap) {
                Err(e) if e.is_convergence() && retries < self.config.convergence_retries => {
                    retries += 1;
                    cap *= 2;
                    log::warn!("{}; retrying with an iteration cap of {}", e, cap);
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::Decorrelation;
    use crate::testsystems::LinearCoupling;

    fn coupling() -> LinearCoupling {
        LinearCoupling::builder()
            .lambdas((0..=10).map(|i| i as f64 / 10.0).collect())
            .correlation(0.5)
            .build()
            .unwrap()
    }

    fn check_total(report: &Report, exact: f64, slack: f64) {
        let total = report.profile.total();
        assert!(
            (total.delta_f - exact).abs() < 4.0 * total.std_error() + slack,
            "{} +- {} vs {}",
            total.delta_f,
            total.std_error(),
            exact
        );
    }

    #[test]
    fn mbar_pipeline() {
        let system = coupling();
        let sample = system.sample_with_seed(1000, 31).unwrap();
        let report = Analysis::default().run(&Dataset::Potentials(sample.potentials)).unwrap();
        check_total(&report, system.analytical_free_energies()[10], 0.0);
        assert_eq!(report.profile.points().len(), 11);
        assert_eq!(report.overlap.as_ref().map(|o| o.matrix().nrows()), Some(11));
        assert_eq!(report.convergence.as_ref().map(|c| c.forward.len()), Some(10));
    }

    #[test]
    fn bar_pipeline() {
        let system = coupling();
        let sample = system.sample_with_seed(1000, 32).unwrap();
        let config = AnalysisConfig::builder()
            .estimator(EstimatorChoice::Bar)
            .convergence_fractions(0)
            .build()
            .unwrap();
        let report = Analysis::new(config).run(&Dataset::Potentials(sample.potentials)).unwrap();
        check_total(&report, system.analytical_free_energies()[10], 0.0);
        assert!(report.overlap.is_some());
        assert!(report.convergence.is_none());
    }

    #[test]
    fn ti_pipeline() {
        let system = coupling();
        let sample = system.sample_with_seed(1000, 33).unwrap();
        let config = AnalysisConfig::builder()
            .estimator(EstimatorChoice::Ti)
            .quadrature(crate::estimators::QuadratureRule::CubicSpline)
            .build()
            .unwrap();
        let report = Analysis::new(config).run(&Dataset::Gradients(sample.gradients)).unwrap();
        check_total(&report, system.analytical_free_energies()[10], 0.02);
        assert!(report.overlap.is_none());
    }

    #[test]
    fn mismatched_data_is_rejected() {
        let sample = LinearCoupling::default().sample_with_seed(50, 1).unwrap();
        let config = AnalysisConfig::builder()
            .estimator(EstimatorChoice::Ti)
            .build()
            .unwrap();
        let err = Analysis::new(config).run(&Dataset::Potentials(sample.potentials)).unwrap_err();
        assert!(matches!(err, AlchemError::IncompatibleInput(_)));
        let err = Analysis::default().run(&Dataset::Gradients(sample.gradients)).unwrap_err();
        assert!(matches!(err, AlchemError::IncompatibleInput(_)));
    }

    #[test]
    fn retries_extend_the_iteration_cap() {
        let sample = LinearCoupling::default().sample_with_seed(300, 5).unwrap();
        let dataset = Dataset::Potentials(sample.potentials);
        let mut builder = AnalysisConfig::builder();
        builder
            .decorrelation(Decorrelation::None)
            .maximum_iterations(1)
            .convergence_fractions(0);

        let err = Analysis::new(builder.build().unwrap()).run(&dataset).unwrap_err();
        assert!(err.is_convergence());

        let report = Analysis::new(builder.convergence_retries(10).build().unwrap())
            .run(&dataset)
            .unwrap();
        assert!(report.free_energies.report().iterations > 1);
    }

    #[test]
    fn bar_retries_cover_the_overlap_matrix() {
        let sample = LinearCoupling::default().sample_with_seed(300, 5).unwrap();
        let config = AnalysisConfig::builder()
            .estimator(EstimatorChoice::Bar)
            .decorrelation(Decorrelation::None)
            .maximum_iterations(1)
            .convergence_retries(12)
            .convergence_fractions(0)
            .build()
            .unwrap();
        let report = Analysis::new(config).run(&Dataset::Potentials(sample.potentials)).unwrap();
        assert_eq!(report.overlap.as_ref().map(|o| o.matrix().nrows()), Some(5));
    }

    #[test]
    fn report_serializes() -> anyhow::Result<()> {
        let sample = LinearCoupling::default().sample_with_seed(200, 2).unwrap();
        let config = AnalysisConfig::builder().convergence_fractions(2).build()?;
        let report = Analysis::new(config).run(&Dataset::Potentials(sample.potentials))?;
        let json = serde_json::to_value(&report)?;
        assert_eq!(json["estimator"], "Mbar");
        assert_eq!(json["profile"]["points"].as_array().map(|p| p.len()), Some(5));
        Ok(())
    }
}
