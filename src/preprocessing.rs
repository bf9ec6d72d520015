//! Decorrelation and burn-in removal of simulation timeseries.
//!
//! Estimators assume uncorrelated samples. Correlated data must be subsampled to extract
//! uncorrelated (effectively independent) samples first, which is what [`Decorrelator`] does.
//!
//! # References
//!
//! 1. Chodera JD, Swope WC, Pitera JW, Seok C, and Dill KA. Use of the weighted histogram
//! analysis method for the analysis of simulated and parallel tempering simulations. JCTC
//! 3(1):26-41, 2007.
//! 2. Chodera JD. A simple method for automated equilibration detection in molecular
//! simulations. JCTC 12:1799, 2016.

use crate::errors::*;
use crate::timeseries::{slice_indices, GradientSamples, PotentialSamples, SeriesMethod, Timeseries};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How to estimate the statistical inefficiency $g$ of a timeseries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InefficiencyMethod {
    /// Integrate the normalized autocorrelation function
    ///
    /// $$ g = 1 + 2 \sum_{t=1}^{T} \left(1 - \frac{t}{N}\right) C(t) $$
    ///
    /// The sum stops at the first lag where $C(t)$ falls to `noise_threshold` standard errors
    /// ($1/\sqrt{N}$) or below, so uncorrelated data gives exactly $g = 1$.
    Autocorrelation {
        /// Grow the lag increment by one after every lag, trading accuracy for speed
        fast: bool,
        /// Autocorrelations at or below `noise_threshold / sqrt(N)` end the sum
        noise_threshold: f64,
    },
    /// Variance of block means relative to the variance of the data
    ///
    /// Uses the largest power-of-two block size that still gives `min_blocks` blocks.
    BlockAveraging {
        /// Minimum number of blocks for a block size to be considered
        min_blocks: usize,
    },
}

impl Default for InefficiencyMethod {
    fn default() -> Self {
        Self::Autocorrelation {
            fast: false,
            noise_threshold: 3.0,
        }
    }
}

impl InefficiencyMethod {
    /// Estimate the statistical inefficiency of `x`
    ///
    /// The result is at least 1. Series with fewer than two samples or no variance carry no
    /// correlation information and give 1.
    pub fn statistical_inefficiency(&self, x: &[f64]) -> f64 {
        let n = x.len();
        if n < 2 {
            return 1.0;
        }
        let mean = x.iter().sum::<f64>() / n as f64;
        let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        if var <= 0.0 {
            return 1.0;
        }

        let g = match *self {
            Self::Autocorrelation {
                fast,
                noise_threshold,
            } => {
                let dx: Vec<f64> = x.iter().map(|v| v - mean).collect();
                let threshold = noise_threshold / (n as f64).sqrt();
                let mut g = 1.0;
                let mut t = 1;
                let mut increment = 1;
                while t < n - 1 {
                    let c = dx[..n - t]
                        .iter()
                        .zip(&dx[t..])
                        .map(|(a, b)| a * b)
                        .sum::<f64>()
                        / ((n - t) as f64 * var);
                    if c <= threshold {
                        break;
                    }
                    g += 2.0 * c * (1.0 - t as f64 / n as f64) * increment as f64;
                    t += increment;
                    if fast {
                        increment += 1;
                    }
                }
                g
            }
            Self::BlockAveraging { min_blocks } => {
                let mut g = 1.0;
                let mut size = 1;
                while n / size >= min_blocks.max(2) {
                    let means: Vec<f64> = x
                        .chunks_exact(size)
                        .map(|block| block.iter().sum::<f64>() / size as f64)
                        .collect();
                    let m = means.iter().sum::<f64>() / means.len() as f64;
                    let var_means =
                        means.iter().map(|v| (v - m).powi(2)).sum::<f64>() / means.len() as f64;
                    g = size as f64 * var_means / var;
                    size *= 2;
                }
                g
            }
        };

        g.max(1.0)
    }
}

/// Result of scanning for the end of equilibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equilibration {
    /// Index of the first production sample
    pub t0: usize,
    /// Statistical inefficiency of `x[t0..]`
    pub g: f64,
    /// Effective number of uncorrelated samples in `x[t0..]`
    pub n_eff: f64,
}

/// Find the origin `t0` that maximizes the effective number of samples in `x[t0..]`
///
/// Every `nskip`th origin is tried; origins are scanned in parallel. Ties go to the earliest
/// origin.
pub fn detect_equilibration(x: &[f64], method: &InefficiencyMethod, nskip: usize) -> Equilibration {
    let n = x.len();
    let candidates: Vec<usize> = (0..n.saturating_sub(1).max(1)).step_by(nskip.max(1)).collect();

    let scanned: Vec<Equilibration> = candidates
        .par_iter()
        .map(|&t0| {
            let g = method.statistical_inefficiency(&x[t0..]);
            Equilibration {
                t0,
                g,
                n_eff: (n - t0) as f64 / g,
            }
        })
        .collect();

    scanned
        .into_iter()
        .fold(None, |best: Option<Equilibration>, eq| match best {
            Some(b) if b.n_eff >= eq.n_eff => Some(b),
            _ => Some(eq),
        })
        .unwrap_or(Equilibration {
            t0: 0,
            g: 1.0,
            n_eff: n as f64,
        })
}

/// Indices of approximately uncorrelated samples from a series of `n` samples
///
/// With `conservative`, samples are taken at a uniform stride of $\lceil g \rceil$. Otherwise
/// sample $i$ is taken at index $\mathrm{round}(i g)$, which keeps more data when $g$ is not an
/// integer.
pub fn subsample_indices(n: usize, g: f64, conservative: bool) -> Vec<usize> {
    if conservative {
        let stride = (g.ceil() as usize).max(1);
        return (0..n).step_by(stride).collect();
    }
    let count = (n as f64 / g).floor() as usize;
    let mut indices: Vec<usize> = (0..count)
        .map(|i| (i as f64 * g).round() as usize)
        .filter(|&i| i < n)
        .collect();
    indices.dedup();
    indices
}

/// Decorrelation strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Decorrelation {
    /// Keep every sample
    None,
    /// Subsample according to the estimated statistical inefficiency
    StatisticalInefficiency(InefficiencyMethod),
    /// Keep every `n`th sample
    FixedStride(usize),
}

impl Default for Decorrelation {
    fn default() -> Self {
        Self::StatisticalInefficiency(InefficiencyMethod::default())
    }
}

/// Selects approximately uncorrelated samples from raw simulation output
///
/// # Examples
///
/// ```
/// use alchemrs::preprocessing::*;
/// use alchemrs::timeseries::Timeseries;
/// use ndarray::Array1;
///
/// let series = Timeseries::from_values(0.0.into(), Array1::linspace(0.0, 1.0, 100));
/// let decorrelator = Decorrelator::builder()
///     .method(Decorrelation::FixedStride(10))
///     .build()
///     .unwrap();
/// assert_eq!(decorrelator.select(&series).unwrap().len(), 10);
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", error = "AlchemError"))]
pub struct Decorrelator {
    /// How to choose uncorrelated samples
    #[builder(default)]
    method: Decorrelation,

    /// Drop the equilibration prefix found by [`detect_equilibration`] before subsampling
    ///
    /// Only applies to [`Decorrelation::StatisticalInefficiency`].
    #[builder(default = "false")]
    remove_burnin: bool,

    /// Subsample at a uniform integer stride rather than at rounded multiples of $g$
    #[builder(default = "true")]
    conservative: bool,

    /// Stride between candidate origins during equilibration detection
    #[builder(default = "1")]
    nskip: usize,

    /// How reduced potentials are collapsed to one series
    #[builder(default)]
    series_method: SeriesMethod,

    /// Discard samples earlier than this time
    #[builder(setter(strip_option), default)]
    lower: Option<f64>,

    /// Discard samples later than this time
    #[builder(setter(strip_option), default)]
    upper: Option<f64>,

    /// Keep every `step`th sample before decorrelating
    #[builder(default = "1")]
    step: usize,
}

impl DecorrelatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(Decorrelation::FixedStride(0)) = self.method {
            return Err("a fixed stride must be at least 1".to_string());
        }
        if let Some(Decorrelation::StatisticalInefficiency(InefficiencyMethod::BlockAveraging {
            min_blocks,
        })) = self.method
        {
            if min_blocks < 2 {
                return Err("block averaging needs at least 2 blocks".to_string());
            }
        }
        if self.nskip == Some(0) || self.step == Some(0) {
            return Err("nskip and step must be at least 1".to_string());
        }
        if let (Some(Some(lower)), Some(Some(upper))) = (self.lower, self.upper) {
            if lower > upper {
                return Err(format!("lower ({}) must not exceed upper ({})", lower, upper));
            }
        }
        Ok(())
    }
}

impl Default for Decorrelator {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Decorrelator should not fail with default params")
    }
}

impl Decorrelator {
    /// Get a new builder for the `Decorrelator` struct.
    pub fn builder() -> DecorrelatorBuilder {
        DecorrelatorBuilder::default()
    }

    /// The decorrelation strategy
    pub fn method(&self) -> Decorrelation {
        self.method
    }

    /// How reduced potentials are collapsed to one series
    pub fn series_method(&self) -> SeriesMethod {
        self.series_method
    }

    /// Indices of the samples of `series` to keep, in increasing order
    ///
    /// Fails with [`AlchemError::InsufficientData`] if samples are discarded and fewer than two
    /// remain.
    pub fn select(&self, series: &Timeseries) -> Result<Vec<usize>> {
        let sliced = slice_indices(series.time(), self.lower, self.upper, self.step);
        let values: Vec<f64> = sliced.iter().map(|&i| series.values()[i]).collect();
        let n = values.len();

        let insufficient = |retained| AlchemError::InsufficientData {
            state: series.state().clone(),
            retained,
            total: series.len(),
        };

        let local: Vec<usize> = match self.method {
            Decorrelation::None => (0..n).collect(),
            Decorrelation::FixedStride(stride) => (0..n).step_by(stride).collect(),
            Decorrelation::StatisticalInefficiency(method) => {
                if n < 2 {
                    return Err(insufficient(n));
                }
                let (start, g) = if self.remove_burnin {
                    let eq = detect_equilibration(&values, &method, self.nskip);
                    log::debug!(
                        "State {}: equilibrated after {} samples, n_eff = {:.1}",
                        series.state(),
                        eq.t0,
                        eq.n_eff
                    );
                    (eq.t0, eq.g)
                } else {
                    (0, method.statistical_inefficiency(&values))
                };
                log::debug!("State {}: statistical inefficiency {:.3}", series.state(), g);
                subsample_indices(n - start, g, self.conservative)
                    .into_iter()
                    .map(|i| i + start)
                    .collect()
            }
        };

        let selected: Vec<usize> = local.into_iter().map(|i| sliced[i]).collect();
        if selected.len() < 2 && selected.len() < series.len() {
            return Err(insufficient(selected.len()));
        }
        log::info!(
            "State {}: kept {} of {} samples",
            series.state(),
            selected.len(),
            series.len()
        );
        Ok(selected)
    }

    /// Decorrelate one block of reduced potentials
    pub fn decorrelate_potentials(&self, samples: &PotentialSamples) -> Result<PotentialSamples> {
        let series = samples.series(self.series_method)?;
        Ok(samples.select(&self.select(&series)?))
    }

    /// Decorrelate one block of gradients
    pub fn decorrelate_gradients(&self, samples: &GradientSamples) -> Result<GradientSamples> {
        Ok(samples.select(&self.select(&samples.series())?))
    }

    /// Decorrelate the blocks of every state in parallel
    pub fn decorrelate_all_potentials(
        &self,
        samples: &[PotentialSamples],
    ) -> Result<Vec<PotentialSamples>> {
        samples
            .par_iter()
            .map(|s| self.decorrelate_potentials(s))
            .collect()
    }

    /// Decorrelate the gradient blocks of every state in parallel
    pub fn decorrelate_all_gradients(
        &self,
        samples: &[GradientSamples],
    ) -> Result<Vec<GradientSamples>> {
        samples
            .par_iter()
            .map(|s| self.decorrelate_gradients(s))
            .collect()
    }
}
