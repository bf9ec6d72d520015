//! Convergence of estimates with the amount of data.

use crate::errors::*;
use crate::estimators::{Estimate, Estimator};
use crate::matrix::DataWindow;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// One estimate of the end-to-end free energy difference on part of the data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Fraction of each state's samples used; for blocks, the end of the block
    pub fraction: f64,
    /// Estimated difference between the first and last states in kT
    pub delta_f: f64,
    /// Standard error of `delta_f`
    pub std_error: f64,
}

impl CurvePoint {
    fn new(fraction: f64, estimate: Estimate) -> Self {
        Self {
            fraction,
            delta_f: estimate.delta_f,
            std_error: estimate.std_error(),
        }
    }
}

/// Estimates on growing fractions of the data, taken from the start and from the end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCurve {
    /// Estimates on the first `fraction` of each state's samples
    pub forward: Vec<CurvePoint>,
    /// Estimates on the last `fraction` of each state's samples
    pub backward: Vec<CurvePoint>,
}

fn check_num(num: usize) -> Result<()> {
    if num == 0 {
        return Err(AlchemError::IncompatibleInput(
            "at least one fraction is required".to_string(),
        ));
    }
    Ok(())
}

/// Forward and backward convergence of an estimator
///
/// The estimator is run on the first and the last `i / num` of every state's samples for
/// `i = 1..=num`. A converged simulation gives forward and backward curves that agree within
/// their error bars well before the full data set.
pub fn forward_backward_convergence<E: Estimator>(
    estimator: &E,
    input: &E::Input,
    num: usize,
) -> Result<ConvergenceCurve> {
    check_num(num)?;
    let points = (1..=num)
        .into_par_iter()
        .map(|i| {
            let fraction = i as f64 / num as f64;
            let forward = estimator.estimate(&input.window(0.0, fraction)?)?.total();
            let backward = estimator.estimate(&input.window(1.0 - fraction, 1.0)?)?.total();
            Ok((CurvePoint::new(fraction, forward), CurvePoint::new(fraction, backward)))
        })
        .collect::<Result<Vec<_>>>()?;
    log::debug!("Forward/backward convergence over {} fractions", num);

    let (forward, backward) = points.into_iter().unzip();
    Ok(ConvergenceCurve { forward, backward })
}

/// Estimates on `num` consecutive, disjoint blocks of every state's samples
pub fn block_average<E: Estimator>(
    estimator: &E,
    input: &E::Input,
    num: usize,
) -> Result<Vec<CurvePoint>> {
    check_num(num)?;
    (0..num)
        .into_par_iter()
        .map(|i| {
            let start = i as f64 / num as f64;
            let end = (i + 1) as f64 / num as f64;
            let estimate = estimator.estimate(&input.window(start, end)?)?.total();
            Ok(CurvePoint::new(end, estimate))
        })
        .collect()
}

/// Forward and backward running averages of a series and the convergence time derived from
/// them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeAverages {
    /// Fractions of the series at which the averages are taken
    pub fractions: Vec<f64>,
    /// Average of the first `fraction` of the series
    pub forward: Vec<f64>,
    /// Average of the last `fraction` of the series
    pub backward: Vec<f64>,
    /// Fraction of the series after which a running average stays within tolerance of the
    /// final value
    pub rc: f64,
}

/// Smallest grid fraction from which every later average lies within `tol` of `target`
fn settled_at(fractions: &[f64], averages: &[f64], target: f64, tol: f64) -> f64 {
    let first_settled = averages
        .iter()
        .rposition(|a| (a - target).abs() >= tol)
        .map_or(0, |i| i + 1);
    fractions.get(first_settled).copied().unwrap_or(1.0)
}

/// Convergence time $R_c$ of a series from its forward and backward cumulative averages
///
/// The averages are evaluated on a grid of fractions spaced by `precision`. A direction
/// settles at the first grid fraction after which its running average never again deviates
/// from the mean of the full series by `tol` or more. $R_c$ is the earlier of the two, so
/// $R_c$ near zero means the series was converged almost immediately and $R_c = 1$ means it
/// never settled.
///
/// # References
///
/// 1. Fan S, Iorga BI, and Beckstein O. Prediction of octanol-water partition coefficients
/// for the SAMPL6-logP molecules using molecular dynamics simulations with OPLS-AA, AMBER and
/// CHARMM force fields. J. Comput. Aided Mol. Des. 34:543, 2020
pub fn fwdrev_cumavg_rc(series: &[f64], precision: f64, tol: f64) -> Result<CumulativeAverages> {
    if series.is_empty() {
        return Err(AlchemError::IncompatibleInput("series is empty".to_string()));
    }
    if !(precision > 0.0 && precision <= 1.0) {
        return Err(AlchemError::IncompatibleInput(format!(
            "precision must lie in (0, 1], not {}",
            precision
        )));
    }
    let n = series.len();
    let steps = (1.0 / precision).round().max(1.0) as usize;
    let target = series.iter().sum::<f64>() / n as f64;

    let mut forward_sums = Vec::with_capacity(n + 1);
    let mut backward_sums = Vec::with_capacity(n + 1);
    forward_sums.push(0.0);
    backward_sums.push(0.0);
    for i in 0..n {
        forward_sums.push(forward_sums[i] + series[i]);
        backward_sums.push(backward_sums[i] + series[n - 1 - i]);
    }

    let fractions: Vec<f64> = (1..=steps).map(|i| i as f64 / steps as f64).collect();
    let counts: Vec<usize> = fractions
        .iter()
        .map(|f| ((f * n as f64).ceil() as usize).clamp(1, n))
        .collect();
    let forward: Vec<f64> = counts.iter().map(|&c| forward_sums[c] / c as f64).collect();
    let backward: Vec<f64> = counts.iter().map(|&c| backward_sums[c] / c as f64).collect();

    let rc = settled_at(&fractions, &forward, target, tol)
        .min(settled_at(&fractions, &backward, target, tol));
    Ok(CumulativeAverages {
        fractions,
        forward,
        backward,
        rc,
    })
}

/// Aggregate convergence $A_c$ over several series
///
/// The mean of $1 - R_c$: one when every series is converged from the start, zero when none
/// settles.
pub fn a_c(series: &[Vec<f64>], precision: f64, tol: f64) -> Result<f64> {
    if series.is_empty() {
        return Err(AlchemError::IncompatibleInput("no series given".to_string()));
    }
    let total = series
        .iter()
        .map(|s| fwdrev_cumavg_rc(s, precision, tol).map(|c| 1.0 - c.rc))
        .sum::<Result<f64>>()?;
    Ok(total / series.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimators::{Bar, Ti};
    use crate::matrix::{GradientSet, ReducedPotentials};
    use crate::testsystems::{HarmonicOscillator, LinearCoupling};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn potentials() -> ReducedPotentials {
        HarmonicOscillator::builder()
            .o_k(array![0.0, 0.5, 1.0])
            .k_k(array![1.0, 1.5, 2.0])
            .build()
            .unwrap()
            .sample_with_seed(array![400, 400, 400], 21)
            .unwrap()
            .reduced_potentials()
            .unwrap()
    }

    #[test]
    fn full_fraction_matches_full_estimate() {
        let u = potentials();
        let curve = forward_backward_convergence(&Bar::default(), &u, 4).unwrap();
        let full = Bar::default().estimate(&u).unwrap().total();
        assert_eq!(curve.forward.len(), 4);
        assert_eq!(curve.forward[3].fraction, 1.0);
        assert_abs_diff_eq!(curve.forward[3].delta_f, full.delta_f, epsilon = 1e-12);
        assert_abs_diff_eq!(curve.backward[3].delta_f, full.delta_f, epsilon = 1e-12);
        assert!(curve.forward[0].std_error > curve.forward[3].std_error);
    }

    #[test]
    fn blocks_cover_the_data() {
        let coupling = LinearCoupling::default().sample_with_seed(200, 4).unwrap();
        let gradients = GradientSet::from_samples(&coupling.gradients).unwrap();
        let blocks = block_average(&Ti::default(), &gradients, 4).unwrap();
        let fractions: Vec<f64> = blocks.iter().map(|p| p.fraction).collect();
        assert_eq!(fractions, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn zero_fractions_are_rejected() {
        let u = potentials();
        assert!(forward_backward_convergence(&Bar::default(), &u, 0).is_err());
    }

    #[test]
    fn constant_series_converges_immediately() {
        let averages = fwdrev_cumavg_rc(&[2.0; 100], 0.1, 0.01).unwrap();
        assert_eq!(averages.fractions.len(), 10);
        assert_abs_diff_eq!(averages.rc, 0.1);
    }

    #[test]
    fn drifting_start_delays_convergence() {
        let series: Vec<f64> = (0..100).map(|i| if i < 50 { 10.0 } else { 0.0 }).collect();
        let averages = fwdrev_cumavg_rc(&series, 0.1, 0.5).unwrap();
        // Neither running average is within tolerance before the full series
        assert_abs_diff_eq!(averages.rc, 1.0);
        let flat = a_c(&[vec![1.0; 20], series], 0.1, 0.5).unwrap();
        assert_abs_diff_eq!(flat, 0.45, epsilon = 1e-12);
    }
}
