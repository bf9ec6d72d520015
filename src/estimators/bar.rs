//! Bennett acceptance ratio between neighbouring states.

use super::{Estimator, FreeEnergies, SolverReport};
use crate::errors::*;
use crate::matrix::ReducedPotentials;
use crate::numerics::{fermi, logaddexp, logsumexp, mean_and_variance};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Root finding scheme for the BAR equation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarMethod {
    /// Fixed point iteration of the two-state self-consistent equation
    SelfConsistentIteration,
    /// Illinois false position, bracketed by the forward and reverse exponential averages
    FalsePosition,
}

impl Default for BarMethod {
    fn default() -> Self {
        Self::SelfConsistentIteration
    }
}

/// Bennett acceptance ratio (BAR)
///
/// Solves for $\Delta f$ between each pair of neighbouring states from the forward work
/// $w_F = u_{k+1}(x) - u_k(x)$ on samples from state $k$ and the reverse work
/// $w_R = u_k(x) - u_{k+1}(x)$ on samples from state $k+1$. Differences between distant states
/// are sums of the neighbouring differences, with variances summed as if independent.
///
/// # References
///
/// 1. Bennett CH. Efficient estimation of free energy differences from Monte Carlo data.
/// J. Comput. Phys. 22:245, 1976 <https://doi.org/10.1016/0021-9991(76)90078-4>
/// 2. Shirts MR, Bair E, Hooker G, and Pande VS. Equilibrium free energies from nonequilibrium
/// measurements using maximum-likelihood methods. Phys. Rev. Lett. 91:140601, 2003
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", error = "AlchemError"))]
pub struct Bar {
    /// Set to limit the maximum number of iterations performed for each pair
    #[builder(default = "10000")]
    maximum_iterations: usize,

    /// Iteration stops when the change in $\Delta f$ falls below
    /// `relative_tolerance * max(|Δf|, 1)`
    #[builder(default = "1.0e-7")]
    relative_tolerance: f64,

    /// Root finding scheme
    #[builder(default)]
    method: BarMethod,
}

impl BarBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(tol) = self.relative_tolerance {
            if !(tol > 0.0) {
                return Err("relative_tolerance must be positive".to_string());
            }
        }
        if self.maximum_iterations == Some(0) {
            return Err("maximum_iterations must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for Bar {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Default BAR builder should never fail")
    }
}

/// Result of solving one pair of states
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarSolution {
    /// $f_1 - f_0$ in kT
    pub delta_f: f64,
    /// Variance of `delta_f`
    pub variance: f64,
    /// Iterations performed
    pub iterations: usize,
    /// Last change in `delta_f`
    pub residual: f64,
}

impl Bar {
    /// Get a new builder for the `Bar` struct.
    pub fn builder() -> BarBuilder {
        BarBuilder::default()
    }

    /// The iteration cap per pair
    pub fn maximum_iterations(&self) -> usize {
        self.maximum_iterations
    }

    /// The same estimator with a different iteration cap
    pub fn with_maximum_iterations(&self, maximum_iterations: usize) -> Self {
        Self {
            maximum_iterations: maximum_iterations.max(1),
            ..self.clone()
        }
    }

    /// Solve for the free energy difference from forward and reverse work values
    pub fn solve(&self, w_f: &[f64], w_r: &[f64]) -> Result<BarSolution> {
        self.solve_pair(w_f, w_r, [0, 1])
    }

    fn solve_pair(&self, w_f: &[f64], w_r: &[f64], pair: [usize; 2]) -> Result<BarSolution> {
        if w_f.is_empty() {
            return Err(AlchemError::EmptyState { state: pair[0] });
        }
        if w_r.is_empty() {
            return Err(AlchemError::EmptyState { state: pair[1] });
        }
        let (delta_f, iterations, residual) = match self.method {
            BarMethod::SelfConsistentIteration => self.self_consistent(w_f, w_r),
            BarMethod::FalsePosition => self.false_position(w_f, w_r),
        }
        .map_err(|(iterations, residual)| AlchemError::Convergence {
            states: pair.to_vec(),
            iterations,
            residual,
        })?;

        let (variance, overlap) = variance(w_f, w_r, delta_f);
        if !(overlap > 0.0 && variance.is_finite()) {
            log::warn!("BAR states {} and {} do not overlap", pair[0], pair[1]);
            return Err(AlchemError::SingularSystem {
                states: pair.to_vec(),
                ratio: overlap,
            });
        }
        log::debug!(
            "BAR {} -> {}: {:.6} +- {:.6} kT after {} iterations",
            pair[0],
            pair[1],
            delta_f,
            variance.sqrt(),
            iterations
        );
        Ok(BarSolution {
            delta_f,
            variance,
            iterations,
            residual,
        })
    }

    fn converged(&self, change: f64, delta_f: f64) -> bool {
        change <= self.relative_tolerance * delta_f.abs().max(1.0)
    }

    /// Fixed point of the two-state MBAR equations with $f_0 = 0$
    fn self_consistent(
        &self,
        w_f: &[f64],
        w_r: &[f64],
    ) -> std::result::Result<(f64, usize, f64), (usize, f64)> {
        let ln_n_f = (w_f.len() as f64).ln();
        let ln_n_r = (w_r.len() as f64).ln();
        // u_1 - u_0 on every pooled sample
        let du: Vec<f64> = w_f.iter().copied().chain(w_r.iter().map(|w| -w)).collect();

        let mut delta_f = 0.0;
        let mut change = f64::INFINITY;
        for iteration in 1..=self.maximum_iterations {
            let next = -logsumexp(du.iter().map(|&d| -logaddexp(ln_n_f + d, ln_n_r + delta_f)));
            change = (next - delta_f).abs();
            delta_f = next;
            if !delta_f.is_finite() {
                return Err((iteration, f64::NAN));
            }
            if self.converged(change, delta_f) {
                return Ok((delta_f, iteration, change));
            }
        }
        Err((self.maximum_iterations, change))
    }

    /// Illinois false position on the BAR implicit equation
    fn false_position(
        &self,
        w_f: &[f64],
        w_r: &[f64],
    ) -> std::result::Result<(f64, usize, f64), (usize, f64)> {
        let n_f = w_f.len() as f64;
        let n_r = w_r.len() as f64;
        let m = (n_f / n_r).ln();
        let zero = |delta_f: f64| {
            logsumexp(w_f.iter().map(|w| -logaddexp(0.0, m + w - delta_f)))
                - logsumexp(w_r.iter().map(|w| -logaddexp(0.0, -m + w + delta_f)))
        };

        // Exponential averaging brackets the root
        let mut upper = -(logsumexp(w_f.iter().map(|w| -w)) - n_f.ln());
        let mut lower = logsumexp(w_r.iter().map(|w| -w)) - n_r.ln();
        if lower > upper {
            std::mem::swap(&mut lower, &mut upper);
        }
        if !(lower.is_finite() && upper.is_finite()) {
            return Err((0, f64::NAN));
        }
        let mut f_lower = zero(lower);
        let mut f_upper = zero(upper);
        let mut width = (upper - lower).max(1.0);
        let mut expansions = 0;
        while f_lower > 0.0 || f_upper < 0.0 {
            if expansions == 64 || !(f_lower.is_finite() && f_upper.is_finite()) {
                return Err((0, f64::NAN));
            }
            if f_lower > 0.0 {
                lower -= width;
                f_lower = zero(lower);
            }
            if f_upper < 0.0 {
                upper += width;
                f_upper = zero(upper);
            }
            width *= 2.0;
            expansions += 1;
        }
        if f_lower == 0.0 {
            return Ok((lower, 0, 0.0));
        }
        if f_upper == 0.0 {
            return Ok((upper, 0, 0.0));
        }

        let mut previous = lower;
        let mut side = 0;
        let mut change = f64::INFINITY;
        for iteration in 1..=self.maximum_iterations {
            let x = if f_upper == f_lower {
                0.5 * (lower + upper)
            } else {
                (lower * f_upper - upper * f_lower) / (f_upper - f_lower)
            };
            let f_x = zero(x);
            change = (x - previous).abs();
            previous = x;
            if !f_x.is_finite() {
                return Err((iteration, f64::NAN));
            }
            if f_x == 0.0 || self.converged(change, x) {
                return Ok((x, iteration, change));
            }
            if f_x > 0.0 {
                upper = x;
                f_upper = f_x;
                if side == 1 {
                    f_lower /= 2.0;
                }
                side = 1;
            } else {
                lower = x;
                f_lower = f_x;
                if side == -1 {
                    f_upper /= 2.0;
                }
                side = -1;
            }
        }
        Err((self.maximum_iterations, change))
    }
}

/// Asymptotic variance of the BAR estimate and the smaller of the two mean acceptances
fn variance(w_f: &[f64], w_r: &[f64], delta_f: f64) -> (f64, f64) {
    let m = (w_f.len() as f64 / w_r.len() as f64).ln();
    let f_f: Vec<f64> = w_f.iter().map(|w| fermi(m + w - delta_f)).collect();
    let f_r: Vec<f64> = w_r.iter().map(|w| fermi(-m + w + delta_f)).collect();
    let (mean_f, var_f) = mean_and_variance(&f_f);
    let (mean_r, var_r) = mean_and_variance(&f_r);
    let variance =
        var_f / (w_f.len() as f64 * mean_f.powi(2)) + var_r / (w_r.len() as f64 * mean_r.powi(2));
    (variance, mean_f.min(mean_r))
}

impl Estimator for Bar {
    type Input = ReducedPotentials;

    fn estimate(&self, input: &ReducedPotentials) -> Result<FreeEnergies> {
        let u_kn = input.u_kn();
        let solutions = (1..input.k())
            .into_par_iter()
            .map(|k| {
                let w_f: Vec<f64> = input
                    .columns_of(k - 1)
                    .into_iter()
                    .map(|n| u_kn[[k, n]] - u_kn[[k - 1, n]])
                    .collect();
                let w_r: Vec<f64> = input
                    .columns_of(k)
                    .into_iter()
                    .map(|n| u_kn[[k - 1, n]] - u_kn[[k, n]])
                    .collect();
                self.solve_pair(&w_f, &w_r, [k - 1, k])
            })
            .collect::<Result<Vec<_>>>()?;

        let deltas: Vec<f64> = solutions.iter().map(|s| s.delta_f).collect();
        let variances: Vec<f64> = solutions.iter().map(|s| s.variance).collect();
        let report = SolverReport {
            iterations: solutions.iter().map(|s| s.iterations).max().unwrap_or(0),
            residual: solutions.iter().map(|s| s.residual).fold(0.0, f64::max),
        };
        Ok(FreeEnergies::from_adjacent(
            input.states().to_vec(),
            &deltas,
            &variances,
            report,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsystems::HarmonicOscillator;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn oscillator() -> HarmonicOscillator {
        HarmonicOscillator::builder()
            .o_k(array![0.0, 0.5, 1.0])
            .k_k(array![1.0, 2.0, 4.0])
            .build()
            .unwrap()
    }

    #[test]
    fn build_bar() {
        let bar = Bar::default();
        assert_eq!(bar.maximum_iterations, 10000);
        assert_eq!(bar.relative_tolerance, 1.0e-7);
        assert_eq!(bar.method, BarMethod::SelfConsistentIteration);
        assert!(Bar::builder().relative_tolerance(0.0).build().is_err());
    }

    #[test]
    fn recovers_analytical_free_energies() {
        let ho = oscillator();
        let u = ho
            .sample_with_seed(array![1000, 1000, 1000], 7)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let fe = Bar::default().estimate(&u).unwrap();
        let f_k = ho.analytical_free_energies();
        for k in 1..3 {
            let e = fe.estimate(0, k);
            assert!(
                (e.delta_f - f_k[k]).abs() < 4.0 * e.std_error(),
                "{} vs {} +- {}",
                e.delta_f,
                f_k[k],
                e.std_error()
            );
        }
        assert_abs_diff_eq!(
            fe.total().variance,
            fe.estimate(0, 1).variance + fe.estimate(1, 2).variance,
            epsilon = 1e-12
        );
    }

    #[test]
    fn methods_agree() {
        let ho = oscillator();
        let u = ho
            .sample_with_seed(array![300, 300, 300], 11)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let sci = Bar::default().estimate(&u).unwrap();
        let fp = Bar::builder()
            .method(BarMethod::FalsePosition)
            .relative_tolerance(1e-10)
            .build()
            .unwrap()
            .estimate(&u)
            .unwrap();
        assert_abs_diff_eq!(sci.total().delta_f, fp.total().delta_f, epsilon = 1e-5);
    }

    #[test]
    fn identical_work_gives_zero() {
        let w = vec![0.0; 50];
        let solution = Bar::default().solve(&w, &w).unwrap();
        assert_abs_diff_eq!(solution.delta_f, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(solution.variance, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn iteration_cap_raises_convergence_error() {
        let ho = oscillator();
        let u = ho
            .sample_with_seed(array![100, 100, 100], 3)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let err = Bar::builder().maximum_iterations(1).build().unwrap().estimate(&u).unwrap_err();
        assert!(err.is_convergence());
    }

    #[test]
    fn separated_states_are_singular() {
        let u = HarmonicOscillator::builder()
            .o_k(array![0.0, 100.0])
            .k_k(array![1.0, 1.0])
            .build()
            .unwrap()
            .sample_with_seed(array![200, 200], 5)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let err = Bar::default().estimate(&u).unwrap_err();
        assert!(matches!(err, AlchemError::SingularSystem { states, .. } if states == vec![0, 1]));

        let false_position = Bar::builder().method(BarMethod::FalsePosition).build().unwrap();
        assert!(false_position.estimate(&u).is_err());
    }

    #[test]
    fn empty_work_is_rejected() {
        let err = Bar::default().solve(&[], &[1.0]).unwrap_err();
        assert!(matches!(err, AlchemError::EmptyState { state: 0 }));
    }
}
