//! Multistate Bennett acceptance ratio.

use super::{Bar, Estimator, FreeEnergies, SolverReport};
use crate::diagnostics::OverlapMatrix;
use crate::errors::*;
use crate::matrix::ReducedPotentials;
use crate::numerics::{logsumexp, pseudo_inverse, sorted_symmetric_eigen, to_dmatrix};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Define the initial guess for free energies
///
/// `InitialFreeEnergies::BAR` works best when the states are ordered such that adjacent states
/// maximize the overlap between states. It's up to the user to arrange the states in such an
/// order, or at least close to such an order. If you are uncertain what the order of states
/// should be, or if it does not make sense to think of states as adjacent, then choose
/// `InitialFreeEnergies::Zeros`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitialFreeEnergies {
    /// Use the specified free energy values
    Specified(Vec<f64>),
    /// Initialize all free energies to zero
    Zeros,
    /// Use BAR between neighbouring states to initialize the free energies.
    BAR,
}

impl Default for InitialFreeEnergies {
    fn default() -> Self {
        Self::Zeros
    }
}

impl From<&[f64]> for InitialFreeEnergies {
    fn from(slice: &[f64]) -> Self {
        Self::Specified(Vec::from(slice))
    }
}

/// Multistate Bennett acceptance ratio method (MBAR) for the analysis of multiple equilibrium
/// samples.
///
/// Solves
///
/// $$
///     f_i = -\ln \sum_{n=1}^N \frac{e^{-u_i(x_n)}}{\sum_k N_k e^{f_k - u_k(x_n)}}
/// $$
///
/// with $f_0 = 0$. Each iteration takes both a self-consistent update and a Newton-Raphson step
/// and keeps whichever leaves the weights closer to normalised.
///
/// # Notes
///
/// Note that this method assumes the data are uncorrelated.
///
/// Correlated data must be subsampled to extract uncorrelated (effectively independent) samples.
///
/// # References
///
/// 1. Shirts MR and Chodera JD. Statistically optimal analysis of samples from multiple
/// equilibrium states. J. Chem. Phys. 129:124105, 2008 <http://dx.doi.org/10.1063/1.2978177>
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", error = "AlchemError"))]
pub struct Mbar {
    /// Set to limit the maximum number of iterations performed
    #[builder(default = "1000")]
    maximum_iterations: usize,

    /// Converged once every state's weights sum to one within this tolerance
    #[builder(default = "1.0e-8")]
    relative_tolerance: f64,

    /// Set to the initial dimensionless free energies to use as a guess
    #[builder(default)]
    initial_free_energies: InitialFreeEnergies,

    /// Spectral gap of the overlap matrix below which the states are treated as disconnected
    #[builder(default = "1.0e-10")]
    singular_tolerance: f64,
}

impl MbarBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.maximum_iterations == Some(0) {
            return Err("maximum_iterations must be at least 1".to_string());
        }
        if let Some(tol) = self.relative_tolerance {
            if !(tol > 0.0) {
                return Err("relative_tolerance must be positive".to_string());
            }
        }
        Ok(())
    }
}

impl Default for Mbar {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Default MBAR builder should never fail")
    }
}

impl Mbar {
    /// Get a new builder for the `Mbar` struct.
    pub fn builder() -> MbarBuilder {
        MbarBuilder::default()
    }

    /// The iteration cap
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

    fn initial_f_k(&self, potentials: &ReducedPotentials) -> Result<Array1<f64>> {
        let k = potentials.k();
        let f_k = match &self.initial_free_energies {
            InitialFreeEnergies::Specified(energies) => {
                if energies.len() != k {
                    return Err(AlchemError::ArrayLengthMismatch(energies.len(), k));
                }
                Array1::from(energies.clone())
            }
            InitialFreeEnergies::Zeros => Array1::zeros(k),
            InitialFreeEnergies::BAR => {
                Bar::default().estimate(potentials)?.delta_f().row(0).to_owned()
            }
        };
        Ok(&f_k - f_k[0])
    }

    /// Solve the MBAR equations
    pub fn solve<'a>(&self, potentials: &'a ReducedPotentials) -> Result<MbarSolution<'a>> {
        let u_kn = potentials.u_kn();
        let n_k = potentials.n_k().mapv(|n| n as f64);
        let log_n_k = n_k.mapv(f64::ln);

        let mut f_k = self.initial_f_k(potentials)?;
        let (mut log_w_kn, mut residual) = log_weights(u_kn, &log_n_k, &f_k);
        let mut iterations = 0;
        while !(residual < self.relative_tolerance) {
            if iterations == self.maximum_iterations {
                return Err(AlchemError::Convergence {
                    states: (0..potentials.k()).collect(),
                    iterations,
                    residual,
                });
            }
            iterations += 1;

            let w_kn = log_w_kn.mapv(f64::exp);
            let row_sums = w_kn.sum_axis(Axis(1));

            let f_sci = &f_k - &row_sums.mapv(f64::ln);
            let f_sci = &f_sci - f_sci[0];
            let (log_w_sci, residual_sci) = log_weights(u_kn, &log_n_k, &f_sci);

            let f_nr = newton_step(&w_kn, &row_sums, &n_k, &f_k);
            let (log_w_nr, residual_nr) = log_weights(u_kn, &log_n_k, &f_nr);

            if residual_nr < residual_sci {
                f_k = f_nr;
                log_w_kn = log_w_nr;
                residual = residual_nr;
            } else {
                f_k = f_sci;
                log_w_kn = log_w_sci;
                residual = residual_sci;
            }
            log::trace!("MBAR iteration {}: residual {:e}", iterations, residual);
        }
        log::debug!(
            "MBAR converged in {} iterations over {} states (residual {:e})",
            iterations,
            potentials.k(),
            residual
        );

        Ok(MbarSolution {
            potentials,
            f_k,
            log_w_kn,
            report: SolverReport {
                iterations,
                residual,
            },
            singular_tolerance: self.singular_tolerance,
        })
    }
}

impl Estimator for Mbar {
    type Input = ReducedPotentials;

    fn estimate(&self, input: &ReducedPotentials) -> Result<FreeEnergies> {
        self.solve(input)?.free_energies()
    }
}

/// Log weights $\ln W_{kn}$ at free energies `f_k` and the largest deviation of a state's
/// weights from normalisation
fn log_weights(
    u_kn: ArrayView2<'_, f64>,
    log_n_k: &Array1<f64>,
    f_k: &Array1<f64>,
) -> (Array2<f64>, f64) {
    let (k, n_tot) = u_kn.dim();
    let log_denominator: Vec<f64> = (0..n_tot)
        .into_par_iter()
        .map(|n| logsumexp((0..k).map(|i| log_n_k[i] + f_k[i] - u_kn[[i, n]])))
        .collect();
    let log_w_kn =
        Array2::from_shape_fn((k, n_tot), |(i, n)| f_k[i] - u_kn[[i, n]] - log_denominator[n]);
    let residual = log_w_kn
        .axis_iter(Axis(0))
        .map(|row| (row.iter().map(|l| l.exp()).sum::<f64>() - 1.0).abs())
        .map(|r| if r.is_nan() { f64::INFINITY } else { r })
        .fold(0.0, f64::max);
    (log_w_kn, residual)
}

/// Jacobian of `N_k (sum_n W_kn - 1)` with respect to `f`
fn hessian(w_kn: &Array2<f64>, row_sums: &Array1<f64>, n_k: &Array1<f64>) -> Array2<f64> {
    let k = n_k.len();
    let wwt = w_kn.dot(&w_kn.t());
    Array2::from_shape_fn((k, k), |(i, j)| {
        let diagonal = if i == j { n_k[i] * row_sums[i] } else { 0.0 };
        diagonal - n_k[i] * n_k[j] * wwt[[i, j]]
    })
}

/// One Newton-Raphson step with $f_0$ held fixed
fn newton_step(
    w_kn: &Array2<f64>,
    row_sums: &Array1<f64>,
    n_k: &Array1<f64>,
    f_k: &Array1<f64>,
) -> Array1<f64> {
    let gradient = n_k * &row_sums.mapv(|s| s - 1.0);
    let hessian = hessian(w_kn, row_sums, n_k);
    let step = pseudo_inverse(hessian.slice(s![1.., 1..])).dot(&gradient.slice(s![1..]));
    let mut next = f_k.clone();
    next.slice_mut(s![1..]).scaled_add(-1.0, &step);
    next
}

/// A converged MBAR solution
///
/// Borrows the reduced potentials it was solved from.
#[derive(Debug, Clone)]
pub struct MbarSolution<'a> {
    potentials: &'a ReducedPotentials,
    f_k: Array1<f64>,
    log_w_kn: Array2<f64>,
    report: SolverReport,
    singular_tolerance: f64,
}

impl<'a> MbarSolution<'a> {
    /// The reduced potentials that were solved
    pub fn potentials(&self) -> &'a ReducedPotentials {
        self.potentials
    }

    /// Retrieve a copy of the relative dimensionless free energy $f_k$ of states $k$
    pub fn f_k(&self) -> Array1<f64> {
        self.f_k.clone()
    }

    /// Retrieve a copy of the log weight matrix $\ln(W_{nk})$
    pub fn log_w_nk(&self) -> Array2<f64> {
        self.log_w_kn.t().to_owned()
    }

    /// Retrieve a copy of the weight matrix $W_{nk}$
    pub fn w_nk(&self) -> Array2<f64> {
        self.log_w_kn.t().mapv(f64::exp)
    }

    /// Iterations and final residual
    pub fn report(&self) -> SolverReport {
        self.report
    }

    fn w_kn(&self) -> Array2<f64> {
        self.log_w_kn.mapv(f64::exp)
    }

    fn n_k(&self) -> Array1<f64> {
        self.potentials.n_k().mapv(|n| n as f64)
    }

    /// Compute the effective sample number of each state
    ///
    /// The effective sample number $n_\mathrm{eff}(k)$ is an estimate of how many samples are
    /// contributing to the average at a given state.
    ///
    /// # Notes
    ///
    /// Using Kish (1965) formula (Kish, Leslie (1965). Survey Sampling. New York: Wiley)
    ///
    /// $$
    ///     n_\mathrm{eff}(k)
    ///         =  \frac{(\sum_{n=1}^N w_{kn})^2}{\sum_{n=1}^N w_{kn}^2}
    /// $$
    ///
    /// The effective sample number is most useful to diagnose when there are only a few samples
    /// contributing to the averages.
    pub fn n_eff(&self) -> Array1<f64> {
        self.w_kn()
            .axis_iter(Axis(0))
            .map(|row| row.sum().powi(2) / row.iter().map(|w| w * w).sum::<f64>())
            .collect()
    }

    /// Asymptotic covariance matrix $\Theta$ of the free energies
    ///
    /// Computed from the eigendecomposition $W^\top W = V S V^\top$ as
    ///
    /// $$
    ///     \Theta = V \Sigma \left(I - \Sigma V^\top M V \Sigma\right)^+ \Sigma V^\top
    /// $$
    ///
    /// with $\Sigma = S^{1/2}$ and $M = \mathrm{diag}(N_k)$.
    pub fn covariance(&self) -> Array2<f64> {
        let w_kn = self.w_kn();
        let k = w_kn.nrows();
        let (s, v) = sorted_symmetric_eigen(to_dmatrix(w_kn.dot(&w_kn.t()).view()));
        let sigma = Array2::from_diag(&s.mapv(|x| x.max(0.0).sqrt()));
        let v_sigma = v.dot(&sigma);
        let m = Array2::from_diag(&self.n_k());
        let inner = Array2::<f64>::eye(k) - v_sigma.t().dot(&m).dot(&v_sigma);
        v_sigma.dot(&pseudo_inverse(inner.view())).dot(&v_sigma.t())
    }

    /// Overlap matrix between all pairs of states
    pub fn overlap(&self) -> OverlapMatrix {
        OverlapMatrix::from_weights(
            self.potentials.states().to_vec(),
            self.w_kn().view(),
            &self.n_k(),
        )
    }

    /// Free energy differences with uncertainties from the covariance matrix
    ///
    /// Fails with [`AlchemError::SingularSystem`] if some states do not overlap with the rest.
    pub fn free_energies(&self) -> Result<FreeEnergies> {
        let overlap = self.overlap();
        let gap = overlap.scalar();
        if gap < self.singular_tolerance {
            let states = disconnected_states(overlap.matrix(), self.singular_tolerance);
            log::warn!("MBAR states {:?} do not overlap with state 0", states);
            return Err(AlchemError::SingularSystem { states, ratio: gap });
        }
        Ok(FreeEnergies::from_covariance(
            self.potentials.states().to_vec(),
            &self.f_k,
            self.covariance(),
            self.report,
        ))
    }
}

/// States not reachable from state 0 through overlaps above `threshold`
///
/// Falls back to every state but the first when the overlap graph is connected but the spectral
/// gap is still below the threshold.
fn disconnected_states(overlap: &Array2<f64>, threshold: f64) -> Vec<usize> {
    let k = overlap.nrows();
    let mut reached = vec![false; k];
    let mut queue = VecDeque::from(vec![0]);
    reached[0] = true;
    while let Some(i) = queue.pop_front() {
        for j in 0..k {
            if !reached[j] && overlap[[i, j]].max(overlap[[j, i]]) > threshold {
                reached[j] = true;
                queue.push_back(j);
            }
        }
    }
    let missing: Vec<usize> = (0..k).filter(|&i| !reached[i]).collect();
    if missing.is_empty() {
        (1..k).collect()
    } else {
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsystems::HarmonicOscillator;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn small_system() -> ReducedPotentials {
        ReducedPotentials::builder()
            .u_kn(array![
                [1.4, 2.3, 3.7, 4.1, 7.7, 9.1],
                [-1.6, -2.3, 9.7, 34.1, 27.7, 19.1],
                [4.4, 7.3, 9.7, 8.1, 4.7, 3.1],
            ])
            .n_k(array![2, 2, 2])
            .build()
            .unwrap()
    }

    #[test]
    fn build_mbar() {
        let mbar = Mbar::default();
        assert_eq!(mbar.maximum_iterations, 1000);
        assert_eq!(mbar.relative_tolerance, 1.0e-8);
        assert_eq!(mbar.initial_free_energies, InitialFreeEnergies::Zeros);
        assert!(Mbar::builder().maximum_iterations(0).build().is_err());
    }

    #[test]
    fn weights_are_normalised() {
        let u = small_system();
        let solution = Mbar::default().solve(&u).unwrap();
        assert_eq!(solution.f_k()[0], 0.0);
        let w_nk = solution.w_nk();
        for column in w_nk.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(column.sum(), 1.0, epsilon = 1e-7);
        }
        for row in w_nk.axis_iter(Axis(0)) {
            let mixture: f64 = row.iter().zip(u.n_k()).map(|(w, &n)| w * n as f64).sum();
            assert_abs_diff_eq!(mixture, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn initialisation_does_not_change_the_answer() {
        let u = HarmonicOscillator::default()
            .sample_with_seed(array![200, 200, 200, 200, 200], 5)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let zeros = Mbar::default().solve(&u).unwrap().f_k();
        let bar = Mbar::builder()
            .initial_free_energies(InitialFreeEnergies::BAR)
            .build()
            .unwrap()
            .solve(&u)
            .unwrap()
            .f_k();
        for (a, b) in zeros.iter().zip(bar.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn recovers_analytical_free_energies() {
        let ho = HarmonicOscillator::default();
        let u = ho
            .sample_with_seed(array![500, 500, 500, 500, 500], 17)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let fe = Mbar::default().estimate(&u).unwrap();
        let f_k = ho.analytical_free_energies();
        for k in 1..5 {
            let e = fe.estimate(0, k);
            assert!((e.delta_f - f_k[k]).abs() < 5.0 * e.std_error() + 1e-3);
        }
        assert!(fe.covariance().is_some());
        assert!(fe.report().iterations > 0);
    }

    #[test]
    fn uncertainties_are_calibrated() {
        let ho = HarmonicOscillator::builder()
            .o_k(array![0.0, 0.5])
            .k_k(array![1.0, 2.0])
            .build()
            .unwrap();
        let exact = ho.analytical_free_energies()[1];
        let trials = 40;
        let within = (0..trials)
            .filter(|&seed| {
                let u = ho
                    .sample_with_seed(array![200, 200], seed as u64)
                    .unwrap()
                    .reduced_potentials()
                    .unwrap();
                let e = Mbar::default().estimate(&u).unwrap().total();
                (e.delta_f - exact).abs() < 3.0 * e.std_error()
            })
            .count();
        assert!(within >= 38, "only {} of {} trials within 3 sigma", within, trials);
    }

    #[test]
    fn effective_sample_number_of_own_state() {
        let u = HarmonicOscillator::default()
            .sample_with_seed(array![100, 100, 100, 100, 100], 3)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let n_eff = Mbar::default().solve(&u).unwrap().n_eff();
        for &n in n_eff.iter() {
            assert!(n > 1.0 && n <= 500.0 + 1e-6);
        }
    }

    #[test]
    fn disjoint_states_are_singular() {
        let inf = f64::INFINITY;
        let u = ReducedPotentials::builder()
            .u_kn(array![[0.0, 0.1, inf, inf], [inf, inf, 0.2, 0.3]])
            .n_k(array![2, 2])
            .build()
            .unwrap();
        let err = Mbar::default().estimate(&u).unwrap_err();
        match err {
            AlchemError::SingularSystem { states, .. } => assert_eq!(states, vec![1]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn iteration_cap_raises_convergence_error() {
        let u = HarmonicOscillator::default()
            .sample_with_seed(array![50, 50, 50, 50, 50], 1)
            .unwrap()
            .reduced_potentials()
            .unwrap();
        let err = Mbar::builder().maximum_iterations(1).build().unwrap().estimate(&u).unwrap_err();
        assert!(matches!(err, AlchemError::Convergence { iterations: 1, .. }));
    }

    #[test]
    fn specified_guess_must_match_states() {
        let u = small_system();
        let mbar = Mbar::builder()
            .initial_free_energies(InitialFreeEnergies::from(&[0.0, 1.0][..]))
            .build()
            .unwrap();
        assert!(matches!(mbar.solve(&u), Err(AlchemError::ArrayLengthMismatch(2, 3))));
    }
}
