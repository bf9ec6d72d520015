//! Synthetic systems with analytically known free energies.

use crate::errors::*;
use crate::matrix::ReducedPotentials;
use crate::state::Lambda;
use crate::timeseries::{GradientSamples, PotentialSamples};
use ndarray::{array, Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, StandardNormal};

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Test cases using harmonic oscillators.
///
/// State `k` has the reduced potential $u_k(x) = \beta K_k (x - O_k)^2 / 2$.
///
/// # Examples
///
/// Generate energy samples with default parameters.
///
/// ```
/// use alchemrs::testsystems::*;
/// use ndarray::array;
///
/// let testcase = HarmonicOscillator::default();
/// let Sample {x_n, u_kn, n_k, s_n} = testcase.sample(array![10, 20, 30, 40, 50]).unwrap();
/// assert_eq!(u_kn.dim(), (5, 150));
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", error = "AlchemError"))]
pub struct HarmonicOscillator {
    /// Offset parameters for each state.
    #[builder(default = "array![0.0, 1.0, 2.0, 3.0, 4.0]")]
    o_k: Array1<f64>,

    /// Force constants for each state.
    #[builder(default = "array![1.0, 2.0, 4.0, 8.0, 16.0]")]
    k_k: Array1<f64>,

    /// Inverse temperature
    #[builder(default = "1.0")]
    beta: f64,
}

impl HarmonicOscillatorBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(o_k), Some(k_k)) = (&self.o_k, &self.k_k) {
            if o_k.len() != k_k.len() {
                return Err(format!(
                    "o_k and k_k must have equal lengths (not {} and {})",
                    o_k.len(),
                    k_k.len()
                ));
            }
        }
        if let Some(k_k) = &self.k_k {
            if k_k.iter().any(|&k| !(k > 0.0)) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(beta) = self.beta {
            if !(beta > 0.0) {
                return Err("beta must be positive".to_string());
            }
        }

        Ok(())
    }
}

impl HarmonicOscillator {
    /// Get a new builder for the `HarmonicOscillator` struct.
    pub fn builder() -> HarmonicOscillatorBuilder {
        HarmonicOscillatorBuilder::default()
    }

    /// Number of states
    pub fn k(&self) -> usize {
        self.o_k.len()
    }

    /// Mean position in each state
    pub fn analytical_means(&self) -> Array1<f64> {
        self.o_k.clone()
    }

    /// Variance of the position in each state
    pub fn analytical_variances(&self) -> Array1<f64> {
        self.k_k.mapv(|k| 1.0 / (self.beta * k))
    }

    /// Standard deviation of the position in each state
    pub fn analytical_standard_deviations(&self) -> Array1<f64> {
        self.analytical_variances().mapv(f64::sqrt)
    }

    /// Dimensionless free energies relative to state 0
    pub fn analytical_free_energies(&self) -> Array1<f64> {
        let f_k = self
            .k_k
            .mapv(|k| -(2.0 * std::f64::consts::PI / (self.beta * k)).sqrt().ln());
        &f_k - f_k[0]
    }

    /// Draw samples from the distribution with a random seed
    pub fn sample(&self, n_k: Array1<usize>) -> Result<Sample> {
        self.sample_inner(n_k, None)
    }

    /// Draw samples from the distribution with a specified seed
    pub fn sample_with_seed(&self, n_k: Array1<usize>, seed: u64) -> Result<Sample> {
        self.sample_inner(n_k, Some(seed))
    }

    fn sample_inner(&self, n_k: Array1<usize>, seed: Option<u64>) -> Result<Sample> {
        if n_k.len() != self.k() {
            return Err(AlchemError::ArrayLengthMismatch(n_k.len(), self.k()));
        }
        let mut rng = rng_from(seed);
        let sigma_k = self.analytical_standard_deviations();

        let mut x_n = Vec::with_capacity(n_k.sum());
        let mut s_n = Vec::with_capacity(n_k.sum());
        for (k, &count) in n_k.iter().enumerate() {
            let normal = Normal::new(self.o_k[k], sigma_k[k])
                .map_err(|e| AlchemError::BuilderError(e.to_string()))?;
            x_n.extend(normal.sample_iter(&mut rng).take(count));
            s_n.extend(std::iter::repeat(k).take(count));
        }
        let x_n = Array1::from(x_n);
        let u_kn = Array2::from_shape_fn((self.k(), x_n.len()), |(k, n)| {
            0.5 * self.beta * self.k_k[k] * (x_n[n] - self.o_k[k]).powi(2)
        });

        Ok(Sample {
            x_n,
            u_kn,
            n_k,
            s_n: Array1::from(s_n),
        })
    }
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("HarmonicOscillator should not fail with default params")
    }
}

/// A sample from a test case
#[derive(Debug, Clone)]
pub struct Sample {
    /// `x_n[n]` is sample n (in concatenated indexing)
    pub x_n: Array1<f64>,
    /// `u_kn[k,n]` is the reduced potential of sample n (in concatenated indexing) evaluated at
    /// state k.
    pub u_kn: Array2<f64>,
    /// `n_k[k]` is the number of samples generated from state k
    pub n_k: Array1<usize>,
    /// `s_n[n]` is the state of origin of `x_n[n]`
    pub s_n: Array1<usize>,
}

impl Sample {
    /// Assemble the sample into an estimator input
    pub fn reduced_potentials(&self) -> Result<ReducedPotentials> {
        ReducedPotentials::builder()
            .u_kn(self.u_kn.clone())
            .n_k(self.n_k.clone())
            .s_n(self.s_n.clone())
            .build()
    }
}

/// A harmonic oscillator whose force constant and offset are switched linearly in λ
///
/// $$
///     u_\lambda(x) = \frac{\beta}{2}\left[
///         (1 - \lambda) K_0 (x - O_0)^2 + \lambda K_1 (x - O_1)^2
///     \right]
/// $$
///
/// Samples at each λ are drawn as an AR(1) chain with lag-one autocorrelation `correlation`,
/// which mimics the correlated output of a molecular dynamics trajectory.
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate", error = "AlchemError"))]
pub struct LinearCoupling {
    /// Offsets of the end states
    #[builder(default = "[0.0, 1.0]")]
    offsets: [f64; 2],

    /// Force constants of the end states
    #[builder(default = "[1.0, 4.0]")]
    force_constants: [f64; 2],

    /// The sampled λ values
    #[builder(default = "vec![0.0, 0.25, 0.5, 0.75, 1.0]")]
    lambdas: Vec<f64>,

    /// Lag-one autocorrelation of each sampled chain
    #[builder(default = "0.0")]
    correlation: f64,

    /// Inverse temperature
    #[builder(default = "1.0")]
    beta: f64,
}

impl LinearCouplingBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(force_constants) = &self.force_constants {
            if force_constants.iter().any(|&k| !(k > 0.0)) {
                return Err("force constants must be positive".to_string());
            }
        }
        if let Some(correlation) = self.correlation {
            if !(0.0..1.0).contains(&correlation) {
                return Err("correlation must lie in [0, 1)".to_string());
            }
        }
        if let Some(lambdas) = &self.lambdas {
            if lambdas.iter().any(|l| !(0.0..=1.0).contains(l)) {
                return Err("lambdas must lie in [0, 1]".to_string());
            }
        }
        Ok(())
    }
}

/// Potentials and gradients sampled along a coupling path
#[derive(Debug, Clone)]
pub struct CoupledSample {
    /// Reduced potentials at every λ, one block per sampled λ
    pub potentials: Vec<PotentialSamples>,
    /// dH/dλ, one block per sampled λ
    pub gradients: Vec<GradientSamples>,
}

impl LinearCoupling {
    /// Get a new builder for the `LinearCoupling` struct.
    pub fn builder() -> LinearCouplingBuilder {
        LinearCouplingBuilder::default()
    }

    fn force_constant(&self, lambda: f64) -> f64 {
        (1.0 - lambda) * self.force_constants[0] + lambda * self.force_constants[1]
    }

    fn centre(&self, lambda: f64) -> f64 {
        let [k0, k1] = self.force_constants;
        let [o0, o1] = self.offsets;
        ((1.0 - lambda) * k0 * o0 + lambda * k1 * o1) / self.force_constant(lambda)
    }

    fn reduced_potential(&self, lambda: f64, x: f64) -> f64 {
        let [k0, k1] = self.force_constants;
        let [o0, o1] = self.offsets;
        0.5 * self.beta * ((1.0 - lambda) * k0 * (x - o0).powi(2) + lambda * k1 * (x - o1).powi(2))
    }

    fn gradient(&self, x: f64) -> f64 {
        let [k0, k1] = self.force_constants;
        let [o0, o1] = self.offsets;
        0.5 * self.beta * (k1 * (x - o1).powi(2) - k0 * (x - o0).powi(2))
    }

    /// Dimensionless free energy of each sampled λ relative to the first
    pub fn analytical_free_energies(&self) -> Array1<f64> {
        let [k0, k1] = self.force_constants;
        let [o0, o1] = self.offsets;
        let f = |lambda: f64| {
            let k = self.force_constant(lambda);
            let minimum =
                0.5 * self.beta * (1.0 - lambda) * lambda * k0 * k1 * (o0 - o1).powi(2) / k;
            minimum - (2.0 * std::f64::consts::PI / (self.beta * k)).sqrt().ln()
        };
        let f_k: Array1<f64> = self.lambdas.iter().map(|&l| f(l)).collect();
        match f_k.first() {
            Some(&f0) => f_k.mapv(|f| f - f0),
            None => f_k,
        }
    }

    /// Draw `n` samples at every λ with a random seed
    pub fn sample(&self, n: usize) -> Result<CoupledSample> {
        self.sample_inner(n, &mut rng_from(None))
    }

    /// Draw `n` samples at every λ with a specified seed
    pub fn sample_with_seed(&self, n: usize, seed: u64) -> Result<CoupledSample> {
        self.sample_inner(n, &mut rng_from(Some(seed)))
    }

    fn sample_inner<R: Rng>(&self, n: usize, rng: &mut R) -> Result<CoupledSample> {
        let evaluated: Vec<Lambda> = self.lambdas.iter().map(|&l| l.into()).collect();
        let time: Vec<f64> = (0..n).map(|t| t as f64).collect();
        let phi = self.correlation;
        let mut potentials = Vec::with_capacity(self.lambdas.len());
        let mut gradients = Vec::with_capacity(self.lambdas.len());

        for &lambda in &self.lambdas {
            let centre = self.centre(lambda);
            let sigma = (1.0 / (self.beta * self.force_constant(lambda))).sqrt();
            let mut x = Vec::with_capacity(n);
            let mut previous: f64 = rng.sample(StandardNormal);
            for _ in 0..n {
                let noise: f64 = rng.sample(StandardNormal);
                previous = phi * previous + (1.0 - phi * phi).sqrt() * noise;
                x.push(centre + sigma * previous);
            }

            let u_nk = Array2::from_shape_fn((n, self.lambdas.len()), |(t, k)| {
                self.reduced_potential(self.lambdas[k], x[t])
            });
            let dhdl = Array2::from_shape_fn((n, 1), |(t, _)| self.gradient(x[t]));
            potentials.push(PotentialSamples::new(
                lambda.into(),
                evaluated.clone(),
                time.clone(),
                u_nk,
            )?);
            gradients.push(GradientSamples::new(lambda.into(), time.clone(), dhdl)?);
        }

        Ok(CoupledSample {
            potentials,
            gradients,
        })
    }
}

impl Default for LinearCoupling {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("LinearCoupling should not fail with default params")
    }
}
