//! Estimator inputs: the reduced potential matrix $u_{kn}$ and per-state dH/dλ averages.
//!
//! Both are immutable once built and are shared by reference between estimators and
//! diagnostics.

use crate::errors::*;
use crate::state::Lambda;
use crate::timeseries::{GradientSamples, PotentialSamples};
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};

/// Data that can be cut down to a fraction of every state's samples
///
/// Used by the convergence diagnostics to re-run an estimator on part of the data.
pub trait DataWindow: Sized {
    /// Keep the samples between fractions `start` and `end` of each state's (time-ordered)
    /// samples, with `0.0 <= start < end <= 1.0`
    fn window(&self, start: f64, end: f64) -> Result<Self>;
}

fn window_bounds(len: usize, start: f64, end: f64) -> (usize, usize) {
    let lo = (start * len as f64).floor() as usize;
    let hi = ((end * len as f64).floor() as usize).min(len);
    (lo.min(hi), hi)
}

/// Reduced potentials of all states on the samples pooled from all states
///
/// # Notes
///
/// Samples must be uncorrelated; see [`crate::preprocessing`].
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(
    validate = "Self::validate",
    name = "build_inner",
    private,
    error = "AlchemError"
))]
pub struct ReducedPotentials {
    /// `u_kn[[k, n]]` is the reduced potential energy of configuration n evaluated at state `k`
    u_kn: Array2<f64>,

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    n_k: Array1<usize>,

    /// `s_n[n]` is the state sample `n` was drawn from
    ///
    /// If not given, the samples are assumed to be in K order: the first `n_k[0]` samples are
    /// from the 0th state, the next `n_k[1]` samples from the 1st state, and so forth.
    #[builder(default)]
    s_n: Array1<usize>,

    /// Labels of the K states. Defaults to the state indices.
    #[builder(default)]
    states: Vec<Lambda>,
}

impl ReducedPotentialsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let (Some(u_kn), Some(n_k)) = (&self.u_kn, &self.n_k) {
            let k = u_kn.len_of(Axis(0));
            let n_tot = u_kn.len_of(Axis(1));

            if n_tot != n_k.iter().sum::<usize>() {
                return Err(format!(
                    "n_k.sum() must equal the total number of samples ({})",
                    n_tot
                ));
            }

            if k != n_k.len() {
                return Err(format!(
                    "n_k's length must equal the number of states ({})",
                    k
                ));
            }

            if let Some(s_n) = &self.s_n {
                if !s_n.is_empty() && s_n.len() != n_tot {
                    return Err(format!(
                        "s_n's length must equal the total number of samples ({})",
                        n_tot
                    ));
                }
            }

            if let Some(states) = &self.states {
                if !states.is_empty() && states.len() != k {
                    return Err(format!(
                        "states' length must equal the number of states ({})",
                        k
                    ));
                }
            }
        }

        Ok(())
    }

    /// Build the matrix, filling in defaults and checking every state has samples
    pub fn build(&self) -> Result<ReducedPotentials> {
        self.build_inner()?.init()
    }
}

impl ReducedPotentials {
    /// Get a new builder for the `ReducedPotentials` struct.
    pub fn builder() -> ReducedPotentialsBuilder {
        ReducedPotentialsBuilder::default()
    }

    fn init(mut self) -> Result<Self> {
        let k = self.k();
        if k == 0 {
            return Err(AlchemError::BuilderError("u_kn must have at least one state".to_string()));
        }
        if self.states.is_empty() {
            self.states = Lambda::indices(k);
        }
        if self.s_n.is_empty() {
            self.s_n = self
                .n_k
                .iter()
                .enumerate()
                .flat_map(|(state, &count)| std::iter::repeat(state).take(count))
                .collect();
        }

        if let Some(state) = self.n_k.iter().position(|&count| count == 0) {
            return Err(AlchemError::EmptyState { state });
        }

        let mut counts = vec![0; k];
        for &state in &self.s_n {
            if state >= k {
                return Err(AlchemError::BuilderError(format!(
                    "s_n refers to state {} but there are only {} states",
                    state, k
                )));
            }
            counts[state] += 1;
        }
        if counts.iter().zip(&self.n_k).any(|(a, b)| a != b) {
            return Err(AlchemError::BuilderError(
                "s_n does not agree with n_k".to_string(),
            ));
        }

        for (n, &origin) in self.s_n.iter().enumerate() {
            for (state, &u) in self.u_kn.column(n).iter().enumerate() {
                let bad = if state == origin {
                    !u.is_finite()
                } else {
                    u.is_nan() || u == f64::NEG_INFINITY
                };
                if bad {
                    return Err(AlchemError::NonFinitePotential { state, sample: n });
                }
            }
        }

        Ok(self)
    }

    /// Assemble the matrix from one or more blocks of samples per state
    ///
    /// States are the evaluated states of the blocks, which must all agree. Blocks from the same
    /// state are concatenated in the order given.
    pub fn from_samples(samples: &[PotentialSamples]) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| AlchemError::IncompatibleInput("no samples given".to_string()))?;
        let states = first.evaluated().to_vec();

        for block in samples {
            if block.evaluated() != states.as_slice() {
                return Err(AlchemError::IncompatibleInput(format!(
                    "samples from state {} were evaluated at different states",
                    block.state()
                )));
            }
            if !states.contains(block.state()) {
                return Err(AlchemError::IncompatibleInput(format!(
                    "samples from state {} were not evaluated at their own state",
                    block.state()
                )));
            }
        }

        let mut columns: Vec<ArrayView2<'_, f64>> = Vec::with_capacity(samples.len());
        let mut n_k = Array1::zeros(states.len());
        let mut s_n = Vec::new();
        for (k, state) in states.iter().enumerate() {
            for block in samples.iter().filter(|b| b.state() == state) {
                columns.push(block.u_nk().reversed_axes());
                n_k[k] += block.len();
                s_n.extend(std::iter::repeat(k).take(block.len()));
            }
            if n_k[k] == 0 {
                return Err(AlchemError::EmptyState { state: k });
            }
        }

        let u_kn = concatenate(Axis(1), &columns)?;
        log::debug!(
            "Built u_kn with {} states and {} samples",
            states.len(),
            u_kn.ncols()
        );

        Self::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .s_n(Array1::from(s_n))
            .states(states)
            .build()
    }

    /// $N_{tot}$, the total number of snapshots from all states
    pub fn n_tot(&self) -> usize {
        self.u_kn.len_of(Axis(1))
    }

    /// $K$, the total number of thermodynamic states
    pub fn k(&self) -> usize {
        self.u_kn.len_of(Axis(0))
    }

    /// `u_kn[[k, n]]` is the reduced potential energy of configuration n evaluated at state `k`
    pub fn u_kn(&self) -> ArrayView2<'_, f64> {
        self.u_kn.view()
    }

    /// `n_k[k]` is the number of uncorrelated snapshots sampled from state `k`
    pub fn n_k(&self) -> &Array1<usize> {
        &self.n_k
    }

    /// `s_n[n]` is the state sample `n` was drawn from
    pub fn s_n(&self) -> &Array1<usize> {
        &self.s_n
    }

    /// Labels of the states
    pub fn states(&self) -> &[Lambda] {
        &self.states
    }

    /// Indices of the samples drawn from state `k`, in time order
    pub fn columns_of(&self, k: usize) -> Vec<usize> {
        self.s_n
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == k)
            .map(|(n, _)| n)
            .collect()
    }

    /// The matrix restricted to the states in `keep`, in that order
    ///
    /// Only samples drawn from the kept states remain.
    pub fn subset(&self, keep: &[usize]) -> Result<Self> {
        let mut cols = Vec::new();
        let mut s_n = Vec::new();
        let mut n_k = Array1::zeros(keep.len());
        for (new, &old) in keep.iter().enumerate() {
            let own = self.columns_of(old);
            n_k[new] = own.len();
            s_n.extend(std::iter::repeat(new).take(own.len()));
            cols.extend(own);
        }
        let u_kn = self.u_kn.select(Axis(0), keep).select(Axis(1), &cols);
        Self::builder()
            .u_kn(u_kn)
            .n_k(n_k)
            .s_n(Array1::from(s_n))
            .states(keep.iter().map(|&k| self.states[k].clone()).collect())
            .build()
    }
}

impl DataWindow for ReducedPotentials {
    fn window(&self, start: f64, end: f64) -> Result<Self> {
        let mut cols = Vec::with_capacity(self.n_tot());
        let mut s_n = Vec::with_capacity(self.n_tot());
        let mut n_k = Array1::zeros(self.k());
        for k in 0..self.k() {
            let own = self.columns_of(k);
            let (lo, hi) = window_bounds(own.len(), start, end);
            n_k[k] = hi - lo;
            s_n.extend(std::iter::repeat(k).take(hi - lo));
            cols.extend_from_slice(&own[lo..hi]);
        }
        Self::builder()
            .u_kn(self.u_kn.select(Axis(1), &cols))
            .n_k(n_k)
            .s_n(Array1::from(s_n))
            .states(self.states.clone())
            .build()
    }
}

/// Raw dH/dλ samples of every state, the input to thermodynamic integration
#[derive(Debug, Clone, PartialEq)]
pub struct GradientSet {
    states: Vec<Lambda>,
    dhdl: Vec<Array2<f64>>,
}

impl GradientSet {
    /// Group blocks by state, in order of first appearance
    ///
    /// Every state must have at least one sample and the same number of lambda components.
    pub fn from_samples(samples: &[GradientSamples]) -> Result<Self> {
        let mut states: Vec<Lambda> = Vec::new();
        let mut blocks: Vec<Vec<ArrayView2<'_, f64>>> = Vec::new();
        for block in samples {
            match states.iter().position(|s| s == block.state()) {
                Some(k) => blocks[k].push(block.dhdl()),
                None => {
                    states.push(block.state().clone());
                    blocks.push(vec![block.dhdl()]);
                }
            }
        }
        if states.is_empty() {
            return Err(AlchemError::IncompatibleInput("no samples given".to_string()));
        }

        let components = states[0].len();
        let mut dhdl = Vec::with_capacity(states.len());
        for (k, (state, parts)) in states.iter().zip(&blocks).enumerate() {
            if state.len() != components {
                return Err(AlchemError::ArrayLengthMismatch(state.len(), components));
            }
            let joined = concatenate(Axis(0), parts)?;
            if joined.nrows() == 0 {
                return Err(AlchemError::EmptyState { state: k });
            }
            dhdl.push(joined);
        }

        Ok(Self { states, dhdl })
    }

    /// Labels of the states
    pub fn states(&self) -> &[Lambda] {
        &self.states
    }

    /// Number of samples from each state
    pub fn n_k(&self) -> Array1<usize> {
        self.dhdl.iter().map(|d| d.nrows()).collect()
    }

    /// Ensemble averages of dH/dλ and the variance of each average
    pub fn averages(&self) -> GradientAverages {
        let k = self.states.len();
        let l = self.states[0].len();
        let mut mean = Array2::zeros((k, l));
        let mut variance = Array2::zeros((k, l));
        for (i, block) in self.dhdl.iter().enumerate() {
            let n = block.nrows() as f64;
            if block.nrows() < 2 {
                log::warn!(
                    "State {} has a single sample; its dH/dl variance is taken as zero",
                    self.states[i]
                );
            }
            for c in 0..l {
                let column = block.column(c);
                let m = column.sum() / n;
                mean[[i, c]] = m;
                if block.nrows() > 1 {
                    let s2 = column.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1.0);
                    variance[[i, c]] = s2 / n;
                }
            }
        }
        GradientAverages {
            states: self.states.clone(),
            mean,
            variance,
        }
    }
}

impl DataWindow for GradientSet {
    fn window(&self, start: f64, end: f64) -> Result<Self> {
        let mut dhdl = Vec::with_capacity(self.dhdl.len());
        for (k, block) in self.dhdl.iter().enumerate() {
            let (lo, hi) = window_bounds(block.nrows(), start, end);
            if hi == lo {
                return Err(AlchemError::EmptyState { state: k });
            }
            dhdl.push(block.slice(ndarray::s![lo..hi, ..]).to_owned());
        }
        Ok(Self {
            states: self.states.clone(),
            dhdl,
        })
    }
}

/// Per-state ensemble averages of dH/dλ
#[derive(Debug, Clone, PartialEq)]
pub struct GradientAverages {
    states: Vec<Lambda>,
    mean: Array2<f64>,
    variance: Array2<f64>,
}

impl GradientAverages {
    /// Averages given directly; `mean` and `variance` are K×L with L lambda components
    pub fn new(states: Vec<Lambda>, mean: Array2<f64>, variance: Array2<f64>) -> Result<Self> {
        if states.is_empty() {
            return Err(AlchemError::IncompatibleInput("no states given".to_string()));
        }
        if mean.nrows() != states.len() {
            return Err(AlchemError::ArrayLengthMismatch(mean.nrows(), states.len()));
        }
        if mean.dim() != variance.dim() {
            return Err(AlchemError::ArrayLengthMismatch(variance.len(), mean.len()));
        }
        if let Some(bad) = states.iter().find(|s| s.len() != mean.ncols()) {
            return Err(AlchemError::ArrayLengthMismatch(bad.len(), mean.ncols()));
        }
        Ok(Self {
            states,
            mean,
            variance,
        })
    }

    /// Labels of the states
    pub fn states(&self) -> &[Lambda] {
        &self.states
    }

    /// `mean[[k, l]]` is $\langle \partial H / \partial \lambda_l \rangle$ at state `k`
    pub fn mean(&self) -> &Array2<f64> {
        &self.mean
    }

    /// `variance[[k, l]]` is the squared standard error of `mean[[k, l]]`
    pub fn variance(&self) -> &Array2<f64> {
        &self.variance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn matrix() -> ReducedPotentials {
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
    fn build_fills_defaults() {
        let m = matrix();
        assert_eq!(m.k(), 3);
        assert_eq!(m.n_tot(), 6);
        assert_eq!(m.s_n(), &array![0, 0, 1, 1, 2, 2]);
        assert_eq!(m.states()[1], Lambda::scalar(1.0));
        assert_eq!(m.columns_of(2), vec![4, 5]);
    }

    #[test]
    fn mismatched_counts_fail() {
        let err = ReducedPotentials::builder()
            .u_kn(array![[1.0, 2.0], [3.0, 4.0]])
            .n_k(array![1, 2])
            .build()
            .unwrap_err();
        assert!(matches!(err, AlchemError::BuilderError(_)));
    }

    #[test]
    fn empty_state_fails() {
        let err = ReducedPotentials::builder()
            .u_kn(array![[1.0, 2.0], [3.0, 4.0]])
            .n_k(array![2, 0])
            .build()
            .unwrap_err();
        assert!(matches!(err, AlchemError::EmptyState { state: 1 }));
    }

    #[test]
    fn no_states_fails() {
        let err = ReducedPotentials::builder()
            .u_kn(Array2::zeros((0, 0)))
            .n_k(Array1::zeros(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, AlchemError::BuilderError(_)));

        let err = GradientAverages::new(vec![], Array2::zeros((0, 1)), Array2::zeros((0, 1)))
            .unwrap_err();
        assert!(matches!(err, AlchemError::IncompatibleInput(_)));
    }

    #[test]
    fn infinite_origin_potential_fails() {
        let err = ReducedPotentials::builder()
            .u_kn(array![[f64::INFINITY, 2.0], [3.0, 4.0]])
            .n_k(array![1, 1])
            .build()
            .unwrap_err();
        assert!(matches!(err, AlchemError::NonFinitePotential { state: 0, sample: 0 }));
    }

    #[test]
    fn from_samples_orders_columns_by_state() {
        let states: Vec<Lambda> = vec![0.0.into(), 1.0.into()];
        let b1 = PotentialSamples::new(1.0.into(), states.clone(), vec![0.0], array![[5.0, 6.0]])
            .unwrap();
        let b0 = PotentialSamples::new(
            0.0.into(),
            states.clone(),
            vec![0.0, 1.0],
            array![[1.0, 2.0], [3.0, 4.0]],
        )
        .unwrap();
        let m = ReducedPotentials::from_samples(&[b1, b0]).unwrap();
        assert_eq!(m.u_kn(), array![[1.0, 3.0, 5.0], [2.0, 4.0, 6.0]]);
        assert_eq!(m.n_k(), &array![2, 1]);
        assert_eq!(m.s_n(), &array![0, 0, 1]);
    }

    #[test]
    fn from_samples_requires_every_state() {
        let states: Vec<Lambda> = vec![0.0.into(), 1.0.into()];
        let b0 = PotentialSamples::new(0.0.into(), states, vec![0.0], array![[1.0, 2.0]]).unwrap();
        let err = ReducedPotentials::from_samples(&[b0]).unwrap_err();
        assert!(matches!(err, AlchemError::EmptyState { state: 1 }));
    }

    #[test]
    fn window_takes_fraction_of_each_state() {
        let m = matrix();
        let front = m.window(0.0, 0.5).unwrap();
        assert_eq!(front.n_k(), &array![1, 1, 1]);
        assert_eq!(front.u_kn().column(1), array![3.7, 9.7, 9.7]);
        let back = m.window(0.5, 1.0).unwrap();
        assert_eq!(back.u_kn().column(0), array![2.3, -2.3, 7.3]);
    }

    #[test]
    fn subset_keeps_own_samples() {
        let m = matrix().subset(&[2, 0]).unwrap();
        assert_eq!(m.k(), 2);
        assert_eq!(m.u_kn(), array![[4.7, 3.1, 4.4, 7.3], [7.7, 9.1, 1.4, 2.3]]);
        assert_eq!(m.states()[0], Lambda::scalar(2.0));
    }

    #[test]
    fn gradient_averages() {
        let blocks = vec![
            GradientSamples::new(0.0.into(), vec![0.0, 1.0], array![[1.0], [3.0]]).unwrap(),
            GradientSamples::new(1.0.into(), vec![0.0, 1.0], array![[5.0], [5.0]]).unwrap(),
            GradientSamples::new(0.0.into(), vec![2.0], array![[2.0]]).unwrap(),
        ];
        let set = GradientSet::from_samples(&blocks).unwrap();
        assert_eq!(set.n_k(), array![3, 2]);
        let avg = set.averages();
        assert_eq!(avg.mean(), &array![[2.0], [5.0]]);
        // sample variance 1, over 3 samples
        assert!((avg.variance()[[0, 0]] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(avg.variance()[[1, 0]], 0.0);
    }
}
