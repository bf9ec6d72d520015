//! Raw simulation output: scalar timeseries and the per-state sample blocks parsers produce.
//!
//! Everything here is immutable once constructed. Preprocessing produces new values through
//! [`Timeseries::select`], [`PotentialSamples::select`] and [`GradientSamples::select`].

use crate::errors::*;
use crate::state::Lambda;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

fn check_time(state: &Lambda, time: &[f64]) -> Result<()> {
    match time.windows(2).position(|w| w[1] <= w[0]) {
        Some(i) => Err(AlchemError::TimeOrdering {
            state: state.clone(),
            index: i + 1,
        }),
        None => Ok(()),
    }
}

/// Indices of the samples whose times fall within `lower..=upper`, keeping every `step`th
///
/// Bounds of `None` are open.
pub fn slice_indices(
    time: &[f64],
    lower: Option<f64>,
    upper: Option<f64>,
    step: usize,
) -> Vec<usize> {
    time.iter()
        .enumerate()
        .filter(|&(_, &t)| lower.map_or(true, |l| t >= l) && upper.map_or(true, |u| t <= u))
        .map(|(i, _)| i)
        .step_by(step.max(1))
        .collect()
}

/// A strictly time-ordered sequence of scalar samples collected at one state
#[derive(Debug, Clone, PartialEq)]
pub struct Timeseries {
    state: Lambda,
    time: Vec<f64>,
    values: Array1<f64>,
}

impl Timeseries {
    /// Create a timeseries, checking that times strictly increase
    pub fn new(state: Lambda, time: Vec<f64>, values: Array1<f64>) -> Result<Self> {
        if time.len() != values.len() {
            return Err(AlchemError::ArrayLengthMismatch(time.len(), values.len()));
        }
        check_time(&state, &time)?;
        Ok(Self {
            state,
            time,
            values,
        })
    }

    /// Create a timeseries whose times are the sample indices `0, 1, 2, ...`
    pub fn from_values(state: Lambda, values: Array1<f64>) -> Self {
        let time = (0..values.len()).map(|i| i as f64).collect();
        Self {
            state,
            time,
            values,
        }
    }

    /// The state the samples were drawn from
    pub fn state(&self) -> &Lambda {
        &self.state
    }

    /// Simulation time of each sample
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// The sampled values
    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Does the series have no samples?
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A new timeseries holding only the samples at `indices`, which must be increasing
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            state: self.state.clone(),
            time: indices.iter().map(|&i| self.time[i]).collect(),
            values: self.values.select(Axis(0), indices),
        }
    }
}

/// How a block of reduced potentials is collapsed to one series for decorrelation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SeriesMethod {
    /// Sum of the reduced potentials of every evaluated state
    All,
    /// Reduced potential difference to the next evaluated state (to the previous one for the
    /// last state)
    DeltaE,
}

impl Default for SeriesMethod {
    fn default() -> Self {
        Self::DeltaE
    }
}

/// Reduced potentials of every evaluated state on the samples drawn from one state
///
/// `u_nk[[n, k]]` is the reduced potential of sample `n` at `evaluated[k]`. This is the
/// transpose of a block of columns of the u_kn matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialSamples {
    state: Lambda,
    evaluated: Vec<Lambda>,
    time: Vec<f64>,
    u_nk: Array2<f64>,
}

impl PotentialSamples {
    /// Create a block of samples, checking shapes and time ordering
    pub fn new(
        state: Lambda,
        evaluated: Vec<Lambda>,
        time: Vec<f64>,
        u_nk: Array2<f64>,
    ) -> Result<Self> {
        if u_nk.ncols() != evaluated.len() {
            return Err(AlchemError::ArrayLengthMismatch(u_nk.ncols(), evaluated.len()));
        }
        if u_nk.nrows() != time.len() {
            return Err(AlchemError::ArrayLengthMismatch(time.len(), u_nk.nrows()));
        }
        check_time(&state, &time)?;
        Ok(Self {
            state,
            evaluated,
            time,
            u_nk,
        })
    }

    /// The state the samples were drawn from
    pub fn state(&self) -> &Lambda {
        &self.state
    }

    /// The states every sample was evaluated at, one per column
    pub fn evaluated(&self) -> &[Lambda] {
        &self.evaluated
    }

    /// Simulation time of each sample
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// `u_nk[[n, k]]` is the reduced potential of sample `n` at state `k`
    pub fn u_nk(&self) -> ArrayView2<'_, f64> {
        self.u_nk.view()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.u_nk.nrows()
    }

    /// Does the block have no samples?
    pub fn is_empty(&self) -> bool {
        self.u_nk.nrows() == 0
    }

    /// Column of the sampled state among the evaluated states
    pub fn own_column(&self) -> Option<usize> {
        self.evaluated.iter().position(|l| l == &self.state)
    }

    /// Collapse the block to a scalar series for decorrelation
    pub fn series(&self, method: SeriesMethod) -> Result<Timeseries> {
        let values = match method {
            SeriesMethod::All => self.u_nk.sum_axis(Axis(1)),
            SeriesMethod::DeltaE => {
                let own = self.own_column().ok_or_else(|| {
                    AlchemError::IncompatibleInput(format!(
                        "state {} was not evaluated on its own samples",
                        self.state
                    ))
                })?;
                let other = if own + 1 < self.evaluated.len() {
                    own + 1
                } else if own > 0 {
                    own - 1
                } else {
                    return Err(AlchemError::IncompatibleInput(
                        "energy differences need at least two evaluated states".to_string(),
                    ));
                };
                &self.u_nk.column(other) - &self.u_nk.column(own)
            }
        };
        Ok(Timeseries {
            state: self.state.clone(),
            time: self.time.clone(),
            values,
        })
    }

    /// A new block holding only the samples at `indices`, which must be increasing
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            state: self.state.clone(),
            evaluated: self.evaluated.clone(),
            time: indices.iter().map(|&i| self.time[i]).collect(),
            u_nk: self.u_nk.select(Axis(0), indices),
        }
    }
}

/// Derivatives $\partial H / \partial \lambda$ on the samples drawn from one state
///
/// `dhdl[[n, l]]` is the derivative with respect to lambda component `l` on sample `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientSamples {
    state: Lambda,
    time: Vec<f64>,
    dhdl: Array2<f64>,
}

impl GradientSamples {
    /// Create a block of gradients, checking shapes and time ordering
    pub fn new(state: Lambda, time: Vec<f64>, dhdl: Array2<f64>) -> Result<Self> {
        if dhdl.ncols() != state.len() {
            return Err(AlchemError::ArrayLengthMismatch(dhdl.ncols(), state.len()));
        }
        if dhdl.nrows() != time.len() {
            return Err(AlchemError::ArrayLengthMismatch(time.len(), dhdl.nrows()));
        }
        check_time(&state, &time)?;
        Ok(Self { state, time, dhdl })
    }

    /// The state the samples were drawn from
    pub fn state(&self) -> &Lambda {
        &self.state
    }

    /// Simulation time of each sample
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// `dhdl[[n, l]]` is the derivative along component `l` on sample `n`
    pub fn dhdl(&self) -> ArrayView2<'_, f64> {
        self.dhdl.view()
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.dhdl.nrows()
    }

    /// Does the block have no samples?
    pub fn is_empty(&self) -> bool {
        self.dhdl.nrows() == 0
    }

    /// Collapse the block to a scalar series (sum over components) for decorrelation
    pub fn series(&self) -> Timeseries {
        Timeseries {
            state: self.state.clone(),
            time: self.time.clone(),
            values: self.dhdl.sum_axis(Axis(1)),
        }
    }

    /// A new block holding only the samples at `indices`, which must be increasing
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            state: self.state.clone(),
            time: indices.iter().map(|&i| self.time[i]).collect(),
            dhdl: self.dhdl.select(Axis(0), indices),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn states() -> Vec<Lambda> {
        vec![0.0.into(), 0.5.into(), 1.0.into()]
    }

    #[test]
    fn rejects_unordered_time() {
        let err =
            Timeseries::new(0.0.into(), vec![0.0, 2.0, 1.0], array![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, AlchemError::TimeOrdering { index: 2, .. }));
    }

    #[test]
    fn slicing_is_inclusive_and_strided() {
        let time = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(slice_indices(&time, Some(1.0), Some(4.0), 2), vec![1, 3]);
        assert_eq!(slice_indices(&time, None, None, 1).len(), 6);
    }

    #[test]
    fn delta_e_uses_next_state() {
        let block = PotentialSamples::new(
            0.5.into(),
            states(),
            vec![0.0, 1.0],
            array![[1.0, 2.0, 4.0], [1.0, 3.0, 7.0]],
        )
        .unwrap();
        let series = block.series(SeriesMethod::DeltaE).unwrap();
        assert_eq!(series.values(), array![2.0, 4.0]);
        let all = block.series(SeriesMethod::All).unwrap();
        assert_eq!(all.values(), array![7.0, 11.0]);
    }

    #[test]
    fn delta_e_uses_previous_state_for_last() {
        let block = PotentialSamples::new(
            1.0.into(),
            states(),
            vec![0.0],
            array![[1.0, 2.0, 4.0]],
        )
        .unwrap();
        let series = block.series(SeriesMethod::DeltaE).unwrap();
        assert_eq!(series.values(), array![-2.0]);
    }

    #[test]
    fn gradient_components_must_match_lambda() {
        let err = GradientSamples::new(0.0.into(), vec![0.0], array![[1.0, 2.0]]).unwrap_err();
        assert!(matches!(err, AlchemError::ArrayLengthMismatch(2, 1)));
    }

    #[test]
    fn select_keeps_times() {
        let block =
            GradientSamples::new(0.0.into(), vec![0.0, 1.0, 2.0], array![[1.0], [2.0], [3.0]])
                .unwrap();
        let sub = block.select(&[0, 2]);
        assert_eq!(sub.time(), &[0.0, 2.0]);
        assert_eq!(sub.series().values(), array![1.0, 3.0]);
    }
}
