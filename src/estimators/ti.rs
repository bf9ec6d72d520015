//! Thermodynamic integration over per-state dH/dλ averages.

use super::{Estimator, FreeEnergies, SolverReport};
use crate::errors::*;
use crate::matrix::{GradientAverages, GradientSet};
use crate::numerics::to_dmatrix;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Quadrature rule for integrating dH/dλ along each lambda component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuadratureRule {
    /// Piecewise linear interpolation between states
    Trapezoidal,
    /// Natural cubic spline through the state averages
    ///
    /// Fitted separately over each run of consecutive states along which the component changes
    /// in one direction.
    CubicSpline,
}

impl Default for QuadratureRule {
    fn default() -> Self {
        Self::Trapezoidal
    }
}

/// Thermodynamic integration (TI)
///
/// $$
///     \Delta f_{ij} = \sum_l \int_{\lambda_i}^{\lambda_j}
///         \left\langle \frac{\partial u}{\partial \lambda_l} \right\rangle \mathrm{d}\lambda_l
/// $$
///
/// The integral is a fixed linear combination of the state averages, so the variance of every
/// difference follows exactly from the variances of the averages, assuming the states were
/// sampled independently.
///
/// # Notes
///
/// Each component of the lambda vector must change monotonically along the state order, or an
/// explicit `ordering` must be given.
#[derive(Builder, Debug, Clone, Default)]
#[builder(build_fn(validate = "Self::validate", error = "AlchemError"))]
pub struct Ti {
    /// Quadrature rule used along each component
    #[builder(default)]
    quadrature: QuadratureRule,

    /// Order in which to traverse the states; `ordering[m]` is the index of the `m`th state on
    /// the path
    #[builder(setter(strip_option), default)]
    ordering: Option<Vec<usize>>,
}

impl TiBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(Some(ordering)) = &self.ordering {
            let mut seen = vec![false; ordering.len()];
            for &i in ordering {
                match seen.get_mut(i) {
                    Some(s) if !*s => *s = true,
                    _ => {
                        return Err(format!(
                            "ordering must be a permutation of 0..{}",
                            ordering.len()
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

impl Ti {
    /// Get a new builder for the `Ti` struct.
    pub fn builder() -> TiBuilder {
        TiBuilder::default()
    }

    /// The quadrature rule
    pub fn quadrature(&self) -> QuadratureRule {
        self.quadrature
    }

    /// Integrate precomputed averages
    pub fn integrate(&self, averages: &GradientAverages) -> Result<FreeEnergies> {
        let states = averages.states();
        let k = states.len();
        let order = match &self.ordering {
            Some(ordering) if ordering.len() != k => {
                return Err(AlchemError::ArrayLengthMismatch(ordering.len(), k))
            }
            Some(ordering) => ordering.clone(),
            None => {
                check_monotonic(states.iter().map(|s| s.components()).collect())?;
                (0..k).collect()
            }
        };
        let n_components = states.first().map_or(0, |s| s.len());

        // prefix[m] holds the quadrature weights on each path position for the integral from
        // the start of the path to position m, summed over components.
        let mut mean_prefix = Array1::<f64>::zeros(k);
        let mut var_prefix = Array2::<f64>::zeros((k, k));
        let mut weight_prefix: Vec<Array2<f64>> = vec![Array2::zeros((n_components, k)); k];
        for c in 0..n_components {
            let x: Vec<f64> = order.iter().map(|&i| states[i].components()[c]).collect();
            let intervals = match self.quadrature {
                QuadratureRule::Trapezoidal => trapezoid_weights(&x),
                QuadratureRule::CubicSpline => spline_weights(&x)?,
            };
            for (m, w) in intervals.iter().enumerate() {
                let next = &weight_prefix[m].row(c) + w;
                weight_prefix[m + 1].row_mut(c).assign(&next);
            }
        }

        let mean = averages.mean();
        let variance = averages.variance();
        for m in 0..k {
            let w = &weight_prefix[m];
            mean_prefix[m] = (0..n_components)
                .flat_map(|c| (0..k).map(move |p| (c, p)))
                .map(|(c, p)| w[[c, p]] * mean[[order[p], c]])
                .sum();
            for n in 0..k {
                let diff = &weight_prefix[n] - w;
                var_prefix[[m, n]] = (0..n_components)
                    .flat_map(|c| (0..k).map(move |p| (c, p)))
                    .map(|(c, p)| diff[[c, p]].powi(2) * variance[[order[p], c]])
                    .sum();
            }
        }

        // Map path positions back to state indices
        let mut position = vec![0; k];
        for (p, &i) in order.iter().enumerate() {
            position[i] = p;
        }
        let delta_f = Array2::from_shape_fn((k, k), |(i, j)| {
            mean_prefix[position[j]] - mean_prefix[position[i]]
        });
        let d_delta_f =
            Array2::from_shape_fn((k, k), |(i, j)| var_prefix[[position[i], position[j]]].sqrt());

        log::debug!("TI over {} states and {} components", k, n_components);
        Ok(FreeEnergies::new(
            states.to_vec(),
            delta_f,
            d_delta_f,
            None,
            SolverReport::default(),
        ))
    }
}

impl Estimator for Ti {
    type Input = GradientSet;

    fn estimate(&self, input: &GradientSet) -> Result<FreeEnergies> {
        self.integrate(&input.averages())
    }
}

/// Every component must be non-decreasing or non-increasing along the path
fn check_monotonic(components: Vec<&[f64]>) -> Result<()> {
    let n_components = components.first().map_or(0, |c| c.len());
    for c in 0..n_components {
        let mut direction = 0.0;
        for m in 1..components.len() {
            let step = components[m][c] - components[m - 1][c];
            if step == 0.0 {
                continue;
            }
            if direction == 0.0 {
                direction = step.signum();
            } else if step.signum() != direction {
                return Err(AlchemError::Ordering {
                    states: vec![m - 1, m],
                });
            }
        }
    }
    Ok(())
}

/// Weights of the trapezoid integral over each interval `[x[m], x[m + 1]]`
fn trapezoid_weights(x: &[f64]) -> Vec<Array1<f64>> {
    (1..x.len())
        .map(|m| {
            let h = x[m] - x[m - 1];
            let mut w = Array1::zeros(x.len());
            w[m - 1] = h / 2.0;
            w[m] = h / 2.0;
            w
        })
        .collect()
}

/// Weights of the natural cubic spline integral over each interval `[x[m], x[m + 1]]`
///
/// The spline is fitted over each maximal run of steps with the same sign; intervals where `x`
/// does not change have zero weight.
fn spline_weights(x: &[f64]) -> Result<Vec<Array1<f64>>> {
    let k = x.len();
    let mut weights = trapezoid_weights(x);
    let mut start = 0;
    while start + 1 < k {
        let direction = (x[start + 1] - x[start]).signum();
        let mut end = start + 1;
        if x[end] != x[start] {
            while end + 1 < k
                && x[end + 1] != x[end]
                && (x[end + 1] - x[end]).signum() == direction
            {
                end += 1;
            }
        }
        if end - start >= 2 {
            let g = second_derivative_operator(&x[start..=end])?;
            for m in start..end {
                let h = x[m + 1] - x[m];
                let c = h.powi(3) / 24.0;
                for p in start..=end {
                    weights[m][p] -=
                        c * (g[[m - start, p - start]] + g[[m + 1 - start, p - start]]);
                }
            }
        }
        start = end;
    }
    Ok(weights)
}

/// Matrix `G` with `M = G y`, the knot second derivatives of the natural cubic spline through
/// `(x, y)`
fn second_derivative_operator(x: &[f64]) -> Result<Array2<f64>> {
    let n = x.len();
    let mut g = Array2::zeros((n, n));
    if n < 3 {
        return Ok(g);
    }
    let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let interior = n - 2;

    let mut lhs = Array2::zeros((interior, interior));
    let mut rhs = Array2::zeros((interior, n));
    for r in 0..interior {
        let i = r + 1;
        lhs[[r, r]] = 2.0 * (h[i - 1] + h[i]);
        if r > 0 {
            lhs[[r, r - 1]] = h[i - 1];
        }
        if r + 1 < interior {
            lhs[[r, r + 1]] = h[i];
        }
        rhs[[r, i - 1]] = 6.0 / h[i - 1];
        rhs[[r, i]] = -6.0 * (1.0 / h[i - 1] + 1.0 / h[i]);
        rhs[[r, i + 1]] = 6.0 / h[i];
    }

    let solved = to_dmatrix(lhs.view())
        .lu()
        .solve(&to_dmatrix(rhs.view()))
        .ok_or_else(|| AlchemError::Ordering {
            states: (0..n).collect(),
        })?;
    for r in 0..interior {
        for c in 0..n {
            g[[r + 1, c]] = solved[(r, c)];
        }
    }
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Lambda;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn averages(lambdas: &[f64], mean: Vec<f64>, variance: Vec<f64>) -> GradientAverages {
        let k = lambdas.len();
        GradientAverages::new(
            lambdas.iter().map(|&l| l.into()).collect(),
            Array2::from_shape_vec((k, 1), mean).unwrap(),
            Array2::from_shape_vec((k, 1), variance).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn linear_gradient_is_integrated_exactly() {
        let lambdas = [0.0, 0.1, 0.35, 0.5, 0.9, 1.0];
        let mean = lambdas.iter().map(|l| 2.0 + 3.0 * l).collect();
        let avg = averages(&lambdas, mean, vec![0.0; 6]);
        for rule in [QuadratureRule::Trapezoidal, QuadratureRule::CubicSpline] {
            let ti = Ti::builder().quadrature(rule).build().unwrap();
            let fe = ti.integrate(&avg).unwrap();
            assert_abs_diff_eq!(fe.total().delta_f, 3.5, epsilon = 1e-10);
            assert_abs_diff_eq!(fe.delta_f()[[5, 0]], -3.5, epsilon = 1e-10);
            assert_abs_diff_eq!(
                fe.delta_f()[[1, 3]],
                2.0 * 0.4 + 1.5 * (0.25 - 0.01),
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn trapezoid_variance_propagates_exactly() {
        let avg = averages(&[0.0, 0.5, 1.0], vec![1.0, 1.0, 1.0], vec![1.0, 2.0, 3.0]);
        let fe = Ti::default().integrate(&avg).unwrap();
        let expected = 0.0625 * 1.0 + 0.25 * 2.0 + 0.0625 * 3.0;
        assert_abs_diff_eq!(fe.total().variance, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(fe.estimate(0, 1).variance, 0.0625 * 3.0, epsilon = 1e-12);
        assert_eq!(fe.estimate(1, 1).variance, 0.0);
    }

    #[test]
    fn spline_beats_trapezoid_on_smooth_curve() {
        let lambdas = [0.0, 0.25, 0.5, 0.75, 1.0];
        let mean = lambdas.iter().map(|l: &f64| (std::f64::consts::PI * l).sin()).collect();
        let avg = averages(&lambdas, mean, vec![0.0; 5]);
        let exact = 2.0 / std::f64::consts::PI;
        let trap = Ti::default().integrate(&avg).unwrap().total().delta_f;
        let spline = Ti::builder()
            .quadrature(QuadratureRule::CubicSpline)
            .build()
            .unwrap()
            .integrate(&avg)
            .unwrap()
            .total()
            .delta_f;
        assert!((spline - exact).abs() < (trap - exact).abs());
        assert_abs_diff_eq!(spline, exact, epsilon = 5e-3);
    }

    #[test]
    fn non_monotonic_path_needs_ordering() {
        let avg = averages(&[0.0, 1.0, 0.5], vec![1.0, 1.0, 1.0], vec![0.0; 3]);
        let err = Ti::default().integrate(&avg).unwrap_err();
        assert!(matches!(err, AlchemError::Ordering { .. }));

        let ti = Ti::builder().ordering(vec![0, 2, 1]).build().unwrap();
        let fe = ti.integrate(&avg).unwrap();
        assert_abs_diff_eq!(fe.delta_f()[[0, 1]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fe.delta_f()[[0, 2]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn ordering_must_be_a_permutation() {
        assert!(Ti::builder().ordering(vec![0, 0, 1]).build().is_err());
        let avg = averages(&[0.0, 1.0], vec![1.0, 1.0], vec![0.0; 2]);
        let ti = Ti::builder().ordering(vec![0, 1, 2]).build().unwrap();
        assert!(matches!(
            ti.integrate(&avg),
            Err(AlchemError::ArrayLengthMismatch(3, 2))
        ));
    }

    #[test]
    fn vector_lambda_integrates_each_component() {
        let states: Vec<Lambda> = vec![
            vec![0.0, 0.0].into(),
            vec![0.5, 0.0].into(),
            vec![1.0, 0.0].into(),
            vec![1.0, 0.5].into(),
            vec![1.0, 1.0].into(),
        ];
        let mean = Array2::from_shape_fn((5, 2), |(_, c)| if c == 0 { 2.0 } else { 4.0 });
        let avg = GradientAverages::new(states, mean, Array2::zeros((5, 2))).unwrap();
        for rule in [QuadratureRule::Trapezoidal, QuadratureRule::CubicSpline] {
            let fe = Ti::builder().quadrature(rule).build().unwrap().integrate(&avg).unwrap();
            assert_abs_diff_eq!(fe.total().delta_f, 6.0, epsilon = 1e-10);
            assert_abs_diff_eq!(fe.delta_f()[[0, 2]], 2.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn spline_operator_vanishes_on_lines() {
        let x = [0.0, 0.2, 0.7, 1.0];
        let g = second_derivative_operator(&x).unwrap();
        let y = array![1.0, 1.4, 2.4, 3.0];
        for m in g.dot(&y).iter() {
            assert_abs_diff_eq!(*m, 0.0, epsilon = 1e-12);
        }
    }
}
