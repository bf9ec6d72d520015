//! Overlap between thermodynamic states.

use crate::errors::*;
use crate::estimators::Mbar;
use crate::matrix::ReducedPotentials;
use crate::numerics::{sorted_symmetric_eigen, to_dmatrix};
use crate::state::Lambda;
use ndarray::{Array1, Array2, ArrayView2};
use serde::Serialize;

/// Overlap between every pair of states
///
/// $O_{ij} = \sum_n W_{in} W_{jn} N_j$ is the probability that a sample drawn from state $i$ is
/// attributed to state $j$; rows sum to one. The eigenvalues of $O$ are real and lie in
/// $[0, 1]$ with the largest equal to one. The second largest approaches one as some group of
/// states stops overlapping with the rest.
///
/// # References
///
/// 1. Klimovich PV, Shirts MR, and Mobley DL. Guidelines for the analysis of free energy
/// calculations. J. Comput. Aided Mol. Des. 29:397, 2015
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlapMatrix {
    states: Vec<Lambda>,
    matrix: Array2<f64>,
    eigenvalues: Array1<f64>,
}

impl OverlapMatrix {
    pub(crate) fn from_weights(
        states: Vec<Lambda>,
        w_kn: ArrayView2<'_, f64>,
        n_k: &Array1<f64>,
    ) -> Self {
        let k = n_k.len();
        let a = w_kn.dot(&w_kn.t());
        let matrix = Array2::from_shape_fn((k, k), |(i, j)| a[[i, j]] * n_k[j]);
        // O is similar to the symmetric N^1/2 A N^1/2
        let symmetric =
            Array2::from_shape_fn((k, k), |(i, j)| n_k[i].sqrt() * a[[i, j]] * n_k[j].sqrt());
        let (eigenvalues, _) = sorted_symmetric_eigen(to_dmatrix(symmetric.view()));
        Self {
            states,
            matrix,
            eigenvalues,
        }
    }

    /// Labels of the states
    pub fn states(&self) -> &[Lambda] {
        &self.states
    }

    /// `matrix[[i, j]]` is the overlap of state `i` with state `j`
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Eigenvalues in descending order
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// Scalar overlap $1 - \lambda_2$, the spectral gap
    ///
    /// Zero when the states split into groups that do not overlap at all.
    pub fn scalar(&self) -> f64 {
        if self.eigenvalues.len() < 2 {
            1.0
        } else {
            1.0 - self.eigenvalues[1]
        }
    }

    /// Overlap of each state with the next one
    pub fn neighbours(&self) -> Vec<f64> {
        (1..self.matrix.nrows())
            .map(|i| self.matrix[[i - 1, i]])
            .collect()
    }

    /// Pairs of neighbouring states whose overlap is below `threshold`
    ///
    /// A threshold of 0.03 is a common rule of thumb for adequate sampling.
    pub fn poorly_overlapping(&self, threshold: f64) -> Vec<(usize, usize)> {
        self.neighbours()
            .into_iter()
            .enumerate()
            .filter(|&(_, o)| o < threshold)
            .map(|(i, _)| (i, i + 1))
            .collect()
    }
}

/// Solve MBAR on `potentials` and compute the overlap matrix of its weights
pub fn overlap_matrix(potentials: &ReducedPotentials, mbar: &Mbar) -> Result<OverlapMatrix> {
    let overlap = mbar.solve(potentials)?.overlap();
    for (i, j) in overlap.poorly_overlapping(0.03) {
        log::warn!("Poor overlap ({:.4}) between states {} and {}", overlap.matrix()[[i, j]], i, j);
    }
    Ok(overlap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsystems::HarmonicOscillator;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Axis};

    fn potentials(o_k: Array1<f64>) -> ReducedPotentials {
        let k = o_k.len();
        HarmonicOscillator::builder()
            .o_k(o_k)
            .k_k(Array1::ones(k))
            .build()
            .unwrap()
            .sample_with_seed(Array1::from_elem(k, 200), 13)
            .unwrap()
            .reduced_potentials()
            .unwrap()
    }

    #[test]
    fn rows_sum_to_one() {
        let overlap = overlap_matrix(&potentials(array![0.0, 1.0, 2.0]), &Mbar::default()).unwrap();
        for row in overlap.matrix().axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(overlap.eigenvalues()[0], 1.0, epsilon = 1e-6);
        assert!(overlap.scalar() > 0.0 && overlap.scalar() < 1.0);
    }

    #[test]
    fn distant_states_overlap_less() {
        let near = overlap_matrix(&potentials(array![0.0, 0.5]), &Mbar::default()).unwrap();
        let far = overlap_matrix(&potentials(array![0.0, 3.0]), &Mbar::default()).unwrap();
        assert!(near.neighbours()[0] > far.neighbours()[0]);
        assert!(near.scalar() > far.scalar());
        assert_eq!(far.poorly_overlapping(0.5), vec![(0, 1)]);
    }

    #[test]
    fn disjoint_states_have_no_gap() {
        let inf = f64::INFINITY;
        let u = ReducedPotentials::builder()
            .u_kn(array![[0.0, 0.1, inf, inf], [inf, inf, 0.2, 0.3]])
            .n_k(array![2, 2])
            .build()
            .unwrap();
        let overlap = overlap_matrix(&u, &Mbar::default()).unwrap();
        assert_abs_diff_eq!(overlap.scalar(), 0.0, epsilon = 1e-12);
        assert_eq!(overlap.matrix()[[0, 1]], 0.0);
    }
}
