//! Numerical helpers shared by the estimators.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2};

/// Singular values below this are treated as zero by pseudo-inverses.
pub(crate) const PINV_EPS: f64 = 1.0e-10;

/// $\ln \sum_i e^{x_i}$ without overflow
///
/// Returns `-inf` for an empty iterator or when every term is `-inf`.
pub fn logsumexp<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let values: Vec<f64> = values.into_iter().collect();
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// $\ln(e^a + e^b)$ without overflow
pub fn logaddexp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Logistic function $1/(1 + e^x)$, stable for large $|x|$
pub(crate) fn fermi(x: f64) -> f64 {
    if x > 0.0 {
        let e = (-x).exp();
        e / (1.0 + e)
    } else {
        1.0 / (1.0 + x.exp())
    }
}

/// Mean and population variance (ddof = 0)
pub(crate) fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var)
}

pub(crate) fn to_dmatrix(a: ArrayView2<'_, f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub(crate) fn to_array2(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Eigenvalues and eigenvectors of a symmetric matrix, eigenvalues sorted in descending order
pub(crate) fn sorted_symmetric_eigen(m: DMatrix<f64>) -> (Array1<f64>, Array2<f64>) {
    let SymmetricEigen {
        eigenvalues,
        eigenvectors,
    } = m.symmetric_eigen();
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    let values = order.iter().map(|&i| eigenvalues[i]).collect();
    let vectors = Array2::from_shape_fn((eigenvectors.nrows(), order.len()), |(r, c)| {
        eigenvectors[(r, order[c])]
    });
    (values, vectors)
}

/// Moore-Penrose pseudo-inverse of a matrix
///
/// Singular values below [`PINV_EPS`] are discarded. Returns a matrix of NaN if the SVD fails,
/// which callers detect through their convergence checks.
pub(crate) fn pseudo_inverse(a: ArrayView2<'_, f64>) -> Array2<f64> {
    match to_dmatrix(a).pseudo_inverse(PINV_EPS) {
        Ok(inv) => to_array2(&inv),
        Err(_) => Array2::from_elem((a.ncols(), a.nrows()), f64::NAN),
    }
}
