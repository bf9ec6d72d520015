//! Diagnostics of estimator quality: state overlap and convergence with sampling time.
//!
//! Everything here reads estimator inputs by shared reference and never modifies them.

pub mod convergence;
pub mod overlap;

pub use convergence::{
    a_c, block_average, forward_backward_convergence, fwdrev_cumavg_rc, ConvergenceCurve,
    CumulativeAverages, CurvePoint,
};
pub use overlap::{overlap_matrix, OverlapMatrix};
