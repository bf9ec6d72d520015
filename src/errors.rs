use crate::state::Lambda;
use thiserror::Error;

/// Enum for errors in this crate
///
/// Every failure names the states it concerns. Estimators never fall back to another method or
/// to a default value, and no error leaves a shared input modified.
#[derive(Error, Debug, Clone)]
pub enum AlchemError {
    /// Error returned when a builder's `build()` was called improperly
    #[error("Could not build: {0}")]
    BuilderError(String),

    /// Error returned when an array is the wrong length
    #[error("Array of length {0} is incorrect; length should be {1}")]
    ArrayLengthMismatch(usize, usize),

    /// Too few samples remain after decorrelation or slicing
    #[error("State {state} retains {retained} of {total} samples; at least 2 are required")]
    InsufficientData {
        /// State whose timeseries was too short
        state: Lambda,
        /// Samples left after preprocessing
        retained: usize,
        /// Samples before preprocessing
        total: usize,
    },

    /// A declared state contributed no samples
    #[error("State {state} has no samples")]
    EmptyState {
        /// Index of the empty state
        state: usize,
    },

    /// Lambda values are not monotonic and no explicit ordering was given
    #[error("Lambda values are not monotonic at states {states:?}")]
    Ordering {
        /// Indices of the states around which monotonicity breaks
        states: Vec<usize>,
    },

    /// An iterative solver hit its iteration cap
    #[error(
        "States {states:?} not converged after {iterations} iterations (residual {residual:e})"
    )]
    Convergence {
        /// Indices of the states being solved for
        states: Vec<usize>,
        /// Iterations performed
        iterations: usize,
        /// Residual when the cap was hit
        residual: f64,
    },

    /// States do not overlap, so the estimate is undefined
    #[error("Insufficient overlap: states {states:?} are disconnected (overlap {ratio:e})")]
    SingularSystem {
        /// For MBAR, the states not connected to state 0; for BAR, the pair being solved
        states: Vec<usize>,
        /// Overlap that fell short: the spectral gap of the overlap matrix for MBAR, the
        /// smaller mean acceptance of the pair for BAR
        ratio: f64,
    },

    /// Pairwise estimates do not form a connected chain
    #[error("Estimates do not connect states {missing:?} to state 0")]
    DisjointChain {
        /// Indices of the states that cannot be reached
        missing: Vec<usize>,
    },

    /// Sample times are not strictly increasing
    #[error("Sample {index} of state {state} is not later than the sample before it")]
    TimeOrdering {
        /// State whose timeseries is out of order
        state: Lambda,
        /// Index of the first offending sample
        index: usize,
    },

    /// A sample has no finite reduced potential at the state it was drawn from
    #[error("Sample {sample} has a non-finite reduced potential at its own state {state}")]
    NonFinitePotential {
        /// Index of the originating state
        state: usize,
        /// Index of the sample (column of u_kn)
        sample: usize,
    },

    /// The data given does not suit the requested estimator
    #[error("Incompatible input: {0}")]
    IncompatibleInput(String),

    /// Error returned when arrays cannot be combined
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl AlchemError {
    /// Is this a solver failing to converge within its iteration cap?
    pub fn is_convergence(&self) -> bool {
        matches!(self, Self::Convergence { .. })
    }
}

impl From<String> for AlchemError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

impl From<derive_builder::UninitializedFieldError> for AlchemError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        Self::BuilderError(e.to_string())
    }
}

/// Result type for the alchemrs crate
pub type Result<T> = std::result::Result<T, AlchemError>;
