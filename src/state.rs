//! Labels of thermodynamic states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The coupling parameter identifying a thermodynamic state
///
/// A state may be labelled by a single $\lambda$ or by one value per alchemical component (for
/// example separate Coulomb and van der Waals couplings). States compare equal only if every
/// component is bitwise equal, which holds for labels read from the same simulation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda(Vec<f64>);

impl Lambda {
    /// A state labelled by one coupling parameter
    pub fn scalar(value: f64) -> Self {
        Self(vec![value])
    }

    /// A state labelled by one coupling parameter per component
    pub fn vector(values: Vec<f64>) -> Self {
        Self(values)
    }

    /// The values of each component
    pub fn components(&self) -> &[f64] {
        &self.0
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Does this label have no components?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index labels `0..k`, used when the caller does not name its states
    pub fn indices(k: usize) -> Vec<Self> {
        (0..k).map(|i| Self::scalar(i as f64)).collect()
    }
}

impl From<f64> for Lambda {
    fn from(value: f64) -> Self {
        Self::scalar(value)
    }
}

impl From<Vec<f64>> for Lambda {
    fn from(values: Vec<f64>) -> Self {
        Self::vector(values)
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            many => {
                write!(f, "(")?;
                for (i, v) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_scalar_and_vector() {
        assert_eq!(Lambda::scalar(0.5).to_string(), "0.5");
        assert_eq!(Lambda::vector(vec![0.0, 1.0]).to_string(), "(0, 1)");
    }

    #[test]
    fn index_labels() {
        let states = Lambda::indices(3);
        assert_eq!(states[2], Lambda::scalar(2.0));
        assert_eq!(states.len(), 3);
    }
}
