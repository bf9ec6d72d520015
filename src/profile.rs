//! Cumulative free energy profiles along a chain of states.

use crate::errors::*;
use crate::estimators::{Estimate, FreeEnergies};
use crate::state::Lambda;
use crate::units::{self, EnergyUnit};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Free energy of one state relative to the first state of the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    /// Label of the state
    pub state: Lambda,
    /// $f_i - f_0$
    pub delta_f: f64,
    /// Standard error of `delta_f`
    pub std_error: f64,
}

/// Cumulative free energy profile and end-to-end total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    points: Vec<ProfilePoint>,
    total: Estimate,
    unit: EnergyUnit,
}

impl Profile {
    /// Sum pairwise estimates along the chain from state 0
    ///
    /// Estimates are treated as independent, so variances add. Each estimate may be given in
    /// either direction. Fails if some state cannot be reached from state 0.
    pub fn from_chain(states: &[Lambda], estimates: &[Estimate]) -> Result<Self> {
        let k = states.len();
        if k == 0 {
            return Err(AlchemError::IncompatibleInput("no states given".to_string()));
        }
        let mut links: Vec<Vec<(usize, f64, f64)>> = vec![Vec::new(); k];
        for e in estimates {
            if e.from >= k || e.to >= k {
                return Err(AlchemError::ArrayLengthMismatch(e.from.max(e.to) + 1, k));
            }
            links[e.from].push((e.to, e.delta_f, e.variance));
            links[e.to].push((e.from, -e.delta_f, e.variance));
        }

        let mut reached: Vec<Option<(f64, f64)>> = vec![None; k];
        reached[0] = Some((0.0, 0.0));
        let mut queue = VecDeque::from(vec![0]);
        while let Some(i) = queue.pop_front() {
            let (f_i, var_i) = reached[i].unwrap_or_default();
            for &(j, delta_f, variance) in &links[i] {
                if reached[j].is_none() {
                    reached[j] = Some((f_i + delta_f, var_i + variance));
                    queue.push_back(j);
                }
            }
        }

        let missing: Vec<usize> = (0..k).filter(|&i| reached[i].is_none()).collect();
        if !missing.is_empty() {
            return Err(AlchemError::DisjointChain { missing });
        }
        let cumulative: Vec<(f64, f64)> = reached.into_iter().flatten().collect();
        Ok(Self::from_cumulative(states, &cumulative))
    }

    /// Profile of an estimator result
    ///
    /// Uses the covariance of the state free energies when the estimator provides one, and the
    /// chain of neighbouring estimates otherwise.
    pub fn from_free_energies(free_energies: &FreeEnergies) -> Result<Self> {
        match free_energies.covariance() {
            Some(_) => {
                let cumulative: Vec<(f64, f64)> = (0..free_energies.k())
                    .map(|i| {
                        let e = free_energies.estimate(0, i);
                        (e.delta_f, e.variance)
                    })
                    .collect();
                Ok(Self::from_cumulative(free_energies.states(), &cumulative))
            }
            None => Self::from_chain(free_energies.states(), &free_energies.adjacent()),
        }
    }

    fn from_cumulative(states: &[Lambda], cumulative: &[(f64, f64)]) -> Self {
        let points = states
            .iter()
            .zip(cumulative)
            .map(|(state, &(delta_f, variance))| ProfilePoint {
                state: state.clone(),
                delta_f,
                std_error: variance.sqrt(),
            })
            .collect();
        let last = cumulative.len() - 1;
        Self {
            points,
            total: Estimate {
                from: 0,
                to: last,
                delta_f: cumulative[last].0,
                variance: cumulative[last].1,
            },
            unit: EnergyUnit::KT,
        }
    }

    /// One point per state, in state order
    pub fn points(&self) -> &[ProfilePoint] {
        &self.points
    }

    /// Difference between the first and last states
    pub fn total(&self) -> Estimate {
        self.total
    }

    /// Energy unit of the values
    pub fn unit(&self) -> EnergyUnit {
        self.unit
    }

    /// The same profile in another unit at `temperature` kelvin
    pub fn to_unit(&self, unit: EnergyUnit, temperature: f64) -> Self {
        let scale = units::convert(1.0, self.unit, unit, temperature);
        Self {
            points: self
                .points
                .iter()
                .map(|p| ProfilePoint {
                    state: p.state.clone(),
                    delta_f: p.delta_f * scale,
                    std_error: p.std_error * scale,
                })
                .collect(),
            total: Estimate {
                delta_f: self.total.delta_f * scale,
                variance: self.total.variance * scale * scale,
                ..self.total
            },
            unit,
        }
    }
}
