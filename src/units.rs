//! Energy unit conversion for reporting.
//!
//! Estimators work in units of kT throughout; conversion happens only on the way in
//! ([`reduce`]) and on the way out ([`crate::profile::Profile::to_unit`]).

use serde::{Deserialize, Serialize};

/// Molar gas constant in kJ/(mol K)
pub const GAS_CONSTANT: f64 = 8.314462618e-3;

/// Kilojoules per kilocalorie
pub const KJ_PER_KCAL: f64 = 4.184;

/// Units in which free energies can be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnergyUnit {
    /// Multiples of the thermal energy
    KT,
    /// kJ/mol
    KJPerMol,
    /// kcal/mol
    KcalPerMol,
}

impl EnergyUnit {
    /// Size of one kT in this unit at `temperature` kelvin
    pub fn kt(self, temperature: f64) -> f64 {
        match self {
            Self::KT => 1.0,
            Self::KJPerMol => GAS_CONSTANT * temperature,
            Self::KcalPerMol => GAS_CONSTANT * temperature / KJ_PER_KCAL,
        }
    }
}

/// Convert `value` between units at `temperature` kelvin
pub fn convert(value: f64, from: EnergyUnit, to: EnergyUnit, temperature: f64) -> f64 {
    value * to.kt(temperature) / from.kt(temperature)
}

/// Reduce an energy to units of kT
pub fn reduce(energy: f64, unit: EnergyUnit, temperature: f64) -> f64 {
    convert(energy, unit, EnergyUnit::KT, temperature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn kt_at_room_temperature() {
        assert_relative_eq!(EnergyUnit::KJPerMol.kt(298.15), 2.479, max_relative = 1e-3);
        assert_relative_eq!(EnergyUnit::KcalPerMol.kt(298.15), 0.5925, max_relative = 1e-3);
    }

    #[test]
    fn conversions_invert() {
        let kj = convert(1.7, EnergyUnit::KT, EnergyUnit::KJPerMol, 310.0);
        assert_relative_eq!(reduce(kj, EnergyUnit::KJPerMol, 310.0), 1.7, max_relative = 1e-12);
        let kcal = convert(kj, EnergyUnit::KJPerMol, EnergyUnit::KcalPerMol, 310.0);
        assert_relative_eq!(kcal * KJ_PER_KCAL, kj, max_relative = 1e-12);
    }
}
