use alchemrs::config::*;
use alchemrs::testsystems::*;
use alchemrs::units::EnergyUnit;
use alchemrs::{Analysis, Dataset};
use anyhow::Result;
use itertools::Itertools;

const TEMPERATURE: f64 = 298.15;

fn main() -> Result<()> {
    env_logger::init();

    let system = LinearCoupling::builder()
        .offsets([0.0, 1.5])
        .force_constants([1.0, 8.0])
        .lambdas((0..=10).map(|i| i as f64 / 10.0).collect())
        .correlation(0.8)
        .build()?;
    let sample = system.sample_with_seed(2000, 2024)?;
    let exact = system.analytical_free_energies();

    println!("Analytical: {:.4} kT", exact[exact.len() - 1]);
    for estimator in [EstimatorChoice::Ti, EstimatorChoice::Bar, EstimatorChoice::Mbar] {
        let config = AnalysisConfig::builder()
            .estimator(estimator)
            .remove_burnin(true)
            .convergence_fractions(5)
            .build()?;
        let dataset = match estimator {
            EstimatorChoice::Ti => Dataset::Gradients(sample.gradients.clone()),
            _ => Dataset::Potentials(sample.potentials.clone()),
        };
        let report = Analysis::new(config).run(&dataset)?;

        let total = report.profile.total();
        let kcal = report.profile.to_unit(EnergyUnit::KcalPerMol, TEMPERATURE).total();
        println!(
            "{:?}: {:.4} +- {:.4} kT ({:.4} +- {:.4} kcal/mol)",
            estimator,
            total.delta_f,
            total.std_error(),
            kcal.delta_f,
            kcal.std_error()
        );
        println!(
            "  profile: {}",
            report
                .profile
                .points()
                .iter()
                .map(|p| format!("{:.3}", p.delta_f))
                .join(" ")
        );
        if let Some(overlap) = &report.overlap {
            println!(
                "  neighbour overlap: {} (scalar {:.3})",
                overlap.neighbours().iter().map(|o| format!("{:.3}", o)).join(" "),
                overlap.scalar()
            );
        }
        if let Some(curve) = &report.convergence {
            for (f, b) in curve.forward.iter().zip(&curve.backward) {
                println!(
                    "  {:>4.0}%: forward {:.4} +- {:.4}, backward {:.4} +- {:.4}",
                    f.fraction * 100.0,
                    f.delta_f,
                    f.std_error,
                    b.delta_f,
                    b.std_error
                );
            }
        }
    }

    Ok(())
}
