//! Two-level coupling against the monolithic Newton solve.

use cs_solver::{
    ConvergenceContext, CouplingStrategy, DenseLu, FnSystem, NewtonConfig, NewtonSolver,
    NonlinearSystem, Partition, SolverResult, TwoLevelConfig, TwoLevelCoupler,
};
use nalgebra::DVector;

/// Two diode-like inner nodes loosely tied to a linear outer network.
fn circuit() -> impl NonlinearSystem {
    FnSystem::new(4, |x: &DVector<f64>, _ctx: &ConvergenceContext| -> SolverResult<DVector<f64>> {
        let diode = |v: f64| 1e-3 * ((v / 0.5).exp() - 1.0);
        Ok(DVector::from_vec(vec![
            diode(x[0]) + (x[0] - x[2]) * 0.2 - 0.05,
            diode(x[1]) + (x[1] - x[3]) * 0.2 - 0.02,
            2.0 * x[2] - x[3] - 0.2 * (x[0] - x[2]) - 1.0,
            2.0 * x[3] - x[2] - 0.2 * (x[1] - x[3]),
        ]))
    })
}

fn monolithic(system: &impl NonlinearSystem) -> DVector<f64> {
    let solver = NewtonSolver::new(NewtonConfig::default());
    let result = solver
        .solve(system, &mut DenseLu, &DVector::zeros(4), &mut ConvergenceContext::default())
        .expect("monolithic solve");
    assert!(result.converged());
    result.x
}

fn coupled(system: &impl NonlinearSystem, strategy: CouplingStrategy) -> DVector<f64> {
    let coupler = TwoLevelCoupler::new(
        NewtonSolver::new(NewtonConfig::default()),
        TwoLevelConfig {
            strategy,
            max_sweeps: 50,
            ..TwoLevelConfig::default()
        },
    );
    let partition = Partition::new(4, [0, 1]).expect("partition");
    let result = coupler
        .solve_composite(system, &partition, &mut DenseLu, &DVector::zeros(4))
        .expect("coupled solve");
    assert!(result.converged(), "{} did not converge", strategy.as_str());
    result.x
}

#[test]
fn full_mode_is_the_monolithic_solve() {
    let system = circuit();
    let reference = monolithic(&system);
    let full = coupled(&system, CouplingStrategy::Full);
    assert_eq!(full, reference);
}

#[test]
fn gauss_seidel_agrees_with_monolithic() {
    let system = circuit();
    let reference = monolithic(&system);
    let gs = coupled(&system, CouplingStrategy::InnerOuter);
    assert!((gs - &reference).amax() < 1e-6);
}

#[test]
fn inner_full_agrees_with_monolithic() {
    let system = circuit();
    let reference = monolithic(&system);
    let alt = coupled(&system, CouplingStrategy::InnerFull);
    assert!((alt - &reference).amax() < 1e-6);
}

#[test]
fn final_full_solve_keeps_the_answer() {
    let system = circuit();
    let reference = monolithic(&system);
    let coupler = TwoLevelCoupler::new(
        NewtonSolver::new(NewtonConfig::default()),
        TwoLevelConfig {
            strategy: CouplingStrategy::InnerOuter,
            max_sweeps: 50,
            enforce_full_solve: true,
            ..TwoLevelConfig::default()
        },
    );
    let partition = Partition::new(4, [0, 1]).expect("partition");
    let result = coupler
        .solve_composite(&system, &partition, &mut DenseLu, &DVector::zeros(4))
        .expect("coupled solve");
    assert!(result.converged());
    assert!((result.x - &reference).amax() < 1e-6);
}
