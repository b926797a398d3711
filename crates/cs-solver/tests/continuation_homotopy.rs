//! Continuation on a problem plain Newton cannot solve from its start.

use cs_solver::{
    ContinuationConfig, ContinuationEngine, ContinuationOutcome, ConvergenceContext, DenseLu,
    FnSystem, NewtonConfig, NewtonSolver, SolverResult,
};
use nalgebra::DVector;

const START: f64 = 10.0;

fn undamped() -> NewtonSolver {
    NewtonSolver::new(NewtonConfig {
        max_line_search_iters: 0,
        max_iterations: 30,
        ..NewtonConfig::default()
    })
}

/// atan(x) = (1 - λ)·atan(10): solved by the start point at λ = 0, root 0 at λ = 1.
fn arctan_family() -> impl cs_solver::NonlinearSystem {
    FnSystem::new(1, |x: &DVector<f64>, ctx: &ConvergenceContext| -> SolverResult<DVector<f64>> {
        Ok(DVector::from_element(
            1,
            x[0].atan() - (1.0 - ctx.continuation_param) * START.atan(),
        ))
    })
}

#[test]
fn plain_newton_overshoots_from_the_start() {
    let result = undamped()
        .solve(
            &arctan_family(),
            &mut DenseLu,
            &DVector::from_element(1, START),
            &mut ConvergenceContext::default(),
        )
        .expect("solve");
    assert!(!result.converged());
}

#[test]
fn continuation_reaches_lambda_one_or_reports_exhaustion() {
    let config = ContinuationConfig {
        max_steps: 400,
        ..ContinuationConfig::source_stepping()
    };
    let max_steps = config.max_steps;
    let engine = ContinuationEngine::new(undamped(), config);
    let outcome = engine
        .attempt(&arctan_family(), &mut DenseLu, &DVector::from_element(1, START))
        .expect("attempt");

    assert!(outcome.steps() <= max_steps);
    match outcome {
        ContinuationOutcome::Converged { result, final_param, .. } => {
            assert_eq!(final_param, 1.0);
            assert!(result.x[0].abs() < 1e-6);
        }
        ContinuationOutcome::Exhausted { reached_param, .. } => {
            assert!((0.0..1.0).contains(&reached_param));
        }
    }
}

#[test]
fn exhausted_run_stays_within_the_step_budget() {
    let config = ContinuationConfig {
        max_steps: 3,
        ..ContinuationConfig::source_stepping()
    };
    let engine = ContinuationEngine::new(undamped(), config);
    let outcome = engine
        .attempt(&arctan_family(), &mut DenseLu, &DVector::from_element(1, START))
        .expect("attempt");
    assert!(outcome.steps() <= 3);
}
