//! Homotopy continuation for problems Newton cannot solve from a cold start.
//!
//! A parameter λ walks from 0 (an easy problem) to 1 (the real one). Each
//! step re-solves with Newton from the previous converged point. Failed steps
//! are halved; runs of successes let the step grow again.

use crate::error::{SolverError, SolverResult};
use crate::linear::LinearSolver;
use crate::newton::{NewtonResult, NewtonSolver};
use crate::system::{ConvergenceContext, Linearization, NonlinearSystem};
use nalgebra::DVector;
use tracing::{debug, info, warn};

/// How λ enters the problem.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Homotopy {
    /// Conductance `g(λ)` from every unknown to its starting value, added by
    /// the engine. `g` falls geometrically from `start` to `end`, and is
    /// removed at λ = 1.
    Gmin { start: f64, end: f64 },
    /// λ is handed to the system through
    /// [`ConvergenceContext::continuation_param`] (source stepping and other
    /// natural-parameter homotopies).
    Parameter,
}

impl Homotopy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Homotopy::Gmin { .. } => "gmin",
            Homotopy::Parameter => "parameter",
        }
    }

    fn conductance(&self, lambda: f64) -> f64 {
        match *self {
            Homotopy::Gmin { start, end } if lambda < 1.0 => start * (end / start).powf(lambda),
            _ => 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ContinuationConfig {
    pub homotopy: Homotopy,
    /// First λ increment.
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    /// Step multiplier after a failed solve.
    pub failed_factor: f64,
    /// Step multiplier after `grow_after` consecutive successes.
    pub grow_factor: f64,
    pub grow_after: usize,
    /// Cap on attempted continuation steps, λ = 0 included.
    pub max_steps: usize,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            homotopy: Homotopy::Gmin {
                start: 1e-2,
                end: 1e-12,
            },
            initial_step: 0.1,
            min_step: 1e-4,
            max_step: 0.5,
            failed_factor: 0.5,
            grow_factor: 2.0,
            grow_after: 2,
            max_steps: 200,
        }
    }
}

impl ContinuationConfig {
    pub fn source_stepping() -> Self {
        Self {
            homotopy: Homotopy::Parameter,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SolverResult<()> {
        let bad = |what: &str| {
            Err(SolverError::ProblemSetup {
                what: format!("continuation: {what}"),
            })
        };
        if let Homotopy::Gmin { start, end } = self.homotopy {
            if !(start > 0.0 && end > 0.0) {
                return bad("gmin bounds must be positive");
            }
        }
        if !(self.min_step > 0.0 && self.min_step <= self.initial_step && self.initial_step <= self.max_step) {
            return bad("steps must satisfy 0 < min_step <= initial_step <= max_step");
        }
        if !(self.failed_factor > 0.0 && self.failed_factor < 1.0) {
            return bad("failed_factor must lie in (0, 1)");
        }
        if self.grow_factor < 1.0 {
            return bad("grow_factor must be at least 1");
        }
        if self.max_steps == 0 {
            return bad("max_steps must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum ContinuationOutcome {
    Converged {
        result: NewtonResult,
        steps: usize,
        final_param: f64,
    },
    /// λ stalled below 1. `last_solution` is the last converged point.
    Exhausted {
        reached_param: f64,
        steps: usize,
        last_solution: DVector<f64>,
    },
}

impl ContinuationOutcome {
    pub fn converged(&self) -> bool {
        matches!(self, ContinuationOutcome::Converged { .. })
    }

    pub fn steps(&self) -> usize {
        match self {
            ContinuationOutcome::Converged { steps, .. } | ContinuationOutcome::Exhausted { steps, .. } => *steps,
        }
    }
}

/// The system plus `g·(x - anchor)` on every equation.
struct GminShunt<'a, S: ?Sized> {
    inner: &'a S,
    anchor: &'a DVector<f64>,
    g: f64,
}

impl<S: NonlinearSystem + ?Sized> NonlinearSystem for GminShunt<'_, S> {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn evaluate(&self, x: &DVector<f64>, ctx: &ConvergenceContext) -> SolverResult<Linearization> {
        let mut lin = self.inner.evaluate(x, ctx)?;
        if self.g != 0.0 {
            lin.residual.axpy(self.g, x, 1.0);
            lin.residual.axpy(-self.g, self.anchor, 1.0);
            for i in 0..lin.jacobian.nrows().min(lin.jacobian.ncols()) {
                lin.jacobian[(i, i)] += self.g;
            }
        }
        Ok(lin)
    }
}

pub struct ContinuationEngine {
    newton: NewtonSolver,
    config: ContinuationConfig,
}

impl ContinuationEngine {
    pub fn new(newton: NewtonSolver, config: ContinuationConfig) -> Self {
        Self { newton, config }
    }

    pub fn config(&self) -> &ContinuationConfig {
        &self.config
    }

    fn solve_at<S, L>(
        &self,
        system: &S,
        linear: &mut L,
        x: &DVector<f64>,
        anchor: &DVector<f64>,
        lambda: f64,
        ctx: &mut ConvergenceContext,
    ) -> SolverResult<NewtonResult>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        match self.config.homotopy {
            Homotopy::Gmin { .. } => {
                ctx.continuation_param = 1.0;
                let shunted = GminShunt {
                    inner: system,
                    anchor,
                    g: self.config.homotopy.conductance(lambda),
                };
                self.newton.solve(&shunted, linear, x, ctx)
            }
            Homotopy::Parameter => {
                ctx.continuation_param = lambda;
                self.newton.solve(system, linear, x, ctx)
            }
        }
    }

    /// Walk λ from 0 to 1 starting at `x0`. Gmin shunts pull towards `x0`.
    ///
    /// Always terminates: every attempt counts against `max_steps` and every
    /// failure shrinks the step towards `min_step`.
    pub fn attempt<S, L>(&self, system: &S, linear: &mut L, x0: &DVector<f64>) -> SolverResult<ContinuationOutcome>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        let cfg = &self.config;
        cfg.validate()?;
        let homotopy = cfg.homotopy.as_str();

        let mut ctx = ConvergenceContext::default();
        let mut steps = 1;
        let start = self.solve_at(system, linear, x0, x0, 0.0, &mut ctx)?;
        if !start.converged() {
            warn!(homotopy, status = ?start.status, "continuation: start problem did not converge");
            return Ok(ContinuationOutcome::Exhausted {
                reached_param: 0.0,
                steps,
                last_solution: x0.clone(),
            });
        }
        ctx.first_solve_complete = true;
        ctx.first_continuation_param = false;

        let mut lambda = 0.0;
        let mut x = start.x;
        let mut step = cfg.initial_step;
        let mut successes = 0;

        while steps < cfg.max_steps {
            let target = (lambda + step).min(1.0);
            ctx.continuation_step = steps;
            steps += 1;

            let result = self.solve_at(system, linear, &x, x0, target, &mut ctx)?;
            if result.converged() {
                debug!(homotopy, lambda = target, step, iterations = result.iterations, "continuation step");
                lambda = target;
                if lambda >= 1.0 {
                    info!(homotopy, steps, "continuation reached the target problem");
                    return Ok(ContinuationOutcome::Converged {
                        result,
                        steps,
                        final_param: lambda,
                    });
                }
                x = result.x;
                successes += 1;
                if successes >= cfg.grow_after {
                    step = (step * cfg.grow_factor).min(cfg.max_step);
                    successes = 0;
                }
            } else {
                successes = 0;
                step *= cfg.failed_factor;
                debug!(homotopy, lambda, step, status = ?result.status, "continuation step failed");
                if step < cfg.min_step {
                    break;
                }
            }
        }

        warn!(homotopy, lambda, steps, "continuation exhausted");
        Ok(ContinuationOutcome::Exhausted {
            reached_param: lambda,
            steps,
            last_solution: x,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::DenseLu;
    use crate::newton::NewtonConfig;
    use crate::system::FnSystem;

    fn plain_newton() -> NewtonSolver {
        NewtonSolver::new(NewtonConfig {
            max_line_search_iters: 0,
            ..NewtonConfig::default()
        })
    }

    #[test]
    fn gmin_conductance_falls_and_vanishes() {
        let h = Homotopy::Gmin { start: 1e-2, end: 1e-12 };
        assert!((h.conductance(0.0) - 1e-2).abs() < 1e-18);
        assert!((h.conductance(0.5) - 1e-7).abs() < 1e-15);
        assert_eq!(h.conductance(1.0), 0.0);
        assert_eq!(Homotopy::Parameter.conductance(0.3), 0.0);
    }

    #[test]
    fn parameter_homotopy_tracks_a_moving_root() {
        // x^3 = 8λ: trivial at λ = 0, root 2 at λ = 1.
        let system = FnSystem::new(1, |x: &DVector<f64>, ctx: &ConvergenceContext| {
            Ok(DVector::from_element(1, x[0].powi(3) + x[0] - 10.0 * ctx.continuation_param))
        });
        let engine = ContinuationEngine::new(plain_newton(), ContinuationConfig::source_stepping());
        let outcome = engine.attempt(&system, &mut DenseLu, &DVector::zeros(1)).unwrap();
        match outcome {
            ContinuationOutcome::Converged { result, final_param, .. } => {
                assert_eq!(final_param, 1.0);
                assert!((result.x[0] - 2.0).abs() < 1e-6);
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn gmin_shunt_is_silent_at_its_anchor() {
        let inner = FnSystem::new(1, |x: &DVector<f64>, _ctx: &ConvergenceContext| {
            Ok(DVector::from_element(1, x[0] * x[0] - 4.0))
        });
        let anchor = DVector::from_element(1, 5.0);
        let shunt = GminShunt {
            inner: &inner,
            anchor: &anchor,
            g: 0.1,
        };
        let ctx = ConvergenceContext::default();
        let at_anchor = shunt.evaluate(&anchor, &ctx).unwrap();
        assert!((at_anchor.residual[0] - 21.0).abs() < 1e-12);

        let away = shunt.evaluate(&DVector::from_element(1, 6.0), &ctx).unwrap();
        assert!((away.residual[0] - 32.1).abs() < 1e-12);
        let bare = inner.evaluate(&anchor, &ctx).unwrap();
        assert!((at_anchor.jacobian[(0, 0)] - bare.jacobian[(0, 0)] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn gmin_homotopy_reaches_the_root_from_a_warm_start() {
        let system = FnSystem::new(1, |x: &DVector<f64>, _ctx: &ConvergenceContext| {
            Ok(DVector::from_element(1, x[0].powi(3) + x[0] - 10.0))
        });
        let engine = ContinuationEngine::new(plain_newton(), ContinuationConfig::default());
        let outcome = engine
            .attempt(&system, &mut DenseLu, &DVector::from_element(1, 1.5))
            .unwrap();
        match outcome {
            ContinuationOutcome::Converged { result, final_param, .. } => {
                assert_eq!(final_param, 1.0);
                assert!((result.x[0] - 2.0).abs() < 1e-6);
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn unsolvable_start_is_exhausted_immediately() {
        let system = FnSystem::new(1, |_x: &DVector<f64>, _ctx: &ConvergenceContext| {
            Ok(DVector::from_element(1, 1.0))
        });
        let engine = ContinuationEngine::new(plain_newton(), ContinuationConfig::source_stepping());
        let outcome = engine.attempt(&system, &mut DenseLu, &DVector::zeros(1)).unwrap();
        assert!(!outcome.converged());
        assert_eq!(outcome.steps(), 1);
    }

    #[test]
    fn bad_config_is_rejected() {
        let cfg = ContinuationConfig {
            min_step: 0.5,
            initial_step: 0.1,
            ..ContinuationConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ContinuationConfig {
            homotopy: Homotopy::Gmin { start: 0.0, end: 1e-12 },
            ..ContinuationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
