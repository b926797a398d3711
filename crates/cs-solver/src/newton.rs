//! Damped Newton-Raphson with backtracking line search.

use crate::error::{SolverError, SolverResult};
use crate::linear::LinearSolver;
use crate::system::{ConvergenceContext, Linearization, NonlinearSystem};
use cs_core::{Communicator, SerialComm, Tolerances, inf_norm, two_norm, weighted_rms_norm};
use nalgebra::DVector;
use std::sync::Arc;
use tracing::{debug, warn};

/// Newton solver configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct NewtonConfig {
    /// Maximum iterations
    pub max_iterations: usize,
    /// Absolute tolerance on the residual 2-norm
    pub residual_abs_tol: f64,
    /// Tolerance on the residual 2-norm relative to the starting residual
    pub residual_rel_tol: f64,
    /// Absolute part of the update weights
    pub update_abs_tol: f64,
    /// Relative part of the update weights
    pub update_rel_tol: f64,
    /// Bound on the weighted RMS norm of the last update
    pub delta_x_tol: f64,
    /// Largest allowed entry of a single update; larger updates are scaled down
    pub max_step: f64,
    /// Line search backtracking factor
    pub line_search_beta: f64,
    /// Maximum line search iterations
    pub max_line_search_iters: usize,
    /// Damping below which the line search counts as stalled
    pub min_damping: f64,
    /// Residual growth over the starting residual treated as divergence
    pub divergence_factor: f64,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            residual_abs_tol: 1e-9,
            residual_rel_tol: 1e-9,
            update_abs_tol: 1e-9,
            update_rel_tol: 1e-6,
            delta_x_tol: 1.0,
            max_step: f64::INFINITY,
            line_search_beta: 0.5,
            max_line_search_iters: 20,
            min_damping: 1e-10,
            divergence_factor: 1e8,
        }
    }
}

impl NewtonConfig {
    pub fn update_tolerances(&self) -> Tolerances {
        Tolerances {
            abs: self.update_abs_tol,
            rel: self.update_rel_tol,
        }
    }

    pub fn validate(&self) -> SolverResult<()> {
        let problem = if self.max_iterations == 0 {
            Some("max_iterations must be positive")
        } else if !(self.line_search_beta > 0.0 && self.line_search_beta < 1.0) {
            Some("line_search_beta must lie in (0, 1)")
        } else if self.max_step <= 0.0 || self.max_step.is_nan() {
            Some("max_step must be positive")
        } else if self.delta_x_tol <= 0.0 {
            Some("delta_x_tol must be positive")
        } else {
            None
        };
        match problem {
            Some(what) => Err(SolverError::ProblemSetup {
                what: what.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Why an iteration was abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivergenceReason {
    ResidualGrowth,
    LinearSolve,
    LineSearchStalled,
    NonFinite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewtonStatus {
    Converged,
    Diverged(DivergenceReason),
    MaxIterationsExceeded,
}

/// Newton iteration result.
#[derive(Clone, Debug)]
pub struct NewtonResult {
    /// Last iterate (the solution when converged)
    pub x: DVector<f64>,
    pub status: NewtonStatus,
    /// Number of linear solves performed
    pub iterations: usize,
    /// Residual 2-norm at `x`
    pub residual_norm: f64,
    /// Weighted RMS norm of the last applied update
    pub update_norm: f64,
}

impl NewtonResult {
    pub fn converged(&self) -> bool {
        self.status == NewtonStatus::Converged
    }
}

/// Newton solver bound to a process group.
#[derive(Clone)]
pub struct NewtonSolver {
    config: NewtonConfig,
    comm: Arc<dyn Communicator>,
}

impl std::fmt::Debug for NewtonSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewtonSolver")
            .field("config", &self.config)
            .field("ranks", &self.comm.size())
            .finish()
    }
}

impl NewtonSolver {
    pub fn new(config: NewtonConfig) -> Self {
        Self::with_comm(config, Arc::new(SerialComm))
    }

    pub fn with_comm(config: NewtonConfig, comm: Arc<dyn Communicator>) -> Self {
        Self { config, comm }
    }

    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Same process group, different configuration.
    pub fn with_config(&self, config: NewtonConfig) -> Self {
        Self {
            config,
            comm: Arc::clone(&self.comm),
        }
    }

    /// Solve `system(x) = 0` starting from `x0`.
    ///
    /// Non-convergence is reported through [`NewtonStatus`]. `Err` is reserved
    /// for malformed input and faults raised while evaluating the system.
    pub fn solve<S, L>(
        &self,
        system: &S,
        linear: &mut L,
        x0: &DVector<f64>,
        ctx: &mut ConvergenceContext,
    ) -> SolverResult<NewtonResult>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        let cfg = &self.config;
        let comm = self.comm.as_ref();
        let n = system.size();
        if x0.len() != n {
            return Err(SolverError::DimensionMismatch {
                what: "initial iterate",
                expected: n,
                found: x0.len(),
            });
        }

        let mut x = x0.clone();
        let Linearization {
            mut residual,
            mut jacobian,
        } = system.evaluate(&x, ctx)?;
        let mut r_norm = two_norm(comm, &residual);
        let r0_norm = r_norm;
        let weights_tol = cfg.update_tolerances();

        let finish = |x: DVector<f64>,
                      status: NewtonStatus,
                      iterations: usize,
                      residual_norm: f64,
                      update_norm: f64|
         -> SolverResult<NewtonResult> {
            Ok(NewtonResult {
                x,
                status,
                iterations,
                residual_norm,
                update_norm,
            })
        };

        if !r_norm.is_finite() {
            return finish(x, NewtonStatus::Diverged(DivergenceReason::NonFinite), 0, r_norm, 0.0);
        }
        // Already solved: no update is needed to certify it.
        if r_norm <= cfg.residual_abs_tol {
            ctx.newton_iterations = 0;
            return finish(x, NewtonStatus::Converged, 0, r_norm, 0.0);
        }

        let growth_limit = cfg.divergence_factor * r0_norm.max(cfg.residual_abs_tol);
        let residual_target = cfg.residual_abs_tol + cfg.residual_rel_tol * r0_norm;
        let mut update_norm = f64::INFINITY;

        for iter in 1..=cfg.max_iterations {
            ctx.newton_iterations = iter;

            let mut dx = match linear.factor_and_solve(&jacobian, &(-&residual)) {
                Ok(dx) => dx,
                Err(e) => {
                    warn!(iter, mode = ctx.mode.as_str(), error = %e, "newton: linear solve failed");
                    return finish(
                        x,
                        NewtonStatus::Diverged(DivergenceReason::LinearSolve),
                        iter,
                        r_norm,
                        update_norm,
                    );
                }
            };

            let dx_max = inf_norm(comm, &dx);
            if dx_max > cfg.max_step {
                dx *= cfg.max_step / dx_max;
            }

            let mut alpha = 1.0;
            let mut trial = &x + &dx;
            let mut lin = system.evaluate(&trial, ctx)?;
            let mut trial_norm = two_norm(comm, &lin.residual);
            let acceptable = |norm: f64| norm.is_finite() && (norm < r_norm || norm <= residual_target);

            for _ in 0..cfg.max_line_search_iters {
                if acceptable(trial_norm) {
                    break;
                }
                alpha *= cfg.line_search_beta;
                trial = &x + alpha * &dx;
                lin = system.evaluate(&trial, ctx)?;
                trial_norm = two_norm(comm, &lin.residual);
            }
            // A trial that still raises the residual is never taken.
            if !acceptable(trial_norm) {
                warn!(iter, alpha, r_norm, trial_norm, "newton: line search stalled");
                return finish(
                    x,
                    NewtonStatus::Diverged(DivergenceReason::LineSearchStalled),
                    iter,
                    r_norm,
                    update_norm,
                );
            }

            let weights = weights_tol.weights(&x);
            update_norm = alpha * weighted_rms_norm(comm, &dx, &weights);

            x = trial;
            residual = lin.residual;
            jacobian = lin.jacobian;
            r_norm = trial_norm;

            debug!(iter, r_norm, update_norm, alpha, mode = ctx.mode.as_str(), "newton iteration");

            if !r_norm.is_finite() || x.iter().any(|v| !v.is_finite()) {
                return finish(x, NewtonStatus::Diverged(DivergenceReason::NonFinite), iter, r_norm, update_norm);
            }
            if r_norm > growth_limit {
                return finish(
                    x,
                    NewtonStatus::Diverged(DivergenceReason::ResidualGrowth),
                    iter,
                    r_norm,
                    update_norm,
                );
            }

            let residual_ok = r_norm <= residual_target;
            let update_ok = update_norm <= cfg.delta_x_tol;
            if residual_ok && update_ok {
                return finish(x, NewtonStatus::Converged, iter, r_norm, update_norm);
            }

            if alpha < cfg.min_damping {
                warn!(iter, alpha, "newton: line search stalled");
                return finish(
                    x,
                    NewtonStatus::Diverged(DivergenceReason::LineSearchStalled),
                    iter,
                    r_norm,
                    update_norm,
                );
            }
        }

        debug!(max_iterations = cfg.max_iterations, r_norm, "newton: iteration limit reached");
        finish(x, NewtonStatus::MaxIterationsExceeded, cfg.max_iterations, r_norm, update_norm)
    }
}
