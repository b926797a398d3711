//! DC operating point.
//!
//! Plain Newton first; on failure each configured homotopy is tried in turn
//! from the original guess.

use crate::continuation::{ContinuationConfig, ContinuationEngine, ContinuationOutcome, Homotopy};
use crate::error::SolverResult;
use crate::linear::LinearSolver;
use crate::loader::Loader;
use crate::mode::SolveMode;
use crate::newton::{NewtonConfig, NewtonSolver};
use crate::system::{ConvergenceContext, StaticSystem};
use cs_core::{Communicator, SerialComm};
use nalgebra::DVector;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct OperatingPointConfig {
    pub newton: NewtonConfig,
    /// Homotopies tried, in order, when plain Newton fails.
    pub fallbacks: Vec<ContinuationConfig>,
}

impl Default for OperatingPointConfig {
    fn default() -> Self {
        Self {
            newton: SolveMode::DcOperatingPoint.to_newton_config(),
            fallbacks: vec![ContinuationConfig::default(), ContinuationConfig::source_stepping()],
        }
    }
}

/// How the operating point was reached.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OperatingPointMethod {
    Newton,
    Continuation(Homotopy),
}

#[derive(Clone, Debug)]
pub struct OperatingPoint {
    pub x: DVector<f64>,
    pub method: OperatingPointMethod,
    pub newton_iterations: usize,
}

#[derive(Clone, Debug)]
pub enum OperatingPointOutcome {
    Converged(OperatingPoint),
    /// Newton and every fallback failed.
    Exhausted { attempts: usize, reached_param: f64 },
}

pub struct OperatingPointSolver {
    newton: NewtonSolver,
    fallbacks: Vec<ContinuationConfig>,
}

impl OperatingPointSolver {
    pub fn new(config: OperatingPointConfig) -> Self {
        Self::with_comm(config, Arc::new(SerialComm))
    }

    pub fn with_comm(config: OperatingPointConfig, comm: Arc<dyn Communicator>) -> Self {
        Self {
            newton: NewtonSolver::with_comm(config.newton, comm),
            fallbacks: config.fallbacks,
        }
    }

    pub fn solve<L, S>(&self, loader: &L, linear: &mut S, x0: &DVector<f64>, time: f64) -> SolverResult<OperatingPointOutcome>
    where
        L: Loader + ?Sized,
        S: LinearSolver + ?Sized,
    {
        let system = StaticSystem::new(loader, time);
        let mut ctx = ConvergenceContext::default();
        let direct = self.newton.solve(&system, linear, x0, &mut ctx)?;
        if direct.converged() {
            return Ok(OperatingPointOutcome::Converged(OperatingPoint {
                x: direct.x,
                method: OperatingPointMethod::Newton,
                newton_iterations: direct.iterations,
            }));
        }
        warn!(status = ?direct.status, iterations = direct.iterations, "dc op: newton failed, trying continuation");

        let mut reached_param = 0.0_f64;
        for (attempt, cfg) in self.fallbacks.iter().enumerate() {
            let engine = ContinuationEngine::new(self.newton.clone(), cfg.clone());
            match engine.attempt(&system, linear, x0)? {
                ContinuationOutcome::Converged { result, steps, .. } => {
                    info!(homotopy = cfg.homotopy.as_str(), steps, "dc op: recovered by continuation");
                    return Ok(OperatingPointOutcome::Converged(OperatingPoint {
                        x: result.x,
                        method: OperatingPointMethod::Continuation(cfg.homotopy),
                        newton_iterations: direct.iterations + result.iterations,
                    }));
                }
                ContinuationOutcome::Exhausted { reached_param: reached, .. } => {
                    warn!(attempt, homotopy = cfg.homotopy.as_str(), reached, "dc op: continuation exhausted");
                    reached_param = reached_param.max(reached);
                }
            }
        }

        Ok(OperatingPointOutcome::Exhausted {
            attempts: 1 + self.fallbacks.len(),
            reached_param,
        })
    }
}
