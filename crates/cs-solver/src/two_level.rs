//! Two-level Newton coupling for partitioned problems.
//!
//! The unknowns are split into an inner block (typically a device-level or
//! distributed sub-problem) and the outer remainder. Depending on the
//! strategy, the coupler solves the full system directly, alternates inner
//! solves with full solves, or runs block Gauss-Seidel sweeps.

use crate::continuation::{ContinuationConfig, ContinuationEngine, ContinuationOutcome};
use crate::error::{SolverError, SolverResult};
use crate::linear::LinearSolver;
use crate::newton::{NewtonResult, NewtonSolver, NewtonStatus};
use crate::system::{ConvergenceContext, CouplingMode, Linearization, NonlinearSystem};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

/// Split of unknown (and equation) indices into inner and outer blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    size: usize,
    inner: Vec<usize>,
    outer: Vec<usize>,
}

impl Partition {
    /// Build from the inner indices; everything else is outer.
    pub fn new(size: usize, inner: impl IntoIterator<Item = usize>) -> SolverResult<Self> {
        let mut mask = vec![false; size];
        for i in inner {
            if i >= size {
                return Err(SolverError::ProblemSetup {
                    what: format!("partition index {i} out of range for size {size}"),
                });
            }
            if mask[i] {
                return Err(SolverError::ProblemSetup {
                    what: format!("partition index {i} listed twice"),
                });
            }
            mask[i] = true;
        }
        let (inner, outer): (Vec<usize>, Vec<usize>) = (0..size).partition(|&i| mask[i]);
        if inner.is_empty() || outer.is_empty() {
            return Err(SolverError::ProblemSetup {
                what: "partition needs non-empty inner and outer blocks".to_string(),
            });
        }
        Ok(Self { size, inner, outer })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn inner(&self) -> &[usize] {
        &self.inner
    }

    pub fn outer(&self) -> &[usize] {
        &self.outer
    }

    fn block(&self, mode: CouplingMode) -> &[usize] {
        match mode {
            CouplingMode::Inner => &self.inner,
            CouplingMode::Outer => &self.outer,
            CouplingMode::Full => &[],
        }
    }
}

/// Coupling strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CouplingStrategy {
    /// One Newton solve on the coupled system.
    #[default]
    Full,
    /// Inner solve, then a full solve, repeated.
    InnerFull,
    /// Block Gauss-Seidel: inner solve with outer frozen, then outer solve
    /// with inner frozen.
    InnerOuter,
}

impl CouplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouplingStrategy::Full => "full",
            CouplingStrategy::InnerFull => "inner_full",
            CouplingStrategy::InnerOuter => "inner_outer",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TwoLevelConfig {
    pub strategy: CouplingStrategy,
    pub max_sweeps: usize,
    /// Stop at the first inner failure instead of carrying on with the
    /// outer solve.
    pub inner_failure_fatal: bool,
    /// Route failed inner solves through continuation.
    pub inner_continuation: Option<ContinuationConfig>,
    /// Certify a converged composite with one last full solve.
    pub enforce_full_solve: bool,
}

impl Default for TwoLevelConfig {
    fn default() -> Self {
        Self {
            strategy: CouplingStrategy::default(),
            max_sweeps: 20,
            inner_failure_fatal: true,
            inner_continuation: None,
            enforce_full_solve: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CouplingStatus {
    Converged,
    Diverged,
}

#[derive(Clone, Debug)]
pub struct CouplingResult {
    pub x: DVector<f64>,
    pub status: CouplingStatus,
    pub sweeps: usize,
    pub inner_iterations: usize,
    pub outer_iterations: usize,
}

impl CouplingResult {
    pub fn converged(&self) -> bool {
        self.status == CouplingStatus::Converged
    }
}

/// One block of the full system with the other block frozen at `frozen`.
struct BlockView<'a, S: ?Sized> {
    full: &'a S,
    indices: &'a [usize],
    frozen: &'a DVector<f64>,
}

impl<S: ?Sized> BlockView<'_, S> {
    fn gather(&self, v: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(self.indices.len(), self.indices.iter().map(|&i| v[i]))
    }

    fn scatter(&self, block: &DVector<f64>) -> DVector<f64> {
        let mut full = self.frozen.clone();
        for (k, &i) in self.indices.iter().enumerate() {
            full[i] = block[k];
        }
        full
    }
}

impl<S: NonlinearSystem + ?Sized> NonlinearSystem for BlockView<'_, S> {
    fn size(&self) -> usize {
        self.indices.len()
    }

    fn evaluate(&self, x: &DVector<f64>, ctx: &ConvergenceContext) -> SolverResult<Linearization> {
        let full = self.full.evaluate(&self.scatter(x), ctx)?;
        let m = self.indices.len();
        let residual = self.gather(&full.residual);
        let jacobian = DMatrix::from_fn(m, m, |r, c| full.jacobian[(self.indices[r], self.indices[c])]);
        Ok(Linearization { residual, jacobian })
    }
}

/// Tracks which trial point each block was last converged at. The trial
/// counter moves whenever a solve changes the iterate.
#[derive(Default)]
struct TrialLedger {
    trial: u64,
    inner_ok_at: Option<u64>,
    outer_ok_at: Option<u64>,
}

impl TrialLedger {
    fn record(&mut self, mode: CouplingMode, result: &NewtonResult) {
        if result.iterations > 0 {
            self.trial += 1;
        }
        let at = result.converged().then_some(self.trial);
        match mode {
            CouplingMode::Inner => self.inner_ok_at = at,
            CouplingMode::Outer => self.outer_ok_at = at,
            CouplingMode::Full => {
                self.inner_ok_at = at;
                self.outer_ok_at = at;
            }
        }
    }

    fn both_converged(&self) -> bool {
        self.inner_ok_at == Some(self.trial) && self.outer_ok_at == Some(self.trial)
    }
}

pub struct TwoLevelCoupler {
    newton: NewtonSolver,
    config: TwoLevelConfig,
}

impl TwoLevelCoupler {
    pub fn new(newton: NewtonSolver, config: TwoLevelConfig) -> Self {
        Self { newton, config }
    }

    pub fn config(&self) -> &TwoLevelConfig {
        &self.config
    }

    fn solve_full<S, L>(&self, system: &S, linear: &mut L, x: &DVector<f64>) -> SolverResult<NewtonResult>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        let mut ctx = ConvergenceContext::with_mode(CouplingMode::Full);
        self.newton.solve(system, linear, x, &mut ctx)
    }

    /// Solve one block; returns the block result mapped back to full length.
    fn solve_block<S, L>(
        &self,
        system: &S,
        partition: &Partition,
        mode: CouplingMode,
        linear: &mut L,
        x: &DVector<f64>,
    ) -> SolverResult<NewtonResult>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        let view = BlockView {
            full: system,
            indices: partition.block(mode),
            frozen: x,
        };
        let xb = view.gather(x);
        let mut ctx = ConvergenceContext::with_mode(mode);
        let mut result = self.newton.solve(&view, linear, &xb, &mut ctx)?;

        if mode == CouplingMode::Inner && !result.converged() {
            if let Some(cfg) = &self.config.inner_continuation {
                let engine = ContinuationEngine::new(self.newton.clone(), cfg.clone());
                if let ContinuationOutcome::Converged { result: cont, steps, .. } = engine.attempt(&view, linear, &xb)? {
                    debug!(steps, "two-level: inner continuation recovered");
                    result = NewtonResult {
                        iterations: result.iterations + cont.iterations.max(1),
                        ..cont
                    };
                }
            }
        }

        result.x = view.scatter(&result.x);
        Ok(result)
    }

    /// Drive the partitioned system to a composite solution.
    pub fn solve_composite<S, L>(
        &self,
        system: &S,
        partition: &Partition,
        linear: &mut L,
        x0: &DVector<f64>,
    ) -> SolverResult<CouplingResult>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        if partition.size() != system.size() || x0.len() != system.size() {
            return Err(SolverError::DimensionMismatch {
                what: "partitioned system",
                expected: system.size(),
                found: partition.size().min(x0.len()),
            });
        }

        let cfg = &self.config;
        let strategy = cfg.strategy.as_str();
        let mut ledger = TrialLedger::default();
        let mut x = x0.clone();
        let mut inner_iterations = 0;
        let mut outer_iterations = 0;
        let mut sweeps = 0;

        let done = |x: DVector<f64>,
                    status: CouplingStatus,
                    sweeps: usize,
                    inner_iterations: usize,
                    outer_iterations: usize|
         -> SolverResult<CouplingResult> {
            Ok(CouplingResult {
                x,
                status,
                sweeps,
                inner_iterations,
                outer_iterations,
            })
        };

        if cfg.strategy == CouplingStrategy::Full {
            let full = self.solve_full(system, linear, &x)?;
            let status = if full.converged() {
                CouplingStatus::Converged
            } else {
                CouplingStatus::Diverged
            };
            return done(full.x, status, 1, 0, full.iterations);
        }

        while sweeps < cfg.max_sweeps {
            sweeps += 1;

            let inner = self.solve_block(system, partition, CouplingMode::Inner, linear, &x)?;
            inner_iterations += inner.iterations;
            ledger.record(CouplingMode::Inner, &inner);
            if inner.converged() {
                x = inner.x;
            } else if cfg.inner_failure_fatal {
                warn!(strategy, sweeps, status = ?inner.status, "two-level: inner solve failed");
                return done(x, CouplingStatus::Diverged, sweeps, inner_iterations, outer_iterations);
            }

            let (mode, second) = match cfg.strategy {
                CouplingStrategy::InnerFull => (CouplingMode::Full, self.solve_full(system, linear, &x)?),
                _ => (
                    CouplingMode::Outer,
                    self.solve_block(system, partition, CouplingMode::Outer, linear, &x)?,
                ),
            };
            outer_iterations += second.iterations;
            ledger.record(mode, &second);
            if second.status != NewtonStatus::Converged {
                debug!(strategy, sweeps, mode = mode.as_str(), status = ?second.status, "two-level: second solve did not converge");
            } else {
                x = second.x;
            }

            debug!(strategy, sweeps, trial = ledger.trial, "two-level sweep");
            if ledger.both_converged() {
                if cfg.enforce_full_solve {
                    let full = self.solve_full(system, linear, &x)?;
                    outer_iterations += full.iterations;
                    let status = if full.converged() {
                        CouplingStatus::Converged
                    } else {
                        CouplingStatus::Diverged
                    };
                    return done(full.x, status, sweeps, inner_iterations, outer_iterations);
                }
                return done(x, CouplingStatus::Converged, sweeps, inner_iterations, outer_iterations);
            }
        }

        warn!(strategy, sweeps, "two-level: sweep limit reached");
        done(x, CouplingStatus::Diverged, sweeps, inner_iterations, outer_iterations)
    }
}
