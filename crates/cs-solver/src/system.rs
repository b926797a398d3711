//! Nonlinear-system views handed to the Newton iteration.

use crate::error::{SolverError, SolverResult};
use crate::jacobian::forward_difference_jacobian;
use crate::loader::{LoadPoint, Loader};
use nalgebra::{DMatrix, DVector};

/// Which equations the current solve owns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CouplingMode {
    #[default]
    Full,
    Inner,
    Outer,
}

impl CouplingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouplingMode::Full => "full",
            CouplingMode::Inner => "inner",
            CouplingMode::Outer => "outer",
        }
    }
}

/// Per-attempt information shared between the solver stack and the system
/// being solved.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvergenceContext {
    pub newton_iterations: usize,
    pub mode: CouplingMode,
    /// Number of continuation steps taken so far in this attempt.
    pub continuation_step: usize,
    /// Value of a natural-parameter homotopy, 1.0 when none is active.
    pub continuation_param: f64,
    pub first_continuation_param: bool,
    pub first_solve_complete: bool,
    /// Set while an arc-length style continuation drives the solve.
    pub loca_flag: bool,
}

impl Default for ConvergenceContext {
    fn default() -> Self {
        Self {
            newton_iterations: 0,
            mode: CouplingMode::Full,
            continuation_step: 0,
            continuation_param: 1.0,
            first_continuation_param: true,
            first_solve_complete: false,
            loca_flag: false,
        }
    }
}

impl ConvergenceContext {
    pub fn with_mode(mode: CouplingMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Residual and Jacobian at one point.
#[derive(Clone, Debug)]
pub struct Linearization {
    pub residual: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

/// `F(x) = 0` as seen by Newton.
pub trait NonlinearSystem {
    fn size(&self) -> usize;

    fn evaluate(&self, x: &DVector<f64>, ctx: &ConvergenceContext) -> SolverResult<Linearization>;
}

/// Static (DC) problem `f(x, t) = 0`, sources scaled by the context's
/// continuation parameter.
pub struct StaticSystem<'a, L: Loader + ?Sized> {
    loader: &'a L,
    time: f64,
}

impl<'a, L: Loader + ?Sized> StaticSystem<'a, L> {
    pub fn new(loader: &'a L, time: f64) -> Self {
        Self { loader, time }
    }
}

impl<L: Loader + ?Sized> NonlinearSystem for StaticSystem<'_, L> {
    fn size(&self) -> usize {
        self.loader.size()
    }

    fn evaluate(&self, x: &DVector<f64>, ctx: &ConvergenceContext) -> SolverResult<Linearization> {
        let point = LoadPoint {
            source_scale: ctx.continuation_param,
            ..LoadPoint::static_at(self.time)
        };
        let loaded = self.loader.evaluate(x, &point)?;
        loaded.check_size(self.size())?;
        Ok(Linearization {
            residual: loaded.f,
            jacobian: loaded.jacobian,
        })
    }
}

/// Residual closure with a finite-difference Jacobian.
///
/// Handy for small hand-written problems where an analytic Jacobian is not
/// worth the effort.
pub struct FnSystem<F> {
    size: usize,
    residual: F,
    epsilon: f64,
}

impl<F> FnSystem<F>
where
    F: Fn(&DVector<f64>, &ConvergenceContext) -> SolverResult<DVector<f64>>,
{
    pub fn new(size: usize, residual: F) -> Self {
        Self {
            size,
            residual,
            epsilon: 1e-7,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

impl<F> NonlinearSystem for FnSystem<F>
where
    F: Fn(&DVector<f64>, &ConvergenceContext) -> SolverResult<DVector<f64>>,
{
    fn size(&self) -> usize {
        self.size
    }

    fn evaluate(&self, x: &DVector<f64>, ctx: &ConvergenceContext) -> SolverResult<Linearization> {
        let residual = (self.residual)(x, ctx)?;
        if residual.len() != self.size {
            return Err(SolverError::DimensionMismatch {
                what: "residual",
                expected: self.size,
                found: residual.len(),
            });
        }
        let jacobian =
            forward_difference_jacobian(x, &residual, |xp| (self.residual)(xp, ctx), self.epsilon)?;
        Ok(Linearization { residual, jacobian })
    }
}
