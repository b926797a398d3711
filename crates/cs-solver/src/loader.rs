//! Contract with the device-evaluation layer.
//!
//! The engine never sees circuit topology. It hands a candidate solution to
//! the [`Loader`] and gets back the two vectors of the DAE
//! `d/dt q(x) + f(x, t) = 0` together with the combined Jacobian.

use crate::error::{SolverError, SolverResult};
use nalgebra::{DMatrix, DVector};

/// Where, and with which weighting, the Loader is evaluated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadPoint {
    pub time: f64,
    /// Weight `c_j` applied to `∂q/∂x` in the combined Jacobian. Zero for
    /// static problems.
    pub derivative_weight: f64,
    /// Scale applied to independent sources, 1.0 outside source stepping.
    pub source_scale: f64,
}

impl LoadPoint {
    pub fn static_at(time: f64) -> Self {
        Self {
            time,
            derivative_weight: 0.0,
            source_scale: 1.0,
        }
    }

    pub fn transient(time: f64, derivative_weight: f64) -> Self {
        Self {
            time,
            derivative_weight,
            source_scale: 1.0,
        }
    }
}

/// One evaluation of the device equations.
#[derive(Clone, Debug)]
pub struct LoadedSystem {
    /// Charge/flux vector `q(x)`.
    pub q: DVector<f64>,
    /// Static vector `f(x, t)`, scaled sources included.
    pub f: DVector<f64>,
    /// `derivative_weight · ∂q/∂x + ∂f/∂x`.
    pub jacobian: DMatrix<f64>,
}

impl LoadedSystem {
    pub fn check_size(&self, n: usize) -> SolverResult<()> {
        for (what, len) in [("loader q", self.q.len()), ("loader f", self.f.len())] {
            if len != n {
                return Err(SolverError::DimensionMismatch {
                    what,
                    expected: n,
                    found: len,
                });
            }
        }
        if self.jacobian.nrows() != n || self.jacobian.ncols() != n {
            return Err(SolverError::DimensionMismatch {
                what: "loader jacobian",
                expected: n,
                found: self.jacobian.nrows().max(self.jacobian.ncols()),
            });
        }
        Ok(())
    }
}

/// Device-evaluation layer.
///
/// `evaluate` must be free of side effects: the same `x` and point give the
/// same answer. Device state only moves forward through `commit`, which is
/// called once per accepted step.
pub trait Loader {
    fn size(&self) -> usize;

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem>;

    fn commit(&mut self, _x: &DVector<f64>, _time: f64) {}

    /// Discontinuities of sources in `(from, to]`.
    fn breakpoints(&self, _from: f64, _to: f64) -> Vec<f64> {
        Vec::new()
    }

    /// Device-imposed limit on the next step.
    fn max_time_step(&self, _time: f64) -> Option<f64> {
        None
    }

    /// Set a named sweep parameter.
    fn set_param(&mut self, name: &str, _value: f64) -> SolverResult<()> {
        Err(SolverError::ProblemSetup {
            what: format!("unknown parameter '{name}'"),
        })
    }
}

impl<T: Loader + ?Sized> Loader for &mut T {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        (**self).evaluate(x, point)
    }

    fn commit(&mut self, x: &DVector<f64>, time: f64) {
        (**self).commit(x, time)
    }

    fn breakpoints(&self, from: f64, to: f64) -> Vec<f64> {
        (**self).breakpoints(from, to)
    }

    fn max_time_step(&self, time: f64) -> Option<f64> {
        (**self).max_time_step(time)
    }

    fn set_param(&mut self, name: &str, value: f64) -> SolverResult<()> {
        (**self).set_param(name, value)
    }
}
