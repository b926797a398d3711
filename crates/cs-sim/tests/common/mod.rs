//! Small circuits shared by the integration tests.

#![allow(dead_code)]

use cs_solver::{LoadPoint, LoadedSystem, Loader, SolverError, SolverResult};
use nalgebra::{DMatrix, DVector};

/// Capacitor discharging through a resistor: `C v' + v / R = 0`.
pub struct RcDecay {
    pub r: f64,
    pub c: f64,
}

impl RcDecay {
    pub fn with_tau(tau: f64) -> Self {
        Self { r: tau, c: 1.0 }
    }

    pub fn tau(&self) -> f64 {
        self.r * self.c
    }
}

impl Loader for RcDecay {
    fn size(&self) -> usize {
        1
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        Ok(LoadedSystem {
            q: x * self.c,
            f: x / self.r,
            jacobian: DMatrix::from_element(1, 1, point.derivative_weight * self.c + 1.0 / self.r),
        })
    }
}

/// RC low-pass fed by a unit step that switches on just after `t = 0`.
pub struct SteppedRc {
    pub tau: f64,
}

impl Loader for SteppedRc {
    fn size(&self) -> usize {
        1
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        let vin = if point.time > 0.0 { point.source_scale } else { 0.0 };
        Ok(LoadedSystem {
            q: x.clone(),
            f: DVector::from_element(1, (x[0] - vin) / self.tau),
            jacobian: DMatrix::from_element(1, 1, point.derivative_weight + 1.0 / self.tau),
        })
    }
}

/// `x' = 0`: every prediction is exact.
pub struct Frozen {
    pub size: usize,
}

impl Loader for Frozen {
    fn size(&self) -> usize {
        self.size
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        let n = self.size;
        Ok(LoadedSystem {
            q: x.clone(),
            f: DVector::zeros(n),
            jacobian: DMatrix::identity(n, n) * point.derivative_weight,
        })
    }
}

/// Decaying rotation, `q = x`, `f = A x` with `A = [[a, w], [-w, a]]`.
pub struct Spiral {
    pub a: f64,
    pub w: f64,
}

impl Loader for Spiral {
    fn size(&self) -> usize {
        2
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        let a = DMatrix::from_row_slice(2, 2, &[self.a, self.w, -self.w, self.a]);
        Ok(LoadedSystem {
            q: x.clone(),
            f: &a * x,
            jacobian: DMatrix::identity(2, 2) * point.derivative_weight + a,
        })
    }
}

/// Produces NaN currents for every time after the start.
pub struct Poisoned;

impl Loader for Poisoned {
    fn size(&self) -> usize {
        1
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        let f = if point.time > 0.0 { f64::NAN } else { 0.0 };
        Ok(LoadedSystem {
            q: x.clone(),
            f: DVector::from_element(1, f),
            jacobian: DMatrix::from_element(1, 1, point.derivative_weight + 1.0),
        })
    }
}

/// Source `vin` behind a resistor, clamped by a diode to ground.
pub struct DiodeClamp {
    pub vin: f64,
    /// Inputs above this make the device model return NaN.
    pub breakdown: f64,
}

impl DiodeClamp {
    pub const R: f64 = 1e3;
    pub const IS: f64 = 1e-14;
    pub const VT: f64 = 0.025;

    pub fn new() -> Self {
        Self {
            vin: 0.0,
            breakdown: f64::INFINITY,
        }
    }
}

impl Loader for DiodeClamp {
    fn size(&self) -> usize {
        1
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        if self.vin > self.breakdown {
            return Ok(LoadedSystem {
                q: DVector::zeros(1),
                f: DVector::from_element(1, f64::NAN),
                jacobian: DMatrix::from_element(1, 1, f64::NAN),
            });
        }
        let v = x[0];
        let e = (v / Self::VT).exp();
        Ok(LoadedSystem {
            q: DVector::zeros(1),
            f: DVector::from_element(1, (v - point.source_scale * self.vin) / Self::R + Self::IS * (e - 1.0)),
            jacobian: DMatrix::from_element(1, 1, 1.0 / Self::R + Self::IS * e / Self::VT),
        })
    }

    fn set_param(&mut self, name: &str, value: f64) -> SolverResult<()> {
        match name {
            "vin" => {
                self.vin = value;
                Ok(())
            }
            _ => Err(SolverError::ProblemSetup {
                what: format!("unknown parameter '{name}'"),
            }),
        }
    }
}
