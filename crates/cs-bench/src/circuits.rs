//! Small reference circuits used by the benchmark scenarios.

use cs_solver::{LoadPoint, LoadedSystem, Loader, SolverError, SolverResult};
use nalgebra::{DMatrix, DVector};

/// Diode saturation current.
pub const DIODE_IS: f64 = 1e-14;
/// Thermal voltage.
pub const DIODE_VT: f64 = 0.025;

/// Exponent above which the diode current continues linearly.
const EXP_LIMIT: f64 = 40.0;

/// `exp(u)` and its derivative, continued linearly above `EXP_LIMIT`.
fn limited_exp(u: f64) -> (f64, f64) {
    if u <= EXP_LIMIT {
        let e = u.exp();
        (e, e)
    } else {
        let e = EXP_LIMIT.exp();
        (e * (1.0 + u - EXP_LIMIT), e)
    }
}

/// Capacitor discharging through a resistor.
#[derive(Clone, Copy, Debug)]
pub struct RcCircuit {
    pub r: f64,
    pub c: f64,
}

impl RcCircuit {
    pub fn tau(&self) -> f64 {
        self.r * self.c
    }
}

impl Loader for RcCircuit {
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

/// Trapezoidal pulse train starting at `t = 0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pulse {
    pub low: f64,
    pub high: f64,
    pub rise: f64,
    pub width: f64,
    pub fall: f64,
    pub period: f64,
}

impl Pulse {
    pub fn value(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return self.low;
        }
        let tau = t % self.period;
        let span = self.high - self.low;
        if tau < self.rise {
            self.low + span * tau / self.rise
        } else if tau < self.rise + self.width {
            self.high
        } else if tau < self.rise + self.width + self.fall {
            self.high - span * (tau - self.rise - self.width) / self.fall
        } else {
            self.low
        }
    }

    /// Corners of the waveform in `(from, to]`.
    pub fn corners(&self, from: f64, to: f64) -> Vec<f64> {
        let offsets = [
            0.0,
            self.rise,
            self.rise + self.width,
            self.rise + self.width + self.fall,
        ];
        let mut out = Vec::new();
        let mut start = (from / self.period).floor().max(0.0) * self.period;
        while start <= to {
            for off in offsets {
                let t = start + off;
                if t > from && t <= to {
                    out.push(t);
                }
            }
            start += self.period;
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Source {
    Dc(f64),
    Pulse(Pulse),
}

impl Source {
    fn value(&self, t: f64) -> f64 {
        match self {
            Source::Dc(v) => *v,
            Source::Pulse(p) => p.value(t),
        }
    }
}

/// Source behind a resistor into a node held by a capacitor and a diode to
/// ground.
#[derive(Clone, Copy, Debug)]
pub struct DiodeClipper {
    pub source: Source,
    pub r: f64,
    pub c: f64,
}

impl DiodeClipper {
    pub fn pulsed(pulse: Pulse) -> Self {
        Self {
            source: Source::Pulse(pulse),
            r: 1e3,
            c: 1e-9,
        }
    }

    pub fn dc(vin: f64) -> Self {
        Self {
            source: Source::Dc(vin),
            r: 1e3,
            c: 1e-9,
        }
    }
}

impl Loader for DiodeClipper {
    fn size(&self) -> usize {
        1
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        let v = x[0];
        let vs = point.source_scale * self.source.value(point.time);
        let (e, de) = limited_exp(v / DIODE_VT);
        Ok(LoadedSystem {
            q: DVector::from_element(1, self.c * v),
            f: DVector::from_element(1, (v - vs) / self.r + DIODE_IS * (e - 1.0)),
            jacobian: DMatrix::from_element(
                1,
                1,
                point.derivative_weight * self.c + 1.0 / self.r + DIODE_IS * de / DIODE_VT,
            ),
        })
    }

    fn breakpoints(&self, from: f64, to: f64) -> Vec<f64> {
        match &self.source {
            Source::Pulse(p) => p.corners(from, to),
            Source::Dc(_) => Vec::new(),
        }
    }

    fn set_param(&mut self, name: &str, value: f64) -> SolverResult<()> {
        match name {
            "vin" => {
                self.source = Source::Dc(value);
                Ok(())
            }
            _ => Err(SolverError::ProblemSetup {
                what: format!("unknown parameter '{name}'"),
            }),
        }
    }
}
