use crate::{CoreError, CoreResult};
use nalgebra::DVector;

/// Floating point type used throughout the engine
pub type Real = f64;

/// Absolute/relative tolerance pair.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tolerances {
    pub abs: Real,
    pub rel: Real,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            abs: 1e-6,
            rel: 1e-3,
        }
    }
}

impl Tolerances {
    /// Weight of a single component: `rel * |x| + abs`.
    pub fn weight(&self, x: Real) -> Real {
        (self.rel * x.abs() + self.abs).max(Real::MIN_POSITIVE)
    }

    /// Per-component error weights for a solution vector.
    pub fn weights(&self, x: &DVector<Real>) -> DVector<Real> {
        x.map(|xi| self.weight(xi))
    }
}

/// Fails on the first non-finite entry of `v`.
pub fn ensure_all_finite(v: &DVector<Real>, what: &'static str) -> CoreResult<()> {
    match v.iter().find(|x| !x.is_finite()) {
        Some(&value) => Err(CoreError::NonFinite { what, value }),
        None => Ok(()),
    }
}
