//! Step descriptors handed in by an outer simulator.

use crate::error::{SimError, SimResult};

/// One step requested by a driving simulator.
///
/// The controller reads it and never writes back. The analysis flags mirror
/// what the outer code is doing so the inner circuit can match it.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExternalCoupling {
    pub is_transient: bool,
    pub current_time: f64,
    pub final_time: f64,
    pub current_step: f64,
    pub previous_step: f64,
    /// Zero on the first step of a run.
    pub step_number: usize,
    pub order: usize,
    pub bp_tol: f64,
    pub dcop_flag: bool,
    pub acop_flag: bool,
    pub tranop_flag: bool,
    pub dcsweep_flag: bool,
    pub double_dcop_step: usize,
    pub sweep_source_reset_flag: bool,
    /// Restart the integration history before this step.
    pub begin_integration: bool,
}

impl Default for ExternalCoupling {
    fn default() -> Self {
        Self {
            is_transient: true,
            current_time: 0.0,
            final_time: 0.0,
            current_step: 0.0,
            previous_step: 0.0,
            step_number: 0,
            order: 1,
            bp_tol: 0.0,
            dcop_flag: false,
            acop_flag: false,
            tranop_flag: false,
            dcsweep_flag: false,
            double_dcop_step: 0,
            sweep_source_reset_flag: false,
            begin_integration: false,
        }
    }
}

impl ExternalCoupling {
    /// Descriptor for a transient step of size `step` starting at `time`.
    pub fn transient_step(time: f64, step: f64, step_number: usize, order: usize) -> Self {
        Self {
            current_time: time,
            final_time: time + step,
            current_step: step,
            step_number,
            order,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        if !self.current_time.is_finite() || !self.final_time.is_finite() {
            return Err(SimError::InvalidArg {
                what: "external times must be finite",
            });
        }
        if self.is_transient && !(self.current_step.is_finite() && self.current_step > 0.0) {
            return Err(SimError::InvalidArg {
                what: "external step must be positive",
            });
        }
        if self.bp_tol < 0.0 {
            return Err(SimError::InvalidArg {
                what: "external bp_tol must be non-negative",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_step_validates() {
        let d = ExternalCoupling::transient_step(1.0, 0.1, 3, 2);
        assert!(d.validate().is_ok());
        assert!((d.final_time - 1.1).abs() < 1e-15);
    }

    #[test]
    fn non_positive_step_is_rejected() {
        let d = ExternalCoupling::transient_step(0.0, 0.0, 0, 1);
        assert!(matches!(d.validate(), Err(SimError::InvalidArg { .. })));
    }
}
