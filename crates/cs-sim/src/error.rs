//! Error types for time stepping and analysis runs.
//!
//! Everything here is fatal for the run. Recoverable outcomes (a rejected
//! step, a diverged Newton solve) are ordinary return values.

use thiserror::Error;

/// Errors that end a simulation run.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Invalid argument: {what}")]
    InvalidArg { what: &'static str },

    #[error("Unknown analysis '{name}'")]
    UnknownAnalysis { name: String },

    #[error("{rejections} consecutive step rejections at t = {time:e} (last attempted step {last_step:e})")]
    MaxConsecutiveRejections {
        time: f64,
        last_step: f64,
        rejections: usize,
    },

    #[error("Time step too small at t = {time:e}: {step:e} < {min_step:e}")]
    StepTooSmall { time: f64, step: f64, min_step: f64 },

    #[error("Continuation exhausted at t = {time:e} (reached parameter {reached_param})")]
    ContinuationExhausted { time: f64, reached_param: f64 },

    #[error("Nonlinear solve failed at t = {time:e} with a fixed step {step:e}")]
    FixedStepNonlinearFailure { time: f64, step: f64 },

    #[error("DC operating point failed at t = {time:e}")]
    OperatingPointFailed { time: f64 },

    #[error("DC sweep failed at {} point(s): {failed:?}", failed.len())]
    SweepFailures { failed: Vec<f64> },

    #[error("Backend error: {message}")]
    Backend { message: String },
}

pub type SimResult<T> = Result<T, SimError>;

impl From<cs_solver::SolverError> for SimError {
    fn from(e: cs_solver::SolverError) -> Self {
        SimError::Backend {
            message: e.to_string(),
        }
    }
}

impl From<cs_core::CoreError> for SimError {
    fn from(e: cs_core::CoreError) -> Self {
        SimError::Backend {
            message: e.to_string(),
        }
    }
}
