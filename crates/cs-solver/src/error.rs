//! Error types for solver operations.
//!
//! Failing to converge is not an error here: it is reported through
//! [`crate::NewtonStatus`] and friends so callers can recover. These
//! variants cover contract violations and faults raised by collaborators.

use cs_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Problem setup error: {what}")]
    ProblemSetup { what: String },

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Loader error: {what}")]
    Loader { what: String },

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

pub type SolverResult<T> = Result<T, SolverError>;
