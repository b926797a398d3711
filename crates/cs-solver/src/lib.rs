//! Nonlinear solution layer for the circstep engine.
//!
//! This crate solves `F(x) = 0` for the residuals assembled by a [`Loader`]:
//! a damped Newton iteration, homotopy continuation for hard starts, a
//! two-level coupling protocol for partitioned problems, and the DC
//! operating point built from all three.

pub mod continuation;
pub mod dc;
pub mod error;
pub mod jacobian;
pub mod linear;
pub mod loader;
pub mod mode;
pub mod newton;
pub mod system;
pub mod two_level;

pub use continuation::{ContinuationConfig, ContinuationEngine, ContinuationOutcome, Homotopy};
pub use dc::{OperatingPoint, OperatingPointConfig, OperatingPointOutcome, OperatingPointSolver};
pub use error::{SolverError, SolverResult};
pub use linear::{DenseLu, LinearSolveError, LinearSolver};
pub use loader::{LoadPoint, LoadedSystem, Loader};
pub use mode::SolveMode;
pub use newton::{DivergenceReason, NewtonConfig, NewtonResult, NewtonSolver, NewtonStatus};
pub use system::{
    ConvergenceContext, CouplingMode, FnSystem, Linearization, NonlinearSystem, StaticSystem,
};
pub use two_level::{
    CouplingResult, CouplingStatus, CouplingStrategy, Partition, TwoLevelConfig, TwoLevelCoupler,
};
