//! Time stepping for the circstep engine.
//!
//! A variable-order BDF [`StepController`] with local error control and
//! breakpoint handling, externally driven steps, and the [`AnalysisDriver`]
//! that runs transient, DC sweep and coupled analyses on top of it.

pub mod breakpoints;
pub mod controller;
pub mod driver;
pub mod error;
pub mod error_history;
pub mod external;
pub mod integrator;
pub mod policy;
pub mod snapshot;
pub mod step_state;

pub use breakpoints::{BreakpointSet, BreakpointSource};
pub use controller::{
    AcceptedStep, CouplingSetup, RejectedStep, RejectionCause, RejectionCounting, StepControlOptions,
    StepController, StepOutcome, StepStatistics,
};
pub use driver::{AnalysisDriver, RunBudget, RunStatus, RunSummary, SimRecord};
pub use error::{SimError, SimResult};
pub use error_history::{AcceptedError, ErrorHistory, ErrorSums, OrderEstimates};
pub use external::ExternalCoupling;
pub use integrator::{BdfCoefficients, DifferenceHistory, IntegrationMethod, MAX_BDF_ORDER};
pub use policy::{
    AnalysisParams, AnalysisRegistry, CoupledOptions, DcSweepOptions, PolicyFactory, SteppingPolicy,
    TransientOptions,
};
pub use snapshot::RestartSnapshot;
pub use step_state::{SolutionState, StepPhase, StepState};
