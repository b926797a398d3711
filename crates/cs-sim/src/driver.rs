//! Analysis runs from start to finish.

use crate::controller::{AcceptedStep, RejectedStep, StepController, StepOutcome};
use crate::error::{SimError, SimResult};
use crate::policy::{CoupledOptions, DcSweepOptions, SteppingPolicy, TransientOptions};
use crate::step_state::SolutionState;
use cs_core::{Communicator, SerialComm};
use cs_solver::{DenseLu, LinearSolver, Loader, OperatingPointOutcome, OperatingPointSolver};
use nalgebra::DVector;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Coarse cancellation, checked between steps.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunBudget {
    /// Accepted steps (or sweep points).
    pub max_steps: Option<usize>,
    pub max_wall: Option<Duration>,
}

impl RunBudget {
    fn exhausted(&self, steps: usize, started: Instant) -> bool {
        self.max_steps.is_some_and(|m| steps >= m) || self.max_wall.is_some_and(|w| started.elapsed() >= w)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RunStatus {
    Completed,
    /// The run budget ran out first.
    StoppedEarly,
    /// A coupled run stopped at the first step the outer simulator sized
    /// too large. Later descriptors were not attempted.
    ExternalStepRejected(RejectedStep),
}

/// Recorded solution points.
#[derive(Clone, Debug, Default)]
pub struct SimRecord {
    /// Time points (the swept value for DC sweeps)
    pub t: Vec<f64>,
    /// Solution snapshots
    pub x: Vec<DVector<f64>>,
}

impl SimRecord {
    pub fn push(&mut self, t: f64, x: DVector<f64>) {
        self.t.push(t);
        self.x.push(x);
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    fn last_time(&self) -> Option<f64> {
        self.t.last().copied()
    }
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub analysis: &'static str,
    pub status: RunStatus,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub final_time: f64,
    pub newton_iterations: usize,
    pub breakpoints_hit: usize,
    pub max_error_ratio: Option<f64>,
    pub record: SimRecord,
}

/// Runs one analysis over a loader.
pub struct AnalysisDriver<L, S = DenseLu> {
    loader: L,
    linear: S,
    comm: Arc<dyn Communicator>,
    policy: SteppingPolicy,
    budget: RunBudget,
    record_every: usize,
}

impl<L: Loader, S: LinearSolver> AnalysisDriver<L, S> {
    pub fn new(loader: L, linear: S, policy: SteppingPolicy) -> Self {
        Self {
            loader,
            linear,
            comm: Arc::new(SerialComm),
            policy,
            budget: RunBudget::default(),
            record_every: 1,
        }
    }

    pub fn with_comm(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }

    pub fn with_budget(mut self, budget: RunBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Record every N-th accepted step (the last one is always kept).
    pub fn with_record_every(mut self, every: usize) -> Self {
        self.record_every = every.max(1);
        self
    }

    pub fn policy(&self) -> &SteppingPolicy {
        &self.policy
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    pub fn into_loader(self) -> L {
        self.loader
    }

    pub fn run_to_completion(&mut self, final_time: f64) -> SimResult<RunSummary> {
        self.run_with_observer(final_time, |_, _| {})
    }

    /// Run the policy; `observer` sees every accepted step.
    ///
    /// For DC sweeps `final_time` is ignored and the observer receives the
    /// swept value as the step time.
    pub fn run_with_observer<F>(&mut self, final_time: f64, mut observer: F) -> SimResult<RunSummary>
    where
        F: FnMut(&AcceptedStep, &SolutionState),
    {
        let policy = self.policy.clone();
        let summary = match &policy {
            SteppingPolicy::Transient(opts) => self.run_transient(opts, final_time, &mut observer),
            SteppingPolicy::DcSweep(opts) => self.run_dc_sweep(opts, &mut observer),
            SteppingPolicy::Coupled(opts) => self.run_coupled(opts, final_time, &mut observer),
        }?;
        info!(
            analysis = summary.analysis,
            status = ?summary.status,
            accepted = summary.accepted_steps,
            rejected = summary.rejected_steps,
            final_time = summary.final_time,
            "analysis finished"
        );
        Ok(summary)
    }

    fn initial_vector(&self, given: &Option<DVector<f64>>) -> SimResult<DVector<f64>> {
        let n = self.loader.size();
        match given {
            Some(x) if x.len() != n => Err(SimError::InvalidArg {
                what: "initial state has the wrong size",
            }),
            Some(x) => Ok(x.clone()),
            None => Ok(DVector::zeros(n)),
        }
    }

    fn run_transient(
        &mut self,
        opts: &TransientOptions,
        final_time: f64,
        observer: &mut dyn FnMut(&AcceptedStep, &SolutionState),
    ) -> SimResult<RunSummary> {
        let started = Instant::now();
        let x_init = self.initial_vector(&opts.initial_state)?;
        let budget = self.budget;
        let every = self.record_every;
        let mut controller =
            StepController::with_comm(&mut self.loader, &mut self.linear, opts.step.clone(), self.comm.clone())?;

        let x0 = if opts.use_initial_conditions {
            x_init
        } else {
            match controller.operating_point(&opts.operating_point, &x_init, opts.start_time)? {
                OperatingPointOutcome::Converged(op) => {
                    info!(method = ?op.method, iterations = op.newton_iterations, "transient operating point");
                    op.x
                }
                OperatingPointOutcome::Exhausted { .. } => {
                    return Err(SimError::OperatingPointFailed { time: opts.start_time });
                }
            }
        };

        let mut record = SimRecord::default();
        record.push(opts.start_time, x0.clone());
        controller.add_breakpoints(opts.breakpoints.iter().copied());
        controller.initialize(opts.start_time, x0, final_time)?;

        let mut status = RunStatus::Completed;
        let mut accepted = 0;
        while !controller.is_finished() {
            if budget.exhausted(accepted, started) {
                status = RunStatus::StoppedEarly;
                warn!(time = controller.solution().time, accepted, "transient stopped by run budget");
                break;
            }
            if let StepOutcome::Accepted(step) = controller.step()? {
                accepted += 1;
                observer(&step, controller.solution());
                if accepted % every == 0 {
                    record.push(step.time, controller.solution().x.clone());
                }
            }
        }
        let solution = controller.solution();
        if record.last_time() != Some(solution.time) {
            record.push(solution.time, solution.x.clone());
        }

        let stats = controller.statistics();
        Ok(RunSummary {
            analysis: "tran",
            status,
            accepted_steps: stats.accepted,
            rejected_steps: stats.rejected,
            final_time: solution.time,
            newton_iterations: stats.newton_iterations,
            breakpoints_hit: stats.breakpoints_hit,
            max_error_ratio: controller.error_history().max_error_ratio(),
            record,
        })
    }

    fn run_dc_sweep(
        &mut self,
        opts: &DcSweepOptions,
        observer: &mut dyn FnMut(&AcceptedStep, &SolutionState),
    ) -> SimResult<RunSummary> {
        if opts.values.is_empty() {
            return Err(SimError::InvalidArg {
                what: "dc sweep needs at least one value",
            });
        }
        let started = Instant::now();
        let guess = self.initial_vector(&opts.initial_guess)?;
        let solver = OperatingPointSolver::with_comm(opts.operating_point.clone(), self.comm.clone());
        let mut record = SimRecord::default();
        let mut failed = Vec::new();
        let mut status = RunStatus::Completed;
        let mut newton_iterations = 0;
        let mut previous: Option<DVector<f64>> = None;
        let mut last_value = opts.values[0];

        for (i, &value) in opts.values.iter().enumerate() {
            if self.budget.exhausted(i, started) {
                status = RunStatus::StoppedEarly;
                warn!(value, "dc sweep stopped by run budget");
                break;
            }
            self.loader.set_param(&opts.parameter, value)?;
            let start = match &previous {
                Some(x) if !opts.sweep_source_reset => x.clone(),
                _ => guess.clone(),
            };
            last_value = value;
            match solver.solve(&self.loader, &mut self.linear, &start, opts.time)? {
                OperatingPointOutcome::Converged(op) => {
                    newton_iterations += op.newton_iterations;
                    let point = AcceptedStep {
                        time: value,
                        step: 0.0,
                        order: 0,
                        next_step: 0.0,
                        next_order: 0,
                        error_ratio: 0.0,
                        newton_iterations: op.newton_iterations,
                        breakpoint_hit: false,
                    };
                    let n = op.x.len();
                    let solution = SolutionState::at_rest(value, op.x, DVector::zeros(n));
                    observer(&point, &solution);
                    record.push(value, solution.x.clone());
                    previous = Some(solution.x);
                }
                OperatingPointOutcome::Exhausted { attempts, reached_param } => {
                    warn!(parameter = %opts.parameter, value, attempts, reached_param, "dc sweep point failed");
                    failed.push(value);
                }
            }
        }

        if !failed.is_empty() {
            return Err(SimError::SweepFailures { failed });
        }
        Ok(RunSummary {
            analysis: "dc",
            status,
            accepted_steps: record.len(),
            rejected_steps: 0,
            final_time: last_value,
            newton_iterations,
            breakpoints_hit: 0,
            max_error_ratio: None,
            record,
        })
    }

    fn run_coupled(
        &mut self,
        opts: &CoupledOptions,
        final_time: f64,
        observer: &mut dyn FnMut(&AcceptedStep, &SolutionState),
    ) -> SimResult<RunSummary> {
        let Some(first) = opts.descriptors.first() else {
            return Err(SimError::InvalidArg {
                what: "coupled run needs at least one step descriptor",
            });
        };
        let started = Instant::now();
        let x0 = self.initial_vector(&opts.initial_state)?;
        let budget = self.budget;
        let every = self.record_every;
        let end = opts
            .descriptors
            .iter()
            .map(|d| d.current_time + d.current_step)
            .fold(final_time, f64::max);
        let mut controller =
            StepController::with_comm(&mut self.loader, &mut self.linear, opts.step.clone(), self.comm.clone())?;
        let mut record = SimRecord::default();
        record.push(first.current_time, x0.clone());
        controller.initialize(first.current_time, x0, end)?;

        let mut status = RunStatus::Completed;
        let mut accepted = 0;
        for desc in &opts.descriptors {
            if budget.exhausted(accepted, started) {
                status = RunStatus::StoppedEarly;
                break;
            }
            match controller.step_external(desc)? {
                StepOutcome::Accepted(step) => {
                    accepted += 1;
                    observer(&step, controller.solution());
                    if accepted % every == 0 {
                        record.push(step.time, controller.solution().x.clone());
                    }
                }
                StepOutcome::Rejected(rejected) => {
                    warn!(
                        time = rejected.time,
                        step = rejected.attempted_step,
                        suggested = rejected.next_step,
                        cause = ?rejected.cause,
                        "externally driven step rejected, stopping"
                    );
                    status = RunStatus::ExternalStepRejected(rejected);
                    break;
                }
            }
        }
        let solution = controller.solution();
        if record.last_time() != Some(solution.time) {
            record.push(solution.time, solution.x.clone());
        }

        let stats = controller.statistics();
        Ok(RunSummary {
            analysis: "coupled",
            status,
            accepted_steps: stats.accepted,
            rejected_steps: stats.rejected,
            final_time: solution.time,
            newton_iterations: stats.newton_iterations,
            breakpoints_hit: 0,
            max_error_ratio: controller.error_history().max_error_ratio(),
            record,
        })
    }
}
