//! Adaptive time stepping: predict, correct, estimate, accept or reject.

use crate::breakpoints::{BreakpointSet, BreakpointSource};
use crate::error::{SimError, SimResult};
use crate::error_history::{AcceptedError, ErrorHistory, ErrorSums, OrderEstimates};
use crate::external::ExternalCoupling;
use crate::integrator::{
    H_PHASE0_INCR, H0_SAFETY, IntegrationMethod, R_FACTOR, R_FUDGE, R_HINCR, R_HINCR_TEST, R_MAX, R_MIN,
    R_SAFETY, TKP1_TK_SAFETY,
};
use crate::snapshot::RestartSnapshot;
use crate::step_state::{SolutionState, StepPhase, StepState};
use cs_core::{Communicator, SerialComm, Tolerances, ensure_all_finite, weighted_rms_norm, wrms_partial_sum};
use cs_solver::{
    ContinuationConfig, ContinuationEngine, ContinuationOutcome, ConvergenceContext, DenseLu, Linearization,
    LinearSolver, LoadPoint, Loader, NewtonConfig, NewtonSolver, NonlinearSystem, OperatingPointConfig,
    OperatingPointOutcome, OperatingPointSolver, Partition, SolveMode, SolverResult, TwoLevelConfig,
    TwoLevelCoupler,
};
use nalgebra::DVector;
use std::f64::consts::SQRT_2;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How consecutive rejections are counted against the limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RejectionCounting {
    /// Error-control and nonlinear failures share one counter.
    #[default]
    Shared,
    /// Each kind has its own counter; either one reaching the limit is fatal.
    Separate,
}

/// Partitioned correction through the two-level coupler.
#[derive(Clone, Debug)]
pub struct CouplingSetup {
    pub partition: Partition,
    pub config: TwoLevelConfig,
}

/// Options for the step controller.
#[derive(Clone, Debug)]
pub struct StepControlOptions {
    pub method: IntegrationMethod,
    pub min_order: usize,
    /// Local error weights `rel·|x| + abs`.
    pub tolerances: Tolerances,
    /// Steps with an error ratio above this are rejected.
    pub error_acceptance: f64,
    /// Upper bound on the first step (and the fixed step in constant mode).
    pub initial_step: Option<f64>,
    pub min_step: f64,
    pub max_step: f64,
    pub max_consecutive_rejections: usize,
    pub rejection_counting: RejectionCounting,
    /// Error-test the first step after a (re)start as well.
    pub test_first_step: bool,
    /// Take at least this many steps between consecutive stop times.
    pub min_steps_per_breakpoint_interval: Option<usize>,
    /// Keep the step fixed at `initial_step`.
    pub constant_step: bool,
    pub history_depth: usize,
    /// Breakpoint merge/landing tolerance; `2·min_step` when unset.
    pub breakpoint_tolerance: Option<f64>,
    /// First step as a fraction of the distance to the next stop time.
    pub restart_step_scale: f64,
    pub newton: NewtonConfig,
    /// Homotopy tried when the corrector fails.
    pub continuation: Option<ContinuationConfig>,
    pub coupling: Option<CouplingSetup>,
}

impl Default for StepControlOptions {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::default(),
            min_order: 1,
            tolerances: Tolerances::default(),
            error_acceptance: 1.0,
            initial_step: None,
            min_step: 1e-14,
            max_step: f64::INFINITY,
            max_consecutive_rejections: 15,
            rejection_counting: RejectionCounting::Shared,
            test_first_step: false,
            min_steps_per_breakpoint_interval: Some(10),
            constant_step: false,
            history_depth: 25,
            breakpoint_tolerance: None,
            restart_step_scale: 0.005,
            newton: SolveMode::Transient.to_newton_config(),
            continuation: None,
            coupling: None,
        }
    }
}

impl StepControlOptions {
    /// Fixed step of size `h`.
    pub fn fixed_step(h: f64) -> Self {
        Self {
            initial_step: Some(h),
            constant_step: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        if !self.method.integrates() {
            return Err(SimError::InvalidArg {
                what: "step controller needs an integrating method",
            });
        }
        if self.min_order == 0 || self.min_order > self.method.max_order() {
            return Err(SimError::InvalidArg {
                what: "min_order must lie in 1..=max_order",
            });
        }
        if !(self.tolerances.abs > 0.0 && self.tolerances.rel >= 0.0) {
            return Err(SimError::InvalidArg {
                what: "tolerances must be positive",
            });
        }
        if !(self.error_acceptance > 0.0) {
            return Err(SimError::InvalidArg {
                what: "error_acceptance must be positive",
            });
        }
        if !(self.min_step > 0.0 && self.max_step >= self.min_step) {
            return Err(SimError::InvalidArg {
                what: "need 0 < min_step <= max_step",
            });
        }
        if self.initial_step.is_some_and(|h| !(h > 0.0 && h.is_finite())) {
            return Err(SimError::InvalidArg {
                what: "initial_step must be positive and finite",
            });
        }
        if self.constant_step && self.initial_step.is_none() {
            return Err(SimError::InvalidArg {
                what: "constant_step needs initial_step",
            });
        }
        if self.max_consecutive_rejections == 0 {
            return Err(SimError::InvalidArg {
                what: "max_consecutive_rejections must be at least 1",
            });
        }
        if self.min_steps_per_breakpoint_interval == Some(0) {
            return Err(SimError::InvalidArg {
                what: "min_steps_per_breakpoint_interval must be at least 1",
            });
        }
        if !(self.restart_step_scale > 0.0) {
            return Err(SimError::InvalidArg {
                what: "restart_step_scale must be positive",
            });
        }
        self.newton.validate()?;
        if let Some(c) = &self.continuation {
            c.validate()?;
        }
        Ok(())
    }
}

/// Why a step attempt failed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RejectionCause {
    NonlinearDivergence,
    ErrorControl { ratio: f64 },
    ContinuationExhausted { reached_param: f64 },
}

impl RejectionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCause::NonlinearDivergence => "nonlinear_divergence",
            RejectionCause::ErrorControl { .. } => "error_control",
            RejectionCause::ContinuationExhausted { .. } => "continuation_exhausted",
        }
    }

    pub fn is_nonlinear(&self) -> bool {
        !matches!(self, RejectionCause::ErrorControl { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AcceptedStep {
    pub time: f64,
    pub step: f64,
    pub order: usize,
    pub next_step: f64,
    pub next_order: usize,
    pub error_ratio: f64,
    pub newton_iterations: usize,
    pub breakpoint_hit: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RejectedStep {
    /// Time the step started from (unchanged by the rejection).
    pub time: f64,
    pub attempted_step: f64,
    pub cause: RejectionCause,
    pub next_step: f64,
    pub next_order: usize,
    pub newton_iterations: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    Accepted(AcceptedStep),
    Rejected(RejectedStep),
}

impl StepOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StepOutcome::Accepted(_))
    }
}

/// Counters over the controller's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepStatistics {
    pub accepted: usize,
    pub rejected: usize,
    pub error_rejections: usize,
    pub nonlinear_rejections: usize,
    pub newton_iterations: usize,
    pub breakpoints_hit: usize,
    pub continuation_recoveries: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct RejectionCounters {
    error: usize,
    nonlinear: usize,
}

impl RejectionCounters {
    fn record(&mut self, cause: &RejectionCause) {
        if cause.is_nonlinear() {
            self.nonlinear += 1;
        } else {
            self.error += 1;
        }
    }

    fn count(&self, counting: RejectionCounting) -> usize {
        match counting {
            RejectionCounting::Shared => self.error + self.nonlinear,
            RejectionCounting::Separate => self.error.max(self.nonlinear),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OrderAction {
    Lower,
    Maintain,
    Raise,
}

/// Corrector equations of one step at `t + h`:
/// `cj·(q(x) - q_pred) + qdot_pred + f(x) = 0`.
struct StepSystem<'a, L: ?Sized> {
    loader: &'a L,
    time: f64,
    cj: f64,
    q_pred: &'a DVector<f64>,
    qdot_pred: &'a DVector<f64>,
}

impl<L: Loader + ?Sized> NonlinearSystem for StepSystem<'_, L> {
    fn size(&self) -> usize {
        self.loader.size()
    }

    fn evaluate(&self, x: &DVector<f64>, ctx: &ConvergenceContext) -> SolverResult<Linearization> {
        let point = LoadPoint {
            time: self.time,
            derivative_weight: self.cj,
            source_scale: ctx.continuation_param,
        };
        let loaded = self.loader.evaluate(x, &point)?;
        loaded.check_size(self.size())?;
        let mut residual = loaded.q - self.q_pred;
        residual *= self.cj;
        residual += self.qdot_pred;
        residual += loaded.f;
        Ok(Linearization {
            residual,
            jacobian: loaded.jacobian,
        })
    }
}

struct Correction {
    x: DVector<f64>,
    iterations: usize,
    failure: Option<RejectionCause>,
}

/// A corrected step waiting for the accept/reject decision.
struct Trial {
    time: f64,
    step: f64,
    lands_on_stop: bool,
    x: DVector<f64>,
    q: DVector<f64>,
    delta: DVector<f64>,
    q_delta: DVector<f64>,
    xdot_pred: DVector<f64>,
    sums: ErrorSums,
    iterations: usize,
}

/// Variable-order BDF step controller.
///
/// Owns the solution and integrator state. The loader sees the trial
/// solution only through `evaluate` and learns about accepted points through
/// `commit`.
pub struct StepController<L, S = DenseLu> {
    loader: L,
    linear: S,
    options: StepControlOptions,
    newton: NewtonSolver,
    comm: Arc<dyn Communicator>,
    state: StepState,
    solution: SolutionState,
    errors: ErrorHistory,
    breakpoints: BreakpointSet,
    breakpoint_sources: Vec<Box<dyn BreakpointSource>>,
    phase: StepPhase,
    rejections: RejectionCounters,
    stats: StepStatistics,
    final_time: f64,
    last_breakpoint: f64,
    initialized: bool,
}

impl<L: Loader, S: LinearSolver> StepController<L, S> {
    pub fn new(loader: L, linear: S, options: StepControlOptions) -> SimResult<Self> {
        Self::with_comm(loader, linear, options, Arc::new(SerialComm))
    }

    pub fn with_comm(
        loader: L,
        linear: S,
        options: StepControlOptions,
        comm: Arc<dyn Communicator>,
    ) -> SimResult<Self> {
        options.validate()?;
        let n = loader.size();
        if let Some(setup) = &options.coupling {
            if setup.partition.size() != n {
                return Err(SimError::InvalidArg {
                    what: "coupling partition does not match the problem size",
                });
            }
        }
        let bp_tol = options.breakpoint_tolerance.unwrap_or(2.0 * options.min_step);
        Ok(Self {
            newton: NewtonSolver::with_comm(options.newton.clone(), comm.clone()),
            state: StepState::new(options.method, options.min_order, n),
            solution: SolutionState::at_rest(0.0, DVector::zeros(n), DVector::zeros(n)),
            errors: ErrorHistory::new(options.history_depth),
            breakpoints: BreakpointSet::new(bp_tol),
            breakpoint_sources: Vec::new(),
            phase: StepPhase::Predicting,
            rejections: RejectionCounters::default(),
            stats: StepStatistics::default(),
            final_time: 0.0,
            last_breakpoint: 0.0,
            initialized: false,
            loader,
            linear,
            options,
            comm,
        })
    }

    /// Start integrating from `x0` at `time` towards `final_time`.
    pub fn initialize(&mut self, time: f64, x0: DVector<f64>, final_time: f64) -> SimResult<()> {
        if x0.len() != self.loader.size() {
            return Err(SimError::InvalidArg {
                what: "initial state has the wrong size",
            });
        }
        ensure_all_finite(&x0, "initial state")?;
        if !(final_time > time) {
            return Err(SimError::InvalidArg {
                what: "final time must lie after the start time",
            });
        }
        self.final_time = final_time;
        self.last_breakpoint = time;
        self.refill_breakpoints(time);
        let n = x0.len();
        self.reinitialize(time, x0, DVector::zeros(n), None)?;
        self.errors.reset();
        self.rejections = RejectionCounters::default();
        self.state.hold_order = false;
        self.phase = StepPhase::Predicting;
        self.initialized = true;
        info!(time, final_time, h0 = self.state.step, "transient integration initialized");
        Ok(())
    }

    /// Add discontinuity times the integrator must land on.
    pub fn add_breakpoints(&mut self, times: impl IntoIterator<Item = f64>) {
        let now = self.state.time;
        let started = self.initialized;
        self.breakpoints.extend(times.into_iter().filter(|&t| !started || t > now));
    }

    /// Add a source asked for its next breakpoint each time the integrator
    /// starts or lands on a breakpoint.
    pub fn add_breakpoint_source(&mut self, source: impl BreakpointSource + 'static) {
        if self.initialized {
            let after = self.state.time + self.breakpoints.tolerance();
            if let Some(t) = source.next_breakpoint(after) {
                self.breakpoints.insert(t);
            }
        }
        self.breakpoint_sources.push(Box::new(source));
    }

    pub fn is_finished(&self) -> bool {
        self.initialized && self.state.time >= self.final_time - self.breakpoints.tolerance()
    }

    /// Attempt one step. A rejection leaves the accepted state untouched and
    /// is returned for the caller to retry.
    pub fn step(&mut self) -> SimResult<StepOutcome> {
        self.ensure_ready()?;
        let t = self.state.time;
        let stop = self.stop_time(t);
        let mut h = self.state.step;
        if !self.options.constant_step {
            h = h.min(self.options.max_step);
            if let Some(device_max) = self.loader.max_time_step(t) {
                if device_max > 0.0 {
                    h = h.min(device_max);
                }
            }
            if let Some(n) = self.options.min_steps_per_breakpoint_interval {
                h = h.min((stop - self.last_breakpoint) / n as f64);
            }
        }
        let lands_on_stop = t + h >= stop - self.breakpoints.tolerance();
        if lands_on_stop {
            h = stop - t;
        }
        self.attempt(h, lands_on_stop.then_some(stop), false)
    }

    /// Step until one is accepted.
    pub fn advance(&mut self) -> SimResult<AcceptedStep> {
        loop {
            if let StepOutcome::Accepted(step) = self.step()? {
                return Ok(step);
            }
        }
    }

    /// Run one step sized by an outer simulator.
    ///
    /// The descriptor's step is taken as given and its order is limited to
    /// what the stored differences support. A rejection is returned rather
    /// than retried, and never counts towards the fatal limits.
    pub fn step_external(&mut self, desc: &ExternalCoupling) -> SimResult<StepOutcome> {
        desc.validate()?;
        if !desc.is_transient {
            return Err(SimError::InvalidArg {
                what: "external step needs a transient descriptor",
            });
        }
        self.ensure_started()?;
        let tol = desc.bp_tol.max(self.breakpoints.tolerance());
        if (desc.current_time - self.state.time).abs() > tol {
            return Err(SimError::InvalidArg {
                what: "external time does not match the last accepted time",
            });
        }
        self.final_time = desc.final_time.max(desc.current_time + desc.current_step);
        if desc.begin_integration || (desc.step_number == 0 && self.state.steps_since_start > 0) {
            let x = self.solution.x.clone();
            let xdot = self.solution.xdot.clone();
            self.reinitialize(self.state.time, x, xdot, None)?;
            self.errors.reset();
        }
        let before = self.state.order;
        let order = self.state.set_order(desc.order.max(1).min(self.state.supported_order()));
        if order.abs_diff(before) > 1 {
            self.errors.reset();
        }
        debug!(time = desc.current_time, step = desc.current_step, order, "external step");
        self.attempt(desc.current_step, None, true)
    }

    /// Solution at `time` within the last accepted step.
    pub fn interpolate(&self, time: f64) -> SimResult<DVector<f64>> {
        self.ensure_started()?;
        let tn = self.solution.time;
        let tol = self.breakpoints.tolerance();
        if (time - tn).abs() <= tol {
            return Ok(self.solution.x.clone());
        }
        let h = self.state.used_step;
        if self.state.steps_since_start == 0 || time > tn + tol || time < tn - h - tol {
            return Err(SimError::InvalidArg {
                what: "interpolation time outside the last accepted step",
            });
        }
        let hist = &self.state.x_history;
        let psi = &self.state.coeffs.psi;
        let delt = time - tn;
        let mut y = self.solution.x.clone();
        let mut c = 1.0;
        let mut gam = delt / psi[0];
        for j in 1..=self.state.used_order {
            let Some(phi) = hist.term(j) else { break };
            c *= gam;
            gam = (delt + psi[j - 1]) / psi[j];
            y.axpy(c, phi, 1.0);
        }
        Ok(y)
    }

    /// Solve for a DC operating point of the owned loader.
    pub fn operating_point(
        &mut self,
        config: &OperatingPointConfig,
        x0: &DVector<f64>,
        time: f64,
    ) -> SimResult<OperatingPointOutcome> {
        let solver = OperatingPointSolver::with_comm(config.clone(), self.comm.clone());
        Ok(solver.solve(&self.loader, &mut self.linear, x0, time)?)
    }

    pub fn snapshot(&self) -> RestartSnapshot {
        RestartSnapshot::capture(
            &self.state,
            &self.solution,
            self.final_time,
            self.last_breakpoint,
            self.breakpoints.iter().collect(),
        )
    }

    /// Resume from a snapshot taken on a problem of the same size and method.
    pub fn restore(&mut self, snapshot: &RestartSnapshot) -> SimResult<()> {
        if snapshot.size() != self.loader.size() || !snapshot.is_consistent() {
            return Err(SimError::InvalidArg {
                what: "snapshot does not fit this problem",
            });
        }
        if snapshot.method != self.state.method {
            return Err(SimError::InvalidArg {
                what: "snapshot was taken with another integration method",
            });
        }
        if snapshot.order < self.state.min_order {
            return Err(SimError::InvalidArg {
                what: "snapshot order is below the configured minimum order",
            });
        }
        self.solution = snapshot.apply(&mut self.state);
        self.final_time = snapshot.final_time;
        self.last_breakpoint = snapshot.last_breakpoint;
        self.breakpoints = BreakpointSet::new(self.breakpoints.tolerance());
        self.breakpoints.extend(snapshot.next_breakpoints.iter().copied());
        self.errors.reset();
        self.rejections = RejectionCounters::default();
        self.phase = StepPhase::Accepted;
        self.initialized = true;
        Ok(())
    }

    pub fn state(&self) -> &StepState {
        &self.state
    }

    pub fn solution(&self) -> &SolutionState {
        &self.solution
    }

    pub fn error_history(&self) -> &ErrorHistory {
        &self.errors
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn statistics(&self) -> StepStatistics {
        self.stats
    }

    pub fn options(&self) -> &StepControlOptions {
        &self.options
    }

    pub fn final_time(&self) -> f64 {
        self.final_time
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    pub fn into_parts(self) -> (L, S) {
        (self.loader, self.linear)
    }

    fn ensure_started(&self) -> SimResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(SimError::InvalidArg {
                what: "step controller is not initialized",
            })
        }
    }

    fn ensure_ready(&self) -> SimResult<()> {
        self.ensure_started()?;
        if self.is_finished() {
            return Err(SimError::InvalidArg {
                what: "integration already reached the final time",
            });
        }
        Ok(())
    }

    /// Drop breakpoints through `time` and queue what the loader and the
    /// breakpoint sources name after it.
    fn refill_breakpoints(&mut self, time: f64) {
        self.breakpoints.prune_through(time);
        let upcoming = self.loader.breakpoints(time, self.final_time);
        self.breakpoints.extend(upcoming);
        let after = time + self.breakpoints.tolerance();
        for source in &self.breakpoint_sources {
            if let Some(t) = source.next_breakpoint(after) {
                self.breakpoints.insert(t);
            }
        }
    }

    /// Next time the integrator must land on exactly.
    fn stop_time(&self, t: f64) -> f64 {
        self.breakpoints
            .next_after(t)
            .map_or(self.final_time, |bp| bp.min(self.final_time))
    }

    /// Restart at order 1 from `x`, choosing a fresh first step.
    fn reinitialize(
        &mut self,
        time: f64,
        x: DVector<f64>,
        xdot: DVector<f64>,
        last_step: Option<f64>,
    ) -> SimResult<()> {
        let n = self.loader.size();
        let loaded = self.loader.evaluate(&x, &LoadPoint::transient(time, 0.0))?;
        loaded.check_size(n)?;
        let weights = self.options.tolerances.weights(&x);
        let dnorm = weighted_rms_norm(self.comm.as_ref(), &loaded.f, &weights);
        let h = self.first_step(time, dnorm, last_step);
        let h_qdot = loaded.f.scale(-h);
        self.state.restart(time, h, x.clone(), loaded.q.clone(), h_qdot);
        self.solution = SolutionState {
            time,
            x,
            xdot,
            q: loaded.q,
        };
        debug!(time, h, dnorm, "integration restarted");
        Ok(())
    }

    fn first_step(&self, time: f64, dnorm: f64, last_step: Option<f64>) -> f64 {
        let opts = &self.options;
        if opts.constant_step {
            if let Some(h) = opts.initial_step {
                return h;
            }
        }
        let span = (self.stop_time(time) - time).abs();
        let mut h = opts.restart_step_scale * span;
        if dnorm > 0.0 {
            h = h.min(SQRT_2 / (H0_SAFETY * dnorm));
        }
        if let Some(user) = opts.initial_step {
            h = h.min(user);
        }
        if let Some(last) = last_step {
            h = h.min(last);
        }
        // Every process must start from the same step.
        self.comm.min_all(h.min(opts.max_step).max(opts.min_step))
    }

    fn attempt(&mut self, h: f64, stop: Option<f64>, external: bool) -> SimResult<StepOutcome> {
        if !(h > 0.0 && h.is_finite()) {
            return Err(SimError::InvalidArg {
                what: "step size must be positive and finite",
            });
        }
        if h < self.options.min_step && stop.is_none() && !external {
            return Err(SimError::StepTooSmall {
                time: self.state.time,
                step: h,
                min_step: self.options.min_step,
            });
        }
        let t = self.state.time;
        let k = self.state.order;
        self.state.step = h;
        self.phase = StepPhase::Predicting;

        let state = &mut self.state;
        state.coeffs.update(h, k, state.used_step, state.used_order);
        let from = state.coeffs.constant_steps;
        let beta = state.coeffs.beta;
        state.x_history.scale_for_prediction(from, &beta);
        state.q_history.scale_for_prediction(from, &beta);
        let x_pred = state.x_history.predict();
        let q_pred = state.q_history.predict();
        let gamma = state.coeffs.gamma;
        let xdot_pred = state.x_history.derivative(&gamma);
        let qdot_pred = state.q_history.derivative(&gamma);
        let cj = state.coeffs.cj;
        let t_new = stop.unwrap_or(t + h);
        debug!(time = t, step = h, order = k, cj, "step attempt");

        self.phase = StepPhase::Correcting;
        let correction = self.correct(t_new, cj, &x_pred, &q_pred, &qdot_pred)?;
        self.stats.newton_iterations += correction.iterations;
        if let Some(cause) = correction.failure {
            return self.reject(cause, None, external, correction.iterations);
        }

        let x = correction.x;
        let loaded = self.loader.evaluate(&x, &LoadPoint::transient(t_new, cj))?;
        loaded.check_size(x.len())?;
        let q = loaded.q;
        let delta = &x - &x_pred;
        let q_delta = &q - &q_pred;
        let x_weights = self.options.tolerances.weights(&self.solution.x);
        let q_weights = self.options.tolerances.weights(&self.solution.q);
        let sums = error_sums(&self.state, &delta, &q_delta, &x_weights, &q_weights).reduce(self.comm.as_ref());
        let has_next = k < self.state.max_order && self.state.x_history.next_difference().is_some();
        let estimates = OrderEstimates::from_sums(k, &self.state.coeffs, &sums, has_next);

        let trial = Trial {
            time: t_new,
            step: h,
            lands_on_stop: stop.is_some(),
            x,
            q,
            delta,
            q_delta,
            xdot_pred,
            sums,
            iterations: correction.iterations,
        };

        let untested = self.state.steps_since_start == 0 && !self.options.test_first_step;
        let ratio = estimates.error_ratio;
        if ratio <= self.options.error_acceptance || untested {
            return self.accept(trial, &estimates, external);
        }
        if self.options.constant_step && !external {
            warn!(time = t, step = h, ratio, "error test failed at a fixed step; accepting");
            return self.accept(trial, &estimates, external);
        }
        self.reject(RejectionCause::ErrorControl { ratio }, Some(estimates), external, trial.iterations)
    }

    fn correct(
        &mut self,
        time: f64,
        cj: f64,
        x_pred: &DVector<f64>,
        q_pred: &DVector<f64>,
        qdot_pred: &DVector<f64>,
    ) -> SimResult<Correction> {
        let system = StepSystem {
            loader: &self.loader,
            time,
            cj,
            q_pred,
            qdot_pred,
        };

        if let Some(setup) = &self.options.coupling {
            let coupler = TwoLevelCoupler::new(self.newton.clone(), setup.config.clone());
            let result = coupler.solve_composite(&system, &setup.partition, &mut self.linear, x_pred)?;
            let converged = result.converged();
            return Ok(Correction {
                iterations: result.inner_iterations + result.outer_iterations,
                x: result.x,
                failure: (!converged).then_some(RejectionCause::NonlinearDivergence),
            });
        }

        let mut ctx = ConvergenceContext::default();
        let direct = self.newton.solve(&system, &mut self.linear, x_pred, &mut ctx)?;
        if direct.converged() {
            return Ok(Correction {
                x: direct.x,
                iterations: direct.iterations,
                failure: None,
            });
        }
        debug!(time, status = ?direct.status, iterations = direct.iterations, "corrector failed");

        let Some(config) = &self.options.continuation else {
            return Ok(Correction {
                x: direct.x,
                iterations: direct.iterations,
                failure: Some(RejectionCause::NonlinearDivergence),
            });
        };
        let engine = ContinuationEngine::new(self.newton.clone(), config.clone());
        match engine.attempt(&system, &mut self.linear, x_pred)? {
            ContinuationOutcome::Converged { result, steps, .. } => {
                self.stats.continuation_recoveries += 1;
                info!(time, steps, homotopy = config.homotopy.as_str(), "corrector recovered by continuation");
                Ok(Correction {
                    x: result.x,
                    iterations: direct.iterations + result.iterations,
                    failure: None,
                })
            }
            ContinuationOutcome::Exhausted { reached_param, .. } => {
                warn!(time, reached_param, "continuation exhausted in corrector");
                Ok(Correction {
                    x: direct.x,
                    iterations: direct.iterations,
                    failure: Some(RejectionCause::ContinuationExhausted { reached_param }),
                })
            }
        }
    }

    fn accept(&mut self, trial: Trial, estimates: &OrderEstimates, external: bool) -> SimResult<StepOutcome> {
        let k = self.state.order;
        let h = trial.step;
        let max = self.state.max_order;
        self.state.steps_since_start += 1;
        self.state.failures = 0;
        self.rejections = RejectionCounters::default();

        let reduced = estimates.reduced_order();
        let order_diff = k as isize - self.state.used_order as isize;
        self.state.used_order = k;
        self.state.used_step = h;
        if reduced + 1 == k || k == max {
            self.state.initial_phase = false;
        }

        let hold = self.state.hold_order;
        let (next_order, rr) = if self.state.initial_phase {
            (if hold { k } else { k + 1 }, H_PHASE0_INCR)
        } else {
            let next = if hold {
                k
            } else {
                self.select_order(k, reduced, order_diff, estimates)
            };
            let est = estimates.estimate_for(next);
            let rr = (R_SAFETY * (est + R_FUDGE)).powf(-1.0 / (next + 1) as f64);
            let rr = if rr >= R_HINCR_TEST {
                R_HINCR
            } else if rr <= 1.0 {
                rr.clamp(R_MIN, R_MAX)
            } else {
                1.0
            };
            (next, rr)
        };

        let cj = self.state.coeffs.cj;
        self.state.x_history.absorb(&trial.delta, max);
        self.state.q_history.absorb(&trial.q_delta, max);
        if self.state.steps_since_start == 1 {
            // The x history starts without a derivative, so the first
            // correction is a first difference, not a higher one.
            self.state.x_history.clear_next();
            self.state.q_history.clear_next();
        }
        let mut xdot = trial.xdot_pred;
        xdot.axpy(cj, &trial.delta, 1.0);
        self.state.time = trial.time;
        self.state.push_step(h);
        let order = self.state.set_order(next_order);
        if order.abs_diff(k) > 1 {
            self.errors.reset();
        }
        self.state.hold_order = false;
        self.errors.record_accepted(AcceptedError {
            time: trial.time,
            step: h,
            order: k,
            error_ratio: estimates.error_ratio,
            sums: trial.sums,
        });
        self.solution = SolutionState {
            time: trial.time,
            x: trial.x,
            xdot,
            q: trial.q,
        };
        self.loader.commit(&self.solution.x, trial.time);

        self.state.step = if self.options.constant_step {
            self.options.initial_step.unwrap_or(h)
        } else {
            (rr * h).clamp(self.options.min_step, self.options.max_step)
        };
        self.stats.accepted += 1;
        self.phase = StepPhase::Accepted;

        let mut breakpoint_hit = false;
        if trial.lands_on_stop && !external && self.breakpoints.contains(trial.time) {
            breakpoint_hit = true;
            self.stats.breakpoints_hit += 1;
            self.refill_breakpoints(trial.time);
            self.last_breakpoint = trial.time;
            if !self.is_finished() {
                let x = self.solution.x.clone();
                let xdot = self.solution.xdot.clone();
                self.reinitialize(trial.time, x, xdot, Some(h))?;
                self.errors.reset();
                self.state.hold_order = true;
            }
            self.phase = StepPhase::BreakpointHit;
            info!(time = trial.time, next_step = self.state.step, "breakpoint reached, restarting at order 1");
        }

        debug!(
            time = trial.time,
            step = h,
            order = k,
            ratio = estimates.error_ratio,
            next_step = self.state.step,
            next_order = self.state.order,
            "step accepted"
        );
        Ok(StepOutcome::Accepted(AcceptedStep {
            time: trial.time,
            step: h,
            order: k,
            next_step: self.state.step,
            next_order: self.state.order,
            error_ratio: estimates.error_ratio,
            newton_iterations: trial.iterations,
            breakpoint_hit,
        }))
    }

    /// Order for the next step after an accepted step at order `k`.
    fn select_order(&self, k: usize, reduced: usize, order_diff: isize, est: &OrderEstimates) -> usize {
        let action = if reduced + 1 == k {
            OrderAction::Lower
        } else if k == self.state.max_order || k + 1 >= self.state.coeffs.constant_steps || order_diff == 1 {
            OrderAction::Maintain
        } else {
            match (est.tkp1, est.tkm1) {
                (Some(tkp1), _) if k == 1 => {
                    if tkp1 >= TKP1_TK_SAFETY * est.tk {
                        OrderAction::Maintain
                    } else {
                        OrderAction::Raise
                    }
                }
                (Some(tkp1), Some(tkm1)) => {
                    if tkm1 <= est.tk.min(tkp1) {
                        OrderAction::Lower
                    } else if tkp1 >= est.tk {
                        OrderAction::Maintain
                    } else {
                        OrderAction::Raise
                    }
                }
                _ => OrderAction::Maintain,
            }
        };
        match action {
            OrderAction::Raise if k < self.state.max_order => k + 1,
            OrderAction::Lower if k > self.state.min_order => k - 1,
            _ => k,
        }
    }

    fn reject(
        &mut self,
        cause: RejectionCause,
        estimates: Option<OrderEstimates>,
        external: bool,
        iterations: usize,
    ) -> SimResult<StepOutcome> {
        let t = self.state.time;
        let h = self.state.step;
        let k = self.state.order;

        let state = &mut self.state;
        let from = state.coeffs.constant_steps;
        let beta = state.coeffs.beta;
        state.x_history.unscale(from, &beta);
        state.q_history.unscale(from, &beta);
        state.coeffs.restore(h, k);
        state.failures += 1;
        state.initial_phase = false;

        self.phase = StepPhase::Rejected;
        self.stats.rejected += 1;
        if cause.is_nonlinear() {
            self.stats.nonlinear_rejections += 1;
        } else {
            self.stats.error_rejections += 1;
        }
        self.rejections.record(&cause);

        if self.options.constant_step && cause.is_nonlinear() && !external {
            return Err(SimError::FixedStepNonlinearFailure { time: t, step: h });
        }

        let failures = self.state.failures;
        let (order, rr) = match (cause, estimates) {
            (RejectionCause::ErrorControl { .. }, Some(est)) => {
                let reduced = est.reduced_order();
                match failures {
                    1 => {
                        let e = est.estimate_for(reduced);
                        let rr = R_FACTOR * (R_SAFETY * (e + R_FUDGE)).powf(-1.0 / (reduced + 1) as f64);
                        (reduced, rr.clamp(R_MIN, R_MAX))
                    }
                    2 => (reduced, R_MIN),
                    _ => (1, R_MIN),
                }
            }
            _ => (if failures > 2 { 1 } else { k }, R_MIN),
        };
        let h_new = rr * h;
        if self.state.steps_since_start == 0 {
            self.state.coeffs.psi[0] = h_new;
            self.state.x_history.scale_first_difference(rr);
            self.state.q_history.scale_first_difference(rr);
        }
        let order = self.state.set_order(order);
        if order.abs_diff(k) > 1 {
            self.errors.reset();
        }
        self.state.hold_order = true;
        self.state.step = h_new;
        warn!(time = t, step = h, cause = cause.as_str(), next_step = h_new, next_order = order, "step rejected");

        if !external {
            let count = self.rejections.count(self.options.rejection_counting);
            if count >= self.options.max_consecutive_rejections {
                return Err(SimError::MaxConsecutiveRejections {
                    time: t,
                    last_step: h,
                    rejections: count,
                });
            }
            if h_new < self.options.min_step {
                return Err(match cause {
                    RejectionCause::ContinuationExhausted { reached_param } => {
                        SimError::ContinuationExhausted { time: t, reached_param }
                    }
                    _ => SimError::StepTooSmall {
                        time: t,
                        step: h_new,
                        min_step: self.options.min_step,
                    },
                });
            }
        }

        Ok(StepOutcome::Rejected(RejectedStep {
            time: t,
            attempted_step: h,
            cause,
            next_step: h_new,
            next_order: order,
            newton_iterations: iterations,
        }))
    }
}

/// Local partial sums for the error estimates of the step just corrected.
fn error_sums(
    state: &StepState,
    delta: &DVector<f64>,
    q_delta: &DVector<f64>,
    x_weights: &DVector<f64>,
    q_weights: &DVector<f64>,
) -> ErrorSums {
    let k = state.order;
    let hist = &state.x_history;
    let mut sums = ErrorSums {
        x_error_sum: wrms_partial_sum(delta, x_weights),
        q_error_sum: wrms_partial_sum(q_delta, q_weights),
        len: delta.len(),
        ..ErrorSums::default()
    };
    if k > 1 {
        if let Some(phi_k) = hist.term(k) {
            sums.x_error_sum_m1 = wrms_partial_sum(&(phi_k + delta), x_weights);
        }
    }
    if k > 2 {
        if let (Some(a), Some(b)) = (hist.term(k - 1), hist.term(k)) {
            sums.x_error_sum_m2 = wrms_partial_sum(&(a + b + delta), x_weights);
        }
    }
    if let Some(next) = hist.next_difference() {
        sums.x_error_sum_p1 = wrms_partial_sum(&(delta - next), x_weights);
    }
    if let Some(q1) = state.q_history.term(1) {
        sums.q1_history_sum = wrms_partial_sum(q1, q_weights);
    }
    sums
}
