//! Per-step integrator state.

use crate::integrator::{BdfCoefficients, DifferenceHistory, IntegrationMethod};
use nalgebra::DVector;
use std::collections::VecDeque;

/// Where the controller is within the current step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepPhase {
    #[default]
    Predicting,
    Correcting,
    Accepted,
    Rejected,
    /// Accepted and landed on a breakpoint; integration restarted.
    BreakpointHit,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Predicting => "predicting",
            StepPhase::Correcting => "correcting",
            StepPhase::Accepted => "accepted",
            StepPhase::Rejected => "rejected",
            StepPhase::BreakpointHit => "breakpoint_hit",
        }
    }
}

/// Solution at the last accepted time.
#[derive(Clone, Debug, PartialEq)]
pub struct SolutionState {
    pub time: f64,
    pub x: DVector<f64>,
    pub xdot: DVector<f64>,
    pub q: DVector<f64>,
}

impl SolutionState {
    pub fn at_rest(time: f64, x: DVector<f64>, q: DVector<f64>) -> Self {
        let n = x.len();
        Self {
            time,
            x,
            xdot: DVector::zeros(n),
            q,
        }
    }
}

/// Step sizes, order and difference histories of the integrator.
///
/// The histories always hold `order + 1` terms.
#[derive(Clone, Debug)]
pub struct StepState {
    pub(crate) time: f64,
    /// Step to attempt next (or being attempted).
    pub(crate) step: f64,
    pub(crate) used_step: f64,
    pub(crate) order: usize,
    pub(crate) used_order: usize,
    pub(crate) min_order: usize,
    pub(crate) max_order: usize,
    pub(crate) method: IntegrationMethod,
    pub(crate) previous_steps: VecDeque<f64>,
    pub(crate) x_history: DifferenceHistory,
    pub(crate) q_history: DifferenceHistory,
    pub(crate) coeffs: BdfCoefficients,
    /// Accepted steps since the last (re)start.
    pub(crate) steps_since_start: usize,
    /// Consecutive failures of the current step.
    pub(crate) failures: usize,
    pub(crate) initial_phase: bool,
    /// Keep the order on the next accepted step.
    pub(crate) hold_order: bool,
}

impl StepState {
    pub(crate) fn new(method: IntegrationMethod, min_order: usize, size: usize) -> Self {
        let max_order = method.max_order().max(1);
        Self {
            time: 0.0,
            step: 0.0,
            used_step: 0.0,
            order: 1,
            used_order: 1,
            min_order: min_order.clamp(1, max_order),
            max_order,
            method,
            previous_steps: VecDeque::with_capacity(max_order + 1),
            x_history: DifferenceHistory::start(DVector::zeros(size), DVector::zeros(size)),
            q_history: DifferenceHistory::start(DVector::zeros(size), DVector::zeros(size)),
            coeffs: BdfCoefficients::default(),
            steps_since_start: 0,
            failures: 0,
            initial_phase: true,
            hold_order: false,
        }
    }

    /// Restart at order 1 from `x`, `q` and the scaled derivative `h·q'`.
    pub(crate) fn restart(&mut self, time: f64, h: f64, x: DVector<f64>, q: DVector<f64>, h_qdot: DVector<f64>) {
        let n = x.len();
        self.time = time;
        self.step = h;
        self.used_step = h;
        self.order = 1;
        self.used_order = 1;
        self.x_history = DifferenceHistory::start(x, DVector::zeros(n));
        self.q_history = DifferenceHistory::start(q, h_qdot);
        self.coeffs.reset(h);
        self.steps_since_start = 0;
        self.failures = 0;
        self.initial_phase = true;
    }

    /// Change the order of both histories. Returns the order set, which may
    /// fall short of a requested raise when no higher difference exists yet.
    pub(crate) fn set_order(&mut self, order: usize) -> usize {
        let order = order.clamp(self.min_order, self.max_order);
        let x = self.x_history.set_order(order);
        let q = self.q_history.set_order(order);
        debug_assert_eq!(x, q);
        self.order = x;
        self.order
    }

    /// Highest order the stored differences can support right now.
    pub fn supported_order(&self) -> usize {
        let pending = usize::from(self.x_history.next_difference().is_some());
        (self.order + pending).min(self.max_order)
    }

    pub(crate) fn push_step(&mut self, h: f64) {
        if self.previous_steps.len() == self.max_order + 1 {
            self.previous_steps.pop_back();
        }
        self.previous_steps.push_front(h);
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn used_step(&self) -> f64 {
        self.used_step
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn used_order(&self) -> usize {
        self.used_order
    }

    pub fn min_order(&self) -> usize {
        self.min_order
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn method(&self) -> IntegrationMethod {
        self.method
    }

    /// Most recent accepted step sizes, newest first.
    pub fn previous_steps(&self) -> impl Iterator<Item = f64> + '_ {
        self.previous_steps.iter().copied()
    }

    pub fn history_len(&self) -> usize {
        self.x_history.len()
    }

    pub fn x_history(&self) -> &DifferenceHistory {
        &self.x_history
    }

    pub fn q_history(&self) -> &DifferenceHistory {
        &self.q_history
    }

    pub fn coefficients(&self) -> &BdfCoefficients {
        &self.coeffs
    }

    pub fn steps_since_start(&self) -> usize {
        self.steps_since_start
    }

    pub fn consecutive_failures(&self) -> usize {
        self.failures
    }

    pub fn in_initial_phase(&self) -> bool {
        self.initial_phase
    }
}
