//! Serializable copy of the stepping state.

use crate::integrator::{BdfCoefficients, DifferenceHistory, IntegrationMethod};
use crate::step_state::{SolutionState, StepState};
use nalgebra::DVector;
use std::collections::VecDeque;

/// Everything needed to resume stepping from an accepted point.
///
/// Vectors are stored as plain `Vec<f64>`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RestartSnapshot {
    pub time: f64,
    pub final_time: f64,
    pub last_breakpoint: f64,
    pub step: f64,
    pub used_step: f64,
    pub order: usize,
    pub used_order: usize,
    pub method: IntegrationMethod,
    pub previous_steps: Vec<f64>,
    pub steps_since_start: usize,
    pub initial_phase: bool,
    pub hold_order: bool,
    pub coefficients: BdfCoefficients,
    pub x_history: Vec<Vec<f64>>,
    pub x_next: Option<Vec<f64>>,
    pub q_history: Vec<Vec<f64>>,
    pub q_next: Option<Vec<f64>>,
    pub x: Vec<f64>,
    pub xdot: Vec<f64>,
    pub q: Vec<f64>,
    pub next_breakpoints: Vec<f64>,
}

fn to_vec(v: &DVector<f64>) -> Vec<f64> {
    v.iter().copied().collect()
}

fn split(h: &DifferenceHistory) -> (Vec<Vec<f64>>, Option<Vec<f64>>) {
    (h.terms().iter().map(to_vec).collect(), h.next_difference().map(to_vec))
}

fn join(terms: &[Vec<f64>], next: &Option<Vec<f64>>) -> DifferenceHistory {
    DifferenceHistory::from_parts(
        terms.iter().map(|t| DVector::from_column_slice(t)).collect(),
        next.as_ref().map(|t| DVector::from_column_slice(t)),
    )
}

impl RestartSnapshot {
    pub(crate) fn capture(
        state: &StepState,
        solution: &SolutionState,
        final_time: f64,
        last_breakpoint: f64,
        breakpoints: Vec<f64>,
    ) -> Self {
        let (x_history, x_next) = split(&state.x_history);
        let (q_history, q_next) = split(&state.q_history);
        Self {
            time: state.time,
            final_time,
            last_breakpoint,
            step: state.step,
            used_step: state.used_step,
            order: state.order,
            used_order: state.used_order,
            method: state.method,
            previous_steps: state.previous_steps.iter().copied().collect(),
            steps_since_start: state.steps_since_start,
            initial_phase: state.initial_phase,
            hold_order: state.hold_order,
            coefficients: state.coeffs.clone(),
            x_history,
            x_next,
            q_history,
            q_next,
            x: to_vec(&solution.x),
            xdot: to_vec(&solution.xdot),
            q: to_vec(&solution.q),
            next_breakpoints: breakpoints,
        }
    }

    /// Problem size the snapshot was taken for.
    pub fn size(&self) -> usize {
        self.x.len()
    }

    /// Internal consistency: orders within what the method supports, positive
    /// finite steps, enough step history for the order last used, history
    /// length matching the order and every vector of the problem size.
    pub fn is_consistent(&self) -> bool {
        let n = self.size();
        let max_order = self.method.max_order();
        let sized = |v: &Vec<f64>| v.len() == n;
        let positive = |h: f64| h.is_finite() && h > 0.0;
        (1..=max_order).contains(&self.order)
            && (1..=max_order).contains(&self.used_order)
            && positive(self.step)
            && positive(self.used_step)
            && self.time.is_finite()
            && self.previous_steps.len() >= self.used_order
            && self.previous_steps.len() <= max_order + 1
            && self.previous_steps.iter().all(|&h| positive(h))
            && self.x_history.len() == self.order + 1
            && self.q_history.len() == self.order + 1
            && self.x_history.iter().all(sized)
            && self.q_history.iter().all(sized)
            && self.x_next.as_ref().is_none_or(sized)
            && self.q_next.as_ref().is_none_or(sized)
            && self.xdot.len() == n
            && self.q.len() == n
    }

    pub(crate) fn apply(&self, state: &mut StepState) -> SolutionState {
        state.time = self.time;
        state.step = self.step;
        state.used_step = self.used_step;
        state.order = self.order;
        state.used_order = self.used_order;
        state.previous_steps = self.previous_steps.iter().copied().collect::<VecDeque<_>>();
        state.steps_since_start = self.steps_since_start;
        state.failures = 0;
        state.initial_phase = self.initial_phase;
        state.hold_order = self.hold_order;
        state.coeffs = self.coefficients.clone();
        state.x_history = join(&self.x_history, &self.x_next);
        state.q_history = join(&self.q_history, &self.q_next);
        SolutionState {
            time: self.time,
            x: DVector::from_column_slice(&self.x),
            xdot: DVector::from_column_slice(&self.xdot),
            q: DVector::from_column_slice(&self.q),
        }
    }
}
