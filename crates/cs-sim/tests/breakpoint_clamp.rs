//! Steps are clamped onto breakpoints and integration restarts there.

mod common;

use common::{Frozen, RcDecay};
use cs_sim::{BreakpointSource, StepControlOptions, StepController, StepOutcome, StepPhase};
use cs_solver::{DenseLu, LoadPoint, LoadedSystem, Loader, SolverResult};
use nalgebra::DVector;

/// Steps of 2.0 from t = 0: the third one would reach 6.0.
fn two_second_steps() -> StepControlOptions {
    StepControlOptions {
        restart_step_scale: 0.4,
        max_step: 2.0,
        min_steps_per_breakpoint_interval: None,
        ..StepControlOptions::default()
    }
}

#[test]
fn step_past_a_breakpoint_lands_on_it() {
    let mut c = StepController::new(Frozen { size: 1 }, DenseLu, two_second_steps()).unwrap();
    c.add_breakpoints([5.0]);
    c.initialize(0.0, DVector::from_element(1, 1.0), 10.0).unwrap();

    c.advance().unwrap();
    c.advance().unwrap();
    assert_eq!(c.state().time(), 4.0);
    assert_eq!(c.state().time() + c.state().step(), 6.0);

    let StepOutcome::Accepted(hit) = c.step().unwrap() else {
        panic!("frozen system never rejects");
    };
    assert_eq!(hit.time, 5.0);
    assert_eq!(hit.step, 1.0);
    assert!(hit.breakpoint_hit);
    assert_eq!(c.phase(), StepPhase::BreakpointHit);
    assert_eq!(c.state().order(), 1);
    assert!(c.error_history().is_empty());

    let next = c.advance().unwrap();
    assert_eq!(next.order, 1);
    assert_eq!(next.next_order, 1, "order held on the step after a breakpoint");
    assert!(next.time > 5.0);
    assert!(next.step <= 1.0, "restart step limited by the last step");
}

#[test]
fn breakpoints_behind_the_start_are_ignored() {
    let mut c = StepController::new(Frozen { size: 1 }, DenseLu, two_second_steps()).unwrap();
    c.add_breakpoints([-1.0, 0.0]);
    c.initialize(0.0, DVector::from_element(1, 1.0), 10.0).unwrap();
    assert!(c.breakpoints().is_empty());
}

/// RC discharge with a loader-provided breakpoint every 0.25 s.
struct Clocked {
    inner: RcDecay,
    period: f64,
}

impl Loader for Clocked {
    fn size(&self) -> usize {
        1
    }

    fn evaluate(&self, x: &DVector<f64>, point: &LoadPoint) -> SolverResult<LoadedSystem> {
        self.inner.evaluate(x, point)
    }

    fn breakpoints(&self, from: f64, to: f64) -> Vec<f64> {
        let first = (from / self.period).floor() as i64 + 1;
        (first..)
            .map(|i| i as f64 * self.period)
            .take_while(|&t| t <= to)
            .collect()
    }
}

#[test]
fn every_loader_breakpoint_is_hit_exactly() {
    let loader = Clocked {
        inner: RcDecay::with_tau(1.0),
        period: 0.25,
    };
    let mut c = StepController::new(loader, DenseLu, StepControlOptions::default()).unwrap();
    c.initialize(0.0, DVector::from_element(1, 1.0), 1.0).unwrap();
    let mut hits = Vec::new();
    while !c.is_finished() {
        let step = c.advance().unwrap();
        if step.breakpoint_hit {
            hits.push(step.time);
        }
    }
    assert_eq!(hits, vec![0.25, 0.5, 0.75, 1.0]);
    assert_eq!(c.statistics().breakpoints_hit, 4);
}

/// Unbounded clock edges, handed out one at a time.
struct Ticks {
    period: f64,
}

impl BreakpointSource for Ticks {
    fn next_breakpoint(&self, after: f64) -> Option<f64> {
        Some(((after / self.period).floor() + 1.0) * self.period)
    }
}

#[test]
fn breakpoint_sources_are_pulled_one_edge_at_a_time() {
    let mut c = StepController::new(RcDecay::with_tau(1.0), DenseLu, StepControlOptions::default()).unwrap();
    c.add_breakpoint_source(Ticks { period: 0.25 });
    c.initialize(0.0, DVector::from_element(1, 1.0), 1.0).unwrap();
    assert_eq!(c.breakpoints().iter().collect::<Vec<_>>(), vec![0.25]);

    let mut hits = Vec::new();
    while !c.is_finished() {
        let step = c.advance().unwrap();
        if step.breakpoint_hit {
            hits.push(step.time);
            assert!(c.breakpoints().len() <= 1);
        }
    }
    assert_eq!(hits, vec![0.25, 0.5, 0.75, 1.0]);
}

#[test]
fn source_added_mid_run_starts_after_the_current_time() {
    let mut c = StepController::new(Frozen { size: 1 }, DenseLu, two_second_steps()).unwrap();
    c.initialize(0.0, DVector::from_element(1, 1.0), 10.0).unwrap();
    c.advance().unwrap();
    let now = c.state().time();
    c.add_breakpoint_source(vec![now, 0.5 * now, 7.0, 3.0 * now + 1.0]);
    assert_eq!(c.breakpoints().iter().collect::<Vec<_>>(), vec![(3.0 * now + 1.0).min(7.0)]);
}
