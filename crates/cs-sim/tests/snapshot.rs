//! Restart snapshots survive JSON and reproduce the run.

#![cfg(feature = "serde")]

mod common;

use common::Spiral;
use cs_sim::{RestartSnapshot, SimError, StepControlOptions, StepController};
use cs_solver::DenseLu;
use nalgebra::DVector;

fn running() -> StepController<Spiral> {
    let mut c = StepController::new(Spiral { a: 0.5, w: 3.0 }, DenseLu, StepControlOptions::default()).unwrap();
    c.add_breakpoints([0.7]);
    c.initialize(0.0, DVector::from_vec(vec![1.0, 0.0]), 2.0).unwrap();
    for _ in 0..12 {
        if c.is_finished() {
            break;
        }
        c.advance().unwrap();
    }
    c
}

#[test]
fn json_round_trip_is_lossless() {
    let snapshot = running().snapshot();
    assert!(snapshot.is_consistent());
    let json = serde_json::to_string(&snapshot).unwrap();
    let back: RestartSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back, snapshot);
}

#[test]
fn restored_controller_takes_the_same_steps() {
    let mut original = running();
    let json = serde_json::to_string(&original.snapshot()).unwrap();
    let snapshot: RestartSnapshot = serde_json::from_str(&json).unwrap();

    let mut resumed =
        StepController::new(Spiral { a: 0.5, w: 3.0 }, DenseLu, StepControlOptions::default()).unwrap();
    resumed.restore(&snapshot).unwrap();

    for _ in 0..10 {
        if original.is_finished() {
            break;
        }
        let a = original.advance().unwrap();
        let b = resumed.advance().unwrap();
        assert_eq!(a, b);
        assert_eq!(original.solution().x, resumed.solution().x);
    }
}

#[test]
fn mismatched_snapshots_are_refused() {
    let snapshot = running().snapshot();
    let mut other = StepController::new(common::RcDecay::with_tau(1.0), DenseLu, StepControlOptions::default())
        .unwrap();
    assert!(matches!(other.restore(&snapshot), Err(SimError::InvalidArg { .. })));

    let mut broken = snapshot.clone();
    broken.x_history.pop();
    assert!(!broken.is_consistent());
}

fn fresh() -> StepController<Spiral> {
    StepController::new(Spiral { a: 0.5, w: 3.0 }, DenseLu, StepControlOptions::default()).unwrap()
}

fn refused(controller: &mut StepController<Spiral>, snapshot: &RestartSnapshot) -> bool {
    matches!(controller.restore(snapshot), Err(SimError::InvalidArg { .. }))
}

#[test]
fn forged_step_state_is_refused_before_stepping() {
    let good = running().snapshot();
    let mut target = fresh();

    // Order past the BDF limit with histories sized to match.
    let mut too_high = good.clone();
    too_high.order = 6;
    too_high.used_order = 6;
    for history in [&mut too_high.x_history, &mut too_high.q_history] {
        let filler = vec![0.0; history[0].len()];
        history.resize(7, filler);
    }
    too_high.previous_steps.resize(7, good.step);
    assert!(refused(&mut target, &too_high));

    let mut no_used_order = good.clone();
    no_used_order.used_order = 0;
    assert!(refused(&mut target, &no_used_order));

    let mut zero_step = good.clone();
    zero_step.step = 0.0;
    assert!(refused(&mut target, &zero_step));

    let mut nan_used_step = good.clone();
    nan_used_step.used_step = f64::NAN;
    assert!(refused(&mut target, &nan_used_step));

    let mut short_memory = good.clone();
    short_memory.previous_steps.truncate(good.used_order - 1);
    assert!(refused(&mut target, &short_memory));

    // The untouched snapshot still restores and steps.
    target.restore(&good).unwrap();
    target.advance().unwrap();
}

#[test]
fn snapshot_below_the_minimum_order_is_refused() {
    let mut first_order = running().snapshot();
    first_order.order = 1;
    first_order.used_order = 1;
    first_order.x_history.truncate(2);
    first_order.q_history.truncate(2);
    first_order.x_next = None;
    first_order.q_next = None;
    assert!(first_order.is_consistent());

    let options = StepControlOptions {
        min_order: 2,
        ..StepControlOptions::default()
    };
    let mut strict = StepController::new(Spiral { a: 0.5, w: 3.0 }, DenseLu, options).unwrap();
    assert!(matches!(strict.restore(&first_order), Err(SimError::InvalidArg { .. })));

    let mut lenient = fresh();
    lenient.restore(&first_order).unwrap();
}
