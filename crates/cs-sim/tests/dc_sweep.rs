//! DC sweep of a diode clamp.

mod common;

use common::DiodeClamp;
use cs_sim::{AnalysisDriver, DcSweepOptions, RunBudget, RunStatus, SimError, SteppingPolicy};
use cs_solver::DenseLu;

fn sweep(values: Vec<f64>) -> SteppingPolicy {
    SteppingPolicy::DcSweep(DcSweepOptions {
        parameter: "vin".into(),
        values,
        ..DcSweepOptions::default()
    })
}

#[test]
fn diode_voltage_rises_and_saturates() {
    let values: Vec<f64> = (0..=10).map(|i| i as f64 * 0.5).collect();
    let mut driver = AnalysisDriver::new(DiodeClamp::new(), DenseLu, sweep(values.clone()));
    let summary = driver.run_to_completion(0.0).unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.record.t, values);
    let v: Vec<f64> = summary.record.x.iter().map(|x| x[0]).collect();
    assert!(v[0].abs() < 1e-9);
    assert!(v.windows(2).all(|w| w[1] >= w[0]), "not monotone: {v:?}");
    assert!(v[10] > 0.5 && v[10] < 0.8, "clamp voltage {}", v[10]);
    // Below the knee almost all of the input appears across the diode.
    assert!(v[1] > 0.45 && v[1] < 0.5, "v(0.5) = {}", v[1]);
}

#[test]
fn reset_and_continuation_reach_the_same_points() {
    let values = vec![1.0, 3.0, 5.0];
    let mut chained = AnalysisDriver::new(DiodeClamp::new(), DenseLu, sweep(values.clone()));
    let mut reset = AnalysisDriver::new(
        DiodeClamp::new(),
        DenseLu,
        SteppingPolicy::DcSweep(DcSweepOptions {
            parameter: "vin".into(),
            values,
            sweep_source_reset: true,
            ..DcSweepOptions::default()
        }),
    );
    let a = chained.run_to_completion(0.0).unwrap();
    let b = reset.run_to_completion(0.0).unwrap();
    for (xa, xb) in a.record.x.iter().zip(&b.record.x) {
        assert!((xa[0] - xb[0]).abs() < 1e-4);
    }
}

#[test]
fn failed_points_are_collected_and_reported_at_the_end() {
    let loader = DiodeClamp {
        vin: 0.0,
        breakdown: 3.0,
    };
    let mut driver = AnalysisDriver::new(loader, DenseLu, sweep(vec![1.0, 2.0, 3.5, 4.0]));
    let mut visited = Vec::new();
    let err = driver
        .run_with_observer(0.0, |point, _| visited.push(point.time))
        .unwrap_err();
    assert_eq!(visited, vec![1.0, 2.0]);
    match err {
        SimError::SweepFailures { failed } => assert_eq!(failed, vec![3.5, 4.0]),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn unknown_parameter_is_a_setup_error() {
    let policy = SteppingPolicy::DcSweep(DcSweepOptions {
        parameter: "temp".into(),
        values: vec![27.0],
        ..DcSweepOptions::default()
    });
    let mut driver = AnalysisDriver::new(DiodeClamp::new(), DenseLu, policy);
    assert!(matches!(driver.run_to_completion(0.0), Err(SimError::Backend { .. })));
}

#[test]
fn budget_stops_the_sweep_early() {
    let mut driver = AnalysisDriver::new(DiodeClamp::new(), DenseLu, sweep(vec![0.0, 1.0, 2.0, 3.0]))
        .with_budget(RunBudget {
            max_steps: Some(2),
            max_wall: None,
        });
    let summary = driver.run_to_completion(0.0).unwrap();
    assert_eq!(summary.status, RunStatus::StoppedEarly);
    assert_eq!(summary.record.len(), 2);
}
