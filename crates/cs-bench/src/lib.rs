//! Benchmark scenarios for the circstep engine.

pub mod circuits;

use circuits::{DiodeClipper, Pulse, RcCircuit};
use cs_sim::{
    AnalysisDriver, DcSweepOptions, RunSummary, SimError, StepControlOptions, SteppingPolicy, TransientOptions,
};
use cs_solver::DenseLu;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("scenario '{id}' failed: {source}")]
    Scenario {
        id: String,
        #[source]
        source: SimError,
    },

    #[error("benchmark needs at least one run")]
    NoRuns,
}

/// A benchmark scenario definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkScenario {
    /// Unique identifier for this benchmark.
    pub id: String,
    pub name: String,
    pub kind: ScenarioKind,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ScenarioKind {
    /// RC discharge from 1 V, checked against `exp(-t / tau)`.
    RcDecay { tau: f64, t_end: f64 },
    /// Pulsed diode clipper; every pulse corner is a breakpoint.
    DiodeClipper { period: f64, t_end: f64 },
    /// DC sweep of the clipper input.
    DiodeSweep { v_start: f64, v_stop: f64, points: usize },
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::RcDecay { .. } => "rc_decay",
            ScenarioKind::DiodeClipper { .. } => "diode_clipper",
            ScenarioKind::DiodeSweep { .. } => "diode_sweep",
        }
    }
}

/// One run's counters and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_time_s: f64,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub newton_iterations: usize,
    pub breakpoints_hit: usize,
    pub final_time: f64,
    pub max_error_ratio: Option<f64>,
    /// Largest deviation from the analytic solution, where one exists.
    pub max_abs_error: Option<f64>,
}

impl RunMetrics {
    fn from_summary(summary: &RunSummary, total_time_s: f64, max_abs_error: Option<f64>) -> Self {
        Self {
            total_time_s,
            accepted_steps: summary.accepted_steps,
            rejected_steps: summary.rejected_steps,
            newton_iterations: summary.newton_iterations,
            breakpoints_hit: summary.breakpoints_hit,
            final_time: summary.final_time,
            max_error_ratio: summary.max_error_ratio,
            max_abs_error,
        }
    }
}

/// Aggregated statistics for multiple runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub run_count: usize,
    pub total_time_median_s: f64,
    pub total_time_min_s: f64,
    pub total_time_max_s: f64,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub newton_iterations_median: usize,
    pub max_abs_error: Option<f64>,
}

/// Complete benchmark result for a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub scenario: BenchmarkScenario,
    pub runs: Vec<RunMetrics>,
    pub aggregate: AggregateMetrics,
}

/// Collection of benchmark results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSuite {
    pub timestamp: String,
    pub results: Vec<BenchmarkResult>,
}

fn run_once(kind: &ScenarioKind) -> Result<RunMetrics, SimError> {
    let started = Instant::now();
    match *kind {
        ScenarioKind::RcDecay { tau, t_end } => {
            let circuit = RcCircuit { r: tau, c: 1.0 };
            let policy = SteppingPolicy::Transient(TransientOptions {
                use_initial_conditions: true,
                initial_state: Some(DVector::from_element(1, 1.0)),
                ..TransientOptions::default()
            });
            let summary = AnalysisDriver::new(circuit, DenseLu, policy).run_to_completion(t_end)?;
            let elapsed = started.elapsed().as_secs_f64();
            let max_abs_error = summary
                .record
                .t
                .iter()
                .zip(&summary.record.x)
                .map(|(t, x)| (x[0] - (-t / tau).exp()).abs())
                .fold(0.0, f64::max);
            Ok(RunMetrics::from_summary(&summary, elapsed, Some(max_abs_error)))
        }
        ScenarioKind::DiodeClipper { period, t_end } => {
            let pulse = Pulse {
                low: 0.0,
                high: 5.0,
                rise: period * 0.05,
                width: period * 0.4,
                fall: period * 0.05,
                period,
            };
            let policy = SteppingPolicy::Transient(TransientOptions {
                step: StepControlOptions {
                    max_step: period / 20.0,
                    ..StepControlOptions::default()
                },
                ..TransientOptions::default()
            });
            let summary =
                AnalysisDriver::new(DiodeClipper::pulsed(pulse), DenseLu, policy).run_to_completion(t_end)?;
            Ok(RunMetrics::from_summary(&summary, started.elapsed().as_secs_f64(), None))
        }
        ScenarioKind::DiodeSweep { v_start, v_stop, points } => {
            let n = points.max(2);
            let values = (0..n)
                .map(|i| v_start + (v_stop - v_start) * i as f64 / (n - 1) as f64)
                .collect();
            let policy = SteppingPolicy::DcSweep(DcSweepOptions {
                parameter: "vin".into(),
                values,
                ..DcSweepOptions::default()
            });
            let summary = AnalysisDriver::new(DiodeClipper::dc(v_start), DenseLu, policy).run_to_completion(0.0)?;
            Ok(RunMetrics::from_summary(&summary, started.elapsed().as_secs_f64(), None))
        }
    }
}

/// Run a single benchmark scenario N times.
pub fn run_scenario(scenario: &BenchmarkScenario, times: usize) -> Result<BenchmarkResult, BenchError> {
    if times == 0 {
        return Err(BenchError::NoRuns);
    }
    let mut runs = Vec::with_capacity(times);
    for run in 0..times {
        let metrics = run_once(&scenario.kind).map_err(|source| BenchError::Scenario {
            id: scenario.id.clone(),
            source,
        })?;
        info!(
            scenario = %scenario.id,
            run,
            accepted = metrics.accepted_steps,
            rejected = metrics.rejected_steps,
            "benchmark run finished"
        );
        runs.push(metrics);
    }
    let aggregate = compute_aggregates(&runs);
    Ok(BenchmarkResult {
        scenario: scenario.clone(),
        runs,
        aggregate,
    })
}

fn median<T: Copy + PartialOrd>(values: &mut [T]) -> Option<T> {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values.get(values.len() / 2).copied()
}

fn compute_aggregates(runs: &[RunMetrics]) -> AggregateMetrics {
    let mut totals: Vec<f64> = runs.iter().map(|r| r.total_time_s).collect();
    let mut iterations: Vec<usize> = runs.iter().map(|r| r.newton_iterations).collect();
    let total_time_median_s = median(&mut totals).unwrap_or(0.0);
    AggregateMetrics {
        run_count: runs.len(),
        total_time_median_s,
        total_time_min_s: totals.first().copied().unwrap_or(0.0),
        total_time_max_s: totals.last().copied().unwrap_or(0.0),
        // Runs are deterministic; step counts agree across them.
        accepted_steps: runs.first().map_or(0, |r| r.accepted_steps),
        rejected_steps: runs.first().map_or(0, |r| r.rejected_steps),
        newton_iterations_median: median(&mut iterations).unwrap_or(0),
        max_abs_error: runs.iter().filter_map(|r| r.max_abs_error).reduce(f64::max),
    }
}

/// Scenarios the bench binary runs.
pub fn default_benchmarks() -> Vec<BenchmarkScenario> {
    vec![
        BenchmarkScenario {
            id: "rc_decay".into(),
            name: "RC discharge".into(),
            kind: ScenarioKind::RcDecay { tau: 1e-3, t_end: 5e-3 },
            notes: Some("Adaptive BDF against the analytic decay".into()),
        },
        BenchmarkScenario {
            id: "diode_clipper".into(),
            name: "Pulsed diode clipper".into(),
            kind: ScenarioKind::DiodeClipper {
                period: 10e-6,
                t_end: 50e-6,
            },
            notes: Some("Breakpoint restarts at every pulse corner".into()),
        },
        BenchmarkScenario {
            id: "diode_sweep".into(),
            name: "Diode clipper DC sweep".into(),
            kind: ScenarioKind::DiodeSweep {
                v_start: 0.0,
                v_stop: 5.0,
                points: 51,
            },
            notes: None,
        },
    ]
}
