//! Standalone benchmark runner.

use cs_bench::{BenchmarkSuite, default_benchmarks, run_scenario};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

const RUNS: usize = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let crate_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let repo_root = crate_path
        .parent()
        .and_then(|p| p.parent())
        .ok_or("could not determine repo root")?
        .to_path_buf();

    let benchmarks = default_benchmarks();
    println!("circstep benchmarks: {} scenarios, {RUNS} runs each\n", benchmarks.len());

    let mut results = Vec::new();
    for (idx, scenario) in benchmarks.iter().enumerate() {
        print!("[{}/{}] {} ... ", idx + 1, benchmarks.len(), scenario.name);
        std::io::Write::flush(&mut std::io::stdout())?;
        match run_scenario(scenario, RUNS) {
            Ok(result) => {
                println!("OK ({:.4}s median)", result.aggregate.total_time_median_s);
                results.push(result);
            }
            Err(e) => {
                println!("FAILED");
                eprintln!("  error: {e}");
            }
        }
    }

    println!();
    for result in &results {
        let agg = &result.aggregate;
        println!("{} ({})", result.scenario.name, result.scenario.kind.as_str());
        println!(
            "  time:     {:.4}s median, min {:.4}s, max {:.4}s",
            agg.total_time_median_s, agg.total_time_min_s, agg.total_time_max_s
        );
        println!("  steps:    {} accepted, {} rejected", agg.accepted_steps, agg.rejected_steps);
        println!("  newton:   {} iterations (median)", agg.newton_iterations_median);
        if let Some(err) = agg.max_abs_error {
            println!("  accuracy: {err:.3e} max abs error");
        }
        println!();
    }

    let timestamp = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?.as_secs();
    let json = serde_json::to_string_pretty(&BenchmarkSuite {
        timestamp: format!("timestamp_{timestamp}"),
        results,
    })?;
    let dir = repo_root.join("benchmarks");
    fs::create_dir_all(&dir)?;
    let path = dir.join("baseline.json");
    fs::write(&path, json)?;
    println!("Baseline saved to: {}", path.display());
    Ok(())
}
