//! VitalSim CLI
//!
//! Run the built-in validation scenarios, or a model described by a JSON
//! component manifest.

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use vitalsim_sim::scenarios::ScenarioId;
use vitalsim_sim::{ComponentRegistry, Manifest, ScenarioResult, ScenarioRunner, SimConfig, SimExport};

/// VitalSim population health microsimulation CLI
#[derive(Parser, Debug)]
#[command(name = "vitalsim")]
#[command(about = "Run population health microsimulations", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (healthy_to_sick, sis, mortality, risk_paf, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to run
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Initial population size
    #[arg(short, long, default_value = "1000")]
    population: usize,

    /// Simulated years
    #[arg(short, long, default_value = "5")]
    years: u32,

    /// Step size in days
    #[arg(long, default_value = "30.5")]
    step_days: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-step category counts to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Run the components of a JSON manifest instead of a scenario
    #[arg(long)]
    manifest: Option<String>,

    /// Manifest comparison to run (default: base model and every comparison)
    #[arg(long)]
    comparison: Option<String>,
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

/// Why `--export` cannot run with the other flags, if it cannot.
fn export_conflict(args: &Args, scenario_count: usize) -> Option<&'static str> {
    if args.manifest.is_some() {
        Some("--export cannot be combined with --manifest")
    } else if scenario_count > 1 {
        Some("--export only supports a single scenario, not 'all'")
    } else {
        None
    }
}

fn runner_for(args: &Args, seed: u64) -> ScenarioRunner {
    ScenarioRunner::from_config(SimConfig {
        seed,
        population_size: args.population,
        step_days: args.step_days,
        years: args.years,
        ..Default::default()
    })
}

fn run_manifest(args: &Args, path: &str, seed: u64) -> Vec<ScenarioResult> {
    let manifest = Manifest::from_file(path).unwrap_or_else(|e| fail(&e.to_string()));
    let registry = ComponentRegistry::default();
    let runner = runner_for(args, seed);

    let mut branches: Vec<Option<String>> = Vec::new();
    match &args.comparison {
        Some(name) => branches.push(Some(name.clone())),
        None => {
            branches.push(None);
            branches.extend(manifest.comparison_names().map(|n| Some(n.to_string())));
        }
    }

    branches
        .into_iter()
        .map(|branch| {
            let label = branch.as_deref().unwrap_or("base");
            let components = manifest
                .resolve(&registry, runner.config(), branch.as_deref())
                .unwrap_or_else(|e| fail(&e.to_string()));
            runner.run_components(label, components)
        })
        .collect()
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!("✓ {} (seed={}) PASSED", result.scenario, result.seed);
        for (key, value) in &result.metrics {
            info!("    {:<32} {:>12.2}", key, value);
        }
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario,
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("VitalSim v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e: String| {
            fail(&format!(
                "{}\nAvailable scenarios: healthy_to_sick, sis, mortality, risk_paf, all",
                e
            ))
        })]
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    if let Some(export_path) = &args.export {
        if let Some(conflict) = export_conflict(&args, scenarios.len()) {
            fail(conflict);
        }
        let scenario = scenarios[0];
        let mut export = SimExport::new(scenario.name(), base_seed);
        let result = runner_for(&args, base_seed).run_with_export(scenario, &mut export);
        match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
        report(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return;
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let results = match &args.manifest {
            Some(path) => run_manifest(&args, path, seed),
            None => {
                let runner = runner_for(&args, seed);
                scenarios.iter().map(|s| runner.run(*s)).collect()
            }
        };
        for result in results {
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario,
                    "seed": r.seed,
                    "passed": r.passed,
                    "steps": r.total_steps,
                    "final_time": r.final_time.map(|t| t.to_string()),
                    "population": r.population,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} runs passed!", total);
        } else {
            error!("❌ {}/{} runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario,
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed_count > 0 {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_conflicts_name_the_flag() {
        let manifest = Args::parse_from(["vitalsim", "-S", "sis", "--export", "out.json", "--manifest", "m.json"]);
        assert_eq!(export_conflict(&manifest, 1), Some("--export cannot be combined with --manifest"));

        let all = Args::parse_from(["vitalsim", "--export", "out.json"]);
        assert_eq!(export_conflict(&all, ScenarioId::all().len()), Some("--export only supports a single scenario, not 'all'"));

        let single = Args::parse_from(["vitalsim", "-S", "sis", "--export", "out.json"]);
        assert_eq!(export_conflict(&single, 1), None);
    }
}
