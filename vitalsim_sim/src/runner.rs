//! Scenario runner - executes validation scenarios and checks their
//! assertions.

use tracing::{debug, info, warn};
use vitalsim_core::{Component, Metrics, SimulationError};
use vitalsim_env::{years, SimTime};

use crate::exporter::{SimExport, StepFrame};
use crate::scenarios::{
    ScenarioId, MORTALITY_RATE, RISK_BASE_INCIDENCE, RISK_EXPOSED_PREVALENCE, RISK_RELATIVE_RISK,
};
use crate::world::{SimConfig, SimWorld};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario (or manifest comparison) that was run
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total steps executed
    pub total_steps: u64,

    /// Final simulated instant
    pub final_time: Option<SimTime>,

    /// Simulants created
    pub population: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Final metrics
    pub metrics: Metrics,
}

impl ScenarioResult {
    fn failed(scenario: &str, seed: u64, error: SimulationError) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            passed: false,
            total_steps: 0,
            final_time: None,
            population: 0,
            failure_reason: Some(format!("simulation error: {}", error)),
            metrics: Metrics::new(),
        }
    }
}

/// Outcome of a completed run before assertions.
struct Completed {
    world: SimWorld,
    metrics: Metrics,
}

/// Runs scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    config: SimConfig,
}

/// Binomial tolerance: four standard deviations plus a small slack.
fn tolerance(p: f64, n: usize) -> f64 {
    4.0 * (p * (1.0 - p) / n.max(1) as f64).sqrt() + 0.005
}

fn check(passed: bool, reason: impl FnOnce() -> String) -> Result<(), String> {
    if passed {
        Ok(())
    } else {
        Err(reason())
    }
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, population_size: usize) -> Self {
        Self {
            config: SimConfig {
                seed,
                population_size,
                ..Default::default()
            },
        }
    }

    /// Creates a runner from a complete configuration.
    pub fn from_config(config: SimConfig) -> Self {
        Self { config }
    }

    /// Sets the run length.
    pub fn with_years(mut self, years: u32) -> Self {
        self.config.years = years;
        self
    }

    /// Sets the step size.
    pub fn with_step_days(mut self, days: f64) -> Self {
        self.config.step_days = days;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn execute(
        &self,
        components: Vec<Box<dyn Component>>,
        overrides: &serde_yaml::Value,
        mut export: Option<&mut SimExport>,
    ) -> Result<Completed, SimulationError> {
        let mut world = SimWorld::with_overrides(self.config.clone(), components, overrides)?;
        world.populate()?;
        let capture = |world: &SimWorld| StepFrame::capture(world.tick_count(), world.time(), &world.snapshot());
        if let Some(export) = export.as_deref_mut() {
            export.add_frame(capture(&world));
        }
        while !world.is_finished() {
            world.tick()?;
            if let Some(export) = export.as_deref_mut() {
                export.add_frame(capture(&world));
            }
            if world.tick_count() % 12 == 0 {
                debug!(step = world.tick_count(), time = %world.time(), "scenario progress");
            }
        }
        let metrics = world.run_to_end()?;
        Ok(Completed { world, metrics })
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_inner(scenario, None)
    }

    /// Runs a scenario, recording every step into `export`.
    pub fn run_with_export(&self, scenario: ScenarioId, export: &mut SimExport) -> ScenarioResult {
        let result = self.run_inner(scenario, Some(&mut *export));
        export.finalize(result.metrics.clone(), result.passed, result.failure_reason.clone());
        result
    }

    fn run_inner(&self, scenario: ScenarioId, export: Option<&mut SimExport>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        let completed = match self.execute(scenario.components(&self.config), &scenario.overrides(), export) {
            Ok(completed) => completed,
            Err(error) => {
                warn!(scenario = scenario.name(), error = %error, "scenario aborted");
                return ScenarioResult::failed(scenario.name(), self.config.seed, error);
            }
        };

        let verdict = match scenario {
            ScenarioId::HealthyToSick => self.check_healthy_to_sick(&completed),
            ScenarioId::Sis => self.check_sis(&completed),
            ScenarioId::Mortality => self.check_mortality(&completed),
            ScenarioId::RiskPaf => self.check_risk_paf(&completed),
        };
        self.result(scenario.name(), completed, verdict)
    }

    /// Runs arbitrary components without assertions.
    pub fn run_components(&self, name: &str, components: Vec<Box<dyn Component>>) -> ScenarioResult {
        info!("Starting run: {} (seed={})", name, self.config.seed);
        match self.execute(components, &serde_yaml::Value::Null, None) {
            Ok(completed) => self.result(name, completed, Ok(())),
            Err(error) => ScenarioResult::failed(name, self.config.seed, error),
        }
    }

    fn result(&self, name: &str, completed: Completed, verdict: Result<(), String>) -> ScenarioResult {
        let Completed { world, metrics } = completed;
        ScenarioResult {
            scenario: name.to_string(),
            seed: self.config.seed,
            passed: verdict.is_ok(),
            total_steps: world.tick_count(),
            final_time: Some(world.time()),
            population: world.population_size(),
            failure_reason: verdict.err(),
            metrics,
        }
    }

    fn metric(metrics: &Metrics, key: &str) -> Result<f64, String> {
        metrics.get(key).copied().ok_or_else(|| format!("metric '{}' was not reported", key))
    }

    fn elapsed_years(completed: &Completed) -> f64 {
        let world = &completed.world;
        years(world.time() - world.simulation().start_time())
    }

    fn check_healthy_to_sick(&self, completed: &Completed) -> Result<(), String> {
        let sick = Self::metric(&completed.metrics, "disease.sick")?;
        let population = completed.world.population_size() as f64;
        check(sick == population, || format!("{} of {} simulants sick", sick, population))
    }

    fn check_sis(&self, completed: &Completed) -> Result<(), String> {
        let infected = Self::metric(&completed.metrics, "infection.infected")?;
        let events = Self::metric(&completed.metrics, "infection.infected_events")?;
        let population = completed.world.population_size() as f64;
        let fraction = infected / population;
        check(events > 0.0, || "no new infections recorded".to_string())?;
        check((0.05..0.95).contains(&fraction), || {
            format!("infected fraction {:.3} is not endemic", fraction)
        })
    }

    fn check_mortality(&self, completed: &Completed) -> Result<(), String> {
        let deaths = Self::metric(&completed.metrics, "deaths")?;
        let n = completed.world.population_size();
        let expected = 1.0 - (-MORTALITY_RATE * Self::elapsed_years(completed)).exp();
        let observed = deaths / n as f64;
        let allowed = tolerance(expected, n);
        info!(observed, expected, "mortality");
        check((observed - expected).abs() <= allowed, || {
            format!("death fraction {:.4} differs from {:.4} by more than {:.4}", observed, expected, allowed)
        })
    }

    fn check_risk_paf(&self, completed: &Completed) -> Result<(), String> {
        let frame = completed.world.snapshot();
        let states = frame.categories("chronic").map_err(|e| e.to_string())?;
        let exposure = frame.categories("smoking_exposure").map_err(|e| e.to_string())?;

        let mut cases = [0usize; 2];
        let mut totals = [0usize; 2];
        for (state, category) in states.iter().zip(exposure) {
            let group = usize::from(category != "exposed");
            totals[group] += 1;
            if state == "with_condition" {
                cases[group] += 1;
            }
        }
        let risk = |g: usize| cases[g] as f64 / totals[g].max(1) as f64;
        check(risk(0) > risk(1), || {
            format!("exposed risk {:.4} not above unexposed {:.4}", risk(0), risk(1))
        })?;

        let t = Self::elapsed_years(completed);
        let mean_rr = RISK_EXPOSED_PREVALENCE * RISK_RELATIVE_RISK + (1.0 - RISK_EXPOSED_PREVALENCE);
        let expected = RISK_EXPOSED_PREVALENCE * (1.0 - (-RISK_BASE_INCIDENCE * RISK_RELATIVE_RISK / mean_rr * t).exp())
            + (1.0 - RISK_EXPOSED_PREVALENCE) * (1.0 - (-RISK_BASE_INCIDENCE / mean_rr * t).exp());
        let n = states.len();
        let observed = (cases[0] + cases[1]) as f64 / n.max(1) as f64;
        let allowed = tolerance(expected, n);
        check((observed - expected).abs() <= allowed, || {
            format!("overall risk {:.4} differs from {:.4} by more than {:.4}", observed, expected, allowed)
        })
    }
}
