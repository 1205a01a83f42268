//! SimWorld - The simulation harness container.

use serde_yaml::{Mapping, Value};
use vitalsim_core::{Component, Frame, Metrics, SimulationContext, SimulationError};
use vitalsim_env::SimTime;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of simulants in the initial population
    pub population_size: usize,

    /// Step size in days
    pub step_days: f64,

    /// Calendar year the run starts in (on January 1st)
    pub start_year: i32,

    /// Run length in whole years
    pub years: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            population_size: 1_000,
            step_days: 30.5,
            start_year: 2005,
            years: 5,
        }
    }
}

fn mapping(entries: Vec<(&str, Value)>) -> Value {
    let mut map = Mapping::new();
    for (key, value) in entries {
        map.insert(Value::String(key.to_string()), value);
    }
    Value::Mapping(map)
}

fn ymd(year: i32) -> Value {
    mapping(vec![
        ("year", Value::from(year)),
        ("month", Value::from(1)),
        ("day", Value::from(1)),
    ])
}

impl SimConfig {
    /// Seed for the demographic generator, independent of the kernel's
    /// randomness streams so adding components never changes who is born.
    pub fn demography_seed(&self) -> u64 {
        self.seed.wrapping_mul(0x9e3779b97f4a7c15)
    }

    /// The `override` configuration layer for this run.
    pub fn to_overrides(&self) -> Value {
        mapping(vec![
            (
                "time",
                mapping(vec![
                    ("start", ymd(self.start_year)),
                    ("end", ymd(self.start_year + self.years as i32)),
                    ("step_size", Value::from(self.step_days)),
                ]),
            ),
            ("randomness", mapping(vec![("random_seed", Value::from(self.seed))])),
            (
                "population",
                mapping(vec![("population_size", Value::from(self.population_size as u64))]),
            ),
        ])
    }

    /// Merges `extra` over the generated overrides, key by key.
    pub fn overrides_with(&self, extra: &Value) -> Value {
        let mut base = self.to_overrides();
        merge(&mut base, extra);
        base
    }
}

fn merge(base: &mut Value, extra: &Value) {
    match (base, extra) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(extra)) => {
            for (key, value) in extra {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, extra) => *base = extra.clone(),
    }
}

/// The SimWorld - one simulation plus its harness bookkeeping.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    simulation: SimulationContext,

    /// Steps taken so far
    tick_count: u64,
}

impl SimWorld {
    /// Builds and sets up a simulation over `components`.
    pub fn new(config: SimConfig, components: Vec<Box<dyn Component>>) -> Result<Self, SimulationError> {
        Self::with_overrides(config, components, &Value::Null)
    }

    /// Like `new`, with extra configuration merged over the run settings.
    pub fn with_overrides(
        config: SimConfig,
        components: Vec<Box<dyn Component>>,
        extra: &Value,
    ) -> Result<Self, SimulationError> {
        let overrides = config.overrides_with(extra);
        let mut simulation = SimulationContext::new(components, Some(&overrides))?;
        simulation.setup()?;
        Ok(Self {
            config,
            simulation,
            tick_count: 0,
        })
    }

    /// Creates the initial population.
    pub fn populate(&mut self) -> Result<usize, SimulationError> {
        Ok(self.simulation.initialize_simulants()?.len())
    }

    /// Advances the simulation by one step.
    pub fn tick(&mut self) -> Result<(), SimulationError> {
        self.simulation.step()?;
        self.tick_count += 1;
        Ok(())
    }

    /// Returns true once the clock has reached the configured end.
    pub fn is_finished(&self) -> bool {
        self.simulation.now() >= self.simulation.end_time()
    }

    /// Runs the remaining steps and evaluates the final metrics.
    pub fn run_to_end(&mut self) -> Result<Metrics, SimulationError> {
        while !self.is_finished() {
            self.tick()?;
        }
        self.simulation.finalize()
    }

    /// Returns the current simulated instant.
    pub fn time(&self) -> SimTime {
        self.simulation.now()
    }

    /// Returns the number of steps taken.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns the number of simulants ever created.
    pub fn population_size(&self) -> usize {
        self.simulation.population().len()
    }

    /// Copies the whole population table.
    pub fn snapshot(&self) -> Frame {
        self.simulation.population().snapshot()
    }

    pub fn simulation(&self) -> &SimulationContext {
        &self.simulation
    }
}
