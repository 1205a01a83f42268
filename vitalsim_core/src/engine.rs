//! Simulation context and main loop.
//!
//! A run goes through four phases, each entered exactly once and in order:
//!
//! 1. **new**: engine defaults, component defaults and overrides are layered
//!    into the configuration and the clock is built from it
//! 2. **setup**: every component (and any sub-component it adds) registers
//!    with the managers, the configuration is frozen, `post_setup` fires
//! 3. **initialize_simulants**: the initial population is created
//! 4. **run / step**: `time_step__prepare`, `time_step`,
//!    `time_step__cleanup` and `collect_metrics` fire once per step until the
//!    clock reaches the end time, then **finalize** fires `simulation_end`
//!    and evaluates the `metrics` pipeline

use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_yaml::Value;
use tracing::{debug, info, warn};
use vitalsim_env::{date, duration_from_days, CalendarContext, RunContext, SimTime};

use crate::builder::{Builder, Component};
use crate::config::ConfigTree;
use crate::error::{Result, SimulationError};
use crate::events::{
    EventManager, COLLECT_METRICS, POST_SETUP, SIMULATION_END, TIME_STEP, TIME_STEP_CLEANUP, TIME_STEP_PREPARE,
};
use crate::lookup::LookupTableManager;
use crate::population::PopulationManager;
use crate::randomness::RandomnessManager;
use crate::values::{Metrics, MetricsValue, ValuesManager};

/// Name of the pipeline evaluated at the end of a run.
pub const METRICS_PIPELINE: &str = "metrics";

const ENGINE_DEFAULTS: &str = r#"
time:
  start: {year: 2005, month: 7, day: 2}
  end: {year: 2010, month: 7, day: 2}
  step_size: 30.5
randomness:
  random_seed: 0
population:
  population_size: 10000
  age_start: 0
  age_end: 125
interpolation:
  order: 1
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Created,
    SetUp,
    Initialized,
    Finished,
}

/// Owns the managers, the clock and the components of one run.
pub struct SimulationContext {
    configuration: ConfigTree,
    clock: Rc<CalendarContext>,
    end_time: SimTime,
    population: PopulationManager,
    events: EventManager,
    values: ValuesManager,
    randomness: RandomnessManager,
    lookup: LookupTableManager,
    metrics: MetricsValue,
    pending: Vec<Box<dyn Component>>,
    components: Vec<Box<dyn Component>>,
    phase: Phase,
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("now", &self.clock.now())
            .field("end_time", &self.end_time)
            .field("phase", &self.phase)
            .field("components", &self.component_names())
            .finish()
    }
}

fn apply_defaults(configuration: &mut ConfigTree, component: &dyn Component) -> Result<()> {
    if let Some(defaults) = component.configuration_defaults() {
        configuration.update(&defaults, Some("component_configs"), Some(&component.name()))?;
    }
    Ok(())
}

fn read_date(configuration: &ConfigTree, prefix: &str) -> Result<SimTime> {
    Ok(date(
        configuration.get_as(&format!("{}.year", prefix))?,
        configuration.get_as(&format!("{}.month", prefix))?,
        configuration.get_as(&format!("{}.day", prefix))?,
    )?)
}

impl SimulationContext {
    /// Creates a simulation from components and an optional override
    /// mapping (highest-priority layer).
    pub fn new(components: Vec<Box<dyn Component>>, overrides: Option<&Value>) -> Result<Self> {
        let mut configuration = ConfigTree::default();
        if let Some(overrides) = overrides {
            configuration.update(overrides, Some("override"), Some("user"))?;
        }
        Self::with_configuration(components, configuration)
    }

    /// Creates a simulation over an existing, unfrozen configuration.
    /// Engine defaults go into its `base` layer.
    pub fn with_configuration(components: Vec<Box<dyn Component>>, mut configuration: ConfigTree) -> Result<Self> {
        let defaults: Value = serde_yaml::from_str(ENGINE_DEFAULTS)
            .map_err(|e| SimulationError::Lifecycle(format!("invalid engine defaults: {}", e)))?;
        configuration.update(&defaults, Some("base"), Some("engine"))?;
        for component in &components {
            apply_defaults(&mut configuration, component.as_ref())?;
        }

        let start = read_date(&configuration, "time.start")?;
        let end_time = read_date(&configuration, "time.end")?;
        let step_size = duration_from_days(configuration.get_as("time.step_size")?)?;
        let seed: u64 = configuration.get_as("randomness.random_seed")?;
        let order: usize = configuration.get_as("interpolation.order")?;

        let clock = CalendarContext::shared(start, step_size, seed);
        let context: Rc<dyn RunContext> = clock.clone();
        let population = PopulationManager::new(Rc::clone(&context));
        let values = ValuesManager::new(Rc::clone(&context));
        let metrics = values.register_value_producer(METRICS_PIPELINE, |_| Ok(Metrics::new()))?;

        Ok(Self {
            events: EventManager::new(Rc::clone(&context)),
            randomness: RandomnessManager::new(Rc::clone(&context)),
            lookup: LookupTableManager::new(population.clone(), Rc::clone(&context), order),
            configuration,
            clock,
            end_time,
            population,
            values,
            metrics,
            pending: components,
            components: Vec::new(),
            phase: Phase::Created,
        })
    }

    fn expect_phase(&self, expected: Phase, action: &str) -> Result<()> {
        if self.phase != expected {
            return Err(SimulationError::Lifecycle(format!(
                "cannot {} in phase {:?}, expected {:?}",
                action, self.phase, expected
            )));
        }
        Ok(())
    }

    /// Sets up every component, including sub-components they add, then
    /// freezes the configuration and emits `post_setup`.
    pub fn setup(&mut self) -> Result<()> {
        self.expect_phase(Phase::Created, "set up")?;
        let context: Rc<dyn RunContext> = self.clock.clone();
        let mut queue: VecDeque<Box<dyn Component>> = std::mem::take(&mut self.pending).into();

        while let Some(mut component) = queue.pop_front() {
            let added = {
                let mut builder = Builder::new(
                    &self.configuration,
                    Rc::clone(&context),
                    &self.population,
                    &self.events,
                    &self.values,
                    &self.randomness,
                    &self.lookup,
                );
                if let Err(error) = component.setup(&mut builder) {
                    warn!(component = %component.name(), error = %error, "component setup failed");
                    return Err(error);
                }
                builder.take_pending()
            };
            for sub in added {
                apply_defaults(&mut self.configuration, sub.as_ref())?;
                queue.push_back(sub);
            }
            debug!(component = %component.name(), "component set up");
            self.components.push(component);
        }

        self.configuration.freeze();
        self.phase = Phase::SetUp;
        self.events.emit(POST_SETUP, Vec::new())?;
        info!(
            components = self.components.len(),
            pipelines = self.values.keys().len(),
            "simulation set up"
        );
        Ok(())
    }

    /// Creates the initial population from `population.population_size`.
    ///
    /// `age_start` and `age_end` are passed to initializers as user data.
    pub fn initialize_simulants(&mut self) -> Result<Vec<usize>> {
        self.expect_phase(Phase::SetUp, "initialize simulants")?;
        let size: usize = self.configuration.get_as("population.population_size")?;
        let mut user_data = IndexMap::new();
        user_data.insert("age_start".to_string(), self.configuration.get_as::<f64>("population.age_start")?);
        user_data.insert("age_end".to_string(), self.configuration.get_as::<f64>("population.age_end")?);

        let index = self.population.create_simulants(size, user_data)?;
        self.phase = Phase::Initialized;
        info!(simulants = index.len(), start = %self.clock.now(), "initial population created");
        Ok(index)
    }

    /// Runs one time step and advances the clock.
    pub fn step(&mut self) -> Result<()> {
        self.expect_phase(Phase::Initialized, "step")?;
        debug!(time = %self.clock.now(), step = self.clock.step_count(), "time step");
        for label in [TIME_STEP_PREPARE, TIME_STEP, TIME_STEP_CLEANUP, COLLECT_METRICS] {
            self.events.emit(label, self.population.index())?;
        }
        self.clock.advance();
        Ok(())
    }

    /// Steps until the clock reaches the end time. Returns the number of
    /// steps taken.
    pub fn run(&mut self) -> Result<u64> {
        let first = self.clock.step_count();
        while self.clock.now() < self.end_time {
            self.step()?;
        }
        Ok(self.clock.step_count() - first)
    }

    /// Emits `simulation_end` and evaluates the metrics pipeline.
    pub fn finalize(&mut self) -> Result<Metrics> {
        self.expect_phase(Phase::Initialized, "finalize")?;
        let index = self.population.index();
        self.events.emit(SIMULATION_END, index.clone())?;
        let metrics = self.metrics.call(&index)?;
        self.phase = Phase::Finished;

        for key in self.configuration.unused_keys() {
            warn!(key = %key, "configuration value was never read");
        }
        info!(steps = self.clock.step_count(), metrics = metrics.len(), "simulation finished");
        Ok(metrics)
    }

    pub fn configuration(&self) -> &ConfigTree {
        &self.configuration
    }

    pub fn clock(&self) -> Rc<dyn RunContext> {
        self.clock.clone()
    }

    pub fn now(&self) -> SimTime {
        self.clock.now()
    }

    pub fn start_time(&self) -> SimTime {
        self.clock.start()
    }

    pub fn end_time(&self) -> SimTime {
        self.end_time
    }

    pub fn population(&self) -> &PopulationManager {
        &self.population
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn values(&self) -> &ValuesManager {
        &self.values
    }

    pub fn randomness(&self) -> &RandomnessManager {
        &self.randomness
    }

    pub fn lookup(&self) -> &LookupTableManager {
        &self.lookup
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components
            .iter()
            .chain(self.pending.iter())
            .map(|c| c.name())
            .collect()
    }
}

/// Builds, sets up, initializes and runs a simulation to completion.
pub fn run_simulation(components: Vec<Box<dyn Component>>, overrides: Option<&Value>) -> Result<Metrics> {
    let mut simulation = SimulationContext::new(components, overrides)?;
    simulation.setup()?;
    simulation.initialize_simulants()?;
    simulation.run()?;
    simulation.finalize()
}
