//! Component protocol.
//!
//! Components never look each other up. During setup each one receives a
//! [`Builder`] and uses it to declare columns, listeners, pipelines and
//! randomness streams; the managers wire those declarations together.

use std::rc::Rc;

use vitalsim_env::RunContext;

use crate::config::ConfigTree;
use crate::error::Result;
use crate::events::{Event, EventManager};
use crate::lookup::{LookupError, LookupSpec, LookupTable, LookupTableManager, TableData};
use crate::population::{PopulationError, PopulationManager, PopulationView, SimulantData};
use crate::randomness::{RandomnessError, RandomnessManager, RandomnessStream};
use crate::values::ValuesManager;

/// A unit of simulation logic.
pub trait Component {
    /// Unique name, used in logs and error messages.
    fn name(&self) -> String;

    /// Defaults merged into the `component_configs` layer when the component
    /// is added to a simulation.
    fn configuration_defaults(&self) -> Option<serde_yaml::Value> {
        None
    }

    /// Registers everything the component needs.
    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()>;
}

/// Registration surface handed to `Component::setup`.
pub struct Builder<'a> {
    configuration: &'a ConfigTree,
    context: Rc<dyn RunContext>,
    population: &'a PopulationManager,
    events: &'a EventManager,
    values: &'a ValuesManager,
    randomness: &'a RandomnessManager,
    lookup: &'a LookupTableManager,
    pending: Vec<Box<dyn Component>>,
}

impl<'a> Builder<'a> {
    pub fn new(
        configuration: &'a ConfigTree,
        context: Rc<dyn RunContext>,
        population: &'a PopulationManager,
        events: &'a EventManager,
        values: &'a ValuesManager,
        randomness: &'a RandomnessManager,
        lookup: &'a LookupTableManager,
    ) -> Self {
        Self {
            configuration,
            context,
            population,
            events,
            values,
            randomness,
            lookup,
            pending: Vec::new(),
        }
    }

    pub fn configuration(&self) -> &ConfigTree {
        self.configuration
    }

    pub fn context(&self) -> Rc<dyn RunContext> {
        Rc::clone(&self.context)
    }

    pub fn population(&self) -> &PopulationManager {
        self.population
    }

    pub fn events(&self) -> &EventManager {
        self.events
    }

    pub fn values(&self) -> &ValuesManager {
        self.values
    }

    pub fn randomness(&self) -> &RandomnessManager {
        self.randomness
    }

    pub fn lookup(&self) -> &LookupTableManager {
        self.lookup
    }

    /// Queues a sub-component; it is set up after the current one.
    pub fn add_component(&mut self, component: Box<dyn Component>) {
        self.pending.push(component);
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Box<dyn Component>> {
        std::mem::take(&mut self.pending)
    }

    pub fn get_view(&self, columns: &[&str], query: Option<&str>) -> std::result::Result<PopulationView, PopulationError> {
        self.population.get_view(columns, query)
    }

    pub fn get_stream(&self, key: &str) -> std::result::Result<RandomnessStream, RandomnessError> {
        self.randomness.get_stream(key)
    }

    pub fn register_simulant_initializer<F>(&self, name: &str, creates: &[&str], requires: &[&str], func: F)
    where
        F: FnMut(&SimulantData) -> Result<()> + 'static,
    {
        self.population.register_simulant_initializer(name, creates, requires, func);
    }

    pub fn register_event_listener<F>(&self, label: &str, priority: usize, listener: F) -> Result<()>
    where
        F: FnMut(&Event) -> Result<()> + 'static,
    {
        self.events.register_listener(Some(label), priority, listener)?;
        Ok(())
    }

    pub fn build_lookup_table(&self, data: impl Into<TableData>, spec: LookupSpec) -> std::result::Result<LookupTable, LookupError> {
        self.lookup.build_table(data, spec)
    }
}
