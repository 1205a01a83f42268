//! VitalSim Core - Discrete-Time Microsimulation Kernel
//!
//! This library runs agent-based population health models. A simulation is a
//! population table advanced in fixed calendar steps by components that never
//! call each other directly:
//! 1. **State**: a columnar population table read and written through views
//! 2. **Control flow**: named event channels with priority-ordered listeners
//! 3. **Quantities**: value pipelines (a source plus ordered modifiers) that
//!    let one component adjust another's rates without knowing about it
//! 4. **Randomness**: common random numbers keyed by stream, time and
//!    simulant, so two runs that differ in one component see the same draws
//!    everywhere else
//!
//! # Example
//!
//! ```ignore
//! use vitalsim_core::components::{BasePopulation, Mortality};
//! use vitalsim_core::run_simulation;
//!
//! let metrics = run_simulation(
//!     vec![Box::new(BasePopulation::default()), Box::new(Mortality::new())],
//!     None,
//! )?;
//! println!("deaths: {}", metrics["deaths"]);
//! ```

pub mod builder;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lookup;
pub mod population;
pub mod randomness;
pub mod rates;
pub mod state_machine;
pub mod values;

// Re-export key types for convenience
pub use builder::{Builder, Component};
pub use config::{ConfigTree, ConfigurationError};
pub use engine::{run_simulation, SimulationContext, METRICS_PIPELINE};
pub use error::{Result, SimulationError};
pub use events::{Event, EventError, EventManager};
pub use lookup::{DataTable, LookupError, LookupSpec, LookupTable, LookupTableManager, TableData};
pub use population::{Column, Frame, PopulationError, PopulationManager, PopulationView, Query, ResourceError, SimulantData};
pub use randomness::{RandomnessError, RandomnessManager, RandomnessStream, Weight, RESIDUAL_CHOICE};
pub use state_machine::{Machine, ProbabilitySpec, State, Transition, TransitionError, TransitionSet};
pub use values::{DynamicValueError, Metrics, Pipeline, ValuesManager};
