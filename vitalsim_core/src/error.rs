//! Kernel-wide error type.
//!
//! Every subsystem owns a focused error enum; `SimulationError` wraps them so
//! that callbacks crossing subsystem boundaries (pipeline sources, event
//! listeners, simulant initializers) can propagate any failure with `?`.
//! Nothing in the kernel catches and continues past one of these.

use thiserror::Error;
use vitalsim_env::EnvError;

use crate::config::ConfigurationError;
use crate::events::EventError;
use crate::lookup::LookupError;
use crate::population::{PopulationError, ResourceError};
use crate::randomness::RandomnessError;
use crate::state_machine::TransitionError;
use crate::values::DynamicValueError;

/// Kernel result type
pub type Result<T> = std::result::Result<T, SimulationError>;

/// Any failure raised while setting up or running a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Randomness(#[from] RandomnessError),

    #[error(transparent)]
    Population(#[from] PopulationError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Value(#[from] DynamicValueError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Env(#[from] EnvError),

    /// A non-finite value appeared in a rate, probability or lookup result.
    #[error("numeric error in {context}: {message}")]
    Numeric { context: String, message: String },

    /// The engine was driven out of order (e.g. stepping before setup).
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// A component rejected its own configuration or inputs.
    #[error("component {component}: {message}")]
    Component { component: String, message: String },
}

impl SimulationError {
    /// Creates a numeric error.
    pub fn numeric(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Numeric {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Creates a component error.
    pub fn component(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Fails with `SimulationError::Numeric` if any value is NaN or infinite.
pub fn ensure_finite(context: &str, values: &[f64]) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(pos) => Err(SimulationError::numeric(
            context,
            format!("non-finite value {} at position {}", values[pos], pos),
        )),
        None => Ok(()),
    }
}
