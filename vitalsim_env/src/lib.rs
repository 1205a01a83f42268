//! VitalSim Environment Abstraction Layer
//!
//! This crate provides the clock abstraction every kernel subsystem reads
//! simulated time from. Nothing in the kernel asks the operating system for
//! the time or for entropy: the current instant, the step size and the master
//! seed all come from a [`RunContext`].
//!
//! # Core Concept: Replayable Time
//!
//! A run is a pure function of its configuration and seed:
//! - Time only moves when the engine calls `advance()`
//! - The step size is fixed for the lifetime of a run
//! - Randomness streams hash the current instant together with the seed
//!
//! # Example
//!
//! ```ignore
//! use vitalsim_env::{CalendarContext, RunContext};
//!
//! let ctx = CalendarContext::from_ymd(2000, 1, 1, 30.5, 42)?;
//! ctx.advance();
//! assert_eq!(ctx.step_count(), 1);
//! ```

mod calendar;
mod context;
mod error;
mod types;

pub use calendar::CalendarContext;
pub use context::RunContext;
pub use error::EnvError;
pub use types::{
    date, days, duration_from_days, fractional_year, years, SimTime, StepSize, DAYS_PER_YEAR,
};
