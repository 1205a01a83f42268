//! Core clock trait shared by every kernel subsystem.

use crate::types::{SimTime, StepSize};

/// The central interface for simulated time.
///
/// This trait abstracts "when are we" so that the population manager,
/// randomness streams, lookup tables and value pipelines all observe the same
/// instant without holding a reference to the engine.
///
/// # Implementations
///
/// - **Calendar**: `CalendarContext` - calendar timestamps with a fixed step
///
/// # Determinism
///
/// Implementations never consult the wall clock. Time moves only when
/// `advance` is called, so two runs with the same configuration observe the
/// same sequence of instants.
pub trait RunContext {
    /// Returns the current simulated instant.
    fn now(&self) -> SimTime;

    /// Returns the fixed duration of one time step.
    fn step_size(&self) -> StepSize;

    /// Returns the master seed for this run.
    ///
    /// Randomness streams mix this into every draw key.
    fn seed(&self) -> u64;

    /// Moves the clock forward by one step.
    fn advance(&self);

    /// Returns the number of completed steps.
    fn step_count(&self) -> u64;

    /// Returns the instant the current step advances to.
    ///
    /// Listeners on `time_step` treat this as the time at which the changes
    /// they make take effect.
    fn next_time(&self) -> SimTime {
        self.now() + self.step_size()
    }
}
