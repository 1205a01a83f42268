//! Error types for the VitalSim environment abstraction.

use thiserror::Error;

/// Errors that can occur while building or driving a simulated clock.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A calendar date could not be constructed.
    #[error("Invalid date: {year}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },

    /// The step size is zero, negative or not finite.
    #[error("Invalid step size: {0} days")]
    InvalidStepSize(f64),

    /// Advancing the clock left the representable calendar range.
    #[error("Time overflow: cannot add {days} days to {time}")]
    TimeOverflow { time: String, days: f64 },
}

impl EnvError {
    /// Creates an invalid step size error.
    pub fn step_size(days: f64) -> Self {
        Self::InvalidStepSize(days)
    }
}
