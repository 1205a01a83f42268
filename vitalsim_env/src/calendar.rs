//! Calendar implementation of RunContext.

use crate::context::RunContext;
use crate::error::EnvError;
use crate::types::{date, duration_from_days, SimTime, StepSize};
use std::cell::Cell;
use std::rc::Rc;

/// Simulation clock backed by calendar timestamps.
///
/// This is the clock every run uses. Time starts at a configured instant and
/// moves forward by a fixed step each time the engine calls `advance`.
#[derive(Debug)]
pub struct CalendarContext {
    /// Master seed for this run
    seed: u64,

    /// First instant of the run
    start: SimTime,

    /// Current simulated instant
    current: Cell<SimTime>,

    /// Fixed step size
    step_size: StepSize,

    /// Completed steps
    steps: Cell<u64>,
}

impl CalendarContext {
    /// Creates a clock starting at `start` with the given step size and seed.
    pub fn new(start: SimTime, step_size: StepSize, seed: u64) -> Self {
        Self {
            seed,
            start,
            current: Cell::new(start),
            step_size,
            steps: Cell::new(0),
        }
    }

    /// Creates a clock from a calendar date and a step size in days.
    pub fn from_ymd(
        year: i32,
        month: u32,
        day: u32,
        step_days: f64,
        seed: u64,
    ) -> Result<Self, EnvError> {
        Ok(Self::new(
            date(year, month, day)?,
            duration_from_days(step_days)?,
            seed,
        ))
    }

    /// Creates an Rc-wrapped clock for sharing across subsystems.
    pub fn shared(start: SimTime, step_size: StepSize, seed: u64) -> Rc<Self> {
        Rc::new(Self::new(start, step_size, seed))
    }

    /// Returns the first instant of the run.
    pub fn start(&self) -> SimTime {
        self.start
    }

    /// Sets the current instant directly.
    ///
    /// Used when restoring a run from a snapshot.
    pub fn set_time(&self, time: SimTime) {
        self.current.set(time);
    }
}

impl RunContext for CalendarContext {
    fn now(&self) -> SimTime {
        self.current.get()
    }

    fn step_size(&self) -> StepSize {
        self.step_size
    }

    fn seed(&self) -> u64 {
        self.seed
    }

    fn advance(&self) {
        self.current.set(self.current.get() + self.step_size);
        self.steps.set(self.steps.get() + 1);
    }

    fn step_count(&self) -> u64 {
        self.steps.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::days;

    #[test]
    fn test_calendar_context_time() {
        let ctx = CalendarContext::from_ymd(2000, 1, 1, 1.0, 42).unwrap();
        assert_eq!(ctx.now(), date(2000, 1, 1).unwrap());

        ctx.advance();
        assert_eq!(ctx.now(), date(2000, 1, 2).unwrap());
        assert_eq!(ctx.step_count(), 1);

        ctx.advance();
        assert_eq!(ctx.now(), date(2000, 1, 3).unwrap());
        assert_eq!(ctx.next_time(), date(2000, 1, 4).unwrap());
    }

    #[test]
    fn test_calendar_context_seed() {
        let ctx = CalendarContext::from_ymd(2000, 1, 1, 30.5, 12345).unwrap();
        assert_eq!(ctx.seed(), 12345);
        assert_eq!(days(ctx.step_size()), 30.5);
    }

    #[test]
    fn test_shared_context_sees_same_time() {
        let ctx = CalendarContext::shared(date(2010, 6, 1).unwrap(), duration_from_days(7.0).unwrap(), 1);
        let other = Rc::clone(&ctx);

        ctx.advance();
        assert_eq!(ctx.now(), other.now());
        assert_eq!(other.now(), date(2010, 6, 8).unwrap());
    }

    #[test]
    fn test_set_time() {
        let ctx = CalendarContext::from_ymd(2000, 1, 1, 1.0, 0).unwrap();
        ctx.set_time(date(2003, 3, 3).unwrap());
        assert_eq!(ctx.now(), date(2003, 3, 3).unwrap());
        assert_eq!(ctx.start(), date(2000, 1, 1).unwrap());
    }
}
