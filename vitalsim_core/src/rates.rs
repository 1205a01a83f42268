//! Rate and probability conversions.
//!
//! Rates are instantaneous hazards, probabilities are per-interval event
//! probabilities. The relationship is exponential, never the linear
//! approximation `p = r`.

use vitalsim_env::{days, StepSize, DAYS_PER_YEAR};

/// Converts a rate into the probability of at least one event: `1 - e^{-rate}`.
pub fn rate_to_probability(rate: f64) -> f64 {
    -(-rate).exp_m1()
}

/// Converts a probability back into a rate: `-ln(1 - p)`.
pub fn probability_to_rate(probability: f64) -> f64 {
    -(-probability).ln_1p()
}

/// Vectorized `rate_to_probability`.
pub fn rates_to_probabilities(rates: &[f64]) -> Vec<f64> {
    rates.iter().map(|&r| rate_to_probability(r)).collect()
}

/// Vectorized `probability_to_rate`.
pub fn probabilities_to_rates(probabilities: &[f64]) -> Vec<f64> {
    probabilities.iter().map(|&p| probability_to_rate(p)).collect()
}

/// Rescales an annual value to a single time step.
pub fn from_yearly(value: f64, step: StepSize) -> f64 {
    value * days(step) / DAYS_PER_YEAR
}

/// Rescales a per-step value to an annual value.
pub fn to_yearly(value: f64, step: StepSize) -> f64 {
    value * DAYS_PER_YEAR / days(step)
}
