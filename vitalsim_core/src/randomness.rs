//! The Randomness Engine - common random numbers
//!
//! Draws are a pure function of (stream key, simulated time, master seed,
//! simulant identity, optional additional key). There is no shared generator
//! whose position depends on who asked first, so two scenarios that differ
//! only in one component make identical stochastic decisions everywhere else.
//!
//! # Derivation
//!
//! ```text
//! SHA-256(key "_" time "_" seed "_" additional_key)  ->  ChaCha8 seed
//! ChaCha8Rng::from_seed(seed).set_stream(simulant)    ->  uniform [0, 1)
//! ```

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use thiserror::Error;
use vitalsim_env::RunContext;

use crate::rates::rate_to_probability;

/// Randomness errors
#[derive(Debug, Error)]
pub enum RandomnessError {
    #[error("randomness stream {0} already exists")]
    DuplicateStream(String),

    #[error("stream {stream}: choice weights sum to {total} (> 1) for simulant {simulant}")]
    WeightsExceedOne {
        stream: String,
        simulant: usize,
        total: f64,
    },

    #[error("stream {stream}: choice weights sum to zero for simulant {simulant}")]
    ZeroWeights { stream: String, simulant: usize },

    #[error("stream {0}: at most one residual choice is allowed per weight set")]
    MultipleResiduals(String),

    #[error("stream {stream}: {choices} choices but {weights} weights")]
    ShapeMismatch {
        stream: String,
        choices: usize,
        weights: usize,
    },

    #[error("stream {stream}: expected {expected} values aligned to the index, got {actual}")]
    Misaligned {
        stream: String,
        expected: usize,
        actual: usize,
    },

    #[error("stream {stream}: invalid weight {value} for simulant {simulant}")]
    InvalidWeight {
        stream: String,
        simulant: usize,
        value: f64,
    },
}

/// One entry of a weight vector passed to [`RandomnessStream::choice`].
#[derive(Debug, Clone, PartialEq)]
pub enum Weight {
    /// Same weight for every simulant
    Fixed(f64),
    /// One weight per simulant, aligned with the index
    PerSimulant(Vec<f64>),
    /// Whatever mass the other weights leave over
    Residual,
}

/// Sentinel meaning "the probability mass the explicit weights leave over".
pub const RESIDUAL_CHOICE: Weight = Weight::Residual;

/// Probabilities for filtering, either shared or per simulant.
#[derive(Debug, Clone, Copy)]
pub enum Probability<'a> {
    Uniform(f64),
    PerSimulant(&'a [f64]),
}

impl From<f64> for Probability<'_> {
    fn from(p: f64) -> Self {
        Probability::Uniform(p)
    }
}

impl<'a> From<&'a [f64]> for Probability<'a> {
    fn from(p: &'a [f64]) -> Self {
        Probability::PerSimulant(p)
    }
}

impl<'a> From<&'a Vec<f64>> for Probability<'a> {
    fn from(p: &'a Vec<f64>) -> Self {
        Probability::PerSimulant(p.as_slice())
    }
}

impl Probability<'_> {
    fn at(&self, position: usize) -> f64 {
        match self {
            Probability::Uniform(p) => *p,
            Probability::PerSimulant(values) => values[position],
        }
    }

    fn check_len(&self, stream: &str, expected: usize) -> Result<(), RandomnessError> {
        match self {
            Probability::PerSimulant(values) if values.len() != expected => Err(RandomnessError::Misaligned {
                stream: stream.to_string(),
                expected,
                actual: values.len(),
            }),
            _ => Ok(()),
        }
    }
}

/// Hands out uniquely keyed randomness streams.
pub struct RandomnessManager {
    context: Rc<dyn RunContext>,
    keys: RefCell<HashSet<String>>,
}

impl RandomnessManager {
    /// Creates a manager drawing its seed and clock from `context`.
    pub fn new(context: Rc<dyn RunContext>) -> Self {
        Self {
            context,
            keys: RefCell::new(HashSet::new()),
        }
    }

    /// Returns a new stream for `key`. Each key may be claimed once.
    pub fn get_stream(&self, key: &str) -> Result<RandomnessStream, RandomnessError> {
        if !self.keys.borrow_mut().insert(key.to_string()) {
            return Err(RandomnessError::DuplicateStream(key.to_string()));
        }
        Ok(RandomnessStream::new(key, Rc::clone(&self.context)))
    }

    /// Returns the master seed.
    pub fn seed(&self) -> u64 {
        self.context.seed()
    }
}

/// A keyed source of replayable per-simulant draws.
#[derive(Clone)]
pub struct RandomnessStream {
    key: String,
    context: Rc<dyn RunContext>,
}

impl std::fmt::Debug for RandomnessStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomnessStream")
            .field("key", &self.key)
            .field("seed", &self.context.seed())
            .finish()
    }
}

impl RandomnessStream {
    /// Creates a stream directly; prefer `RandomnessManager::get_stream`.
    pub fn new(key: &str, context: Rc<dyn RunContext>) -> Self {
        Self {
            key: key.to_string(),
            context,
        }
    }

    /// Returns the stream key.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn draw_seed(&self, additional_key: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(b"_");
        hasher.update(self.context.now().format("%Y-%m-%dT%H:%M:%S%.f").to_string().as_bytes());
        hasher.update(b"_");
        hasher.update(self.context.seed().to_le_bytes());
        hasher.update(b"_");
        hasher.update(additional_key.as_bytes());
        let digest = hasher.finalize();

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        seed
    }

    /// Returns one uniform [0, 1) value per simulant in `index`.
    pub fn get_draw(&self, index: &[usize]) -> Vec<f64> {
        self.get_draw_keyed(index, "")
    }

    /// Like `get_draw`, with an extra key to decorrelate several draws
    /// made by the same stream in the same step.
    pub fn get_draw_keyed(&self, index: &[usize], additional_key: &str) -> Vec<f64> {
        let seed = self.draw_seed(additional_key);
        index
            .iter()
            .map(|&simulant| {
                let mut rng = ChaCha8Rng::from_seed(seed);
                rng.set_stream(simulant as u64);
                rng.gen::<f64>()
            })
            .collect()
    }

    /// Keeps the simulants whose draw falls below their probability.
    pub fn filter_for_probability<'a>(
        &self,
        index: &[usize],
        probability: impl Into<Probability<'a>>,
    ) -> Result<Vec<usize>, RandomnessError> {
        self.filter_for_probability_keyed(index, probability, "")
    }

    /// `filter_for_probability` with an additional draw key.
    pub fn filter_for_probability_keyed<'a>(
        &self,
        index: &[usize],
        probability: impl Into<Probability<'a>>,
        additional_key: &str,
    ) -> Result<Vec<usize>, RandomnessError> {
        let probability = probability.into();
        probability.check_len(&self.key, index.len())?;
        let draws = self.get_draw_keyed(index, additional_key);
        Ok(index
            .iter()
            .zip(draws)
            .enumerate()
            .filter(|(pos, (_, draw))| *draw < probability.at(*pos))
            .map(|(_, (&simulant, _))| simulant)
            .collect())
    }

    /// Keeps simulants for whom an event with the given rate occurs.
    ///
    /// The rate is converted with `1 - e^{-rate}`; it must already be
    /// expressed per time step.
    pub fn filter_for_rate<'a>(
        &self,
        index: &[usize],
        rate: impl Into<Probability<'a>>,
    ) -> Result<Vec<usize>, RandomnessError> {
        self.filter_for_rate_keyed(index, rate, "")
    }

    /// `filter_for_rate` with an additional draw key.
    pub fn filter_for_rate_keyed<'a>(
        &self,
        index: &[usize],
        rate: impl Into<Probability<'a>>,
        additional_key: &str,
    ) -> Result<Vec<usize>, RandomnessError> {
        let probabilities: Vec<f64> = match rate.into() {
            Probability::Uniform(r) => vec![rate_to_probability(r); index.len()],
            Probability::PerSimulant(rates) => {
                if rates.len() != index.len() {
                    return Err(RandomnessError::Misaligned {
                        stream: self.key.clone(),
                        expected: index.len(),
                        actual: rates.len(),
                    });
                }
                rates.iter().map(|&r| rate_to_probability(r)).collect()
            }
        };
        self.filter_for_probability_keyed(index, &probabilities, additional_key)
    }

    /// Picks one of `choices` per simulant according to `weights`.
    ///
    /// Without a residual weight, each simulant's weights are normalized to
    /// sum to one. With `RESIDUAL_CHOICE`, the explicit weights must not
    /// exceed one and the residual takes the complement.
    pub fn choice<T: Clone>(
        &self,
        index: &[usize],
        choices: &[T],
        weights: &[Weight],
    ) -> Result<Vec<T>, RandomnessError> {
        self.choice_keyed(index, choices, weights, "")
    }

    /// `choice` with an additional draw key.
    pub fn choice_keyed<T: Clone>(
        &self,
        index: &[usize],
        choices: &[T],
        weights: &[Weight],
        additional_key: &str,
    ) -> Result<Vec<T>, RandomnessError> {
        let rows = self.choice_probabilities(index, choices.len(), weights)?;
        let draws = self.get_draw_keyed(index, additional_key);

        Ok(rows
            .iter()
            .zip(draws)
            .map(|(row, draw)| {
                let mut cumulative = 0.0;
                let mut chosen = None;
                for (pos, p) in row.iter().enumerate() {
                    cumulative += p;
                    if *p > 0.0 {
                        // Fall back to the last reachable choice if rounding
                        // leaves the cumulative sum just under the draw.
                        chosen = Some(pos);
                    }
                    if cumulative > draw {
                        break;
                    }
                }
                choices[chosen.unwrap_or(choices.len() - 1)].clone()
            })
            .collect())
    }

    fn choice_probabilities(
        &self,
        index: &[usize],
        num_choices: usize,
        weights: &[Weight],
    ) -> Result<Vec<Vec<f64>>, RandomnessError> {
        if num_choices == 0 || num_choices != weights.len() {
            return Err(RandomnessError::ShapeMismatch {
                stream: self.key.clone(),
                choices: num_choices,
                weights: weights.len(),
            });
        }

        let residuals = weights.iter().filter(|w| matches!(w, Weight::Residual)).count();
        if residuals > 1 {
            return Err(RandomnessError::MultipleResiduals(self.key.clone()));
        }
        for weight in weights {
            if let Weight::PerSimulant(values) = weight {
                if values.len() != index.len() {
                    return Err(RandomnessError::Misaligned {
                        stream: self.key.clone(),
                        expected: index.len(),
                        actual: values.len(),
                    });
                }
            }
        }

        let mut rows = Vec::with_capacity(index.len());
        for (pos, &simulant) in index.iter().enumerate() {
            let mut row: Vec<f64> = weights
                .iter()
                .map(|w| match w {
                    Weight::Fixed(v) => *v,
                    Weight::PerSimulant(values) => values[pos],
                    Weight::Residual => 0.0,
                })
                .collect();

            if let Some(bad) = row.iter().find(|v| !v.is_finite() || **v < 0.0) {
                return Err(RandomnessError::InvalidWeight {
                    stream: self.key.clone(),
                    simulant,
                    value: *bad,
                });
            }

            let total: f64 = row.iter().sum();
            if residuals == 1 {
                if total > 1.0 + 1e-9 {
                    return Err(RandomnessError::WeightsExceedOne {
                        stream: self.key.clone(),
                        simulant,
                        total,
                    });
                }
                if let Some(slot) = weights.iter().position(|w| matches!(w, Weight::Residual)) {
                    row[slot] = (1.0 - total).max(0.0);
                }
            } else {
                if total <= 0.0 {
                    return Err(RandomnessError::ZeroWeights {
                        stream: self.key.clone(),
                        simulant,
                    });
                }
                for v in row.iter_mut() {
                    *v /= total;
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }
}
