//! Seeded demographic generator for harness populations.
//!
//! Draws ages from a normal distribution truncated to the requested age
//! range and assigns sex with equal probability. The generator owns its own
//! RNG, seeded separately from the kernel's randomness streams, so the
//! population a scenario starts from does not depend on which other
//! components are present.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use vitalsim_core::components::{Demographics, PopulationGenerator};
use vitalsim_core::{Result, SimulantData, SimulationError};

/// Default mean age in years.
pub const DEFAULT_MEAN_AGE: f64 = 40.0;

/// Default age standard deviation in years.
pub const DEFAULT_AGE_STD: f64 = 20.0;

/// Normal ages clamped to the requested range, 50/50 sex split.
#[derive(Debug, Clone)]
pub struct DemographyGenerator {
    /// Seed the RNG was created from
    seed: u64,

    rng: ChaCha8Rng,

    mean_age: f64,

    age_std: f64,
}

impl DemographyGenerator {
    /// Creates a generator with the default age distribution.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            mean_age: DEFAULT_MEAN_AGE,
            age_std: DEFAULT_AGE_STD,
        }
    }

    /// Sets the untruncated age distribution.
    pub fn with_age_distribution(mut self, mean: f64, std_dev: f64) -> Self {
        self.mean_age = mean;
        self.age_std = std_dev;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn sample_ages(&mut self, count: usize, start: f64, end: f64) -> Result<Vec<f64>> {
        if end <= start {
            return Ok(vec![start; count]);
        }
        let normal = Normal::new(self.mean_age, self.age_std)
            .map_err(|e| SimulationError::component("demography", e.to_string()))?;
        Ok((0..count)
            .map(|_| normal.sample(&mut self.rng).clamp(start, end))
            .collect())
    }
}

impl PopulationGenerator for DemographyGenerator {
    fn generate(&mut self, data: &SimulantData) -> Result<Demographics> {
        let count = data.index.len();
        let start = data.user_data.get("age_start").copied().unwrap_or(0.0);
        let end = data.user_data.get("age_end").copied().unwrap_or(start);

        let age = self.sample_ages(count, start, end)?;
        let sex = (0..count)
            .map(|_| if self.rng.gen_bool(0.5) { "Female" } else { "Male" }.to_string())
            .collect();
        Ok(Demographics { age, sex })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use proptest::prelude::*;
    use vitalsim_env::{date, duration_from_days};

    fn data(count: usize, start: f64, end: f64) -> SimulantData {
        let mut user_data = IndexMap::new();
        user_data.insert("age_start".to_string(), start);
        user_data.insert("age_end".to_string(), end);
        SimulantData {
            index: (0..count).collect(),
            creation_time: date(2000, 1, 1).unwrap(),
            creation_window: duration_from_days(30.5).unwrap(),
            user_data,
        }
    }

    #[test]
    fn test_deterministic_population() {
        let mut a = DemographyGenerator::new(7);
        let mut b = DemographyGenerator::new(7);
        assert_eq!(a.generate(&data(100, 0.0, 100.0)).unwrap(), b.generate(&data(100, 0.0, 100.0)).unwrap());

        let mut c = DemographyGenerator::new(8);
        assert_ne!(a.generate(&data(100, 0.0, 100.0)).unwrap(), c.generate(&data(100, 0.0, 100.0)).unwrap());
    }

    #[test]
    fn test_newborns() {
        let mut generator = DemographyGenerator::new(1);
        let born = generator.generate(&data(10, 0.0, 0.0)).unwrap();
        assert!(born.age.iter().all(|a| *a == 0.0));
    }

    #[test]
    fn test_mean_age() {
        let mut generator = DemographyGenerator::new(3).with_age_distribution(50.0, 5.0);
        let generated = generator.generate(&data(5_000, 0.0, 125.0)).unwrap();
        let mean = generated.age.iter().sum::<f64>() / 5_000.0;
        assert!((mean - 50.0).abs() < 0.5);
        let females = generated.sex.iter().filter(|s| *s == "Female").count();
        assert!((2_300..2_700).contains(&females));
    }

    proptest! {
        #[test]
        fn prop_ages_within_range(seed in any::<u64>(), start in 0.0f64..60.0, width in 0.0f64..60.0, count in 1usize..200) {
            let mut generator = DemographyGenerator::new(seed);
            let generated = generator.generate(&data(count, start, start + width)).unwrap();
            prop_assert_eq!(generated.age.len(), count);
            prop_assert_eq!(generated.sex.len(), count);
            prop_assert!(generated.age.iter().all(|a| *a >= start && *a <= start + width));
        }
    }
}
