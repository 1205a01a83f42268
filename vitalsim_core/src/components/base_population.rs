//! Demographic core of every model.
//!
//! Creates `age` (years), `sex`, `alive` and `entrance_time` for new
//! simulants and ages the living once per step. Where the ages and sexes
//! come from is delegated to a [`PopulationGenerator`].

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;
use vitalsim_env::years;

use super::{AGE, ALIVE, ENTRANCE_TIME, SEX};
use crate::builder::{Builder, Component};
use crate::error::{Result, SimulationError};
use crate::events::TIME_STEP;
use crate::population::{Column, SimulantData};
use crate::randomness::{RandomnessStream, Weight};

/// Listener priority for aging; after most step logic.
pub const AGING_PRIORITY: usize = 8;

/// Ages and sexes for a batch of new simulants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Demographics {
    pub age: Vec<f64>,
    pub sex: Vec<String>,
}

/// Source of demographic attributes for new simulants.
///
/// `user_data` carries `age_start` and `age_end` (years) when the caller
/// supplies an age range.
pub trait PopulationGenerator {
    /// Acquires whatever the generator needs from the simulation.
    fn setup(&mut self, _builder: &mut Builder<'_>) -> Result<()> {
        Ok(())
    }

    fn generate(&mut self, data: &SimulantData) -> Result<Demographics>;
}

fn age_range(data: &SimulantData) -> (f64, f64) {
    let start = data.user_data.get("age_start").copied().unwrap_or(0.0);
    let end = data.user_data.get("age_end").copied().unwrap_or(start);
    (start, end.max(start))
}

/// Uniform ages within the requested range and an even sex split, both
/// drawn from common random numbers.
#[derive(Debug, Default)]
pub struct UniformGenerator {
    streams: Option<(RandomnessStream, RandomnessStream)>,
}

impl PopulationGenerator for UniformGenerator {
    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.streams = Some((builder.get_stream("population.age")?, builder.get_stream("population.sex")?));
        Ok(())
    }

    fn generate(&mut self, data: &SimulantData) -> Result<Demographics> {
        let (age_stream, sex_stream) = self
            .streams
            .as_ref()
            .ok_or_else(|| SimulationError::component("base_population", "generator used before setup"))?;
        let (start, end) = age_range(data);
        let age = age_stream
            .get_draw(&data.index)
            .into_iter()
            .map(|u| start + u * (end - start))
            .collect();
        let sex = sex_stream.choice(
            &data.index,
            &["Female".to_string(), "Male".to_string()],
            &[Weight::Fixed(0.5), Weight::Fixed(0.5)],
        )?;
        Ok(Demographics { age, sex })
    }
}

/// Creates the demographic columns and ages living simulants each step.
pub struct BasePopulation {
    generator: Rc<RefCell<dyn PopulationGenerator>>,
}

impl std::fmt::Debug for BasePopulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasePopulation").finish_non_exhaustive()
    }
}

impl Default for BasePopulation {
    fn default() -> Self {
        Self::new(UniformGenerator::default())
    }
}

impl BasePopulation {
    pub fn new<G: PopulationGenerator + 'static>(generator: G) -> Self {
        Self {
            generator: Rc::new(RefCell::new(generator)),
        }
    }
}

impl Component for BasePopulation {
    fn name(&self) -> String {
        "base_population".to_string()
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        self.generator.borrow_mut().setup(builder)?;

        let columns = [AGE, SEX, ALIVE, ENTRANCE_TIME];
        let view = builder.get_view(&columns, None)?;
        let generator = Rc::clone(&self.generator);
        builder.register_simulant_initializer("base_population", &columns, &[], move |data| {
            let n = data.index.len();
            let demographics = generator.borrow_mut().generate(data)?;
            if demographics.age.len() != n || demographics.sex.len() != n {
                return Err(SimulationError::component(
                    "base_population",
                    format!(
                        "generator returned {} ages and {} sexes for {} simulants",
                        demographics.age.len(),
                        demographics.sex.len(),
                        n
                    ),
                ));
            }
            view.update_column(AGE, &data.index, Column::Float(demographics.age))?;
            view.update_column(SEX, &data.index, Column::Category(demographics.sex))?;
            view.update_column(ALIVE, &data.index, Column::Bool(vec![true; n]))?;
            view.update_column(ENTRANCE_TIME, &data.index, Column::Time(vec![Some(data.creation_time); n]))?;
            Ok(())
        });

        let living = builder.get_view(&[AGE], Some(ALIVE))?;
        builder.register_event_listener(TIME_STEP, AGING_PRIORITY, move |event| {
            let frame = living.get(&event.index)?;
            let step = years(event.step_size);
            let aged: Vec<f64> = frame.floats(AGE)?.iter().map(|a| a + step).collect();
            debug!(simulants = frame.len(), "aging population");
            living.update_column(AGE, frame.index(), Column::Float(aged))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulationContext;
    use approx::assert_relative_eq;

    fn simulation(components: Vec<Box<dyn Component>>) -> SimulationContext {
        let config = serde_yaml::from_str(
            "population: {population_size: 1000, age_start: 20, age_end: 40}\ntime: {step_size: 36.5}",
        )
        .unwrap();
        let mut sim = SimulationContext::new(components, Some(&config)).unwrap();
        sim.setup().unwrap();
        sim
    }

    #[test]
    fn test_initial_columns() {
        let mut sim = simulation(vec![Box::new(BasePopulation::default())]);
        let index = sim.initialize_simulants().unwrap();
        let frame = sim.population().snapshot();
        assert_eq!(frame.len(), 1000);

        let ages = frame.floats(AGE).unwrap();
        assert!(ages.iter().all(|a| (20.0..=40.0).contains(a)));
        let females = frame.categories(SEX).unwrap().iter().filter(|s| *s == "Female").count();
        assert!((400..600).contains(&females));
        assert!(frame.bools(ALIVE).unwrap().iter().all(|a| *a));
        assert!(frame.times(ENTRANCE_TIME).unwrap().iter().all(|t| *t == Some(sim.start_time())));
        assert_eq!(index.len(), 1000);
    }

    #[test]
    fn test_only_living_age() {
        let mut sim = simulation(vec![Box::new(BasePopulation::default())]);
        sim.initialize_simulants().unwrap();
        let before = sim.population().snapshot();

        let view = sim.population().get_view(&[ALIVE], None).unwrap();
        view.update_column(ALIVE, &[0], Column::Bool(vec![false])).unwrap();
        sim.step().unwrap();

        let after = sim.population().snapshot();
        let (old, new) = (before.floats(AGE).unwrap(), after.floats(AGE).unwrap());
        assert_eq!(old[0], new[0]);
        assert_relative_eq!(new[1] - old[1], 0.1, epsilon = 1e-12);
    }

    struct FixedAges;

    impl PopulationGenerator for FixedAges {
        fn generate(&mut self, data: &SimulantData) -> Result<Demographics> {
            Ok(Demographics {
                age: vec![50.0; data.index.len()],
                sex: vec!["Male".to_string(); data.index.len() + 1],
            })
        }
    }

    #[test]
    fn test_generator_length_checked() {
        let mut sim = simulation(vec![Box::new(BasePopulation::new(FixedAges))]);
        assert!(matches!(
            sim.initialize_simulants(),
            Err(SimulationError::Component { .. })
        ));
    }
}
