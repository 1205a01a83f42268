//! Disease models: a state machine plus an initial prevalence.

use indexmap::IndexMap;

use super::ALIVE;
use crate::builder::{Builder, Component};
use crate::error::{Result, SimulationError};
use crate::events::{DEFAULT_PRIORITY, TIME_STEP};
use crate::population::Column;
use crate::randomness::Weight;
use crate::state_machine::{Machine, State};

/// A disease progressing through the states of a [`Machine`].
///
/// The first state is the initial state for everyone not assigned another
/// state by the initial prevalence. Only living simulants transition.
#[derive(Debug)]
pub struct DiseaseModel {
    machine: Machine,
    prevalence: IndexMap<String, f64>,
}

impl DiseaseModel {
    /// `name` is also the state column.
    pub fn new(name: &str, states: Vec<State>) -> Self {
        Self {
            machine: Machine::new(name, states),
            prevalence: IndexMap::new(),
        }
    }

    /// Fraction of the initial population starting in `state`.
    pub fn with_prevalence(mut self, state: &str, prevalence: f64) -> Self {
        self.prevalence.insert(state.to_string(), prevalence);
        self
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    fn initial_weights(&self) -> Result<(Vec<String>, Vec<Weight>)> {
        let states = self.machine.state_names();
        if states.is_empty() {
            return Err(SimulationError::component(self.name(), "disease model has no states"));
        }
        if let Some(unknown) = self.prevalence.keys().find(|s| !states.contains(*s)) {
            return Err(SimulationError::component(
                self.name(),
                format!("prevalence given for unknown state '{}'", unknown),
            ));
        }
        if self.prevalence.contains_key(&states[0]) {
            return Err(SimulationError::component(
                self.name(),
                "the initial state takes the residual prevalence",
            ));
        }
        let weights = states
            .iter()
            .enumerate()
            .map(|(i, s)| match self.prevalence.get(s) {
                _ if i == 0 => Weight::Residual,
                Some(&p) => Weight::Fixed(p),
                None => Weight::Fixed(0.0),
            })
            .collect();
        Ok((states, weights))
    }
}

impl Component for DiseaseModel {
    fn name(&self) -> String {
        self.machine.state_column().to_string()
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        let (states, weights) = self.initial_weights()?;
        self.machine.setup(builder)?;

        let column = self.machine.state_column().to_string();
        let view = builder.get_view(&[column.as_str()], None)?;
        let stream = builder.get_stream(&format!("{}.initial_states", column))?;
        builder.register_simulant_initializer(&column, &[column.as_str()], &[], {
            let column = column.clone();
            move |data| {
                let initial = stream.choice(&data.index, &states, &weights)?;
                view.update_column(&column, &data.index, Column::Category(initial))?;
                Ok(())
            }
        });

        let living = builder.get_view(&[ALIVE], Some(ALIVE))?;
        let machine = self.machine.clone();
        builder.register_event_listener(TIME_STEP, DEFAULT_PRIORITY, move |event| {
            let alive = living.get(&event.index)?;
            machine.transition(alive.index(), event)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::BasePopulation;
    use crate::engine::SimulationContext;
    use crate::state_machine::Transition;
    use chrono::Duration;
    use serde_yaml::Value;

    fn simulation(model: DiseaseModel, population: usize) -> SimulationContext {
        let config: Value = serde_yaml::from_str(&format!("population: {{population_size: {}}}", population)).unwrap();
        let mut sim = SimulationContext::new(
            vec![Box::new(BasePopulation::default()), Box::new(model)],
            Some(&config),
        )
        .unwrap();
        sim.setup().unwrap();
        sim.initialize_simulants().unwrap();
        sim
    }

    fn sis(prevalence: f64) -> DiseaseModel {
        DiseaseModel::new(
            "flu",
            vec![
                State::new("susceptible").add_transition(Transition::constant("infected", 0.0)),
                State::new("infected")
                    .with_dwell_time(Duration::days(45))
                    .add_transition(Transition::constant("susceptible", 1.0)),
            ],
        )
        .with_prevalence("infected", prevalence)
    }

    #[test]
    fn test_initial_prevalence() {
        let sim = simulation(sis(0.2), 10_000);
        let frame = sim.population().snapshot();
        let infected = frame.categories("flu").unwrap().iter().filter(|s| *s == "infected").count();
        assert!((1800..2200).contains(&infected), "infected = {}", infected);
    }

    #[test]
    fn test_recovery_after_dwell() {
        let mut sim = simulation(sis(1.0), 200);
        let infected = |sim: &SimulationContext| {
            let frame = sim.population().snapshot();
            frame.categories("flu").unwrap().iter().filter(|s| *s == "infected").count()
        };

        // Initial cases dwell from creation: 30.5 days in, still infected.
        sim.step().unwrap();
        assert_eq!(infected(&sim), 200);

        sim.step().unwrap();
        assert_eq!(infected(&sim), 0);
        let metrics = sim.finalize().unwrap();
        assert_eq!(metrics["flu.susceptible"], 200.0);
        assert_eq!(metrics["flu.infected_events"], 0.0);
    }

    #[test]
    fn test_dead_do_not_transition() {
        let model = DiseaseModel::new(
            "cold",
            vec![
                State::new("well").add_transition(Transition::constant("ill", 1.0)),
                State::new("ill"),
            ],
        );
        let mut sim = simulation(model, 10);
        let view = sim.population().get_view(&[ALIVE], None).unwrap();
        view.update_column(ALIVE, &[3, 4], Column::Bool(vec![false; 2])).unwrap();
        sim.step().unwrap();

        let frame = sim.population().snapshot();
        let states = frame.categories("cold").unwrap();
        assert_eq!(states[3], "well");
        assert_eq!(states[4], "well");
        assert_eq!(states.iter().filter(|s| *s == "ill").count(), 8);
    }

    #[test]
    fn test_bad_prevalence_rejected() {
        let model = DiseaseModel::new("d", vec![State::new("a"), State::new("b")]).with_prevalence("c", 0.1);
        let mut sim = SimulationContext::new(vec![Box::new(model)], None).unwrap();
        assert!(matches!(sim.setup(), Err(SimulationError::Component { .. })));
    }
}
