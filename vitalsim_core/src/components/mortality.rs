//! All-cause mortality.

use std::cell::Cell;
use std::rc::Rc;

use serde_yaml::Value;
use tracing::debug;

use super::{ALIVE, EXIT_TIME};
use crate::builder::{Builder, Component};
use crate::error::Result;
use crate::events::{DEFAULT_PRIORITY, TIME_STEP};
use crate::lookup::{LookupSpec, TableData};
use crate::population::Column;
use crate::values::{Metrics, MetricsValue};

/// Name of the rate pipeline other components may modify.
pub const MORTALITY_RATE: &str = "mortality_rate";

/// Kills living simulants at the `mortality_rate` pipeline's rate.
///
/// Without reference data the annual rate comes from the
/// `mortality.all_cause_rate` configuration key.
#[derive(Debug, Default)]
pub struct Mortality {
    data: Option<(TableData, LookupSpec)>,
}

impl Mortality {
    pub fn new() -> Self {
        Self::default()
    }

    /// Annual rates from reference data, e.g. by sex with age as an
    /// interpolation parameter.
    pub fn from_table(data: impl Into<TableData>, spec: LookupSpec) -> Self {
        Self {
            data: Some((data.into(), spec)),
        }
    }
}

impl Component for Mortality {
    fn name(&self) -> String {
        "mortality".to_string()
    }

    fn configuration_defaults(&self) -> Option<Value> {
        serde_yaml::from_str("mortality: {all_cause_rate: 0.01}").ok()
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        let (data, spec) = match &self.data {
            Some((data, spec)) => (data.clone(), spec.clone()),
            None => {
                let rate: f64 = builder.configuration().get_as("mortality.all_cause_rate")?;
                (TableData::Scalar(rate), LookupSpec::scalar())
            }
        };
        let table = builder.build_lookup_table(data, spec)?;
        let rate = builder
            .values()
            .register_rate_producer(MORTALITY_RATE, move |index| table.call_value(index))?;

        let view = builder.get_view(&[ALIVE, EXIT_TIME], None)?;
        builder.register_simulant_initializer("mortality", &[EXIT_TIME], &[ALIVE], {
            let view = view.clone();
            move |data| {
                view.update_column(EXIT_TIME, &data.index, Column::Time(vec![None; data.index.len()]))?;
                Ok(())
            }
        });

        let stream = builder.get_stream("mortality")?;
        let deaths = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&deaths);
        builder.register_event_listener(TIME_STEP, DEFAULT_PRIORITY, move |event| {
            let living = view.get_with(&event.index, ALIVE)?;
            let rates = rate.call(living.index())?;
            let dying = stream.filter_for_rate(living.index(), &rates)?;
            if dying.is_empty() {
                return Ok(());
            }
            view.update_column(ALIVE, &dying, Column::Bool(vec![false; dying.len()]))?;
            view.update_column(EXIT_TIME, &dying, Column::Time(vec![Some(event.time); dying.len()]))?;
            counter.set(counter.get() + dying.len());
            debug!(deaths = dying.len(), time = %event.time, "simulants died");
            Ok(())
        })?;

        builder
            .values()
            .register_value_modifier::<MetricsValue, _>("metrics", DEFAULT_PRIORITY, move |_, metrics| {
                let mut metrics: Metrics = metrics.clone();
                metrics.insert("deaths".to_string(), deaths.get() as f64);
                Ok(metrics)
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::BasePopulation;
    use crate::engine::SimulationContext;
    use crate::lookup::DataTable;
    use approx::assert_relative_eq;

    fn run(mortality: Mortality, overrides: &str, steps: usize) -> (SimulationContext, Metrics) {
        let config: Value = serde_yaml::from_str(overrides).unwrap();
        let mut sim = SimulationContext::new(
            vec![Box::new(BasePopulation::default()), Box::new(mortality)],
            Some(&config),
        )
        .unwrap();
        sim.setup().unwrap();
        sim.initialize_simulants().unwrap();
        for _ in 0..steps {
            sim.step().unwrap();
        }
        let metrics = sim.finalize().unwrap();
        (sim, metrics)
    }

    #[test]
    fn test_deaths_match_rate() {
        // annual rate ln(2) over a 365-day step: half the population dies
        let config = format!(
            "mortality: {{all_cause_rate: {}}}\npopulation: {{population_size: 10000}}\ntime: {{step_size: 365}}",
            std::f64::consts::LN_2
        );
        let (sim, metrics) = run(Mortality::new(), &config, 1);
        let deaths = metrics["deaths"];
        assert!((4700.0..5300.0).contains(&deaths), "deaths = {}", deaths);

        let frame = sim.population().snapshot();
        let dead = frame.bools(ALIVE).unwrap().iter().filter(|a| !**a).count();
        assert_eq!(dead as f64, deaths);
        let exits = frame.times(EXIT_TIME).unwrap().iter().filter(|t| t.is_some()).count();
        assert_eq!(exits, dead);
    }

    #[test]
    fn test_dead_stay_dead() {
        let config = "mortality: {all_cause_rate: 1000.0}\npopulation: {population_size: 100}";
        let (sim, metrics) = run(Mortality::new(), config, 3);
        assert_eq!(metrics["deaths"], 100.0);
        let exits = sim.population().snapshot();
        let first = exits.times(EXIT_TIME).unwrap()[0];
        assert_eq!(first, Some(sim.start_time() + sim.clock().step_size()));
    }

    #[test]
    fn test_rate_from_table() {
        let table = DataTable::new()
            .with_categorical("sex", vec!["Female", "Male"])
            .unwrap()
            .with_numeric("value", vec![0.0, 0.5])
            .unwrap();
        let config = "population: {population_size: 50}";
        let (sim, _) = run(
            Mortality::from_table(table, LookupSpec::new(&["sex"], &[], &["value"])),
            config,
            0,
        );
        let rates: crate::values::RateValue = sim.values().get_value(MORTALITY_RATE).unwrap();
        let index = sim.population().index();
        let raw = rates.call_raw(&index).unwrap();
        let sexes = sim.population().snapshot();
        for (rate, sex) in raw.iter().zip(sexes.categories("sex").unwrap()) {
            assert_relative_eq!(*rate, if sex == "Male" { 0.5 } else { 0.0 });
        }
    }
}
