//! Categorical risk exposures and their effects on rates.
//!
//! A [`CategoricalRisk`] assigns each simulant an exposure category from the
//! configured prevalence. A [`RiskEffect`] multiplies a target rate by the
//! relative risk of the simulant's category and contributes the population
//! attributable fraction
//!
//! ```text
//! paf = (sum_i p_i * rr_i - 1) / sum_i p_i * rr_i
//! ```
//!
//! to the `<rate>.paf` pipeline, so the base rate is deleted of the risk's
//! share before the relative risks are applied.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::builder::{Builder, Component};
use crate::config::ConfigTree;
use crate::error::{Result, SimulationError};
use crate::events::DEFAULT_PRIORITY;
use crate::population::Column;
use crate::randomness::Weight;
use crate::values::{JointValue, RateValue};

/// Configured exposure distribution of a risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub categories: Vec<String>,
    pub prevalence: Vec<f64>,
}

impl Exposure {
    fn read(configuration: &ConfigTree, risk: &str) -> Result<Self> {
        let exposure = Exposure {
            categories: configuration.get_as(&format!("{}.categories", risk))?,
            prevalence: configuration.get_as(&format!("{}.prevalence", risk))?,
        };
        if exposure.categories.len() != exposure.prevalence.len() || exposure.categories.is_empty() {
            return Err(SimulationError::component(
                risk,
                format!(
                    "{} categories but {} prevalence values",
                    exposure.categories.len(),
                    exposure.prevalence.len()
                ),
            ));
        }
        if exposure.prevalence.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(SimulationError::component(risk, "prevalence must be finite and non-negative"));
        }
        Ok(exposure)
    }

    /// Prevalence normalized to sum to one.
    fn normalized(&self) -> Vec<f64> {
        let total: f64 = self.prevalence.iter().sum();
        self.prevalence.iter().map(|p| p / total).collect()
    }
}

/// Name of the exposure column for `risk`.
pub fn exposure_column(risk: &str) -> String {
    format!("{}_exposure", risk)
}

/// Population attributable fraction of a categorical exposure.
pub fn population_attributable_fraction(prevalence: &[f64], relative_risks: &[f64]) -> f64 {
    let mean: f64 = prevalence.iter().zip(relative_risks).map(|(p, rr)| p * rr).sum();
    if mean <= 0.0 {
        0.0
    } else {
        (mean - 1.0) / mean
    }
}

/// Assigns an exposure category to every new simulant.
#[derive(Debug, Clone)]
pub struct CategoricalRisk {
    name: String,
    defaults: Exposure,
}

impl CategoricalRisk {
    pub fn new<S: Into<String>>(name: &str, categories: Vec<S>, prevalence: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            defaults: Exposure {
                categories: categories.into_iter().map(Into::into).collect(),
                prevalence,
            },
        }
    }
}

impl Component for CategoricalRisk {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn configuration_defaults(&self) -> Option<Value> {
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert(Value::String(self.name.clone()), serde_yaml::to_value(&self.defaults).ok()?);
        Some(Value::Mapping(mapping))
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        let exposure = Exposure::read(builder.configuration(), &self.name)?;
        let weights: Vec<Weight> = exposure.normalized().into_iter().map(Weight::Fixed).collect();
        let column = exposure_column(&self.name);
        let view = builder.get_view(&[column.as_str()], None)?;
        let stream = builder.get_stream(&format!("{}.exposure", self.name))?;
        let categories = exposure.categories;
        builder.register_simulant_initializer(&column, &[column.as_str()], &[], {
            let column = column.clone();
            move |data| {
                let assigned = stream.choice(&data.index, &categories, &weights)?;
                view.update_column(&column, &data.index, Column::Category(assigned))?;
                Ok(())
            }
        });
        Ok(())
    }
}

/// Applies a risk's relative risks to a rate pipeline.
#[derive(Debug, Clone)]
pub struct RiskEffect {
    risk: String,
    target: String,
    relative_risks: IndexMap<String, f64>,
}

impl RiskEffect {
    /// `target` names a rate pipeline. Categories without a relative risk
    /// use 1.
    pub fn new(risk: &str, target: &str, relative_risks: &[(&str, f64)]) -> Self {
        Self {
            risk: risk.to_string(),
            target: target.to_string(),
            relative_risks: relative_risks.iter().map(|(c, rr)| (c.to_string(), *rr)).collect(),
        }
    }

    fn relative_risk(&self, category: &str) -> f64 {
        self.relative_risks.get(category).copied().unwrap_or(1.0)
    }
}

impl Component for RiskEffect {
    fn name(&self) -> String {
        format!("{}_on_{}", self.risk, self.target)
    }

    fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        let exposure = Exposure::read(builder.configuration(), &self.risk)?;
        if let Some((unknown, _)) = self
            .relative_risks
            .iter()
            .find(|(category, _)| !exposure.categories.contains(*category))
        {
            return Err(SimulationError::component(
                self.name(),
                format!("relative risk given for unknown category '{}'", unknown),
            ));
        }

        let rrs: Vec<f64> = exposure.categories.iter().map(|c| self.relative_risk(c)).collect();
        let paf = population_attributable_fraction(&exposure.normalized(), &rrs);

        let column = exposure_column(&self.risk);
        let view = builder.get_view(&[column.as_str()], None)?;
        let effect = self.clone();
        builder
            .values()
            .register_value_modifier::<RateValue, _>(&self.target, DEFAULT_PRIORITY, move |index, rates| {
                let frame = view.get(index)?;
                let categories = frame.categories(&column)?;
                Ok(rates
                    .iter()
                    .zip(categories)
                    .map(|(rate, category)| rate * effect.relative_risk(category))
                    .collect())
            })?;
        builder
            .values()
            .register_value_modifier::<JointValue, _>(&format!("{}.paf", self.target), DEFAULT_PRIORITY, move |index, _| {
                Ok(vec![paf; index.len()])
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulationContext;
    use crate::lookup::LookupSpec;
    use crate::state_machine::{Machine, ProbabilitySpec, State, Transition};
    use approx::assert_relative_eq;

    /// Registers an incidence pipeline through a machine and owns the state
    /// column.
    struct Incidence {
        machine: Machine,
    }

    impl Component for Incidence {
        fn name(&self) -> String {
            "incidence".to_string()
        }

        fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
            self.machine.setup(builder)?;
            let view = builder.get_view(&["d"], None)?;
            builder.register_simulant_initializer("d", &["d"], &[], move |data| {
                view.update_column("d", &data.index, Column::Category(vec!["s".to_string(); data.index.len()]))?;
                Ok(())
            });
            Ok(())
        }
    }

    fn incidence() -> Box<dyn Component> {
        let spec = ProbabilitySpec::RateData {
            pipeline: "d.incidence_rate".to_string(),
            data: 0.1.into(),
            spec: LookupSpec::scalar(),
        };
        Box::new(Incidence {
            machine: Machine::new("d", vec![State::new("s").add_transition(Transition::to_state("i", spec)), State::new("i")]),
        })
    }

    #[test]
    fn test_paf_formula() {
        assert_relative_eq!(population_attributable_fraction(&[0.3, 0.7], &[2.0, 1.0]), 0.3 / 1.3);
        assert_eq!(population_attributable_fraction(&[0.5, 0.5], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_relative_risk_with_paf_deletion() {
        let config: Value = serde_yaml::from_str("population: {population_size: 10000}").unwrap();
        let mut sim = SimulationContext::new(
            vec![
                incidence(),
                Box::new(CategoricalRisk::new("smoking", vec!["cat1", "cat2"], vec![0.3, 0.7])),
                Box::new(RiskEffect::new("smoking", "d.incidence_rate", &[("cat1", 2.0)])),
            ],
            Some(&config),
        )
        .unwrap();
        sim.setup().unwrap();
        let index = sim.initialize_simulants().unwrap();

        let rate: RateValue = sim.values().get_value("d.incidence_rate").unwrap();
        let annual = rate.call_raw(&index).unwrap();
        let frame = sim.population().snapshot();
        let exposure = frame.categories("smoking_exposure").unwrap();
        for (r, category) in annual.iter().zip(exposure) {
            let expected = if category == "cat1" { 0.2 / 1.3 } else { 0.1 / 1.3 };
            assert_relative_eq!(*r, expected, epsilon = 1e-12);
        }

        let mean = annual.iter().sum::<f64>() / annual.len() as f64;
        assert_relative_eq!(mean, 0.1, epsilon = 0.005);
    }

    #[test]
    fn test_configuration_overrides_prevalence() {
        let config: Value =
            serde_yaml::from_str("smoking: {prevalence: [1.0, 0.0]}\npopulation: {population_size: 100}").unwrap();
        let mut sim = SimulationContext::new(
            vec![Box::new(CategoricalRisk::new("smoking", vec!["cat1", "cat2"], vec![0.3, 0.7]))],
            Some(&config),
        )
        .unwrap();
        sim.setup().unwrap();
        sim.initialize_simulants().unwrap();
        let frame = sim.population().snapshot();
        assert!(frame.categories("smoking_exposure").unwrap().iter().all(|c| c == "cat1"));
    }

    #[test]
    fn test_unknown_category_rejected() {
        let mut sim = SimulationContext::new(
            vec![
                Box::new(CategoricalRisk::new("smoking", vec!["cat1", "cat2"], vec![0.3, 0.7])),
                Box::new(RiskEffect::new("smoking", "rate", &[("cat9", 2.0)])),
            ],
            None,
        )
        .unwrap();
        assert!(matches!(sim.setup(), Err(SimulationError::Component { .. })));
    }
}
