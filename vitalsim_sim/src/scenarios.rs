//! Built-in validation scenarios.

use vitalsim_core::components::{BasePopulation, CategoricalRisk, DiseaseModel, Mortality, RiskEffect};
use vitalsim_core::{Component, LookupSpec, ProbabilitySpec, State, Transition};
use vitalsim_env::StepSize;

use crate::demography::DemographyGenerator;
use crate::world::SimConfig;

/// Annual all-cause mortality rate used by the mortality scenario.
pub const MORTALITY_RATE: f64 = 0.05;

/// Annual infection rate of the SIS scenario.
pub const SIS_INFECTION_RATE: f64 = 2.0;

/// Base annual incidence of the risk scenario.
pub const RISK_BASE_INCIDENCE: f64 = 0.05;

/// Relative risk of the exposed category in the risk scenario.
pub const RISK_RELATIVE_RISK: f64 = 3.0;

/// Prevalence of the exposed category in the risk scenario.
pub const RISK_EXPOSED_PREVALENCE: f64 = 0.2;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Everyone moves from healthy to sick in the first step
    HealthyToSick,

    /// Susceptible/infected/susceptible with a minimum infection duration
    Sis,

    /// Constant all-cause mortality
    Mortality,

    /// Relative risk with PAF deletion of the base incidence
    RiskPaf,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::HealthyToSick,
            ScenarioId::Sis,
            ScenarioId::Mortality,
            ScenarioId::RiskPaf,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::HealthyToSick => "healthy_to_sick",
            ScenarioId::Sis => "sis",
            ScenarioId::Mortality => "mortality",
            ScenarioId::RiskPaf => "risk_paf",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::HealthyToSick => "certain transition: every simulant is sick after one step",
            ScenarioId::Sis => "SIS infection with a 60-day dwell time reaches an endemic mix",
            ScenarioId::Mortality => "deaths match 1 - exp(-rate * t) for a constant rate",
            ScenarioId::RiskPaf => "exposed simulants get sick more often while total incidence stays at the base rate",
        }
    }

    /// Builds the scenario's components.
    pub fn components(&self, config: &SimConfig) -> Vec<Box<dyn Component>> {
        let population: Box<dyn Component> =
            Box::new(BasePopulation::new(DemographyGenerator::new(config.demography_seed())));
        match self {
            ScenarioId::HealthyToSick => vec![population, Box::new(healthy_to_sick())],
            ScenarioId::Sis => vec![population, Box::new(sis())],
            ScenarioId::Mortality => vec![population, Box::new(Mortality::new())],
            ScenarioId::RiskPaf => vec![
                population,
                Box::new(CategoricalRisk::new(
                    "smoking",
                    vec!["exposed", "unexposed"],
                    vec![RISK_EXPOSED_PREVALENCE, 1.0 - RISK_EXPOSED_PREVALENCE],
                )),
                Box::new(incident_disease("chronic", RISK_BASE_INCIDENCE)),
                Box::new(RiskEffect::new(
                    "smoking",
                    "chronic.incidence_rate",
                    &[("exposed", RISK_RELATIVE_RISK)],
                )),
            ],
        }
    }

    /// Configuration merged over the run settings.
    pub fn overrides(&self) -> serde_yaml::Value {
        match self {
            ScenarioId::Mortality => {
                let mut mortality = serde_yaml::Mapping::new();
                mortality.insert("all_cause_rate".into(), MORTALITY_RATE.into());
                let mut root = serde_yaml::Mapping::new();
                root.insert("mortality".into(), serde_yaml::Value::Mapping(mortality));
                serde_yaml::Value::Mapping(root)
            }
            _ => serde_yaml::Value::Null,
        }
    }
}

/// A healthy/sick model where the transition always happens.
pub fn healthy_to_sick() -> DiseaseModel {
    DiseaseModel::new(
        "disease",
        vec![
            State::new("healthy").add_transition(Transition::constant("sick", 1.0)),
            State::new("sick"),
        ],
    )
}

/// Susceptible/infected/susceptible with a 60-day minimum infection.
pub fn sis() -> DiseaseModel {
    let infection = ProbabilitySpec::RateData {
        pipeline: "infection.incidence_rate".to_string(),
        data: SIS_INFECTION_RATE.into(),
        spec: LookupSpec::scalar(),
    };
    DiseaseModel::new(
        "infection",
        vec![
            State::new("susceptible").add_transition(Transition::to_state("infected", infection)),
            State::new("infected")
                .with_dwell_time(StepSize::days(60))
                .add_transition(Transition::constant("susceptible", 0.5)),
        ],
    )
    .with_prevalence("infected", 0.1)
}

/// A two-state chronic disease driven by `<name>.incidence_rate`.
pub fn incident_disease(name: &str, incidence: f64) -> DiseaseModel {
    let rate = ProbabilitySpec::RateData {
        pipeline: format!("{}.incidence_rate", name),
        data: incidence.into(),
        spec: LookupSpec::scalar(),
    };
    DiseaseModel::new(
        name,
        vec![
            State::new("susceptible").add_transition(Transition::to_state("with_condition", rate)),
            State::new("with_condition"),
        ],
    )
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "healthy_to_sick" | "healthytosick" => Ok(ScenarioId::HealthyToSick),
            "sis" => Ok(ScenarioId::Sis),
            "mortality" => Ok(ScenarioId::Mortality),
            "risk_paf" | "riskpaf" | "paf" => Ok(ScenarioId::RiskPaf),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert!("nope".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_components_per_scenario() {
        let config = SimConfig::default();
        let names: Vec<String> = ScenarioId::RiskPaf.components(&config).iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec!["base_population", "smoking", "chronic", "smoking_on_chronic.incidence_rate"]
        );
        assert_eq!(ScenarioId::Sis.components(&config).len(), 2);
    }

    #[test]
    fn test_mortality_overrides_rate() {
        let overrides = ScenarioId::Mortality.overrides();
        assert_eq!(overrides["mortality"]["all_cause_rate"].as_f64(), Some(MORTALITY_RATE));
        assert!(ScenarioId::Sis.overrides().is_null());
    }
}
