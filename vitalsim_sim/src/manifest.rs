//! Component manifests.
//!
//! A manifest is a JSON document naming the components of a model, plus
//! optional named comparisons that add components on top of the base list:
//!
//! ```json
//! {
//!   "components": [
//!     {"type": "base_population"},
//!     {"type": "incident_disease", "name": "chronic", "incidence": 0.05}
//!   ],
//!   "comparisons": {
//!     "smoking": [
//!       {"type": "categorical_risk", "name": "smoking",
//!        "categories": ["exposed", "unexposed"], "prevalence": [0.2, 0.8]},
//!       {"type": "risk_effect", "risk": "smoking",
//!        "target": "chronic.incidence_rate", "relative_risks": {"exposed": 3.0}}
//!     ]
//!   }
//! }
//! ```
//!
//! Each `type` is resolved through a [`ComponentRegistry`] of named
//! factories; the remaining keys are the factory's parameters.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use vitalsim_core::components::{BasePopulation, CategoricalRisk, Mortality, RiskEffect};
use vitalsim_core::{Component, LookupSpec};

use crate::demography::{DemographyGenerator, DEFAULT_AGE_STD, DEFAULT_MEAN_AGE};
use crate::scenarios;
use crate::world::SimConfig;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown component type '{0}'")]
    UnknownComponent(String),

    #[error("invalid parameters for '{component}': {message}")]
    InvalidParameters { component: String, message: String },

    #[error("unknown comparison '{0}'")]
    UnknownComparison(String),
}

/// One component declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEntry {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// A model description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub components: Vec<ComponentEntry>,

    #[serde(default)]
    pub comparisons: IndexMap<String, Vec<ComponentEntry>>,
}

impl Manifest {
    pub fn from_json_str(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &str) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn comparison_names(&self) -> impl Iterator<Item = &str> {
        self.comparisons.keys().map(String::as_str)
    }

    /// Builds the base components, followed by those of `comparison`.
    pub fn resolve(
        &self,
        registry: &ComponentRegistry,
        config: &SimConfig,
        comparison: Option<&str>,
    ) -> Result<Vec<Box<dyn Component>>, ManifestError> {
        let extra = match comparison {
            Some(name) => self
                .comparisons
                .get(name)
                .ok_or_else(|| ManifestError::UnknownComparison(name.to_string()))?
                .as_slice(),
            None => &[],
        };
        self.components
            .iter()
            .chain(extra)
            .map(|entry| registry.build(entry, config))
            .collect()
    }
}

type Factory = Box<dyn Fn(&Map<String, Value>, &SimConfig) -> Result<Box<dyn Component>, ManifestError>>;

/// Named component factories.
pub struct ComponentRegistry {
    factories: IndexMap<String, Factory>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn params<T: DeserializeOwned>(component: &str, params: &Map<String, Value>) -> Result<T, ManifestError> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| ManifestError::InvalidParameters {
        component: component.to_string(),
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PopulationParams {
    #[serde(default)]
    mean_age: Option<f64>,
    #[serde(default)]
    age_std: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MortalityParams {
    #[serde(default)]
    all_cause_rate: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DiseaseParams {
    name: String,
    incidence: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RiskParams {
    name: String,
    categories: Vec<String>,
    prevalence: Vec<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EffectParams {
    risk: String,
    target: String,
    relative_risks: IndexMap<String, f64>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("base_population", |p, config| {
            let p: PopulationParams = params("base_population", p)?;
            let generator = DemographyGenerator::new(config.demography_seed())
                .with_age_distribution(p.mean_age.unwrap_or(DEFAULT_MEAN_AGE), p.age_std.unwrap_or(DEFAULT_AGE_STD));
            Ok(Box::new(BasePopulation::new(generator)))
        });
        registry.register("mortality", |p, _| {
            let p: MortalityParams = params("mortality", p)?;
            Ok(Box::new(match p.all_cause_rate {
                Some(rate) => Mortality::from_table(rate, LookupSpec::scalar()),
                None => Mortality::new(),
            }))
        });
        registry.register("healthy_to_sick", |_, _| Ok(Box::new(scenarios::healthy_to_sick())));
        registry.register("sis", |_, _| Ok(Box::new(scenarios::sis())));
        registry.register("incident_disease", |p, _| {
            let p: DiseaseParams = params("incident_disease", p)?;
            Ok(Box::new(scenarios::incident_disease(&p.name, p.incidence)))
        });
        registry.register("categorical_risk", |p, _| {
            let p: RiskParams = params("categorical_risk", p)?;
            Ok(Box::new(CategoricalRisk::new(&p.name, p.categories, p.prevalence)))
        });
        registry.register("risk_effect", |p, _| {
            let p: EffectParams = params("risk_effect", p)?;
            let rrs: Vec<(&str, f64)> = p.relative_risks.iter().map(|(c, rr)| (c.as_str(), *rr)).collect();
            Ok(Box::new(RiskEffect::new(&p.risk, &p.target, &rrs)))
        });
        registry
    }
}

impl ComponentRegistry {
    /// A registry with no factories.
    pub fn empty() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// Adds or replaces the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&Map<String, Value>, &SimConfig) -> Result<Box<dyn Component>, ManifestError> + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(&self, entry: &ComponentEntry, config: &SimConfig) -> Result<Box<dyn Component>, ManifestError> {
        let factory = self
            .factories
            .get(&entry.kind)
            .ok_or_else(|| ManifestError::UnknownComponent(entry.kind.clone()))?;
        factory(&entry.params, config)
    }
}
