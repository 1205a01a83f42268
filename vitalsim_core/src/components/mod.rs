//! Generic components most population health models start from.

mod base_population;
mod disease;
mod mortality;
mod risk;

pub use base_population::{BasePopulation, Demographics, PopulationGenerator, UniformGenerator, AGING_PRIORITY};
pub use disease::DiseaseModel;
pub use mortality::{Mortality, MORTALITY_RATE};
pub use risk::{exposure_column, population_attributable_fraction, CategoricalRisk, Exposure, RiskEffect};

/// Age in years.
pub const AGE: &str = "age";
pub const SEX: &str = "sex";
/// False once a simulant has died.
pub const ALIVE: &str = "alive";
pub const ENTRANCE_TIME: &str = "entrance_time";
/// Time of death, unset while alive.
pub const EXIT_TIME: &str = "exit_time";
