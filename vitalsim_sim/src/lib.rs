//! VitalSim simulation harness
//!
//! Wraps the kernel in a seeded [`SimWorld`], supplies a demographic
//! generator, and runs validation scenarios whose outcomes have known
//! analytic expectations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      SimWorld                        │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ SimulationContext (clock, CRN, pipelines, ...) │  │
//! │  └────────────────────────────────────────────────┘  │
//! │      ▲              ▲                ▲               │
//! │  BasePopulation  DiseaseModel    RiskEffect  ...     │
//! │      ▲                                               │
//! │  DemographyGenerator                                 │
//! └──────────────────────────────────────────────────────┘
//!        │ ScenarioRunner checks metrics / SimExport traces
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vitalsim_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 1_000).run(ScenarioId::Mortality);
//! assert!(result.passed);
//! ```

mod demography;
mod exporter;
mod manifest;
mod runner;
pub mod scenarios;
mod world;

pub use demography::DemographyGenerator;
pub use exporter::{SimExport, StepFrame};
pub use manifest::{ComponentEntry, ComponentRegistry, Manifest, ManifestError};
pub use runner::{ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld};
