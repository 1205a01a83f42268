//! JSON exporter for run traces.
//!
//! Records, once per step, how many simulants are in each category of every
//! categorical column, plus the number alive, and the final metrics.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use vitalsim_core::components::ALIVE;
use vitalsim_core::{Column, Frame, Metrics};
use vitalsim_env::SimTime;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFrame {
    /// Steps completed when the frame was captured
    pub step: u64,

    /// Simulated instant
    pub time: SimTime,

    /// Simulants alive, when the model tracks it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alive: Option<usize>,

    /// Counts per categorical column and category
    pub counts: IndexMap<String, IndexMap<String, usize>>,
}

impl StepFrame {
    /// Counts the categories of every categorical column in `frame`.
    pub fn capture(step: u64, time: SimTime, frame: &Frame) -> Self {
        let mut counts = IndexMap::new();
        for (name, column) in frame.columns() {
            if let Column::Category(values) = column {
                let mut per_category: IndexMap<String, usize> = IndexMap::new();
                for value in values {
                    *per_category.entry(value.clone()).or_default() += 1;
                }
                per_category.sort_keys();
                counts.insert(name.clone(), per_category);
            }
        }
        let alive = frame.bools(ALIVE).ok().map(|a| a.iter().filter(|v| **v).count());
        Self {
            step,
            time,
            alive,
            counts,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// All frames
    pub frames: Vec<StepFrame>,

    /// Final metrics
    pub metrics: Metrics,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            frames: Vec::new(),
            metrics: Metrics::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: StepFrame) {
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, metrics: Metrics, passed: bool, failure_reason: Option<String>) {
        self.metrics = metrics;
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
