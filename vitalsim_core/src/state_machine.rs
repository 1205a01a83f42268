//! Finite-state machines over a categorical population column.
//!
//! Each [`State`] owns a [`TransitionSet`]. Once per call to
//! [`Machine::transition`], every simulant in the machine applies exactly
//! one outcome: one of its state's transitions, or staying put when the set
//! allows a null transition.
//!
//! Selection for the simulants in one state:
//!
//! 1. evaluate each transition's probability per simulant (0 where gated)
//! 2. stack into a simulants x transitions matrix, plus a null column
//! 3. take the cumulative sum across each row
//! 4. pick the first column whose cumulative probability exceeds the
//!    simulant's draw
//!
//! A transition whose target is another set recurses with a fresh draw.
//! Draws of a state's own set are keyed by the state name; a nested set is
//! keyed by its parent's key, its position and its label, so a branch never
//! shares draws with a state or a sibling.

use std::rc::Rc;

use chrono::Duration;
use indexmap::IndexMap;
use nalgebra::DMatrix;
use thiserror::Error;
use tracing::debug;

use crate::builder::Builder;
use crate::error::{ensure_finite, Result, SimulationError};
use crate::events::{Event, DEFAULT_PRIORITY};
use crate::lookup::{LookupSpec, TableData};
use crate::population::{Column, PopulationView};
use crate::randomness::RandomnessStream;
use crate::rates::rates_to_probabilities;
use crate::values::{JointValue, Metrics, MetricsValue, RateValue};

/// Slack allowed when checking that probabilities sum to at most one.
const PROBABILITY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("transition probabilities out of '{set}' sum to {total} for simulant {simulant}")]
    Overflow { set: String, simulant: usize, total: f64 },

    #[error("transitions out of '{set}' have no probability mass for simulant {simulant}")]
    NoProbabilityMass { set: String, simulant: usize },

    #[error("state '{0}' is not part of the machine")]
    UnknownState(String),

    #[error("transition into '{target}' produced {actual} probabilities for {expected} simulants")]
    Misaligned { target: String, expected: usize, actual: usize },

    #[error("machine '{0}' was used before setup")]
    NotSetUp(String),
}

pub type ProbabilityFn = Rc<dyn Fn(&[usize]) -> Result<Vec<f64>>>;
pub type Gate = Rc<dyn Fn(&[usize]) -> Result<Vec<bool>>>;
pub type SideEffect = Rc<dyn Fn(&[usize], &Event) -> Result<()>>;

/// How a transition's per-simulant probability is obtained.
#[derive(Clone)]
pub enum ProbabilitySpec {
    Constant(f64),
    Function(ProbabilityFn),
    /// An existing rate pipeline, converted with `1 - e^{-rate}`.
    Rate(String),
    /// Registers a rate pipeline from reference data. The base rate is
    /// multiplied by `1 - paf`, where `paf` is the joint pipeline
    /// `<pipeline>.paf` that risk components modify.
    RateData {
        pipeline: String,
        data: TableData,
        spec: LookupSpec,
    },
}

impl std::fmt::Debug for ProbabilitySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbabilitySpec::Constant(p) => write!(f, "Constant({})", p),
            ProbabilitySpec::Function(_) => write!(f, "Function"),
            ProbabilitySpec::Rate(name) => write!(f, "Rate({})", name),
            ProbabilitySpec::RateData { pipeline, .. } => write!(f, "RateData({})", pipeline),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Target {
    State(String),
    Branch(TransitionSet),
}

#[derive(Clone)]
pub struct Transition {
    target: Target,
    probability: ProbabilitySpec,
    gate: Option<Gate>,
    side_effects: Vec<SideEffect>,
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("target", &self.target)
            .field("probability", &self.probability)
            .field("gated", &self.gate.is_some())
            .field("side_effects", &self.side_effects.len())
            .finish()
    }
}

impl Transition {
    pub fn new(target: Target, probability: ProbabilitySpec) -> Self {
        Self {
            target,
            probability,
            gate: None,
            side_effects: Vec::new(),
        }
    }

    pub fn to_state(state: &str, probability: ProbabilitySpec) -> Self {
        Self::new(Target::State(state.to_string()), probability)
    }

    pub fn constant(state: &str, probability: f64) -> Self {
        Self::to_state(state, ProbabilitySpec::Constant(probability))
    }

    /// Transition driven by the rate pipeline `pipeline`.
    pub fn from_rate(state: &str, pipeline: &str) -> Self {
        Self::to_state(state, ProbabilitySpec::Rate(pipeline.to_string()))
    }

    pub fn from_function<F>(state: &str, probability: F) -> Self
    where
        F: Fn(&[usize]) -> Result<Vec<f64>> + 'static,
    {
        Self::to_state(state, ProbabilitySpec::Function(Rc::new(probability)))
    }

    pub fn branch(set: TransitionSet, probability: ProbabilitySpec) -> Self {
        Self::new(Target::Branch(set), probability)
    }

    /// Only simulants for which `gate` is true may take this transition.
    pub fn with_gate<F>(mut self, gate: F) -> Self
    where
        F: Fn(&[usize]) -> Result<Vec<bool>> + 'static,
    {
        self.gate = Some(Rc::new(gate));
        self
    }

    /// Runs `effect` for the simulants that take this transition.
    pub fn with_side_effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&[usize], &Event) -> Result<()> + 'static,
    {
        self.side_effects.push(Rc::new(effect));
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

#[derive(Debug, Clone)]
pub struct TransitionSet {
    label: String,
    transitions: Vec<Transition>,
    allow_null_transition: bool,
}

impl TransitionSet {
    pub fn new(label: &str, transitions: Vec<Transition>) -> Self {
        Self {
            label: label.to_string(),
            transitions,
            allow_null_transition: true,
        }
    }

    /// Requires the transitions to partition the probability space.
    /// Probabilities are normalized per simulant.
    pub fn without_null_transition(mut self) -> Self {
        self.allow_null_transition = false;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn allows_null_transition(&self) -> bool {
        self.allow_null_transition
    }
}

#[derive(Debug, Clone)]
pub struct State {
    name: String,
    set: TransitionSet,
    dwell_time: Option<Duration>,
    track_events: bool,
}

impl State {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            set: TransitionSet::new(name, Vec::new()),
            dwell_time: None,
            track_events: false,
        }
    }

    pub fn add_transition(mut self, transition: Transition) -> Self {
        self.set.transitions.push(transition);
        self
    }

    pub fn with_transition_set(mut self, set: TransitionSet) -> Self {
        self.set = set;
        self
    }

    /// Simulants must have spent `dwell_time` in this state before any
    /// transition out of it applies. Implies event tracking; simulants
    /// created in this state count their dwell from their creation time.
    pub fn with_dwell_time(mut self, dwell_time: Duration) -> Self {
        self.dwell_time = Some(dwell_time);
        self.track_events = true;
        self
    }

    /// Records `<state>_event_time` and `<state>_event_count` on entry.
    pub fn tracking_events(mut self) -> Self {
        self.track_events = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dwell_time(&self) -> Option<Duration> {
        self.dwell_time
    }

    pub fn event_time_column(&self) -> String {
        format!("{}_event_time", self.name)
    }

    pub fn event_count_column(&self) -> String {
        format!("{}_event_count", self.name)
    }
}

enum ResolvedProbability {
    Constant(f64),
    Function(ProbabilityFn),
    Rate(RateValue),
}

impl ResolvedProbability {
    fn evaluate(&self, index: &[usize]) -> Result<Vec<f64>> {
        match self {
            ResolvedProbability::Constant(p) => Ok(vec![*p; index.len()]),
            ResolvedProbability::Function(f) => f(index),
            ResolvedProbability::Rate(pipeline) => Ok(rates_to_probabilities(&pipeline.call(index)?)),
        }
    }
}

enum ResolvedTarget {
    State(usize),
    Branch(ResolvedSet),
}

struct ResolvedTransition {
    target: ResolvedTarget,
    target_name: String,
    probability: ResolvedProbability,
    gate: Option<Gate>,
    side_effects: Vec<SideEffect>,
}

struct ResolvedSet {
    label: String,
    key: String,
    allow_null: bool,
    transitions: Vec<ResolvedTransition>,
}

struct Resolved {
    view: PopulationView,
    stream: RandomnessStream,
    sets: Vec<ResolvedSet>,
}

/// Where each simulant ends up and which side effects to run.
struct Outcome {
    moves: Vec<Vec<usize>>,
    effects: Vec<(SideEffect, Vec<usize>)>,
}

/// A state machine over one categorical column.
#[derive(Clone)]
pub struct Machine {
    state_column: String,
    states: Vec<State>,
    resolved: Option<Rc<Resolved>>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("state_column", &self.state_column)
            .field("states", &self.states.iter().map(State::name).collect::<Vec<_>>())
            .field("ready", &self.resolved.is_some())
            .finish()
    }
}

impl Machine {
    pub fn new(state_column: &str, states: Vec<State>) -> Self {
        Self {
            state_column: state_column.to_string(),
            states,
            resolved: None,
        }
    }

    pub fn state_column(&self) -> &str {
        &self.state_column
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn state_names(&self) -> Vec<String> {
        self.states.iter().map(|s| s.name.clone()).collect()
    }

    /// Event tracking columns created by the machine.
    pub fn tracking_columns(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|s| s.track_events)
            .flat_map(|s| [s.event_time_column(), s.event_count_column()])
            .collect()
    }

    fn state_position(&self, name: &str) -> std::result::Result<usize, TransitionError> {
        self.states
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| TransitionError::UnknownState(name.to_string()))
    }

    /// Resolves transition probabilities, creates the tracking columns and
    /// registers the machine's metrics.
    ///
    /// The state column itself must be created by another initializer.
    pub fn setup(&mut self, builder: &mut Builder<'_>) -> Result<()> {
        let sets = self
            .states
            .iter()
            .map(|state| self.resolve_set(&state.set, &state.name, builder))
            .collect::<Result<Vec<_>>>()?;

        let tracking = self.tracking_columns();
        if !tracking.is_empty() {
            let creates: Vec<&str> = tracking.iter().map(String::as_str).collect();
            let view = builder.get_view(&creates, None)?;
            let reader = builder.get_view(&[self.state_column.as_str()], None)?;
            let state_column = self.state_column.clone();
            let tracked: Vec<(String, String, String)> = self
                .states
                .iter()
                .filter(|s| s.track_events)
                .map(|s| (s.name.clone(), s.event_time_column(), s.event_count_column()))
                .collect();
            // New simulants enter their initial state at creation time;
            // the entry is not counted as an event.
            builder.register_simulant_initializer(
                &format!("{}.event_tracking", self.state_column),
                &creates,
                &[self.state_column.as_str()],
                move |data| {
                    let frame = reader.get(&data.index)?;
                    let current = frame.categories(&state_column)?;
                    for (state, time_column, count_column) in &tracked {
                        let entered = current
                            .iter()
                            .map(|s| (s == state).then_some(data.creation_time))
                            .collect();
                        view.update_column(time_column, &data.index, Column::Time(entered))?;
                        view.update_column(count_column, &data.index, Column::Int(vec![0; data.index.len()]))?;
                    }
                    Ok(())
                },
            );
        }

        let mut columns = vec![self.state_column.as_str()];
        columns.extend(tracking.iter().map(String::as_str));
        let resolved = Rc::new(Resolved {
            view: builder.get_view(&columns, None)?,
            stream: builder.get_stream(&format!("{}.transitions", self.state_column))?,
            sets,
        });
        self.resolved = Some(Rc::clone(&resolved));

        let machine = self.clone();
        let population = builder.population().clone();
        builder
            .values()
            .register_value_modifier::<MetricsValue, _>("metrics", DEFAULT_PRIORITY, move |_, metrics| {
                let mut metrics: Metrics = metrics.clone();
                machine.report(&population.index(), &mut metrics)?;
                Ok(metrics)
            })?;

        debug!(column = %self.state_column, states = self.states.len(), "state machine ready");
        Ok(())
    }

    fn resolve_set(&self, set: &TransitionSet, key: &str, builder: &Builder<'_>) -> Result<ResolvedSet> {
        let transitions = set
            .transitions
            .iter()
            .enumerate()
            .map(|(position, t)| -> Result<ResolvedTransition> {
                let (target, target_name) = match &t.target {
                    Target::State(name) => (ResolvedTarget::State(self.state_position(name)?), name.clone()),
                    Target::Branch(inner) => {
                        let inner_key = format!("{}.{}.{}", key, position, inner.label);
                        (ResolvedTarget::Branch(self.resolve_set(inner, &inner_key, builder)?), inner.label.clone())
                    }
                };
                Ok(ResolvedTransition {
                    target,
                    target_name,
                    probability: resolve_probability(&t.probability, builder)?,
                    gate: t.gate.clone(),
                    side_effects: t.side_effects.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ResolvedSet {
            label: set.label.clone(),
            key: key.to_string(),
            allow_null: set.allow_null_transition,
            transitions,
        })
    }

    fn resolved(&self) -> std::result::Result<&Resolved, TransitionError> {
        self.resolved
            .as_deref()
            .ok_or_else(|| TransitionError::NotSetUp(self.state_column.clone()))
    }

    /// Advances every simulant in `index` by one transition.
    pub fn transition(&self, index: &[usize], event: &Event) -> Result<()> {
        let resolved = self.resolved()?;
        let frame = resolved.view.get(index)?;
        let current = frame.categories(&self.state_column)?;

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); self.states.len()];
        let mut positions: Vec<Vec<usize>> = vec![Vec::new(); self.states.len()];
        for (pos, (&simulant, state)) in frame.index().iter().zip(current).enumerate() {
            let s = self.state_position(state)?;
            groups[s].push(simulant);
            positions[s].push(pos);
        }

        let mut outcome = Outcome {
            moves: vec![Vec::new(); self.states.len()],
            effects: Vec::new(),
        };
        for (s, state) in self.states.iter().enumerate() {
            if groups[s].is_empty() {
                continue;
            }
            let eligible = match state.dwell_time {
                Some(dwell) => {
                    let entered = frame.times(&state.event_time_column())?;
                    groups[s]
                        .iter()
                        .zip(&positions[s])
                        // No recorded entry: the state was written outside the machine.
                        .filter(|(_, pos)| entered[**pos].map_or(true, |t| event.time - t >= dwell))
                        .map(|(&simulant, _)| simulant)
                        .collect()
                }
                None => groups[s].clone(),
            };
            select(&resolved.sets[s], &eligible, &resolved.stream, &mut outcome)?;
        }

        self.apply(resolved, outcome, event)
    }

    fn apply(&self, resolved: &Resolved, outcome: Outcome, event: &Event) -> Result<()> {
        let view = &resolved.view;
        for (s, movers) in outcome.moves.iter().enumerate() {
            if movers.is_empty() {
                continue;
            }
            let state = &self.states[s];
            view.update_column(
                &self.state_column,
                movers,
                Column::Category(vec![state.name.clone(); movers.len()]),
            )?;
            if state.track_events {
                let count_column = state.event_count_column();
                let counts: Vec<i64> = view
                    .get(movers)?
                    .ints(&count_column)?
                    .iter()
                    .map(|c| c + 1)
                    .collect();
                view.update_column(&count_column, movers, Column::Int(counts))?;
                view.update_column(
                    &state.event_time_column(),
                    movers,
                    Column::Time(vec![Some(event.time); movers.len()]),
                )?;
            }
            debug!(column = %self.state_column, state = %state.name, simulants = movers.len(), "transitioned");
        }
        for (effect, simulants) in outcome.effects {
            effect(&simulants, event)?;
        }
        Ok(())
    }

    /// Number of simulants in `index` per state.
    pub fn state_counts(&self, index: &[usize]) -> Result<IndexMap<String, usize>> {
        let resolved = self.resolved()?;
        let frame = resolved.view.get(index)?;
        let mut counts: IndexMap<String, usize> = self.states.iter().map(|s| (s.name.clone(), 0)).collect();
        for state in frame.categories(&self.state_column)? {
            *counts
                .get_mut(state)
                .ok_or_else(|| TransitionError::UnknownState(state.clone()))? += 1;
        }
        Ok(counts)
    }

    fn report(&self, index: &[usize], metrics: &mut Metrics) -> Result<()> {
        for (state, count) in self.state_counts(index)? {
            metrics.insert(format!("{}.{}", self.state_column, state), count as f64);
        }
        let frame = self.resolved()?.view.get(index)?;
        for state in self.states.iter().filter(|s| s.track_events) {
            let events: i64 = frame.ints(&state.event_count_column())?.iter().sum();
            metrics.insert(format!("{}.{}_events", self.state_column, state.name), events as f64);
        }
        Ok(())
    }
}

fn resolve_probability(spec: &ProbabilitySpec, builder: &Builder<'_>) -> Result<ResolvedProbability> {
    Ok(match spec {
        ProbabilitySpec::Constant(p) => ResolvedProbability::Constant(*p),
        ProbabilitySpec::Function(f) => ResolvedProbability::Function(Rc::clone(f)),
        ProbabilitySpec::Rate(name) => ResolvedProbability::Rate(builder.values().get_value(name)?),
        ProbabilitySpec::RateData { pipeline, data, spec } => {
            let table = builder.build_lookup_table(data.clone(), spec.clone())?;
            let paf: JointValue = builder
                .values()
                .register_joint_value_producer(&format!("{}.paf", pipeline), |index| Ok(vec![vec![0.0; index.len()]]))?;
            let rate = builder.values().register_rate_producer(pipeline, move |index| {
                let base = table.call_value(index)?;
                let paf = paf.call(index)?;
                Ok(base.iter().zip(paf).map(|(r, p)| r * (1.0 - p)).collect())
            })?;
            ResolvedProbability::Rate(rate)
        }
    })
}

/// Chooses one outcome of `set` for each simulant in `index`.
fn select(set: &ResolvedSet, index: &[usize], stream: &RandomnessStream, outcome: &mut Outcome) -> Result<()> {
    if index.is_empty() {
        return Ok(());
    }
    let n = index.len();
    let k = set.transitions.len();
    let columns = if set.allow_null { k + 1 } else { k };
    if columns == 0 {
        return Ok(());
    }

    let mut probabilities = DMatrix::<f64>::zeros(n, columns);
    for (j, transition) in set.transitions.iter().enumerate() {
        let p = transition.probability.evaluate(index)?;
        if p.len() != n {
            return Err(TransitionError::Misaligned {
                target: transition.target_name.clone(),
                expected: n,
                actual: p.len(),
            }
            .into());
        }
        ensure_finite(&format!("transition to '{}'", transition.target_name), &p)?;
        let open = match &transition.gate {
            Some(gate) => gate(index)?,
            None => vec![true; n],
        };
        if open.len() != n {
            return Err(TransitionError::Misaligned {
                target: transition.target_name.clone(),
                expected: n,
                actual: open.len(),
            }
            .into());
        }
        for i in 0..n {
            if open[i] {
                probabilities[(i, j)] = p[i];
            }
        }
    }

    for i in 0..n {
        let total: f64 = (0..k).map(|j| probabilities[(i, j)]).sum();
        if total > 1.0 + PROBABILITY_TOLERANCE {
            return Err(overflow(set, index[i], total));
        }
        if set.allow_null {
            probabilities[(i, k)] = (1.0 - total).max(0.0);
        } else if total <= 0.0 {
            return Err(TransitionError::NoProbabilityMass {
                set: set.label.clone(),
                simulant: index[i],
            }
            .into());
        } else {
            for j in 0..k {
                probabilities[(i, j)] /= total;
            }
        }
    }

    let draws = stream.get_draw_keyed(index, &set.key);
    let mut chosen: Vec<Vec<usize>> = vec![Vec::new(); columns];
    for (i, draw) in draws.into_iter().enumerate() {
        let mut cumulative = 0.0;
        let mut pick = None;
        for j in 0..columns {
            let p = probabilities[(i, j)];
            cumulative += p;
            if p > 0.0 {
                pick = Some(j);
            }
            if cumulative > draw {
                break;
            }
        }
        if let Some(j) = pick {
            chosen[j].push(index[i]);
        }
    }

    for (transition, group) in set.transitions.iter().zip(chosen) {
        if group.is_empty() {
            continue;
        }
        for effect in &transition.side_effects {
            outcome.effects.push((Rc::clone(effect), group.clone()));
        }
        match &transition.target {
            ResolvedTarget::State(s) => outcome.moves[*s].extend(group),
            ResolvedTarget::Branch(inner) => select(inner, &group, stream, outcome)?,
        }
    }
    Ok(())
}

fn overflow(set: &ResolvedSet, simulant: usize, total: f64) -> SimulationError {
    TransitionError::Overflow {
        set: set.label.clone(),
        simulant,
        total,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigTree;
    use crate::events::EventManager;
    use crate::lookup::LookupTableManager;
    use crate::population::PopulationManager;
    use crate::randomness::RandomnessManager;
    use crate::values::ValuesManager;
    use crate::SimulationError;
    use vitalsim_env::{duration_from_days, CalendarContext, RunContext};

    struct Harness {
        config: ConfigTree,
        ctx: Rc<CalendarContext>,
        population: PopulationManager,
        events: EventManager,
        values: ValuesManager,
        randomness: RandomnessManager,
        lookup: LookupTableManager,
    }

    impl Harness {
        fn new() -> Self {
            let ctx = Rc::new(CalendarContext::from_ymd(2000, 1, 1, 1.0, 11).unwrap());
            let population = PopulationManager::new(ctx.clone());
            let values = ValuesManager::new(ctx.clone());
            values
                .register_value_producer("metrics", |_| Ok(Metrics::new()))
                .unwrap();
            Self {
                config: ConfigTree::default(),
                events: EventManager::new(ctx.clone()),
                randomness: RandomnessManager::new(ctx.clone()),
                lookup: LookupTableManager::new(population.clone(), ctx.clone(), 1),
                values,
                population,
                ctx,
            }
        }

        fn setup(&self, machine: &mut Machine, initial: &'static str, count: usize) -> Vec<usize> {
            let mut builder = Builder::new(
                &self.config,
                self.ctx.clone(),
                &self.population,
                &self.events,
                &self.values,
                &self.randomness,
                &self.lookup,
            );
            machine.setup(&mut builder).unwrap();
            let column = machine.state_column().to_string();
            let view = self.population.get_view(&[column.as_str()], None).unwrap();
            let name = column.clone();
            self.population.register_simulant_initializer("initial_state", &[column.as_str()], &[], move |data| {
                view.update_column(&name, &data.index, Column::Category(vec![initial.to_string(); data.index.len()]))?;
                Ok(())
            });
            self.population.create_simulants(count, IndexMap::new()).unwrap()
        }

        /// Emits a step: the event time is the next clock time, then the
        /// clock advances.
        fn step(&self, machine: &Machine, index: &[usize]) {
            let event = Event {
                index: index.to_vec(),
                time: self.ctx.next_time(),
                step_size: self.ctx.step_size(),
            };
            machine.transition(index, &event).unwrap();
            self.ctx.advance();
        }
    }

    #[test]
    fn test_certain_transition_moves_everyone() {
        let harness = Harness::new();
        let mut machine = Machine::new(
            "disease",
            vec![
                State::new("healthy").add_transition(Transition::constant("sick", 1.0)),
                State::new("sick"),
            ],
        );
        let index = harness.setup(&mut machine, "healthy", 10_000);
        harness.step(&machine, &index);

        let counts = machine.state_counts(&index).unwrap();
        assert_eq!(counts["sick"], 10_000);
        assert_eq!(counts["healthy"], 0);
    }

    #[test]
    fn test_null_transition_keeps_complement() {
        let harness = Harness::new();
        let mut machine = Machine::new(
            "disease",
            vec![
                State::new("healthy").add_transition(Transition::constant("sick", 0.3)),
                State::new("sick"),
            ],
        );
        let index = harness.setup(&mut machine, "healthy", 10_000);
        harness.step(&machine, &index);
        let sick = machine.state_counts(&index).unwrap()["sick"] as f64 / 10_000.0;
        assert!((sick - 0.3).abs() < 0.02, "sick fraction {}", sick);
    }

    #[test]
    fn test_dwell_time_gates_exit() {
        let harness = Harness::new();
        let dwell = duration_from_days(3.0).unwrap();
        let mut machine = Machine::new(
            "disease",
            vec![
                State::new("susceptible").add_transition(Transition::constant("infected", 1.0)),
                State::new("infected")
                    .with_dwell_time(dwell)
                    .add_transition(Transition::constant("susceptible", 1.0)),
            ],
        );
        let index = harness.setup(&mut machine, "susceptible", 100);

        // Step 1: everyone enters infected at T = day 1.
        harness.step(&machine, &index);
        assert_eq!(machine.state_counts(&index).unwrap()["infected"], 100);

        // Steps at T+1 and T+2 stay put.
        harness.step(&machine, &index);
        harness.step(&machine, &index);
        assert_eq!(machine.state_counts(&index).unwrap()["infected"], 100);

        // At exactly T+3 the exit applies.
        harness.step(&machine, &index);
        assert_eq!(machine.state_counts(&index).unwrap()["susceptible"], 100);
    }

    #[test]
    fn test_initial_state_dwell_counts_from_creation() {
        let harness = Harness::new();
        let dwell = duration_from_days(3.0).unwrap();
        let mut machine = Machine::new(
            "disease",
            vec![
                State::new("infected")
                    .with_dwell_time(dwell)
                    .add_transition(Transition::constant("recovered", 1.0)),
                State::new("recovered"),
            ],
        );
        let created = harness.ctx.now();
        let index = harness.setup(&mut machine, "infected", 50);
        let view = harness
            .population
            .get_view(&["infected_event_time", "infected_event_count"], None)
            .unwrap();
        let frame = view.get(&index).unwrap();
        assert!(frame.times("infected_event_time").unwrap().iter().all(|t| *t == Some(created)));
        assert_eq!(frame.ints("infected_event_count").unwrap(), &[0; 50]);

        // Event times are creation + 1 and + 2 days.
        harness.step(&machine, &index);
        harness.step(&machine, &index);
        assert_eq!(machine.state_counts(&index).unwrap()["infected"], 50);

        harness.step(&machine, &index);
        assert_eq!(machine.state_counts(&index).unwrap()["recovered"], 50);
    }

    #[test]
    fn test_nested_set_draws_independent_of_state_draws() {
        let harness = Harness::new();
        // Same label as the owning state.
        let branch = TransitionSet::new(
            "healthy",
            vec![Transition::constant("mild", 0.5), Transition::constant("severe", 0.5)],
        )
        .without_null_transition();
        let mut machine = Machine::new(
            "mi",
            vec![
                State::new("healthy").add_transition(Transition::branch(branch, ProbabilitySpec::Constant(0.5))),
                State::new("mild"),
                State::new("severe"),
            ],
        );
        let index = harness.setup(&mut machine, "healthy", 4_000);
        harness.step(&machine, &index);

        let counts = machine.state_counts(&index).unwrap();
        let severe = counts["severe"] as f64 / 4_000.0;
        let mild = counts["mild"] as f64 / 4_000.0;
        assert!((severe - 0.25).abs() < 0.03, "severe fraction {}", severe);
        assert!((mild - 0.25).abs() < 0.03, "mild fraction {}", mild);
    }

    #[test]
    fn test_event_count_increments_once_per_entry() {
        let harness = Harness::new();
        let mut machine = Machine::new(
            "disease",
            vec![
                State::new("susceptible").add_transition(Transition::constant("infected", 1.0)),
                State::new("infected")
                    .tracking_events()
                    .add_transition(Transition::constant("susceptible", 1.0)),
            ],
        );
        let index = harness.setup(&mut machine, "susceptible", 10);
        let view = harness
            .population
            .get_view(&["infected_event_count", "infected_event_time"], None)
            .unwrap();
        assert_eq!(view.get(&index).unwrap().ints("infected_event_count").unwrap(), &[0; 10]);

        harness.step(&machine, &index);
        let entered = harness.ctx.now();
        assert_eq!(view.get(&index).unwrap().ints("infected_event_count").unwrap(), &[1; 10]);
        assert_eq!(
            view.get(&[0]).unwrap().times("infected_event_time").unwrap(),
            &[Some(entered)]
        );

        harness.step(&machine, &index);
        assert_eq!(view.get(&index).unwrap().ints("infected_event_count").unwrap(), &[1; 10]);
        harness.step(&machine, &index);
        assert_eq!(view.get(&index).unwrap().ints("infected_event_count").unwrap(), &[2; 10]);

        let metrics: MetricsValue = harness.values.get_value("metrics").unwrap();
        let metrics = metrics.call(&[]).unwrap();
        assert_eq!(metrics["disease.infected_events"], 20.0);
        assert_eq!(metrics["disease.infected"], 10.0);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let harness = Harness::new();
        let mut machine = Machine::new(
            "disease",
            vec![
                State::new("a")
                    .add_transition(Transition::constant("b", 0.7))
                    .add_transition(Transition::constant("c", 0.6)),
                State::new("b"),
                State::new("c"),
            ],
        );
        let index = harness.setup(&mut machine, "a", 5);
        let event = Event {
            index: index.clone(),
            time: harness.ctx.next_time(),
            step_size: harness.ctx.step_size(),
        };
        assert!(matches!(
            machine.transition(&index, &event),
            Err(SimulationError::Transition(TransitionError::Overflow { .. }))
        ));
        assert_eq!(machine.state_counts(&index).unwrap()["a"], 5);
    }

    #[test]
    fn test_disallowed_null_normalizes() {
        let harness = Harness::new();
        let set = TransitionSet::new(
            "a",
            vec![Transition::constant("b", 0.2), Transition::constant("c", 0.2)],
        )
        .without_null_transition();
        let mut machine = Machine::new(
            "x",
            vec![State::new("a").with_transition_set(set), State::new("b"), State::new("c")],
        );
        let index = harness.setup(&mut machine, "a", 2_000);
        harness.step(&machine, &index);
        let counts = machine.state_counts(&index).unwrap();
        assert_eq!(counts["a"], 0);
        assert_eq!(counts["b"] + counts["c"], 2_000);
        assert!((counts["b"] as f64 / 2_000.0 - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_nested_branch_and_side_effects() {
        let harness = Harness::new();
        let hits = Rc::new(std::cell::Cell::new(0));
        let h = Rc::clone(&hits);
        let severity = TransitionSet::new(
            "severity",
            vec![Transition::constant("mild", 0.5), Transition::constant("severe", 0.5)],
        )
        .without_null_transition();
        let mut machine = Machine::new(
            "mi",
            vec![
                State::new("healthy").add_transition(
                    Transition::branch(severity, ProbabilitySpec::Constant(1.0)).with_side_effect(move |index, _| {
                        h.set(h.get() + index.len());
                        Ok(())
                    }),
                ),
                State::new("mild"),
                State::new("severe"),
            ],
        );
        let index = harness.setup(&mut machine, "healthy", 1_000);
        harness.step(&machine, &index);

        let counts = machine.state_counts(&index).unwrap();
        assert_eq!(counts["healthy"], 0);
        assert_eq!(counts["mild"] + counts["severe"], 1_000);
        assert!(counts["mild"] > 400 && counts["severe"] > 400);
        assert_eq!(hits.get(), 1_000);
    }

    #[test]
    fn test_gate_and_rate_pipeline() {
        let harness = Harness::new();
        harness
            .values
            .register_value_producer("recovery_rate", |index| Ok(vec![1e9; index.len()]))
            .unwrap();
        let mut machine = Machine::new(
            "disease",
            vec![
                State::new("sick").add_transition(
                    Transition::from_rate("healthy", "recovery_rate")
                        .with_gate(|index| Ok(index.iter().map(|i| i % 2 == 0).collect())),
                ),
                State::new("healthy"),
            ],
        );
        let index = harness.setup(&mut machine, "sick", 10);
        harness.step(&machine, &index);
        let frame = harness.population.get_view(&["disease"], None).unwrap().get(&index).unwrap();
        for (i, state) in frame.categories("disease").unwrap().iter().enumerate() {
            assert_eq!(state, if i % 2 == 0 { "healthy" } else { "sick" });
        }
    }

    #[test]
    fn test_unknown_target_fails_setup() {
        let harness = Harness::new();
        let mut machine = Machine::new(
            "disease",
            vec![State::new("healthy").add_transition(Transition::constant("zombie", 1.0))],
        );
        let mut builder = Builder::new(
            &harness.config,
            harness.ctx.clone(),
            &harness.population,
            &harness.events,
            &harness.values,
            &harness.randomness,
            &harness.lookup,
        );
        assert!(matches!(
            machine.setup(&mut builder),
            Err(SimulationError::Transition(TransitionError::UnknownState(_)))
        ));
    }
}
