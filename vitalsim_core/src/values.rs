//! Dynamic value pipelines.
//!
//! A pipeline is a named quantity that several components determine
//! jointly. Exactly one component registers the source; any number register
//! mutators. Evaluation is
//!
//! ```text
//! value = source(index)
//! for mutator in mutators (priority 0..=9, registration order):
//!     value = combiner(value, mutator(index, &value))
//! output = post_processor(index, value, step_size)
//! ```
//!
//! Consumers may obtain a pipeline before its source exists. Calling it
//! without a source is an error.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;
use vitalsim_env::{RunContext, StepSize};

use crate::error::{ensure_finite, Result};
use crate::events::PRIORITY_LEVELS;
use crate::rates::from_yearly;

#[derive(Debug, Error)]
pub enum DynamicValueError {
    #[error("pipeline '{0}' was called but no component produces it")]
    NoSource(String),

    #[error("pipeline '{0}' already has a source")]
    DuplicateSource(String),

    #[error("pipeline evaluation cycle: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("pipeline '{0}' was requested with different value types than it was created with")]
    TypeMismatch(String),

    #[error("priority {priority} for pipeline '{name}' is outside 0..=9")]
    InvalidPriority { name: String, priority: usize },

    #[error("expected {expected} values per component, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

pub type Source<T> = Rc<dyn Fn(&[usize]) -> Result<T>>;
pub type Mutator<T, M> = Rc<dyn Fn(&[usize], &T) -> Result<M>>;
pub type Combiner<T, M> = fn(T, M) -> T;
pub type PostProcessor<T, O> = Rc<dyn Fn(&[usize], T, StepSize) -> Result<O>>;

/// Per-simulant rates or probabilities.
pub type RateValue = Pipeline<Vec<f64>, Vec<f64>, Vec<f64>>;
/// Independent probabilities joined with `union_post_processor`.
pub type JointValue = Pipeline<Vec<Vec<f64>>, Vec<f64>, Vec<f64>>;
pub type Metrics = IndexMap<String, f64>;
pub type MetricsValue = Pipeline<Metrics, Metrics, Metrics>;

/// Mutator output replaces the running value.
pub fn replace_combiner<T>(_value: T, mutated: T) -> T {
    mutated
}

/// Mutator output is appended to the running list.
pub fn list_combiner<X>(mut value: Vec<X>, mutated: X) -> Vec<X> {
    value.push(mutated);
    value
}

/// Mutator output is added to the running set.
pub fn set_combiner<X: Ord>(mut value: BTreeSet<X>, mutated: X) -> BTreeSet<X> {
    value.insert(mutated);
    value
}

/// Passes the combined value through unchanged.
pub fn identity_post_processor<T>(_index: &[usize], value: T, _step: StepSize) -> Result<T> {
    Ok(value)
}

/// Scales annual rates to the step length.
pub fn rescale_post_processor(_index: &[usize], rates: Vec<f64>, step: StepSize) -> Result<Vec<f64>> {
    let rescaled: Vec<f64> = rates.into_iter().map(|r| from_yearly(r, step)).collect();
    ensure_finite("rescaled rate", &rescaled)?;
    Ok(rescaled)
}

/// Probability that at least one of several independent events occurs,
/// `1 - prod(1 - p_i)` per simulant.
pub fn union_post_processor(index: &[usize], values: Vec<Vec<f64>>, _step: StepSize) -> Result<Vec<f64>> {
    for v in &values {
        if v.len() != index.len() {
            return Err(DynamicValueError::LengthMismatch {
                expected: index.len(),
                actual: v.len(),
            }
            .into());
        }
    }
    let mut values = values.into_iter();
    let Some(first) = values.next() else {
        return Ok(vec![0.0; index.len()]);
    };
    let mut complement: Vec<f64> = first.iter().map(|p| 1.0 - p).collect();
    let mut single = Some(first);
    for v in values {
        single = None;
        for (c, p) in complement.iter_mut().zip(v) {
            *c *= 1.0 - p;
        }
    }
    let joint = match single {
        Some(only) => only,
        None => complement.into_iter().map(|c| 1.0 - c).collect(),
    };
    ensure_finite("joint value", &joint)?;
    Ok(joint)
}

struct Producer<T, M, O> {
    source: Source<T>,
    combiner: Combiner<T, M>,
    post_processor: PostProcessor<T, O>,
}

impl<T, M, O> Clone for Producer<T, M, O> {
    fn clone(&self) -> Self {
        Self {
            source: Rc::clone(&self.source),
            combiner: self.combiner,
            post_processor: Rc::clone(&self.post_processor),
        }
    }
}

struct PipelineInner<T, M, O> {
    name: String,
    producer: RefCell<Option<Producer<T, M, O>>>,
    mutators: RefCell<Vec<Vec<Mutator<T, M>>>>,
}

/// Pops the pipeline off the evaluation stack when evaluation ends.
struct EvaluationFrame<'a> {
    stack: &'a RefCell<Vec<String>>,
}

impl<'a> EvaluationFrame<'a> {
    fn enter(stack: &'a RefCell<Vec<String>>, name: &str) -> std::result::Result<Self, DynamicValueError> {
        let mut frames = stack.borrow_mut();
        if frames.iter().any(|f| f == name) {
            let mut chain = frames.clone();
            chain.push(name.to_string());
            return Err(DynamicValueError::Cycle { chain });
        }
        frames.push(name.to_string());
        Ok(Self { stack })
    }
}

impl Drop for EvaluationFrame<'_> {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

/// Handle to a named pipeline. Clones share the same pipeline.
pub struct Pipeline<T, M, O> {
    inner: Rc<PipelineInner<T, M, O>>,
    stack: Rc<RefCell<Vec<String>>>,
    context: Rc<dyn RunContext>,
}

impl<T, M, O> Clone for Pipeline<T, M, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            stack: Rc::clone(&self.stack),
            context: Rc::clone(&self.context),
        }
    }
}

impl<T, M, O> std::fmt::Debug for Pipeline<T, M, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("has_source", &self.has_source())
            .field("mutators", &self.mutator_count())
            .finish()
    }
}

impl<T, M, O> Pipeline<T, M, O> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn has_source(&self) -> bool {
        self.inner.producer.borrow().is_some()
    }

    pub fn mutator_count(&self) -> usize {
        self.inner.mutators.borrow().iter().map(Vec::len).sum()
    }

    fn producer(&self) -> std::result::Result<Producer<T, M, O>, DynamicValueError> {
        self.inner
            .producer
            .borrow()
            .clone()
            .ok_or_else(|| DynamicValueError::NoSource(self.inner.name.clone()))
    }

    /// Evaluates source and mutators without post-processing.
    pub fn call_raw(&self, index: &[usize]) -> Result<T> {
        let producer = self.producer()?;
        self.evaluate(&producer, index)
    }

    /// Evaluates the pipeline for `index`.
    pub fn call(&self, index: &[usize]) -> Result<O> {
        let producer = self.producer()?;
        let value = self.evaluate(&producer, index)?;
        (producer.post_processor)(index, value, self.context.step_size())
    }

    fn evaluate(&self, producer: &Producer<T, M, O>, index: &[usize]) -> Result<T> {
        let _frame = EvaluationFrame::enter(&self.stack, &self.inner.name)?;
        let mutators: Vec<Mutator<T, M>> = self.inner.mutators.borrow().iter().flatten().cloned().collect();

        let mut value = (producer.source)(index)?;
        for mutator in mutators {
            let mutated = mutator(index, &value)?;
            value = (producer.combiner)(value, mutated);
        }
        Ok(value)
    }

    fn set_producer(&self, producer: Producer<T, M, O>) -> std::result::Result<(), DynamicValueError> {
        let mut slot = self.inner.producer.borrow_mut();
        if slot.is_some() {
            return Err(DynamicValueError::DuplicateSource(self.inner.name.clone()));
        }
        *slot = Some(producer);
        Ok(())
    }

    fn add_mutator(&self, priority: usize, mutator: Mutator<T, M>) -> std::result::Result<(), DynamicValueError> {
        if priority >= PRIORITY_LEVELS {
            return Err(DynamicValueError::InvalidPriority {
                name: self.inner.name.clone(),
                priority,
            });
        }
        self.inner.mutators.borrow_mut()[priority].push(mutator);
        Ok(())
    }
}

/// Names the value, mutation and output types of a pipeline alias so that
/// modifiers can be registered as `register_value_modifier::<RateValue, _>`.
pub trait PipelineType: 'static {
    type Value: 'static;
    type Mutation: 'static;
    type Output: 'static;
}

impl<T: 'static, M: 'static, O: 'static> PipelineType for Pipeline<T, M, O> {
    type Value = T;
    type Mutation = M;
    type Output = O;
}

/// Registry of every pipeline in a simulation.
#[derive(Clone)]
pub struct ValuesManager {
    pipelines: Rc<RefCell<IndexMap<String, Rc<dyn Any>>>>,
    stack: Rc<RefCell<Vec<String>>>,
    context: Rc<dyn RunContext>,
}

impl std::fmt::Debug for ValuesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuesManager")
            .field("pipelines", &self.keys())
            .finish()
    }
}

impl ValuesManager {
    pub fn new(context: Rc<dyn RunContext>) -> Self {
        Self {
            pipelines: Rc::new(RefCell::new(IndexMap::new())),
            stack: Rc::new(RefCell::new(Vec::new())),
            context,
        }
    }

    /// Returns the pipeline called `name`, creating it if needed.
    pub fn get_value<T: 'static, M: 'static, O: 'static>(
        &self,
        name: &str,
    ) -> std::result::Result<Pipeline<T, M, O>, DynamicValueError> {
        let mut pipelines = self.pipelines.borrow_mut();
        let entry = pipelines.entry(name.to_string()).or_insert_with(|| {
            Rc::new(PipelineInner::<T, M, O> {
                name: name.to_string(),
                producer: RefCell::new(None),
                mutators: RefCell::new((0..PRIORITY_LEVELS).map(|_| Vec::new()).collect()),
            }) as Rc<dyn Any>
        });
        let inner = Rc::clone(entry)
            .downcast::<PipelineInner<T, M, O>>()
            .map_err(|_| DynamicValueError::TypeMismatch(name.to_string()))?;
        Ok(Pipeline {
            inner,
            stack: Rc::clone(&self.stack),
            context: Rc::clone(&self.context),
        })
    }

    /// Registers the source of `name` with an explicit combiner and
    /// post-processor.
    pub fn register_value_producer_with<T, M, O, S>(
        &self,
        name: &str,
        source: S,
        combiner: Combiner<T, M>,
        post_processor: PostProcessor<T, O>,
    ) -> std::result::Result<Pipeline<T, M, O>, DynamicValueError>
    where
        T: 'static,
        M: 'static,
        O: 'static,
        S: Fn(&[usize]) -> Result<T> + 'static,
    {
        let pipeline = self.get_value::<T, M, O>(name)?;
        pipeline.set_producer(Producer {
            source: Rc::new(source),
            combiner,
            post_processor,
        })?;
        debug!(pipeline = name, "registered value producer");
        Ok(pipeline)
    }

    /// Registers a source whose mutators replace the value and whose output
    /// is not post-processed.
    pub fn register_value_producer<T, S>(
        &self,
        name: &str,
        source: S,
    ) -> std::result::Result<Pipeline<T, T, T>, DynamicValueError>
    where
        T: 'static,
        S: Fn(&[usize]) -> Result<T> + 'static,
    {
        self.register_value_producer_with(name, source, replace_combiner::<T>, Rc::new(identity_post_processor::<T>))
    }

    /// Registers an annual-rate source; outputs are rescaled to the step.
    pub fn register_rate_producer<S>(&self, name: &str, source: S) -> std::result::Result<RateValue, DynamicValueError>
    where
        S: Fn(&[usize]) -> Result<Vec<f64>> + 'static,
    {
        self.register_value_producer_with(name, source, replace_combiner::<Vec<f64>>, Rc::new(rescale_post_processor))
    }

    /// Registers a list of independent probabilities joined by union.
    pub fn register_joint_value_producer<S>(&self, name: &str, source: S) -> std::result::Result<JointValue, DynamicValueError>
    where
        S: Fn(&[usize]) -> Result<Vec<Vec<f64>>> + 'static,
    {
        self.register_value_producer_with(name, source, list_combiner::<Vec<f64>>, Rc::new(union_post_processor))
    }

    /// Adds a mutator to `name` at `priority` (0..=9, default 5).
    pub fn register_value_modifier<P, F>(&self, name: &str, priority: usize, modifier: F) -> std::result::Result<(), DynamicValueError>
    where
        P: PipelineType,
        F: Fn(&[usize], &P::Value) -> Result<P::Mutation> + 'static,
    {
        let pipeline = self.get_value::<P::Value, P::Mutation, P::Output>(name)?;
        pipeline.add_mutator(priority, Rc::new(modifier))?;
        debug!(pipeline = name, priority, "registered value modifier");
        Ok(())
    }

    /// Names of every pipeline created so far.
    pub fn keys(&self) -> Vec<String> {
        self.pipelines.borrow().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DEFAULT_PRIORITY;
    use crate::SimulationError;
    use approx::assert_relative_eq;
    use vitalsim_env::CalendarContext;

    fn values() -> ValuesManager {
        let ctx = CalendarContext::from_ymd(2000, 1, 1, 30.5, 0).unwrap();
        ValuesManager::new(Rc::new(ctx))
    }

    #[test]
    fn test_call_without_source_fails_even_with_mutators() {
        let values = values();
        values
            .register_value_modifier::<RateValue, _>("incidence", DEFAULT_PRIORITY, |_, v| Ok(v.clone()))
            .unwrap();
        let pipeline: RateValue = values.get_value("incidence").unwrap();
        assert!(matches!(
            pipeline.call(&[0]),
            Err(SimulationError::Value(DynamicValueError::NoSource(_)))
        ));
        assert!(pipeline.call_raw(&[0]).is_err());
    }

    #[test]
    fn test_joint_value_union() {
        let values = values();
        let paf = values
            .register_joint_value_producer("incidence.paf", |index| Ok(vec![vec![0.0; index.len()]]))
            .unwrap();
        assert_eq!(paf.call(&[0, 1]).unwrap(), vec![0.0, 0.0]);

        for _ in 0..2 {
            values
                .register_value_modifier::<JointValue, _>("incidence.paf", DEFAULT_PRIORITY, |index, _| {
                    Ok(vec![0.0; index.len()])
                })
                .unwrap();
        }
        assert_eq!(paf.call(&[0, 1]).unwrap(), vec![0.0, 0.0]);

        let values = self::values();
        let joint = values
            .register_joint_value_producer("j", |_| Ok(Vec::new()))
            .unwrap();
        for _ in 0..2 {
            values
                .register_value_modifier::<JointValue, _>("j", DEFAULT_PRIORITY, |index, _| Ok(vec![0.5; index.len()]))
                .unwrap();
        }
        for p in joint.call(&[0, 1, 2]).unwrap() {
            assert_relative_eq!(p, 0.75);
        }
        assert_eq!(joint.call_raw(&[0]).unwrap().len(), 2);
    }

    #[test]
    fn test_union_single_value_unchanged() {
        let step = vitalsim_env::duration_from_days(1.0).unwrap();
        assert_eq!(union_post_processor(&[0, 1], vec![vec![0.2, 0.4]], step).unwrap(), vec![0.2, 0.4]);
        assert_eq!(union_post_processor(&[0], vec![], step).unwrap(), vec![0.0]);
        assert!(union_post_processor(&[0], vec![vec![0.1, 0.2]], step).is_err());
    }

    #[test]
    fn test_rate_rescaled_to_step() {
        let values = values();
        let rate = values
            .register_rate_producer("mortality_rate", |index| Ok(vec![0.01; index.len()]))
            .unwrap();
        assert_relative_eq!(rate.call(&[7]).unwrap()[0], 0.0008356164383561645, epsilon = 1e-15);
        assert_eq!(rate.call_raw(&[7]).unwrap(), vec![0.01]);
    }

    #[test]
    fn test_modifiers_run_in_priority_order() {
        let values = values();
        let pipeline = values
            .register_value_producer("x", |index| Ok(vec![1.0; index.len()]))
            .unwrap();
        values
            .register_value_modifier::<RateValue, _>("x", 9, |_, v| Ok(v.iter().map(|x| x * 10.0).collect()))
            .unwrap();
        values
            .register_value_modifier::<RateValue, _>("x", 0, |_, v| Ok(v.iter().map(|x| x + 1.0).collect()))
            .unwrap();
        assert_eq!(pipeline.call(&[0]).unwrap(), vec![20.0]);
        assert_eq!(pipeline.mutator_count(), 2);

        assert!(matches!(
            values.register_value_modifier::<RateValue, _>("x", 10, |_, v| Ok(v.clone())),
            Err(DynamicValueError::InvalidPriority { .. })
        ));
    }

    #[test]
    fn test_duplicate_source_and_type_mismatch() {
        let values = values();
        values.register_value_producer("x", |_| Ok(1.0_f64)).unwrap();
        assert!(matches!(
            values.register_value_producer("x", |_| Ok(2.0_f64)),
            Err(DynamicValueError::DuplicateSource(_))
        ));
        assert!(matches!(
            values.get_value::<i64, i64, i64>("x"),
            Err(DynamicValueError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_cycle_is_reported_with_chain() {
        let values = values();
        let b: RateValue = values.get_value("b").unwrap();
        values
            .register_value_producer("a", move |index| b.call(index))
            .unwrap();
        let a: RateValue = values.get_value("a").unwrap();
        values
            .register_value_producer("b", move |index| a.call(index))
            .unwrap();

        let a: RateValue = values.get_value("a").unwrap();
        match a.call(&[0]) {
            Err(SimulationError::Value(DynamicValueError::Cycle { chain })) => {
                assert_eq!(chain, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        // The stack unwinds after a failure.
        assert!(matches!(
            a.call(&[0]),
            Err(SimulationError::Value(DynamicValueError::Cycle { .. }))
        ));
    }

    fn sorted(_index: &[usize], tags: BTreeSet<String>, _step: StepSize) -> Result<Vec<String>> {
        Ok(tags.into_iter().collect())
    }

    #[test]
    fn test_set_combiner() {
        let values = values();
        let tags = values
            .register_value_producer_with(
                "tags",
                |_| Ok(BTreeSet::new()),
                set_combiner::<String>,
                Rc::new(sorted),
            )
            .unwrap();
        type Tags = Pipeline<BTreeSet<String>, String, Vec<String>>;
        values
            .register_value_modifier::<Tags, _>("tags", 5, |_, _| Ok("b".to_string()))
            .unwrap();
        values
            .register_value_modifier::<Tags, _>("tags", 5, |_, _| Ok("a".to_string()))
            .unwrap();
        values
            .register_value_modifier::<Tags, _>("tags", 5, |_, _| Ok("a".to_string()))
            .unwrap();
        assert_eq!(tags.call(&[]).unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
