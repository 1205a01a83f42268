use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::{debug, info};
use vitalsim_env::{RunContext, SimTime, StepSize};

use super::column::Frame;
use super::query::Query;
use super::view::PopulationView;
use super::{PopulationError, PopulationTable, ResourceError};
use crate::error::Result;

/// What an initializer is told about the simulants being created.
#[derive(Debug, Clone)]
pub struct SimulantData {
    /// Ids of the new rows.
    pub index: Vec<usize>,
    pub creation_time: SimTime,
    /// Length of the step in which the simulants appear.
    pub creation_window: StepSize,
    /// Caller-supplied parameters, e.g. an age range for births.
    pub user_data: IndexMap<String, f64>,
}

type InitializerFn = Box<dyn FnMut(&SimulantData) -> Result<()>>;

struct Initializer {
    name: String,
    creates: Vec<String>,
    requires: Vec<String>,
    func: RefCell<InitializerFn>,
}

struct ManagerInner {
    table: Rc<RefCell<PopulationTable>>,
    initializers: RefCell<Vec<Rc<Initializer>>>,
    order: RefCell<Option<Vec<Rc<Initializer>>>>,
    creating: Cell<bool>,
    context: Rc<dyn RunContext>,
}

/// Owner of the population table.
///
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct PopulationManager {
    inner: Rc<ManagerInner>,
}

impl std::fmt::Debug for PopulationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopulationManager")
            .field("simulants", &self.len())
            .field("initializers", &self.inner.initializers.borrow().len())
            .finish()
    }
}

/// Resets the growth flags even if an initializer fails.
struct GrowthGuard<'a> {
    inner: &'a ManagerInner,
}

impl<'a> GrowthGuard<'a> {
    fn enter(inner: &'a ManagerInner) -> Self {
        inner.creating.set(true);
        inner.table.borrow_mut().set_growing(true);
        Self { inner }
    }
}

impl Drop for GrowthGuard<'_> {
    fn drop(&mut self) {
        self.inner.creating.set(false);
        if let Ok(mut table) = self.inner.table.try_borrow_mut() {
            table.set_growing(false);
        }
    }
}

impl PopulationManager {
    pub fn new(context: Rc<dyn RunContext>) -> Self {
        Self {
            inner: Rc::new(ManagerInner {
                table: Rc::new(RefCell::new(PopulationTable::default())),
                initializers: RefCell::new(Vec::new()),
                order: RefCell::new(None),
                creating: Cell::new(false),
                context,
            }),
        }
    }

    /// Returns a view over `columns` (all columns if empty), optionally
    /// filtered by a query such as `"alive and age >= 25"`.
    pub fn get_view(&self, columns: &[&str], query: Option<&str>) -> std::result::Result<PopulationView, PopulationError> {
        let query = query.map(Query::parse).transpose()?;
        Ok(self.view_with_query(columns, query))
    }

    /// Returns a view with an already built query.
    pub fn view_with_query(&self, columns: &[&str], query: Option<Query>) -> PopulationView {
        PopulationView::new(
            Rc::downgrade(&self.inner.table),
            columns.iter().map(|c| c.to_string()).collect(),
            query,
        )
    }

    /// Declares that `func` fills `creates` for new simulants and needs
    /// `requires` to be filled first.
    pub fn register_simulant_initializer<F>(&self, name: &str, creates: &[&str], requires: &[&str], func: F)
    where
        F: FnMut(&SimulantData) -> Result<()> + 'static,
    {
        debug!(initializer = name, ?creates, ?requires, "registered simulant initializer");
        self.inner.initializers.borrow_mut().push(Rc::new(Initializer {
            name: name.to_string(),
            creates: creates.iter().map(|c| c.to_string()).collect(),
            requires: requires.iter().map(|c| c.to_string()).collect(),
            func: RefCell::new(Box::new(func)),
        }));
        self.inner.order.borrow_mut().take();
    }

    /// Appends `count` rows and runs every initializer over them in
    /// dependency order. Returns the new ids.
    pub fn create_simulants(&self, count: usize, user_data: IndexMap<String, f64>) -> Result<Vec<usize>> {
        if self.inner.creating.get() {
            return Err(PopulationError::CreationInProgress.into());
        }
        let order = self.initialization_order()?;
        let _guard = GrowthGuard::enter(&self.inner);

        let index = self.inner.table.borrow_mut().extend(count);
        let data = SimulantData {
            index,
            creation_time: self.inner.context.now(),
            creation_window: self.inner.context.step_size(),
            user_data,
        };

        for initializer in order {
            {
                let mut func = initializer.func.borrow_mut();
                (*func)(&data)?;
            }
            let table = self.inner.table.borrow();
            let missing: Vec<String> = initializer
                .creates
                .iter()
                .filter(|c| !table.has_column(c))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(ResourceError::NotCreated {
                    initializer: initializer.name.clone(),
                    columns: missing,
                }
                .into());
            }
        }

        info!(count, total = self.len(), "created simulants");
        Ok(data.index)
    }

    fn initialization_order(&self) -> std::result::Result<Vec<Rc<Initializer>>, ResourceError> {
        if let Some(order) = self.inner.order.borrow().as_ref() {
            return Ok(order.clone());
        }
        let initializers = self.inner.initializers.borrow().clone();
        let existing: HashSet<String> = self.inner.table.borrow().column_names().map(str::to_string).collect();
        let order = resolve_order(initializers, existing)?;
        debug!(
            order = ?order.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            "resolved initializer order"
        );
        *self.inner.order.borrow_mut() = Some(order.clone());
        Ok(order)
    }

    /// Ids of every simulant ever created.
    pub fn index(&self) -> Vec<usize> {
        (0..self.len()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_growing(&self) -> bool {
        self.inner.table.borrow().is_growing()
    }

    /// Copies the whole table.
    pub fn snapshot(&self) -> Frame {
        self.inner.table.borrow().to_frame()
    }

    /// A handle that lets listeners add simulants mid-run.
    pub fn simulant_creator(&self) -> SimulantCreator {
        SimulantCreator {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

/// Brute-force fixed-point ordering of initializers by (creates, requires).
fn resolve_order(
    initializers: Vec<Rc<Initializer>>,
    existing: HashSet<String>,
) -> std::result::Result<Vec<Rc<Initializer>>, ResourceError> {
    let mut producers: HashMap<&str, &str> = HashMap::new();
    for initializer in &initializers {
        for column in &initializer.creates {
            if let Some(first) = producers.insert(column, &initializer.name) {
                return Err(ResourceError::DuplicateProducer {
                    column: column.clone(),
                    first: first.to_string(),
                    second: initializer.name.clone(),
                });
            }
        }
    }
    for initializer in &initializers {
        let missing: Vec<String> = initializer
            .requires
            .iter()
            .filter(|c| !producers.contains_key(c.as_str()) && !existing.contains(*c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ResourceError::MissingProducer {
                initializer: initializer.name.clone(),
                columns: missing,
            });
        }
    }

    let mut available = existing;
    let mut remaining = initializers.clone();
    let mut order = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|i| i.requires.iter().all(|c| available.contains(c)));
        if ready.is_empty() {
            return Err(ResourceError::Cycle {
                initializers: blocked.iter().map(|i| i.name.clone()).collect(),
            });
        }
        for initializer in ready {
            available.extend(initializer.creates.iter().cloned());
            order.push(initializer);
        }
        remaining = blocked;
    }
    Ok(order)
}

/// Weak handle for creating simulants from inside listeners.
#[derive(Clone)]
pub struct SimulantCreator {
    inner: Weak<ManagerInner>,
}

impl SimulantCreator {
    pub fn create(&self, count: usize, user_data: IndexMap<String, f64>) -> Result<Vec<usize>> {
        let inner = self.inner.upgrade().ok_or(PopulationError::TableDropped)?;
        PopulationManager { inner }.create_simulants(count, user_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::population::{Column, Series};
    use crate::SimulationError;
    use vitalsim_env::CalendarContext;

    fn manager() -> PopulationManager {
        let ctx = CalendarContext::from_ymd(2000, 1, 1, 30.5, 1).unwrap();
        PopulationManager::new(Rc::new(ctx))
    }

    #[test]
    fn test_initializers_run_in_dependency_order() {
        let pop = manager();
        let log = Rc::new(RefCell::new(Vec::new()));

        // Registered in reverse dependency order.
        let view = pop.get_view(&["risk"], None).unwrap();
        let reader = pop.get_view(&["age"], None).unwrap();
        let l = Rc::clone(&log);
        pop.register_simulant_initializer("risk", &["risk"], &["age"], move |data| {
            l.borrow_mut().push("risk");
            let ages = reader.get(&data.index)?;
            let risk: Vec<f64> = ages.floats("age")?.iter().map(|a| a / 100.0).collect();
            view.update_column("risk", &data.index, Column::Float(risk))?;
            Ok(())
        });

        let view = pop.get_view(&["age"], None).unwrap();
        let l = Rc::clone(&log);
        pop.register_simulant_initializer("age", &["age"], &[], move |data| {
            l.borrow_mut().push("age");
            view.update_column("age", &data.index, Column::Float(vec![50.0; data.index.len()]))?;
            Ok(())
        });

        let index = pop.create_simulants(4, IndexMap::new()).unwrap();
        assert_eq!(index, vec![0, 1, 2, 3]);
        assert_eq!(*log.borrow(), vec!["age", "risk"]);
        assert!(!pop.is_growing());

        let frame = pop.get_view(&["risk"], None).unwrap().get(&index).unwrap();
        assert_eq!(frame.floats("risk").unwrap(), &[0.5; 4]);
    }

    #[test]
    fn test_cycle_names_stuck_initializers() {
        let pop = manager();
        pop.register_simulant_initializer("a", &["x"], &["y"], |_| Ok(()));
        pop.register_simulant_initializer("b", &["y"], &["x"], |_| Ok(()));
        pop.register_simulant_initializer("c", &["z"], &[], |_| Ok(()));

        match pop.create_simulants(1, IndexMap::new()) {
            Err(SimulationError::Resource(ResourceError::Cycle { initializers })) => {
                assert_eq!(initializers, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
        assert!(pop.is_empty());
    }

    #[test]
    fn test_missing_and_duplicate_producers() {
        let pop = manager();
        pop.register_simulant_initializer("a", &["x"], &["nowhere"], |_| Ok(()));
        let err = pop.create_simulants(1, IndexMap::new()).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
        assert!(err.to_string().contains("'a'"));

        let pop = manager();
        pop.register_simulant_initializer("a", &["x"], &[], |_| Ok(()));
        pop.register_simulant_initializer("b", &["x"], &[], |_| Ok(()));
        assert!(matches!(
            pop.create_simulants(1, IndexMap::new()),
            Err(SimulationError::Resource(ResourceError::DuplicateProducer { .. }))
        ));
    }

    #[test]
    fn test_initializer_must_create_its_columns() {
        let pop = manager();
        pop.register_simulant_initializer("lazy", &["x"], &[], |_| Ok(()));
        assert!(matches!(
            pop.create_simulants(1, IndexMap::new()),
            Err(SimulationError::Resource(ResourceError::NotCreated { .. }))
        ));
        assert!(!pop.is_growing());
    }

    fn two_column_population() -> PopulationManager {
        let pop = manager();
        let view = pop.get_view(&["alive", "age"], None).unwrap();
        pop.register_simulant_initializer("base", &["alive", "age"], &[], move |data| {
            let n = data.index.len();
            let frame = Frame::new(data.index.clone())
                .with_column("alive", Column::Bool((0..n).map(|i| i % 2 == 0).collect()))?
                .with_column("age", Column::Float((0..n).map(|i| i as f64 * 10.0).collect()))?;
            view.update(frame)?;
            Ok(())
        });
        pop.create_simulants(4, IndexMap::new()).unwrap();
        pop
    }

    #[test]
    fn test_series_update_single_column_view() {
        let pop = two_column_population();
        let view = pop.get_view(&["age"], None).unwrap();
        view.update_series(Series::named("age", vec![1], Column::Float(vec![99.0])))
            .unwrap();
        view.update_series(Series::new(vec![2], Column::Float(vec![77.0]))).unwrap();
        assert_eq!(view.get(&[1, 2]).unwrap().floats("age").unwrap(), &[99.0, 77.0]);
    }

    #[test]
    fn test_series_update_ambiguous_in_multi_column_view() {
        let pop = two_column_population();
        let view = pop.get_view(&["alive", "age"], None).unwrap();
        let err = view
            .update_series(Series::named("height", vec![0], Column::Float(vec![1.0])))
            .unwrap_err();
        assert!(matches!(err, PopulationError::AmbiguousSeries { .. }));

        view.update_series(Series::named("age", vec![0], Column::Float(vec![5.0])))
            .unwrap();
        assert_eq!(view.get(&[0]).unwrap().floats("age").unwrap(), &[5.0]);
    }

    #[test]
    fn test_view_drops_foreign_columns_and_filters_rows() {
        let pop = two_column_population();
        let ages = pop.get_view(&["age"], Some("alive")).unwrap();

        let frame = Frame::new(vec![0, 1])
            .with_column("age", Column::Float(vec![1.0, 2.0]))
            .unwrap()
            .with_column("alive", Column::Bool(vec![false, false]))
            .unwrap();
        ages.update(frame).unwrap();
        ages.update(Frame::new(vec![])).unwrap();

        let all = pop.get_view(&[], None).unwrap().get(&pop.index()).unwrap();
        assert_eq!(all.bools("alive").unwrap(), &[true, false, true, false]);
        assert_eq!(all.floats("age").unwrap(), &[1.0, 2.0, 20.0, 30.0]);

        let living = ages.get(&pop.index()).unwrap();
        assert_eq!(living.index(), &[0, 2]);
        assert_eq!(ages.get_with(&pop.index(), "age > 10").unwrap().index(), &[2]);
    }

    #[test]
    fn test_column_write_outside_view_is_dropped() {
        let pop = two_column_population();
        let ages = pop.get_view(&["age"], None).unwrap();
        ages.update_column("alive", &[1, 3], Column::Bool(vec![true, true])).unwrap();
        ages.update_column("tracked", &[0], Column::Bool(vec![true])).unwrap();

        let all = pop.get_view(&[], None).unwrap().get(&pop.index()).unwrap();
        assert_eq!(all.bools("alive").unwrap(), &[true, false, true, false]);
        assert!(all.columns().get("tracked").is_none());
    }

    #[test]
    fn test_zero_simulants_still_create_columns() {
        let pop = manager();
        let view = pop.get_view(&["age", "sex"], None).unwrap();
        pop.register_simulant_initializer("base", &["age", "sex"], &[], move |data| {
            let n = data.index.len();
            view.update_column("age", &data.index, Column::Float(vec![0.0; n]))?;
            let frame = Frame::new(data.index.clone()).with_column("sex", Column::Category(vec!["Male".to_string(); n]))?;
            view.update(frame)?;
            Ok(())
        });

        assert!(pop.create_simulants(0, IndexMap::new()).unwrap().is_empty());
        let frame = pop.snapshot();
        assert_eq!(frame.len(), 0);
        assert!(frame.floats("age").unwrap().is_empty());
        assert!(frame.categories("sex").unwrap().is_empty());

        assert_eq!(pop.create_simulants(2, IndexMap::new()).unwrap(), vec![0, 1]);
        assert_eq!(pop.snapshot().floats("age").unwrap(), &[0.0, 0.0]);
    }

    #[test]
    fn test_steady_state_dtype_enforced() {
        let pop = two_column_population();
        let view = pop.get_view(&["age"], None).unwrap();
        let err = view.update_column("age", &[0], Column::Int(vec![3])).unwrap_err();
        assert!(matches!(err, PopulationError::DtypeMismatch { .. }));

        assert!(matches!(
            pop.get_view(&["height"], None).unwrap().get(&[0]),
            Err(PopulationError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_subview_and_creator() {
        let pop = two_column_population();
        let view = pop.get_view(&["alive", "age"], Some("alive")).unwrap();
        let sub = view.subview(&["age"]).unwrap();
        assert_eq!(sub.get(&pop.index()).unwrap().index(), &[0, 2]);
        assert!(view.subview(&["sex"]).is_err());

        let creator = pop.simulant_creator();
        assert_eq!(creator.create(2, IndexMap::new()).unwrap(), vec![4, 5]);
        assert_eq!(pop.snapshot().len(), 6);
    }
}
