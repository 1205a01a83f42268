//! Reference-data lookup tables.
//!
//! A [`LookupTable`] turns externally supplied tabular data into a callable
//! from simulant ids to values. Depending on the data it is
//!
//! - **constant**: scalar input, the same value for everyone;
//! - **exact match**: key columns only, each simulant must match exactly one
//!   row;
//! - **interpolated**: data partitioned by key columns and interpolated over
//!   one or two parameter columns.
//!
//! A key or parameter column named `year` is read from the clock instead of
//! the population: the calendar year for keys, the fractional year for
//! parameters.

mod interpolation;

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;
use vitalsim_env::{fractional_year, RunContext};

use crate::error::{ensure_finite, Result};
use crate::population::{PopulationManager, PopulationView, Scalar};

pub use interpolation::{fit_bivariate, fit_univariate, Interpolant, MAX_ORDER};

/// Column name resolved from the simulation clock.
pub const YEAR_COLUMN: &str = "year";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup data has no column '{0}'")]
    MissingColumn(String),

    #[error("lookup column '{0}' must be numeric")]
    NotNumeric(String),

    #[error("lookup column '{column}' has {actual} rows, expected {expected}")]
    LengthMismatch { column: String, expected: usize, actual: usize },

    #[error("lookup data is empty")]
    EmptyTable,

    #[error("expected {expected} scalar values, got {actual}")]
    ScalarCount { expected: usize, actual: usize },

    #[error("key {key:?} matches {rows} rows of the reference data")]
    AmbiguousMatch { key: Vec<String>, rows: usize },

    #[error("key {0:?} matches no rows of the reference data")]
    NoMatch(Vec<String>),

    #[error("parameter value {0} appears more than once in a partition")]
    DuplicateParameter(f64),

    #[error("parameter grid is incomplete: expected {expected} points, got {actual}")]
    IncompleteGrid { expected: usize, actual: usize },

    #[error("interpolation order {0} is not supported")]
    UnsupportedOrder(usize),

    #[error("at most two parameter columns are supported, got {0}")]
    TooManyParameters(usize),

    #[error("lookup produces {0} value columns; call() must be used")]
    MultipleValues(usize),
}

/// One column of reference data.
#[derive(Debug, Clone, PartialEq)]
pub enum TableColumn {
    Categorical(Vec<String>),
    Numeric(Vec<f64>),
}

impl TableColumn {
    pub fn len(&self) -> usize {
        match self {
            TableColumn::Categorical(v) => v.len(),
            TableColumn::Numeric(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(&self, row: usize) -> String {
        match self {
            TableColumn::Categorical(v) => v[row].clone(),
            TableColumn::Numeric(v) => Scalar::Float(v[row]).key_string(),
        }
    }
}

/// Rectangular reference data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    columns: IndexMap<String, TableColumn>,
    len: usize,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, column: TableColumn) -> std::result::Result<Self, LookupError> {
        let name = name.into();
        if !self.columns.is_empty() && column.len() != self.len {
            return Err(LookupError::LengthMismatch {
                column: name,
                expected: self.len,
                actual: column.len(),
            });
        }
        self.len = column.len();
        self.columns.insert(name, column);
        Ok(self)
    }

    pub fn with_numeric(self, name: impl Into<String>, values: Vec<f64>) -> std::result::Result<Self, LookupError> {
        self.with_column(name, TableColumn::Numeric(values))
    }

    pub fn with_categorical<S: Into<String>>(
        self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> std::result::Result<Self, LookupError> {
        self.with_column(name, TableColumn::Categorical(values.into_iter().map(Into::into).collect()))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn column(&self, name: &str) -> std::result::Result<&TableColumn, LookupError> {
        self.columns
            .get(name)
            .ok_or_else(|| LookupError::MissingColumn(name.to_string()))
    }

    pub fn numeric(&self, name: &str) -> std::result::Result<&[f64], LookupError> {
        match self.column(name)? {
            TableColumn::Numeric(v) => Ok(v),
            TableColumn::Categorical(_) => Err(LookupError::NotNumeric(name.to_string())),
        }
    }

    fn key(&self, columns: &[String], row: usize) -> std::result::Result<Vec<String>, LookupError> {
        columns.iter().map(|c| Ok(self.column(c)?.key(row))).collect()
    }
}

/// Reference data handed to the lookup engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TableData {
    Scalar(f64),
    /// One constant per value column.
    Scalars(Vec<f64>),
    Table(DataTable),
}

impl From<f64> for TableData {
    fn from(v: f64) -> Self {
        TableData::Scalar(v)
    }
}

impl From<DataTable> for TableData {
    fn from(t: DataTable) -> Self {
        TableData::Table(t)
    }
}

/// Which columns of the data play which role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupSpec {
    pub key_columns: Vec<String>,
    pub parameter_columns: Vec<String>,
    pub value_columns: Vec<String>,
    /// Interpolation order; the manager default when unset.
    pub order: Option<usize>,
}

impl LookupSpec {
    pub fn new<S: AsRef<str>>(key_columns: &[S], parameter_columns: &[S], value_columns: &[S]) -> Self {
        let owned = |cols: &[S]| -> Vec<String> { cols.iter().map(|c| c.as_ref().to_string()).collect() };
        Self {
            key_columns: owned(key_columns),
            parameter_columns: owned(parameter_columns),
            value_columns: owned(value_columns),
            order: None,
        }
    }

    /// A single value column named `value` with no keys or parameters.
    pub fn scalar() -> Self {
        Self {
            value_columns: vec!["value".to_string()],
            ..Self::default()
        }
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = Some(order);
        self
    }
}

#[derive(Debug)]
enum LookupKind {
    Constant(Vec<f64>),
    ExactMatch(HashMap<Vec<String>, Vec<f64>>),
    Interpolated(HashMap<Vec<String>, Vec<Interpolant>>),
}

/// Values per value column, aligned with the requested index.
pub type LookupResult = IndexMap<String, Vec<f64>>;

/// Callable wrapper around reference data.
#[derive(Clone)]
pub struct LookupTable {
    kind: Rc<LookupKind>,
    spec: Rc<LookupSpec>,
    view: PopulationView,
    context: Rc<dyn RunContext>,
}

impl std::fmt::Debug for LookupTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupTable")
            .field("spec", &self.spec)
            .field("kind", &self.kind)
            .finish()
    }
}

impl LookupTable {
    pub fn spec(&self) -> &LookupSpec {
        &self.spec
    }

    /// Evaluates every value column for `index`.
    pub fn call(&self, index: &[usize]) -> Result<LookupResult> {
        let rows: Vec<Vec<f64>> = match self.kind.as_ref() {
            LookupKind::Constant(values) => values.iter().map(|&v| vec![v; index.len()]).collect(),
            LookupKind::ExactMatch(table) => {
                let keys = self.keys(index)?;
                let mut out = vec![Vec::with_capacity(index.len()); self.spec.value_columns.len()];
                for key in keys {
                    let values = table.get(&key).ok_or_else(|| LookupError::NoMatch(key.clone()))?;
                    for (column, &v) in out.iter_mut().zip(values) {
                        column.push(v);
                    }
                }
                out
            }
            LookupKind::Interpolated(partitions) => {
                let keys = self.keys(index)?;
                let parameters = self.parameters(index)?;
                let mut out = vec![Vec::with_capacity(index.len()); self.spec.value_columns.len()];
                for (pos, key) in keys.into_iter().enumerate() {
                    let fits = partitions.get(&key).ok_or_else(|| LookupError::NoMatch(key.clone()))?;
                    let a = parameters[0][pos];
                    let b = parameters.get(1).map_or(0.0, |p| p[pos]);
                    for (column, fit) in out.iter_mut().zip(fits) {
                        column.push(fit.evaluate(a, b));
                    }
                }
                out
            }
        };

        let mut result = LookupResult::new();
        for (name, values) in self.spec.value_columns.iter().zip(rows) {
            ensure_finite(&format!("lookup column '{}'", name), &values)?;
            result.insert(name.clone(), values);
        }
        Ok(result)
    }

    /// Evaluates a lookup with a single value column.
    pub fn call_value(&self, index: &[usize]) -> Result<Vec<f64>> {
        if self.spec.value_columns.len() != 1 {
            return Err(LookupError::MultipleValues(self.spec.value_columns.len()).into());
        }
        let mut result = self.call(index)?;
        Ok(result.swap_remove_index(0).map(|(_, v)| v).unwrap_or_default())
    }

    fn keys(&self, index: &[usize]) -> Result<Vec<Vec<String>>> {
        let frame = self.view.get(index)?;
        let year = self.context.now().format("%Y").to_string();
        let mut keys = vec![Vec::with_capacity(self.spec.key_columns.len()); frame.len()];
        for name in &self.spec.key_columns {
            if name == YEAR_COLUMN {
                keys.iter_mut().for_each(|k| k.push(year.clone()));
                continue;
            }
            let column = frame.column(name)?;
            for (pos, key) in keys.iter_mut().enumerate() {
                key.push(column.get(pos).map(|s| s.key_string()).unwrap_or_default());
            }
        }
        Ok(keys)
    }

    fn parameters(&self, index: &[usize]) -> Result<Vec<Vec<f64>>> {
        let frame = self.view.get(index)?;
        self.spec
            .parameter_columns
            .iter()
            .map(|name| -> Result<Vec<f64>> {
                if name == YEAR_COLUMN {
                    return Ok(vec![fractional_year(self.context.now()); index.len()]);
                }
                frame
                    .column(name)?
                    .to_floats()
                    .ok_or_else(|| LookupError::NotNumeric(name.clone()).into())
            })
            .collect()
    }
}

/// Builds lookup tables bound to the live population and clock.
#[derive(Clone)]
pub struct LookupTableManager {
    population: PopulationManager,
    context: Rc<dyn RunContext>,
    default_order: usize,
}

impl LookupTableManager {
    pub fn new(population: PopulationManager, context: Rc<dyn RunContext>, default_order: usize) -> Self {
        Self {
            population,
            context,
            default_order,
        }
    }

    pub fn default_order(&self) -> usize {
        self.default_order
    }

    /// Fits `data` according to `spec`.
    pub fn build_table(&self, data: impl Into<TableData>, spec: LookupSpec) -> std::result::Result<LookupTable, LookupError> {
        let mut spec = spec;
        let kind = match data.into() {
            TableData::Scalar(v) => {
                if spec.value_columns.is_empty() {
                    spec.value_columns.push("value".to_string());
                }
                if spec.value_columns.len() != 1 {
                    return Err(LookupError::ScalarCount {
                        expected: spec.value_columns.len(),
                        actual: 1,
                    });
                }
                LookupKind::Constant(vec![v])
            }
            TableData::Scalars(values) => {
                if values.len() != spec.value_columns.len() {
                    return Err(LookupError::ScalarCount {
                        expected: spec.value_columns.len(),
                        actual: values.len(),
                    });
                }
                LookupKind::Constant(values)
            }
            TableData::Table(table) => {
                if table.is_empty() {
                    return Err(LookupError::EmptyTable);
                }
                if spec.parameter_columns.is_empty() {
                    LookupKind::ExactMatch(self.exact_match(&table, &spec)?)
                } else {
                    let order = spec.order.unwrap_or(self.default_order);
                    spec.order = Some(order);
                    LookupKind::Interpolated(self.interpolate(&table, &spec, order)?)
                }
            }
        };

        let population_columns: Vec<&str> = spec
            .key_columns
            .iter()
            .chain(&spec.parameter_columns)
            .map(String::as_str)
            .filter(|c| *c != YEAR_COLUMN)
            .collect();
        debug!(
            keys = ?spec.key_columns,
            parameters = ?spec.parameter_columns,
            values = ?spec.value_columns,
            "built lookup table"
        );
        Ok(LookupTable {
            kind: Rc::new(kind),
            view: self.population.view_with_query(&population_columns, None),
            spec: Rc::new(spec),
            context: Rc::clone(&self.context),
        })
    }

    fn exact_match(
        &self,
        table: &DataTable,
        spec: &LookupSpec,
    ) -> std::result::Result<HashMap<Vec<String>, Vec<f64>>, LookupError> {
        let values: Vec<&[f64]> = spec
            .value_columns
            .iter()
            .map(|c| table.numeric(c))
            .collect::<std::result::Result<_, _>>()?;
        let mut rows: HashMap<Vec<String>, Vec<f64>> = HashMap::new();
        let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
        for row in 0..table.len() {
            let key = table.key(&spec.key_columns, row)?;
            *counts.entry(key.clone()).or_default() += 1;
            rows.insert(key, values.iter().map(|v| v[row]).collect());
        }
        if let Some((key, n)) = counts.iter().find(|(_, n)| **n > 1) {
            return Err(LookupError::AmbiguousMatch {
                key: key.clone(),
                rows: *n,
            });
        }
        Ok(rows)
    }

    fn interpolate(
        &self,
        table: &DataTable,
        spec: &LookupSpec,
        order: usize,
    ) -> std::result::Result<HashMap<Vec<String>, Vec<Interpolant>>, LookupError> {
        if spec.parameter_columns.len() > 2 {
            return Err(LookupError::TooManyParameters(spec.parameter_columns.len()));
        }
        let parameters: Vec<&[f64]> = spec
            .parameter_columns
            .iter()
            .map(|c| table.numeric(c))
            .collect::<std::result::Result<_, _>>()?;
        let values: Vec<&[f64]> = spec
            .value_columns
            .iter()
            .map(|c| table.numeric(c))
            .collect::<std::result::Result<_, _>>()?;

        let mut partitions: IndexMap<Vec<String>, Vec<usize>> = IndexMap::new();
        for row in 0..table.len() {
            partitions
                .entry(table.key(&spec.key_columns, row)?)
                .or_default()
                .push(row);
        }

        let gather = |column: &[f64], rows: &[usize]| -> Vec<f64> { rows.iter().map(|&r| column[r]).collect() };
        let mut fitted = HashMap::with_capacity(partitions.len());
        for (key, rows) in partitions {
            let x = gather(parameters[0], &rows);
            let fits = values
                .iter()
                .map(|column| {
                    let v = gather(column, &rows);
                    match parameters.get(1) {
                        Some(second) => fit_bivariate(&x, &gather(second, &rows), &v, order),
                        None => fit_univariate(&x, &v, order),
                    }
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            fitted.insert(key, fits);
        }
        Ok(fitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::population::{Column, Frame};
    use crate::SimulationError;
    use approx::assert_relative_eq;
    use vitalsim_env::CalendarContext;

    fn setup(ages: Vec<f64>, sexes: Vec<&str>) -> (LookupTableManager, Rc<CalendarContext>, Vec<usize>) {
        let ctx = Rc::new(CalendarContext::from_ymd(2005, 7, 2, 1.0, 0).unwrap());
        let population = PopulationManager::new(ctx.clone());
        let view = population.get_view(&["age", "sex"], None).unwrap();
        let sexes: Vec<String> = sexes.into_iter().map(String::from).collect();
        population.register_simulant_initializer("demo", &["age", "sex"], &[], move |data| {
            let frame = Frame::new(data.index.clone())
                .with_column("age", Column::Float(ages.clone()))?
                .with_column("sex", Column::Category(sexes.clone()))?;
            view.update(frame)?;
            Ok(())
        });
        let index = population.create_simulants(3, IndexMap::new()).unwrap();
        (LookupTableManager::new(population, ctx.clone(), 1), ctx, index)
    }

    fn rates_by_sex_and_age() -> DataTable {
        DataTable::new()
            .with_categorical("sex", ["Male", "Male", "Female", "Female"])
            .unwrap()
            .with_numeric("age", vec![0.0, 100.0, 0.0, 100.0])
            .unwrap()
            .with_numeric("rate", vec![0.0, 1.0, 0.0, 2.0])
            .unwrap()
    }

    #[test]
    fn test_scalar_is_constant() {
        let (lookups, _, index) = setup(vec![1.0, 2.0, 3.0], vec!["Male"; 3]);
        let table = lookups.build_table(0.25, LookupSpec::scalar()).unwrap();
        assert_eq!(table.call_value(&index).unwrap(), vec![0.25; 3]);
    }

    #[test]
    fn test_interpolated_by_key_partition() {
        let (lookups, _, index) = setup(vec![50.0, 50.0, 150.0], vec!["Male", "Female", "Female"]);
        let table = lookups
            .build_table(rates_by_sex_and_age(), LookupSpec::new(&["sex"], &["age"], &["rate"]))
            .unwrap();
        let rates = table.call_value(&index).unwrap();
        assert_relative_eq!(rates[0], 0.5);
        assert_relative_eq!(rates[1], 1.0);
        assert_relative_eq!(rates[2], 2.0);

        let step = lookups
            .build_table(
                rates_by_sex_and_age(),
                LookupSpec::new(&["sex"], &["age"], &["rate"]).with_order(0),
            )
            .unwrap();
        assert_eq!(step.call_value(&index).unwrap(), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_year_parameter_comes_from_clock() {
        let (lookups, ctx, index) = setup(vec![1.0, 2.0, 3.0], vec!["Male"; 3]);
        let data = DataTable::new()
            .with_numeric("year", vec![2005.0, 2006.0])
            .unwrap()
            .with_numeric("value", vec![10.0, 20.0])
            .unwrap();
        let table = lookups
            .build_table(data, LookupSpec::new(&[], &["year"], &["value"]))
            .unwrap();
        let expected = 10.0 + 10.0 * (fractional_year(ctx.now()) - 2005.0);
        for v in table.call_value(&index).unwrap() {
            assert_relative_eq!(v, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_exact_match() {
        let (lookups, _, index) = setup(vec![1.0, 2.0, 3.0], vec!["Male", "Female", "Male"]);
        let data = DataTable::new()
            .with_categorical("sex", ["Male", "Female"])
            .unwrap()
            .with_numeric("year", vec![2005.0, 2005.0])
            .unwrap()
            .with_numeric("value", vec![1.0, 2.0])
            .unwrap()
            .with_numeric("other", vec![3.0, 4.0])
            .unwrap();
        let table = lookups
            .build_table(data, LookupSpec::new(&["sex", "year"], &[], &["value", "other"]))
            .unwrap();
        let result = table.call(&index).unwrap();
        assert_eq!(result["value"], vec![1.0, 2.0, 1.0]);
        assert_eq!(result["other"], vec![3.0, 4.0, 3.0]);
        assert!(matches!(
            table.call_value(&index),
            Err(SimulationError::Lookup(LookupError::MultipleValues(2)))
        ));
    }

    #[test]
    fn test_exact_match_fails_loudly() {
        let (lookups, _, index) = setup(vec![1.0, 2.0, 3.0], vec!["Male", "Female", "Male"]);
        let duplicated = DataTable::new()
            .with_categorical("sex", ["Male", "Male"])
            .unwrap()
            .with_numeric("value", vec![1.0, 2.0])
            .unwrap();
        assert!(matches!(
            lookups.build_table(duplicated, LookupSpec::new(&["sex"], &[], &["value"])),
            Err(LookupError::AmbiguousMatch { rows: 2, .. })
        ));

        let incomplete = DataTable::new()
            .with_categorical("sex", ["Male"])
            .unwrap()
            .with_numeric("value", vec![1.0])
            .unwrap();
        let table = lookups
            .build_table(incomplete, LookupSpec::new(&["sex"], &[], &["value"]))
            .unwrap();
        assert!(matches!(
            table.call(&index),
            Err(SimulationError::Lookup(LookupError::NoMatch(_)))
        ));
    }

    #[test]
    fn test_build_errors() {
        let (lookups, _, _) = setup(vec![1.0, 2.0, 3.0], vec!["Male"; 3]);
        assert!(matches!(
            lookups.build_table(
                rates_by_sex_and_age(),
                LookupSpec::new(&["sex"], &["age"], &["rate"]).with_order(3)
            ),
            Err(LookupError::UnsupportedOrder(3))
        ));
        assert!(matches!(
            lookups.build_table(rates_by_sex_and_age(), LookupSpec::new(&[], &["sex"], &["rate"])),
            Err(LookupError::NotNumeric(_))
        ));
        assert!(DataTable::new()
            .with_numeric("a", vec![1.0])
            .unwrap()
            .with_numeric("b", vec![1.0, 2.0])
            .is_err());
    }
}
