//! Simulant state table.
//!
//! The [`PopulationManager`] is the only owner of the table. Components read
//! and write it through [`PopulationView`]s, which hold a weak handle and are
//! restricted to a fixed set of columns and an optional row filter.
//!
//! Rows are never removed or renumbered, so a simulant's id is also its row
//! position for the lifetime of a run.

mod column;
mod manager;
mod query;
mod view;

use indexmap::IndexMap;
use thiserror::Error;

pub use column::{Column, DType, Frame, Scalar, Series};
pub use manager::{PopulationManager, SimulantCreator, SimulantData};
pub use query::{CmpOp, Query};
pub use view::PopulationView;

/// View and table contract violations.
#[derive(Debug, Error)]
pub enum PopulationError {
    #[error("column '{0}' does not exist")]
    MissingColumn(String),

    #[error("column '{column}' is not part of this view (columns: {view:?})")]
    NotInView { column: String, view: Vec<String> },

    #[error("cannot update a view with columns {columns:?} from a series named {name:?}")]
    AmbiguousSeries { name: Option<String>, columns: Vec<String> },

    #[error("column '{column}' has dtype {expected:?}, got {actual:?}")]
    DtypeMismatch { column: String, expected: DType, actual: DType },

    #[error("column '{column}' expected {expected} values, got {actual}")]
    LengthMismatch { column: String, expected: usize, actual: usize },

    #[error("simulant {0} does not exist")]
    UnknownSimulant(usize),

    #[error("invalid query: {0}")]
    Query(String),

    #[error("the population table has been dropped")]
    TableDropped,

    #[error("simulants cannot be created while another creation is running")]
    CreationInProgress,
}

/// Failures resolving the column initializer dependency graph.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("column '{column}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer { column: String, first: String, second: String },

    #[error("initializer '{initializer}' requires columns {columns:?} that nothing produces")]
    MissingProducer { initializer: String, columns: Vec<String> },

    #[error("initializers {initializers:?} have dependencies that can never be satisfied")]
    Cycle { initializers: Vec<String> },

    #[error("initializer '{initializer}' did not create its columns {columns:?}")]
    NotCreated { initializer: String, columns: Vec<String> },
}

/// The canonical table: one row per simulant, one column per attribute.
#[derive(Debug, Default)]
pub struct PopulationTable {
    columns: IndexMap<String, Column>,
    len: usize,
    growing: bool,
}

impl PopulationTable {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True while simulants are being created.
    pub fn is_growing(&self) -> bool {
        self.growing
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub(crate) fn set_growing(&mut self, growing: bool) {
        self.growing = growing;
    }

    /// Appends `count` rows and returns their ids.
    pub(crate) fn extend(&mut self, count: usize) -> Vec<usize> {
        let start = self.len;
        for column in self.columns.values_mut() {
            column.extend_default(count);
        }
        self.len += count;
        (start..self.len).collect()
    }

    pub(crate) fn check_index(&self, index: &[usize]) -> Result<(), PopulationError> {
        match index.iter().find(|&&i| i >= self.len) {
            Some(&i) => Err(PopulationError::UnknownSimulant(i)),
            None => Ok(()),
        }
    }

    /// Writes `values` to the rows in `index`.
    ///
    /// While growing, missing columns are created and numeric values are
    /// coerced to the column dtype. Otherwise the column must exist and the
    /// dtypes must match exactly.
    pub(crate) fn write(&mut self, name: &str, index: &[usize], values: Column) -> Result<(), PopulationError> {
        self.check_index(index)?;
        if !self.columns.contains_key(name) {
            if !self.growing {
                return Err(PopulationError::MissingColumn(name.to_string()));
            }
            self.columns
                .insert(name.to_string(), Column::filled(values.dtype(), self.len));
        }
        let len = self.len;
        let column = self
            .columns
            .get_mut(name)
            .ok_or_else(|| PopulationError::MissingColumn(name.to_string()))?;
        let values = if self.growing && values.dtype() != column.dtype() {
            let actual = values.dtype();
            values
                .coerce(column.dtype())
                .ok_or(PopulationError::DtypeMismatch {
                    column: name.to_string(),
                    expected: column.dtype(),
                    actual,
                })?
        } else {
            values
        };
        debug_assert_eq!(column.len(), len);
        column.scatter(name, index, values)
    }

    /// Copies the whole table into a frame.
    pub fn to_frame(&self) -> Frame {
        let index: Vec<usize> = (0..self.len).collect();
        Frame::from_parts(index, self.columns.clone())
    }
}
