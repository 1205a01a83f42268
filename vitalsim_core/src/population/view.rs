use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::column::{Column, Frame, Series};
use super::query::Query;
use super::{PopulationError, PopulationTable};
use tracing::trace;

/// Column-restricted access to the population table.
///
/// Reads return copies. Writes of columns outside the view are dropped
/// without error, so several components can share overlapping frames.
/// An empty column list means every column in the table.
#[derive(Debug, Clone)]
pub struct PopulationView {
    table: Weak<RefCell<PopulationTable>>,
    columns: Vec<String>,
    query: Option<Query>,
}

impl PopulationView {
    pub(crate) fn new(table: Weak<RefCell<PopulationTable>>, columns: Vec<String>, query: Option<Query>) -> Self {
        Self { table, columns, query }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    fn table(&self) -> Result<Rc<RefCell<PopulationTable>>, PopulationError> {
        self.table.upgrade().ok_or(PopulationError::TableDropped)
    }

    fn allows(&self, column: &str) -> bool {
        self.columns.is_empty() || self.columns.iter().any(|c| c == column)
    }

    /// Reads the view's columns for the simulants in `index` that pass the
    /// view's filter.
    pub fn get(&self, index: &[usize]) -> Result<Frame, PopulationError> {
        self.read(index, self.query.as_ref())
    }

    /// Like `get`, additionally filtering by `extra`.
    pub fn get_with(&self, index: &[usize], extra: &str) -> Result<Frame, PopulationError> {
        let extra = Query::parse(extra)?;
        let query = match &self.query {
            Some(own) => own.clone().and(extra),
            None => extra,
        };
        self.read(index, Some(&query))
    }

    fn read(&self, index: &[usize], query: Option<&Query>) -> Result<Frame, PopulationError> {
        let table = self.table()?;
        let table = table.borrow();
        table.check_index(index)?;

        let kept: Vec<usize> = match query {
            Some(query) => {
                let lookup = |name: &str| table.column(name);
                let mask = query.evaluate(&lookup, index)?;
                index
                    .iter()
                    .zip(mask)
                    .filter(|(_, keep)| *keep)
                    .map(|(&i, _)| i)
                    .collect()
            }
            None => index.to_vec(),
        };

        let names: Vec<String> = if self.columns.is_empty() {
            table.column_names().map(str::to_string).collect()
        } else {
            self.columns.clone()
        };
        let mut frame = Frame::new(kept.clone());
        for name in names {
            let column = table
                .column(&name)
                .ok_or_else(|| PopulationError::MissingColumn(name.clone()))?;
            frame.insert(name, column.take(&kept))?;
        }
        Ok(frame)
    }

    /// Returns a view over a subset of this view's columns with the same
    /// filter.
    pub fn subview(&self, columns: &[&str]) -> Result<PopulationView, PopulationError> {
        if let Some(missing) = columns.iter().find(|c| !self.allows(c)) {
            return Err(PopulationError::NotInView {
                column: missing.to_string(),
                view: self.columns.clone(),
            });
        }
        Ok(PopulationView::new(
            self.table.clone(),
            columns.iter().map(|c| c.to_string()).collect(),
            self.query.clone(),
        ))
    }

    /// Writes every column of `frame` that belongs to this view.
    ///
    /// Rows are taken from the frame's index. An empty frame is a no-op,
    /// except while simulants are being created, where it still creates the
    /// frame's columns.
    pub fn update(&self, frame: Frame) -> Result<(), PopulationError> {
        if frame.columns().is_empty() {
            return Ok(());
        }
        let table = self.table()?;
        let mut table = table.borrow_mut();
        if frame.index().is_empty() && !table.is_growing() {
            return Ok(());
        }
        let (index, columns) = frame.into_parts();
        for (name, values) in columns {
            if self.allows(&name) {
                table.write(&name, &index, values)?;
            } else {
                trace!(column = %name, "dropping write outside the view");
            }
        }
        Ok(())
    }

    /// Writes a single series.
    ///
    /// A series named after one of the view's columns updates that column.
    /// An unnamed or differently named series is accepted only when the
    /// view has exactly one column.
    pub fn update_series(&self, series: Series) -> Result<(), PopulationError> {
        let target = match &series.name {
            Some(name) if self.columns.iter().any(|c| c == name) => name.clone(),
            _ if self.columns.len() == 1 => self.columns[0].clone(),
            _ => {
                return Err(PopulationError::AmbiguousSeries {
                    name: series.name,
                    columns: self.columns.clone(),
                })
            }
        };
        self.update_column(&target, &series.index, series.values)
    }

    /// Writes one column for the simulants in `index`.
    ///
    /// A column outside the view is dropped, like in `update`.
    pub fn update_column(&self, name: &str, index: &[usize], values: Column) -> Result<(), PopulationError> {
        if !self.allows(name) {
            trace!(column = name, "dropping write outside the view");
            return Ok(());
        }
        let table = self.table()?;
        let mut table = table.borrow_mut();
        if index.is_empty() && !table.is_growing() {
            return Ok(());
        }
        table.write(name, index, values)
    }
}
