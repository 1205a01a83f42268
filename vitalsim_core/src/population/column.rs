//! Typed columns, frames and series exchanged with population views.

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::PopulationError;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Float,
    Int,
    Bool,
    Category,
    Time,
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    Time(Option<NaiveDateTime>),
}

impl Scalar {
    /// Returns the value as a float if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(v) => Some(*v),
            Scalar::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Renders the value as a lookup key.
    ///
    /// Integral floats render without a fractional part so that `1990.0` in
    /// a reference table matches an integer `1990` column.
    pub fn key_string(&self) -> String {
        match self {
            Scalar::Float(v) if v.fract() == 0.0 && v.is_finite() => format!("{}", *v as i64),
            Scalar::Float(v) => v.to_string(),
            Scalar::Int(v) => v.to_string(),
            Scalar::Bool(v) => v.to_string(),
            Scalar::Str(v) => v.clone(),
            Scalar::Time(Some(t)) => t.to_string(),
            Scalar::Time(None) => "NaT".to_string(),
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(v: NaiveDateTime) -> Self {
        Scalar::Time(Some(v))
    }
}

/// A homogeneous column of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    Category(Vec<String>),
    Time(Vec<Option<NaiveDateTime>>),
}

impl Column {
    /// A column of `len` default values: NaN, 0, false, "" or no time.
    pub fn filled(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::Float => Column::Float(vec![f64::NAN; len]),
            DType::Int => Column::Int(vec![0; len]),
            DType::Bool => Column::Bool(vec![false; len]),
            DType::Category => Column::Category(vec![String::new(); len]),
            DType::Time => Column::Time(vec![None; len]),
        }
    }

    /// A column repeating `value` `len` times.
    pub fn repeat(value: impl Into<Scalar>, len: usize) -> Self {
        match value.into() {
            Scalar::Float(v) => Column::Float(vec![v; len]),
            Scalar::Int(v) => Column::Int(vec![v; len]),
            Scalar::Bool(v) => Column::Bool(vec![v; len]),
            Scalar::Str(v) => Column::Category(vec![v; len]),
            Scalar::Time(v) => Column::Time(vec![v; len]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Column::Float(_) => DType::Float,
            Column::Int(_) => DType::Int,
            Column::Bool(_) => DType::Bool,
            Column::Category(_) => DType::Category,
            Column::Time(_) => DType::Time,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Category(v) => v.len(),
            Column::Time(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value at `position`.
    pub fn get(&self, position: usize) -> Option<Scalar> {
        match self {
            Column::Float(v) => v.get(position).map(|x| Scalar::Float(*x)),
            Column::Int(v) => v.get(position).map(|x| Scalar::Int(*x)),
            Column::Bool(v) => v.get(position).map(|x| Scalar::Bool(*x)),
            Column::Category(v) => v.get(position).map(|x| Scalar::Str(x.clone())),
            Column::Time(v) => v.get(position).map(|x| Scalar::Time(*x)),
        }
    }

    /// Gathers the values at `positions` into a new column.
    pub fn take(&self, positions: &[usize]) -> Column {
        fn gather<T: Clone>(values: &[T], positions: &[usize]) -> Vec<T> {
            positions.iter().map(|&p| values[p].clone()).collect()
        }
        match self {
            Column::Float(v) => Column::Float(gather(v, positions)),
            Column::Int(v) => Column::Int(gather(v, positions)),
            Column::Bool(v) => Column::Bool(gather(v, positions)),
            Column::Category(v) => Column::Category(gather(v, positions)),
            Column::Time(v) => Column::Time(gather(v, positions)),
        }
    }

    /// Appends `count` default values.
    pub(crate) fn extend_default(&mut self, count: usize) {
        match self {
            Column::Float(v) => v.extend(std::iter::repeat(f64::NAN).take(count)),
            Column::Int(v) => v.extend(std::iter::repeat(0).take(count)),
            Column::Bool(v) => v.extend(std::iter::repeat(false).take(count)),
            Column::Category(v) => v.extend(std::iter::repeat(String::new()).take(count)),
            Column::Time(v) => v.extend(std::iter::repeat(None).take(count)),
        }
    }

    /// Writes `values[i]` to position `positions[i]`. Dtypes must match.
    pub(crate) fn scatter(&mut self, name: &str, positions: &[usize], values: Column) -> Result<(), PopulationError> {
        fn put<T>(target: &mut [T], positions: &[usize], values: Vec<T>) {
            for (&p, v) in positions.iter().zip(values) {
                target[p] = v;
            }
        }
        if values.len() != positions.len() {
            return Err(PopulationError::LengthMismatch {
                column: name.to_string(),
                expected: positions.len(),
                actual: values.len(),
            });
        }
        match (self, values) {
            (Column::Float(t), Column::Float(v)) => put(t, positions, v),
            (Column::Int(t), Column::Int(v)) => put(t, positions, v),
            (Column::Bool(t), Column::Bool(v)) => put(t, positions, v),
            (Column::Category(t), Column::Category(v)) => put(t, positions, v),
            (Column::Time(t), Column::Time(v)) => put(t, positions, v),
            (target, values) => {
                return Err(PopulationError::DtypeMismatch {
                    column: name.to_string(),
                    expected: target.dtype(),
                    actual: values.dtype(),
                })
            }
        }
        Ok(())
    }

    /// Converts between numeric dtypes; `None` if the conversion is lossy
    /// or meaningless.
    pub fn coerce(self, dtype: DType) -> Option<Column> {
        if self.dtype() == dtype {
            return Some(self);
        }
        match (self, dtype) {
            (Column::Int(v), DType::Float) => Some(Column::Float(v.into_iter().map(|x| x as f64).collect())),
            (Column::Bool(v), DType::Int) => Some(Column::Int(v.into_iter().map(i64::from).collect())),
            (Column::Float(v), DType::Int) if v.iter().all(|x| x.fract() == 0.0) => {
                Some(Column::Int(v.into_iter().map(|x| x as i64).collect()))
            }
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f64]> {
        match self {
            Column::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Column::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bools(&self) -> Option<&[bool]> {
        match self {
            Column::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_categories(&self) -> Option<&[String]> {
        match self {
            Column::Category(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_times(&self) -> Option<&[Option<NaiveDateTime>]> {
        match self {
            Column::Time(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric values as floats, converting integer columns.
    pub fn to_floats(&self) -> Option<Vec<f64>> {
        match self {
            Column::Float(v) => Some(v.clone()),
            Column::Int(v) => Some(v.iter().map(|x| *x as f64).collect()),
            _ => None,
        }
    }
}

/// A copy of some rows and columns of the population table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    index: Vec<usize>,
    columns: IndexMap<String, Column>,
}

impl Frame {
    /// Creates a frame with no columns over `index`.
    pub fn new(index: Vec<usize>) -> Self {
        Self {
            index,
            columns: IndexMap::new(),
        }
    }

    pub(crate) fn from_parts(index: Vec<usize>, columns: IndexMap<String, Column>) -> Self {
        Self { index, columns }
    }

    /// Adds a column, builder style.
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<Self, PopulationError> {
        self.insert(name, column)?;
        Ok(self)
    }

    /// Adds or replaces a column; its length must match the index.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), PopulationError> {
        let name = name.into();
        if column.len() != self.index.len() {
            return Err(PopulationError::LengthMismatch {
                column: name,
                expected: self.index.len(),
                actual: column.len(),
            });
        }
        self.columns.insert(name, column);
        Ok(())
    }

    /// Simulant ids of the rows, in row order.
    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty() || self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn columns(&self) -> &IndexMap<String, Column> {
        &self.columns
    }

    pub fn into_parts(self) -> (Vec<usize>, IndexMap<String, Column>) {
        (self.index, self.columns)
    }

    pub fn column(&self, name: &str) -> Result<&Column, PopulationError> {
        self.columns
            .get(name)
            .ok_or_else(|| PopulationError::MissingColumn(name.to_string()))
    }

    pub fn floats(&self, name: &str) -> Result<&[f64], PopulationError> {
        let column = self.column(name)?;
        column.as_floats().ok_or_else(|| wrong_type(name, DType::Float, column))
    }

    pub fn ints(&self, name: &str) -> Result<&[i64], PopulationError> {
        let column = self.column(name)?;
        column.as_ints().ok_or_else(|| wrong_type(name, DType::Int, column))
    }

    pub fn bools(&self, name: &str) -> Result<&[bool], PopulationError> {
        let column = self.column(name)?;
        column.as_bools().ok_or_else(|| wrong_type(name, DType::Bool, column))
    }

    pub fn categories(&self, name: &str) -> Result<&[String], PopulationError> {
        let column = self.column(name)?;
        column
            .as_categories()
            .ok_or_else(|| wrong_type(name, DType::Category, column))
    }

    pub fn times(&self, name: &str) -> Result<&[Option<NaiveDateTime>], PopulationError> {
        let column = self.column(name)?;
        column.as_times().ok_or_else(|| wrong_type(name, DType::Time, column))
    }

    /// Keeps the rows whose mask entry is true.
    pub fn filter(&self, mask: &[bool]) -> Frame {
        let positions: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, keep)| **keep)
            .map(|(pos, _)| pos)
            .collect();
        Frame {
            index: positions.iter().map(|&p| self.index[p]).collect(),
            columns: self
                .columns
                .iter()
                .map(|(name, column)| (name.clone(), column.take(&positions)))
                .collect(),
        }
    }
}

fn wrong_type(name: &str, expected: DType, column: &Column) -> PopulationError {
    PopulationError::DtypeMismatch {
        column: name.to_string(),
        expected,
        actual: column.dtype(),
    }
}

/// A single column aligned with an index, optionally named.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: Option<String>,
    pub index: Vec<usize>,
    pub values: Column,
}

impl Series {
    pub fn new(index: Vec<usize>, values: Column) -> Self {
        Self {
            name: None,
            index,
            values,
        }
    }

    pub fn named(name: impl Into<String>, index: Vec<usize>, values: Column) -> Self {
        Self {
            name: Some(name.into()),
            index,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_scatter() {
        let mut column = Column::Float(vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(column.take(&[3, 1]), Column::Float(vec![3.0, 1.0]));

        column.scatter("x", &[0, 2], Column::Float(vec![10.0, 20.0])).unwrap();
        assert_eq!(column, Column::Float(vec![10.0, 1.0, 20.0, 3.0]));

        let err = column.scatter("x", &[0], Column::Int(vec![1])).unwrap_err();
        assert!(matches!(err, PopulationError::DtypeMismatch { .. }));

        let err = column.scatter("x", &[0, 1], Column::Float(vec![1.0])).unwrap_err();
        assert!(matches!(err, PopulationError::LengthMismatch { .. }));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            Column::Int(vec![1, 2]).coerce(DType::Float),
            Some(Column::Float(vec![1.0, 2.0]))
        );
        assert_eq!(Column::Float(vec![1.5]).coerce(DType::Int), None);
        assert_eq!(Column::Category(vec!["a".into()]).coerce(DType::Float), None);
    }

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(vec![4, 7])
            .with_column("age", Column::Float(vec![30.0, 40.0]))
            .unwrap()
            .with_column("sex", Column::Category(vec!["Male".into(), "Female".into()]))
            .unwrap();

        assert_eq!(frame.floats("age").unwrap(), &[30.0, 40.0]);
        assert!(frame.bools("age").is_err());
        assert!(matches!(
            frame.column("alive"),
            Err(PopulationError::MissingColumn(_))
        ));

        let filtered = frame.filter(&[false, true]);
        assert_eq!(filtered.index(), &[7]);
        assert_eq!(filtered.categories("sex").unwrap(), &["Female".to_string()]);
    }

    #[test]
    fn test_key_string() {
        assert_eq!(Scalar::Float(1990.0).key_string(), "1990");
        assert_eq!(Scalar::Int(1990).key_string(), "1990");
        assert_eq!(Scalar::Float(2.5).key_string(), "2.5");
        assert_eq!(Scalar::Str("Male".into()).key_string(), "Male");
    }
}
