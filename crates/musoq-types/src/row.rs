use std::ops::Index;

use musoq_error::{MusoqError, Result};
use smallvec::SmallVec;

use crate::ty::SchemaColumn;
use crate::value::Value;

/// Fixed-length tuple of column values.
///
/// Equality and hashing are element-wise, which is what DISTINCT, UNION and
/// grouping rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    #[must_use]
    pub const fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Number of columns.
    #[must_use]
    pub fn count(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Whether the values at the key's columns equal the key's tuple.
    #[must_use]
    pub fn fits(&self, key: &Key) -> bool {
        key.columns
            .iter()
            .zip(key.values.iter())
            .all(|(col, expected)| self.values.get(*col) == Some(expected))
    }

    /// New row holding only the given columns, in the given order.
    #[must_use]
    pub fn project(&self, columns: &[usize]) -> Self {
        Self::new(
            columns
                .iter()
                .map(|c| self.values.get(*c).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Projection of a row used for group and index lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    columns: SmallVec<[usize; 4]>,
    values: SmallVec<[Value; 4]>,
}

impl Key {
    /// Build a key; `columns` and `values` must have the same length.
    pub fn new(columns: &[usize], values: Vec<Value>) -> Result<Self> {
        if columns.len() != values.len() {
            return Err(MusoqError::internal(format!(
                "key arity mismatch: {} columns, {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self {
            columns: columns.iter().copied().collect(),
            values: values.into_iter().collect(),
        })
    }

    /// Key made of a row's values at `columns`.
    #[must_use]
    pub fn from_row(row: &Row, columns: &[usize]) -> Self {
        Self {
            columns: columns.iter().copied().collect(),
            values: columns
                .iter()
                .map(|c| row.get(*c).cloned().unwrap_or(Value::Null))
                .collect(),
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Named, ordered collection of rows with column descriptors.
///
/// Final output of execution and the materialized form of CTEs and derived
/// tables.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Table {
    name: String,
    columns: Vec<SchemaColumn>,
    rows: Vec<Row>,
}

impl Table {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<SchemaColumn>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table, checking every row against the column count.
    pub fn with_rows(
        name: impl Into<String>,
        columns: Vec<SchemaColumn>,
        rows: Vec<Row>,
    ) -> Result<Self> {
        let mut table = Self::new(name, columns);
        table.rows.reserve(rows.len());
        for row in rows {
            table.add(row)?;
        }
        Ok(table)
    }

    pub fn add(&mut self, row: Row) -> Result<()> {
        if row.count() != self.columns.len() {
            return Err(MusoqError::internal(format!(
                "row with {} values added to table {} with {} columns",
                row.count(),
                self.name,
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn columns(&self) -> &[SchemaColumn] {
        &self.columns
    }

    /// Column descriptor by name, case-insensitive.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn contains(&self, row: &Row) -> bool {
        self.rows.contains(row)
    }

    /// Values of one column, in row order.
    #[must_use]
    pub fn column_values(&self, index: usize) -> Vec<Value> {
        self.rows
            .iter()
            .map(|r| r.get(index).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::{SemanticType, TypeKind};

    fn columns() -> Vec<SchemaColumn> {
        vec![
            SchemaColumn::new("Name", 0, SemanticType::non_null(TypeKind::String)),
            SchemaColumn::new("Count", 1, SemanticType::non_null(TypeKind::Int)),
        ]
    }

    #[test]
    fn row_fits_key() {
        let row = Row::new(vec![Value::from("a"), Value::Int(3), Value::Bool(true)]);
        let key = Key::new(&[0, 2], vec![Value::from("a"), Value::Bool(true)]).unwrap();
        assert!(row.fits(&key));
        let key = Key::new(&[1], vec![Value::Int(4)]).unwrap();
        assert!(!row.fits(&key));
    }

    #[test]
    fn key_arity_mismatch_rejected() {
        assert!(Key::new(&[0, 1], vec![Value::Null]).is_err());
    }

    #[test]
    fn key_from_row_matches_row() {
        let row = Row::new(vec![Value::Int(1), Value::from("x")]);
        let key = Key::from_row(&row, &[1]);
        assert_eq!(key.values(), &[Value::from("x")]);
        assert!(row.fits(&key));
    }

    #[test]
    fn row_equality_is_structural() {
        let a = Row::new(vec![Value::Int(1), Value::Null]);
        let b = Row::new(vec![Value::Int(1), Value::Null]);
        let c = Row::new(vec![Value::Long(1), Value::Null]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn table_rejects_wrong_arity() {
        let mut table = Table::new("t", columns());
        assert!(table.add(Row::new(vec![Value::from("a")])).is_err());
        table
            .add(Row::new(vec![Value::from("a"), Value::Int(1)]))
            .unwrap();
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn table_column_lookup_is_case_insensitive() {
        let table = Table::new("t", columns());
        assert_eq!(table.column("count").map(|c| c.index), Some(1));
        assert!(table.column("missing").is_none());
    }

    #[test]
    fn project_reorders() {
        let row = Row::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(row.project(&[2, 0]), Row::new(vec![Value::Int(3), Value::Int(1)]));
    }
}
