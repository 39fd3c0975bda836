//! Ordered rows passed between the source connector, transformer and loader.

use serde::{Deserialize, Serialize};

use super::value::SqlValue;

/// An ordered mapping from column name to value.
///
/// Column order is preserved so that the target INSERT column list follows
/// the mapping declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
    /// Source columns the driver could not decode; their value is NULL.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    undecodable: Vec<DecodeFailure>,
}

/// A source column whose stored value could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeFailure {
    pub column: String,
    pub message: String,
}

/// A row as read from the source store.
pub type SourceRow = Row;

/// A fully converted row, ready for insertion into the target store.
pub type TargetRow = Row;

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
            undecodable: Vec::new(),
        }
    }

    /// Append a column; replaces the value if the column already exists.
    pub fn push(&mut self, name: impl Into<String>, value: SqlValue) {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name, value)),
        }
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(name, value.into());
        self
    }

    /// Record a column whose value could not be decoded. The column reads as NULL.
    pub fn push_undecodable(&mut self, name: impl Into<String>, message: impl Into<String>) {
        let name = name.into();
        self.push(name.clone(), SqlValue::Null);
        self.undecodable.push(DecodeFailure {
            column: name,
            message: message.into(),
        });
    }

    pub fn decode_failure(&self, name: &str) -> Option<&DecodeFailure> {
        self.undecodable.iter().find(|f| f.column == name)
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.columns.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.push(name, value);
        }
        row
    }
}
