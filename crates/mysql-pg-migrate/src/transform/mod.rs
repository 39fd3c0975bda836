//! Row transformation: one source row into one target row, or a row error.
//!
//! A row is atomic: either every field converts and a complete target row is
//! produced, or the first failing field rejects the whole row. A field whose
//! source column could not be decoded by the driver fails like a conversion.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convert::{convert, ConversionError, ConverterKind};
use crate::core::{ColumnInfo, SourceRow, SqlValue, TargetRow, TypeHint};
use crate::mapping::SchemaMapping;

/// Maximum characters of the offending value kept in a [`RowError`].
pub const EXCERPT_CHARS: usize = 64;

/// A source row that could not be transformed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("row {}: field '{field}' ({excerpt}): {error}", .row_key.as_deref().unwrap_or("?"))]
pub struct RowError {
    /// Target field whose conversion failed.
    pub field: String,
    /// Offending raw value, cut to [`EXCERPT_CHARS`].
    pub excerpt: String,
    pub error: ConversionError,
    /// Source key of the row, when one could be determined.
    pub row_key: Option<String>,
}

/// Per-table source metadata consulted while transforming rows.
#[derive(Debug, Clone, Default)]
pub struct SourceHints {
    hints: HashMap<String, TypeHint>,
    key_column: Option<String>,
}

impl SourceHints {
    pub fn from_columns(columns: &[ColumnInfo]) -> Self {
        Self {
            hints: columns
                .iter()
                .map(|c| (c.name.clone(), c.type_hint.clone()))
                .collect(),
            key_column: columns
                .iter()
                .find(|c| c.is_primary_key)
                .map(|c| c.name.clone()),
        }
    }

    pub fn hint(&self, column: &str) -> TypeHint {
        self.hints
            .get(column)
            .cloned()
            .unwrap_or_else(TypeHint::unknown)
    }

    pub fn key_column(&self) -> Option<&str> {
        self.key_column.as_deref()
    }

    /// Identify a row for error reports: its key value, else its first column.
    pub fn row_key(&self, row: &SourceRow) -> Option<String> {
        let value = match &self.key_column {
            Some(key) => row.get(key),
            None => row.values().next(),
        }?;
        Some(value.excerpt(EXCERPT_CHARS))
    }
}

/// Apply a mapping to one source row.
pub fn transform(
    row: &SourceRow,
    mapping: &SchemaMapping,
    hints: &SourceHints,
) -> Result<TargetRow, RowError> {
    let mut out = TargetRow::with_capacity(mapping.fields.len());

    for field in &mapping.fields {
        let reject = |raw: &SqlValue, error: ConversionError| RowError {
            field: field.target_field.clone(),
            excerpt: raw.excerpt(EXCERPT_CHARS),
            error,
            row_key: hints.row_key(row),
        };

        if let Some(failure) = field
            .source_field
            .as_deref()
            .and_then(|name| row.decode_failure(name))
        {
            return Err(reject(
                &SqlValue::Null,
                ConversionError::ParseFailure(format!(
                    "source column '{}' could not be decoded: {}",
                    failure.column, failure.message
                )),
            ));
        }

        let raw = field
            .source_field
            .as_deref()
            .and_then(|name| row.get(name))
            .filter(|v| !v.is_null());

        let value = match raw {
            None => match field.default_value() {
                Some(Ok(v)) => v,
                Some(Err(e)) => return Err(reject(&SqlValue::Null, e)),
                None => SqlValue::Null,
            },
            Some(raw) => {
                let hint = field
                    .source_field
                    .as_deref()
                    .map(|name| hints.hint(name))
                    .unwrap_or_else(TypeHint::unknown);
                match convert(raw, &hint, field.converter, &field.options()) {
                    Ok(v) => v,
                    Err(e @ ConversionError::TypeMismatch { .. })
                        if field.converter == ConverterKind::BoolFromInt01 =>
                    {
                        match field.default_value() {
                            Some(Ok(v)) => v,
                            _ => return Err(reject(raw, e)),
                        }
                    }
                    Err(e) => return Err(reject(raw, e)),
                }
            }
        };

        out.push(field.target_field.clone(), value);
    }

    Ok(out)
}

/// Serializable summary of a failed row, kept in reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl From<&RowError> for SampleError {
    fn from(e: &RowError) -> Self {
        Self {
            row_key: e.row_key.clone(),
            field: Some(e.field.clone()),
            message: format!("{} (value: {})", e.error, e.excerpt),
        }
    }
}

impl std::fmt::Display for SampleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref key) = self.row_key {
            write!(f, "row {}: ", key)?;
        }
        if let Some(ref field) = self.field {
            write!(f, "{}: ", field)?;
        }
        f.write_str(&self.message)
    }
}
