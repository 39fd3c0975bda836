//! Value conversion between loosely typed source values and strict target types.
//!
//! Every conversion is a pure function of `(raw value, source type hint,
//! converter kind, options)`. Which converter applies to a field is declared
//! in the mapping; nothing here inspects a value to guess what it should become.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{SqlValue, TypeClass, TypeHint};

/// Maximum characters of a raw value quoted inside a conversion error.
const ERROR_EXCERPT_CHARS: usize = 64;

/// Declared conversion for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    /// Copy the value unchanged.
    #[default]
    Passthrough,
    /// Integer 0/1 or a single-bit flag to boolean.
    BoolFromInt01,
    /// Decode bytes as UTF-8 text.
    BytesToText,
    /// Parse JSON text; the fallback on parse failure must be declared.
    JsonNormalize,
    /// Parse JSON text; on failure keep the raw text as a JSON string.
    JsonParseOrWrap,
    /// Widen or narrow a number to the declared numeric target.
    Numeric,
    /// Pass temporal values through verbatim.
    Timestamp,
}

impl ConverterKind {
    /// Whether a source column of the given class can feed this converter.
    pub fn accepts(&self, class: TypeClass) -> bool {
        use TypeClass::*;
        if class == Unknown {
            return true;
        }
        match self {
            ConverterKind::Passthrough => true,
            ConverterKind::BoolFromInt01 => matches!(class, Integer | Bit),
            ConverterKind::BytesToText => matches!(class, Text | Binary | Json),
            ConverterKind::JsonNormalize | ConverterKind::JsonParseOrWrap => {
                matches!(class, Text | Binary | Json)
            }
            ConverterKind::Numeric => matches!(class, Integer | Decimal | Float | Text),
            ConverterKind::Timestamp => matches!(class, Temporal | Text),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConverterKind::Passthrough => "passthrough",
            ConverterKind::BoolFromInt01 => "bool_from_int01",
            ConverterKind::BytesToText => "bytes_to_text",
            ConverterKind::JsonNormalize => "json_normalize",
            ConverterKind::JsonParseOrWrap => "json_parse_or_wrap",
            ConverterKind::Numeric => "numeric",
            ConverterKind::Timestamp => "timestamp",
        }
    }
}

/// What a JSON converter produces when the raw text does not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonFallback {
    /// `["raw text"]`
    WrapArray,
    /// `"raw text"`
    WrapString,
    /// `[]`
    EmptyArray,
    /// `{}`
    EmptyObject,
    /// SQL NULL
    Null,
    /// Reject the value (and therefore the row).
    Fail,
}

/// What `BytesToText` does with bytes that are not valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingPolicy {
    #[default]
    Fail,
    Null,
    Lossy,
}

/// Declared target precision for `Numeric`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericTarget {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    /// Double precision.
    Float,
    /// Exact decimal.
    #[default]
    Decimal,
}

/// Per-field options consulted by the converters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertOptions {
    pub json_fallback: Option<JsonFallback>,
    pub on_encoding_error: EncodingPolicy,
    pub numeric: NumericTarget,
}

/// A single field could not be converted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),
}

impl ConversionError {
    fn mismatch(expected: &'static str, raw: &SqlValue) -> Self {
        ConversionError::TypeMismatch {
            expected,
            found: format!("{} {}", raw.kind_name(), raw.excerpt(ERROR_EXCERPT_CHARS)),
        }
    }
}

/// Convert one raw source value into a target-typed value.
///
/// NULL converts to NULL under every kind.
pub fn convert(
    raw: &SqlValue,
    hint: &TypeHint,
    kind: ConverterKind,
    opts: &ConvertOptions,
) -> Result<SqlValue, ConversionError> {
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }

    match kind {
        ConverterKind::Passthrough => passthrough(raw, hint),
        ConverterKind::BoolFromInt01 => bool_from_int01(raw),
        ConverterKind::BytesToText => bytes_to_text(raw, opts.on_encoding_error),
        ConverterKind::JsonNormalize => {
            json_value(raw, opts.json_fallback.unwrap_or(JsonFallback::Fail))
        }
        ConverterKind::JsonParseOrWrap => {
            json_value(raw, opts.json_fallback.unwrap_or(JsonFallback::WrapString))
        }
        ConverterKind::Numeric => numeric(raw, opts.numeric),
        ConverterKind::Timestamp => timestamp(raw),
    }
}

fn passthrough(raw: &SqlValue, hint: &TypeHint) -> Result<SqlValue, ConversionError> {
    match (raw, hint.class()) {
        (SqlValue::Bytes(_), TypeClass::Binary | TypeClass::Bit | TypeClass::Unknown) => {
            Ok(raw.clone())
        }
        (SqlValue::Bytes(_), _) => Err(ConversionError::mismatch("non-binary scalar", raw)),
        _ => Ok(raw.clone()),
    }
}

fn bool_from_int01(raw: &SqlValue) -> Result<SqlValue, ConversionError> {
    match raw {
        SqlValue::Bool(b) => Ok(SqlValue::Bool(*b)),
        SqlValue::I64(0) => Ok(SqlValue::Bool(false)),
        SqlValue::I64(1) => Ok(SqlValue::Bool(true)),
        SqlValue::Bytes(b) if b.as_slice() == [0] => Ok(SqlValue::Bool(false)),
        SqlValue::Bytes(b) if b.as_slice() == [1] => Ok(SqlValue::Bool(true)),
        _ => Err(ConversionError::mismatch("integer 0 or 1", raw)),
    }
}

fn bytes_to_text(raw: &SqlValue, policy: EncodingPolicy) -> Result<SqlValue, ConversionError> {
    match raw {
        SqlValue::Text(_) => Ok(raw.clone()),
        SqlValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(SqlValue::Text(s.to_string())),
            Err(e) => match policy {
                EncodingPolicy::Fail => Err(ConversionError::Encoding(e.to_string())),
                EncodingPolicy::Null => Ok(SqlValue::Null),
                EncodingPolicy::Lossy => {
                    Ok(SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()))
                }
            },
        },
        _ => Err(ConversionError::mismatch("bytes or text", raw)),
    }
}

fn json_value(raw: &SqlValue, fallback: JsonFallback) -> Result<SqlValue, ConversionError> {
    let text = match raw {
        SqlValue::Json(_) => return Ok(raw.clone()),
        SqlValue::Bool(b) => return Ok(SqlValue::Json(serde_json::Value::Bool(*b))),
        SqlValue::I64(i) => return Ok(SqlValue::Json(serde_json::Value::from(*i))),
        SqlValue::Text(s) => s.as_str(),
        SqlValue::Bytes(b) => {
            std::str::from_utf8(b).map_err(|e| ConversionError::Encoding(e.to_string()))?
        }
        _ => return Err(ConversionError::mismatch("json text", raw)),
    };

    // Blank text carries no document.
    if text.trim().is_empty() {
        return Ok(SqlValue::Null);
    }

    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => Ok(SqlValue::Json(value)),
        Err(e) => match fallback {
            JsonFallback::WrapArray => Ok(SqlValue::Json(serde_json::Value::Array(vec![
                serde_json::Value::String(text.to_string()),
            ]))),
            JsonFallback::WrapString => {
                Ok(SqlValue::Json(serde_json::Value::String(text.to_string())))
            }
            JsonFallback::EmptyArray => Ok(SqlValue::Json(serde_json::Value::Array(Vec::new()))),
            JsonFallback::EmptyObject => {
                Ok(SqlValue::Json(serde_json::Value::Object(Default::default())))
            }
            JsonFallback::Null => Ok(SqlValue::Null),
            JsonFallback::Fail => Err(ConversionError::ParseFailure(format!(
                "invalid JSON ({}): {}",
                e,
                crate::core::value::truncate_chars(text, ERROR_EXCERPT_CHARS)
            ))),
        },
    }
}

fn numeric(raw: &SqlValue, target: NumericTarget) -> Result<SqlValue, ConversionError> {
    let decimal = match raw {
        SqlValue::I64(i) => Decimal::from(*i),
        SqlValue::Decimal(d) => *d,
        SqlValue::Bool(b) => Decimal::from(*b as i64),
        SqlValue::F64(f) => {
            if target == NumericTarget::Float {
                return Ok(SqlValue::F64(*f));
            }
            if !f.is_finite() {
                return Err(ConversionError::ParseFailure(format!("non-finite number {}", f)));
            }
            Decimal::from_str(&f.to_string())
                .or_else(|_| Decimal::from_scientific(&format!("{:e}", f)))
                .map_err(|e| ConversionError::ParseFailure(e.to_string()))?
        }
        SqlValue::Text(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .map_err(|_| {
                    ConversionError::ParseFailure(format!(
                        "not a number: {}",
                        crate::core::value::truncate_chars(s, ERROR_EXCERPT_CHARS)
                    ))
                })?
        }
        _ => return Err(ConversionError::mismatch("number", raw)),
    };

    match target {
        NumericTarget::Decimal => Ok(SqlValue::Decimal(decimal)),
        NumericTarget::Float => decimal
            .to_f64()
            .map(SqlValue::F64)
            .ok_or_else(|| ConversionError::mismatch("float", raw)),
        NumericTarget::BigInt => {
            if !decimal.fract().is_zero() {
                return Err(ConversionError::mismatch("whole number", raw));
            }
            decimal
                .to_i64()
                .map(SqlValue::I64)
                .ok_or_else(|| ConversionError::mismatch("64-bit integer", raw))
        }
        NumericTarget::Integer => {
            if !decimal.fract().is_zero() {
                return Err(ConversionError::mismatch("whole number", raw));
            }
            decimal
                .to_i32()
                .map(|i| SqlValue::I64(i as i64))
                .ok_or_else(|| ConversionError::mismatch("32-bit integer", raw))
        }
    }
}

fn timestamp(raw: &SqlValue) -> Result<SqlValue, ConversionError> {
    match raw {
        SqlValue::DateTime(_)
        | SqlValue::DateTimeOffset(_)
        | SqlValue::Date(_)
        | SqlValue::Time(_) => Ok(raw.clone()),
        SqlValue::Text(s) => parse_timestamp_text(s.trim()),
        _ => Err(ConversionError::mismatch("timestamp", raw)),
    }
}

fn parse_timestamp_text(s: &str) -> Result<SqlValue, ConversionError> {
    // MySQL zero dates have no PostgreSQL equivalent.
    if s.is_empty() || s.starts_with("0000-00-00") {
        return Ok(SqlValue::Null);
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(SqlValue::DateTime(dt));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(SqlValue::DateTimeOffset(dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(SqlValue::Date(d));
    }
    Err(ConversionError::ParseFailure(format!(
        "not a timestamp: {}",
        crate::core::value::truncate_chars(s, ERROR_EXCERPT_CHARS)
    )))
}
