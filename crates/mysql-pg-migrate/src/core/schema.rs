//! Column metadata and source type classification.

use serde::{Deserialize, Serialize};

/// Column metadata as reported by a store's `describe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Full declared type (e.g. "tinyint(1)", "varchar(255)", "json").
    pub type_hint: TypeHint,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Whether the column is part of the primary key.
    pub is_primary_key: bool,

    /// Whether the column is an auto-increment / identity column.
    pub is_auto_increment: bool,
}

impl ColumnInfo {
    /// Convenience constructor for a nullable, non-key column.
    pub fn new(name: impl Into<String>, type_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: TypeHint::new(type_hint),
            is_nullable: true,
            is_primary_key: false,
            is_auto_increment: false,
        }
    }

    /// Mark this column as the (auto-increment) primary key.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_nullable = false;
        self
    }

    /// Mark this column as auto-increment.
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }
}

/// Declared source type of a column, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeHint(String);

impl TypeHint {
    pub fn new(hint: impl Into<String>) -> Self {
        Self(hint.into().trim().to_lowercase())
    }

    /// Hint used when a column's type is not known (e.g. constant fields).
    pub fn unknown() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base type name without length/precision or modifiers ("tinyint(1) unsigned" -> "tinyint").
    pub fn base(&self) -> &str {
        let end = self
            .0
            .find(|c: char| c == '(' || c.is_whitespace())
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Whether the declared type carries the `unsigned` modifier.
    pub fn is_unsigned(&self) -> bool {
        self.0.contains("unsigned")
    }

    /// Classify the declared type.
    pub fn class(&self) -> TypeClass {
        match self.base() {
            "bit" | "bool" | "boolean" => TypeClass::Bit,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
                TypeClass::Integer
            }
            "decimal" | "numeric" | "dec" | "fixed" => TypeClass::Decimal,
            "float" | "double" | "real" => TypeClass::Float,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "enum"
            | "set" => TypeClass::Text,
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                TypeClass::Binary
            }
            "json" => TypeClass::Json,
            "date" | "datetime" | "timestamp" | "time" => TypeClass::Temporal,
            "" => TypeClass::Unknown,
            _ => TypeClass::Other,
        }
    }
}

impl From<&str> for TypeHint {
    fn from(s: &str) -> Self {
        TypeHint::new(s)
    }
}

impl std::fmt::Display for TypeHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse class of a source column type, used to check converter compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeClass {
    Integer,
    Bit,
    Decimal,
    Float,
    Text,
    Binary,
    Json,
    Temporal,
    Other,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_hint_base() {
        assert_eq!(TypeHint::new("TINYINT(1)").base(), "tinyint");
        assert_eq!(TypeHint::new("int unsigned").base(), "int");
        assert_eq!(TypeHint::new("json").base(), "json");
        assert!(TypeHint::new("bigint(20) unsigned").is_unsigned());
    }

    #[test]
    fn test_type_classes() {
        assert_eq!(TypeHint::new("tinyint(1)").class(), TypeClass::Integer);
        assert_eq!(TypeHint::new("bit(1)").class(), TypeClass::Bit);
        assert_eq!(TypeHint::new("decimal(10,2)").class(), TypeClass::Decimal);
        assert_eq!(TypeHint::new("longtext").class(), TypeClass::Text);
        assert_eq!(TypeHint::new("mediumblob").class(), TypeClass::Binary);
        assert_eq!(TypeHint::new("json").class(), TypeClass::Json);
        assert_eq!(TypeHint::new("datetime(3)").class(), TypeClass::Temporal);
        assert_eq!(TypeHint::new("geometry").class(), TypeClass::Other);
        assert_eq!(TypeHint::unknown().class(), TypeClass::Unknown);
    }
}
