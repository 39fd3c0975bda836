//! Declarative schema mappings and the registry that validates them.
//!
//! A [`SchemaMapping`] describes how one source entity becomes one target
//! entity: which source column feeds each target column, through which
//! converter, and with what default. A source table may feed several
//! mappings (a split table); each extra mapping carries a `name` that
//! identifies it in dependencies, state, and reports. The [`MappingRegistry`] is built once
//! from configuration and is immutable afterwards; every structural problem
//! is reported at construction time, before any data moves.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::convert::{
    convert, ConvertOptions, ConversionError, ConverterKind, EncodingPolicy, JsonFallback,
    NumericTarget,
};
use crate::core::{ColumnInfo, SqlValue, TypeHint};
use crate::error::{MigrateError, Result};
use crate::orchestrator::graph::DependencyGraph;

/// How one target column is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMapping {
    /// Source column; when absent the default is used unconditionally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_field: Option<String>,

    /// Target column.
    pub target_field: String,

    /// Conversion applied to the source value (default: passthrough).
    #[serde(default)]
    pub converter: ConverterKind,

    /// Value used when the source field is absent, NULL, or rejected by `bool_from_int01`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    /// Parse-failure behavior of the JSON converters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_fallback: Option<JsonFallback>,

    /// Invalid UTF-8 behavior of `bytes_to_text`.
    #[serde(default)]
    pub on_encoding_error: EncodingPolicy,

    /// Target precision of `numeric`.
    #[serde(default)]
    pub numeric: NumericTarget,
}

impl FieldMapping {
    /// Field fed by a source column through a converter.
    pub fn new(
        source_field: impl Into<String>,
        target_field: impl Into<String>,
        converter: ConverterKind,
    ) -> Self {
        Self {
            source_field: Some(source_field.into()),
            target_field: target_field.into(),
            converter,
            default: None,
            json_fallback: None,
            on_encoding_error: EncodingPolicy::default(),
            numeric: NumericTarget::default(),
        }
    }

    /// Field with no source column, always set to `value`.
    pub fn constant(target_field: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            source_field: None,
            target_field: target_field.into(),
            converter: ConverterKind::Passthrough,
            default: Some(value),
            json_fallback: None,
            on_encoding_error: EncodingPolicy::default(),
            numeric: NumericTarget::default(),
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_json_fallback(mut self, fallback: JsonFallback) -> Self {
        self.json_fallback = Some(fallback);
        self
    }

    pub fn with_encoding_policy(mut self, policy: EncodingPolicy) -> Self {
        self.on_encoding_error = policy;
        self
    }

    pub fn with_numeric(mut self, target: NumericTarget) -> Self {
        self.numeric = target;
        self
    }

    pub fn options(&self) -> ConvertOptions {
        ConvertOptions {
            json_fallback: self.json_fallback,
            on_encoding_error: self.on_encoding_error,
            numeric: self.numeric,
        }
    }

    /// The configured default, run through this field's converter.
    pub fn default_value(&self) -> Option<std::result::Result<SqlValue, ConversionError>> {
        self.default.as_ref().map(|literal| {
            convert(
                &SqlValue::from_json_literal(literal),
                &TypeHint::unknown(),
                self.converter,
                &self.options(),
            )
        })
    }
}

/// Mapping of one source entity onto one target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaMapping {
    /// Entity id when it differs from the source table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Source table.
    pub source: String,

    /// Target table.
    pub target: String,

    /// Target columns, in insertion order.
    pub fields: Vec<FieldMapping>,

    /// Entities that must be migrated first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// SQL predicate restricting which source rows are migrated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filter: Option<String>,

    /// Per-table override of the loader batch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl SchemaMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: None,
            source: source.into(),
            target: target.into(),
            fields: Vec::new(),
            depends_on: Vec::new(),
            source_filter: None,
            batch_size: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Id of this mapping: its `name`, else its source table.
    pub fn entity(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.source)
    }

    pub fn field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    pub fn depends_on(mut self, parent: impl Into<String>) -> Self {
        self.depends_on.push(parent.into());
        self
    }

    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.source_filter = Some(predicate.into());
        self
    }

    /// Distinct source columns referenced by this mapping, in field order.
    pub fn source_columns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.fields
            .iter()
            .filter_map(|f| f.source_field.as_deref())
            .filter(|c| seen.insert(*c))
            .collect()
    }

    /// Check the mapping against the described source columns.
    ///
    /// Every referenced column must exist and its declared type must be one
    /// the field's converter accepts.
    pub fn check_source_columns(&self, columns: &[ColumnInfo]) -> Result<()> {
        let by_name: HashMap<&str, &ColumnInfo> =
            columns.iter().map(|c| (c.name.as_str(), c)).collect();

        let mut problems = Vec::new();
        for field in &self.fields {
            let Some(source_field) = field.source_field.as_deref() else {
                continue;
            };
            match by_name.get(source_field) {
                None => problems.push(format!(
                    "{}: source column '{}' does not exist",
                    field.target_field, source_field
                )),
                Some(col) => {
                    let class = col.type_hint.class();
                    if !field.converter.accepts(class) {
                        problems.push(format!(
                            "{}: converter {} cannot read source column '{}' of type {}",
                            field.target_field,
                            field.converter.name(),
                            source_field,
                            col.type_hint
                        ));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(MigrateError::Config(format!(
                "mapping '{}' is incompatible with the source schema: {}",
                self.entity(),
                problems.join("; ")
            )))
        }
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| {
            Err(MigrateError::Config(format!(
                "mapping '{}': {}",
                self.entity(),
                msg
            )))
        };

        if self.source.trim().is_empty() {
            return Err(MigrateError::Config("mapping with empty source name".into()));
        }
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return fail("name must not be empty".into());
        }
        if self.target.trim().is_empty() {
            return fail("target is required".into());
        }
        if self.fields.is_empty() {
            return fail("at least one field is required".into());
        }
        if self.batch_size == Some(0) {
            return fail("batch_size must be at least 1".into());
        }
        if self.depends_on.iter().any(|p| p == self.entity()) {
            return fail("cannot depend on itself".into());
        }

        let mut targets = HashSet::new();
        for field in &self.fields {
            if field.target_field.trim().is_empty() {
                return fail("field with empty target_field".into());
            }
            if !targets.insert(field.target_field.as_str()) {
                return fail(format!("duplicate target field '{}'", field.target_field));
            }
            if field.source_field.is_none() && field.default.is_none() {
                return fail(format!(
                    "field '{}' has neither source_field nor default",
                    field.target_field
                ));
            }
            if field.converter == ConverterKind::JsonNormalize && field.json_fallback.is_none() {
                return fail(format!(
                    "field '{}' uses json_normalize without a json_fallback",
                    field.target_field
                ));
            }
            if let Some(Err(e)) = field.default_value() {
                return fail(format!(
                    "default of field '{}' is not valid for converter {}: {}",
                    field.target_field,
                    field.converter.name(),
                    e
                ));
            }
        }

        Ok(())
    }
}

/// Immutable, validated set of mappings keyed by entity id.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    mappings: Vec<SchemaMapping>,
    index: HashMap<String, usize>,
}

impl MappingRegistry {
    /// Validate and index the mappings.
    ///
    /// Fails on the first structural problem: duplicate entities or target
    /// fields, fields without a value source, undeclared JSON fallbacks,
    /// defaults the converter rejects, unknown dependencies, or cycles.
    pub fn new(mappings: Vec<SchemaMapping>) -> Result<Self> {
        let mut index = HashMap::with_capacity(mappings.len());
        for (i, mapping) in mappings.iter().enumerate() {
            mapping.validate()?;
            if index.insert(mapping.entity().to_string(), i).is_some() {
                return Err(MigrateError::Config(format!(
                    "duplicate mapping for entity '{}' (give each mapping of a split table its own name)",
                    mapping.entity()
                )));
            }
        }

        // Rejects unknown parents and cycles.
        DependencyGraph::from_mappings(&mappings)?;

        Ok(Self { mappings, index })
    }

    pub fn lookup(&self, entity: &str) -> Option<&SchemaMapping> {
        self.index.get(entity).map(|&i| &self.mappings[i])
    }

    /// Mappings reading from `table`.
    pub fn for_source<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a SchemaMapping> {
        self.mappings.iter().filter(move |m| m.source == table)
    }

    pub fn maps_source(&self, table: &str) -> bool {
        self.for_source(table).next().is_some()
    }

    pub fn mappings(&self) -> &[SchemaMapping] {
        &self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> SchemaMapping {
        SchemaMapping::new("usuarios", "users")
            .field(FieldMapping::new("id", "id", ConverterKind::Passthrough))
            .field(
                FieldMapping::new("ativo", "active", ConverterKind::BoolFromInt01)
                    .with_default(json!(true)),
            )
    }

    fn orders() -> SchemaMapping {
        SchemaMapping::new("pedidos", "orders")
            .field(FieldMapping::new("id", "id", ConverterKind::Passthrough))
            .field(FieldMapping::new("usuario_id", "user_id", ConverterKind::Passthrough))
            .field(
                FieldMapping::new("itens", "items", ConverterKind::JsonNormalize)
                    .with_json_fallback(JsonFallback::WrapArray),
            )
            .depends_on("usuarios")
    }

    fn config_error(result: Result<MappingRegistry>) -> String {
        match result {
            Err(MigrateError::Config(msg)) => msg,
            other => panic!("expected config error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = MappingRegistry::new(vec![users(), orders()]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("pedidos").unwrap().target, "orders");
        assert!(registry.lookup("orders").is_none());
    }

    #[test]
    fn test_duplicate_target_field_rejected() {
        let mapping = users().field(FieldMapping::new("nome", "id", ConverterKind::Passthrough));
        let msg = config_error(MappingRegistry::new(vec![mapping]));
        assert!(msg.contains("duplicate target field 'id'"));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let msg = config_error(MappingRegistry::new(vec![users(), users()]));
        assert!(msg.contains("duplicate mapping for entity 'usuarios'"));
    }

    fn team_members() -> SchemaMapping {
        SchemaMapping::new("usuarios", "team_members")
            .named("equipe")
            .field(FieldMapping::new("id", "user_id", ConverterKind::Passthrough))
            .filter("tipo = 'equipe'")
            .depends_on("usuarios")
    }

    #[test]
    fn test_split_table_needs_distinct_names() {
        let registry = MappingRegistry::new(vec![users(), team_members(), orders()]).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.lookup("usuarios").unwrap().target, "users");
        assert_eq!(registry.lookup("equipe").unwrap().target, "team_members");
        let targets: Vec<_> = registry.for_source("usuarios").map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["users", "team_members"]);
        assert!(registry.maps_source("usuarios"));
        assert!(!registry.maps_source("equipe"));

        let mut unnamed = team_members();
        unnamed.name = None;
        unnamed.depends_on.clear();
        let msg = config_error(MappingRegistry::new(vec![users(), unnamed]));
        assert!(msg.contains("own name"));
    }

    #[test]
    fn test_named_mapping_cannot_depend_on_itself() {
        let mapping = team_members().depends_on("equipe");
        let msg = config_error(MappingRegistry::new(vec![users(), mapping]));
        assert!(msg.contains("mapping 'equipe': cannot depend on itself"));
    }

    #[test]
    fn test_field_without_source_or_default_rejected() {
        let mut field = FieldMapping::constant("created_by", json!("migration"));
        field.default = None;
        let msg = config_error(MappingRegistry::new(vec![users().field(field)]));
        assert!(msg.contains("neither source_field nor default"));
    }

    #[test]
    fn test_json_normalize_requires_fallback() {
        let mapping = users().field(FieldMapping::new(
            "prefs",
            "preferences",
            ConverterKind::JsonNormalize,
        ));
        let msg = config_error(MappingRegistry::new(vec![mapping]));
        assert!(msg.contains("json_fallback"));
    }

    #[test]
    fn test_unconvertible_default_rejected() {
        let mapping = users().field(
            FieldMapping::new("destaque", "featured", ConverterKind::BoolFromInt01)
                .with_default(json!("yes")),
        );
        let msg = config_error(MappingRegistry::new(vec![mapping]));
        assert!(msg.contains("default of field 'featured'"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let msg = config_error(MappingRegistry::new(vec![orders()]));
        assert!(msg.contains("usuarios"));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let a = users().depends_on("pedidos");
        let msg = config_error(MappingRegistry::new(vec![a, orders()]));
        assert!(msg.contains("cycle"));
    }

    #[test]
    fn test_unknown_converter_fails_to_deserialize() {
        let yaml = r#"
source: produtos
target: products
fields:
  - source_field: nome
    target_field: name
    converter: to_upper
"#;
        assert!(serde_yaml::from_str::<SchemaMapping>(yaml).is_err());
    }

    #[test]
    fn test_mapping_from_yaml() {
        let yaml = r#"
source: produtos
target: products
source_filter: "ativo = 1"
depends_on: [categorias]
fields:
  - source_field: id
    target_field: id
  - source_field: imagens
    target_field: images
    converter: json_normalize
    json_fallback: wrap_array
  - target_field: currency
    default: "BRL"
"#;
        let mapping: SchemaMapping = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(mapping.entity(), "produtos");
        assert_eq!(mapping.source_filter.as_deref(), Some("ativo = 1"));
        assert_eq!(mapping.fields[0].converter, ConverterKind::Passthrough);
        assert_eq!(mapping.fields[1].json_fallback, Some(JsonFallback::WrapArray));
        assert_eq!(mapping.fields[2].source_field, None);
        assert_eq!(mapping.source_columns(), vec!["id", "imagens"]);
    }

    #[test]
    fn test_check_source_columns() {
        let mapping = users();
        let good = vec![
            ColumnInfo::new("id", "int").primary_key(),
            ColumnInfo::new("ativo", "tinyint(1)"),
        ];
        assert!(mapping.check_source_columns(&good).is_ok());

        let missing = vec![ColumnInfo::new("id", "int").primary_key()];
        let err = mapping.check_source_columns(&missing).unwrap_err();
        assert!(err.to_string().contains("'ativo' does not exist"));

        let wrong_type = vec![
            ColumnInfo::new("id", "int").primary_key(),
            ColumnInfo::new("ativo", "longblob"),
        ];
        let err = mapping.check_source_columns(&wrong_type).unwrap_err();
        assert!(err.to_string().contains("bool_from_int01"));
    }
}
