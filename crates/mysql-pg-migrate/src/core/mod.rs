//! Core abstractions shared by the engine and the drivers.
//!
//! - [`value`]: the owned SQL value enum
//! - [`row`]: ordered source/target rows
//! - [`schema`]: column metadata and source type classification
//! - [`traits`]: the source and target connector traits
//!
//! The engine modules (`convert`, `mapping`, `transform`, `loader`,
//! `transfer`, `orchestrator`) only depend on this module, never on a
//! concrete driver.

pub mod row;
pub mod schema;
pub mod traits;
pub mod value;

pub use row::{DecodeFailure, Row, SourceRow, TargetRow};
pub use schema::{ColumnInfo, TypeClass, TypeHint};
pub use traits::{
    BatchOutcome, RowOutcome, SequenceOutcome, SourceStore, TargetStore, TargetTableInfo,
};
pub use value::SqlValue;
