//! Core types and traits for relmap.
//!
//! This crate provides the foundational abstractions for the unit-of-work
//! data access core:
//!
//! - `Value` and `Row` for dynamic SQL values and results
//! - The error taxonomy (`Error`, `ValidationFailed`, `DriverError`)
//! - `Driver` trait for the opaque store transport
//! - The Entity Metadata Registry (`Registry`, `EntityDef`, `RelationDef`)
//! - Reactive rule declarations (`RuleDef`, `RulePath`)
//! - `Outcome`/`Cx` re-exports from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod driver;
pub mod error;
pub mod meta;
pub mod row;
pub mod rules;
pub mod value;

pub use driver::{Dialect, Driver};
pub use row::{ColumnInfo, Row};
pub use value::Value;
pub use error::{DriverError, Error, Result, RuleViolation, ValidationFailed};
pub use meta::{
    EntityDef, EntityId, EntityMeta, FieldCheck, FieldDef, FieldId, FieldMeta, InverseLink,
    KeySource, LinkTableDef, Registry, RelationDef, RelationId, RelationKind, RelationMeta,
    RelationTarget, RelationTargetDef, SqlType, VariantDef, VariantMeta,
};
pub use rules::{
    DepPath, DeriveFn, EntityView, RuleDef, RuleId, RuleKind, RuleKindDef, RuleMeta, RulePath,
    RuleSet, RuleTrigger, ValidateFn,
};
