//! relmap: the in-memory data-access core of an object-relational mapper.
//!
//! A per-request [`UnitOfWork`] mediates all reads and writes between
//! application code and a relational store while presenting entities as a
//! consistent, mutation-tracked object graph:
//!
//! - **Identity map**: at most one in-memory instance per (entity type,
//!   key); every load of the same row returns the same reference.
//! - **Batched loader**: loads and finds issued within one scheduling turn
//!   coalesce into minimal SQL (`WHERE key IN (…)` per type, one tagged
//!   statement per identical filter shape).
//! - **Change tracking**: original/current snapshots with semantic value
//!   equality; setting a field back to its original value issues no SQL.
//! - **Relation consistency**: loaded forward and inverse caches never
//!   desync, without extra queries.
//! - **Reactive graph**: declared derived fields and validation rules
//!   settle to a fixed point before every flush.
//! - **Flush orchestrator**: dependency-ordered writes in one transaction,
//!   with up-front key assignment for cyclic graphs and optimistic-lock
//!   preconditions.
//!
//! The store itself is an opaque collaborator behind the [`Driver`] trait;
//! metadata is supplied once at process start through [`Registry::build`].
//!
//! # Example
//!
//! ```ignore
//! let registry = Registry::build(entity_defs, rule_defs)?;
//! let mut uow = UnitOfWork::new(registry, driver);
//!
//! let author = uow.create("Author")?;
//! uow.set(&author, "name", "a1")?;
//! let book = uow.create("Book")?;
//! uow.set(&book, "title", "b1")?;
//! uow.set_relation(&book, "author", Some(&author))?;
//!
//! // One transaction, author inserted before book.
//! uow.flush(&cx).await?;
//! ```

pub use relmap_core::{
    Cx, Dialect, Driver, DriverError, EntityDef, EntityId, EntityView, Error, FieldCheck,
    FieldDef, FieldId, KeySource, LinkTableDef, Outcome, Registry, RelationDef, RelationId,
    RelationKind, RelationTargetDef, Result, Row, RuleDef, RuleId, RulePath, RuleViolation,
    SqlType, ValidationFailed, Value, VariantDef,
};
pub use relmap_query::{CmpOp, Cond, Dir, Filter, Stmt};
pub use relmap_session::{
    ChangeTracker, DirtySet, EntityKey, EntityRef, FindHandle, FlushReport, FlushState,
    HookEvent, HookPoint, IdentityMap, Key, KeyValue, Lifecycle, LoadHandle, LoaderStats,
    TurnStats, UnitOfWork,
};
