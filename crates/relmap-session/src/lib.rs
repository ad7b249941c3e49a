//! Unit of Work for relmap.
//!
//! `relmap-session` is the **unit-of-work layer**: a per-request object graph
//! manager that mediates all reads and writes between application code and
//! the store while presenting entities as a consistent, mutation-tracked
//! graph.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per (entity type, key).
//! - **Batched loader**: loads and finds issued in one turn coalesce into
//!   minimal SQL.
//! - **Change tracking**: original/current snapshots, minimal dirty sets.
//! - **Relation consistency**: loaded inverse caches never desync.
//! - **Reactive graph**: derived fields and validations settle before flush.
//! - **Flush orchestrator**: dependency-ordered, transactional, with
//!   optimistic locking.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: no autoflush; the turn boundary is a
//!   visible, testable call.
//! - **Ownership clarity**: the identity map is the sole owner of entity
//!   lifetime; relation caches hold weak references.
//! - **Cancel-correct**: all driver-touching operations use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(registry, driver);
//!
//! // Coalesced reads: one statement per entity type per turn.
//! let a = uow.load("Author", 1)?;
//! let b = uow.load("Author", 2)?;
//! uow.run_turn(&cx).await?;
//! let a = a.take()?;
//!
//! // Mutation-tracked writes.
//! uow.set(&a, "name", "renamed")?;
//! uow.flush(&cx).await?;
//! ```

pub mod change_tracker;
pub mod entity;
pub mod flush;
pub mod hooks;
pub mod identity_map;
pub mod loader;
pub mod reactive;
pub mod relations;

#[cfg(test)]
mod test_support;

pub use change_tracker::{ChangeTracker, DirtySet, Partition};
pub use entity::{EntityCell, EntityInner, EntityKey, EntityRef, Key, KeyValue, Lifecycle, RelationCache};
pub use flush::{FlushReport, FlushState};
pub use hooks::{HookEvent, HookFn, HookPoint, HookRegistry};
pub use identity_map::IdentityMap;
pub use loader::{FindHandle, LoadHandle, Loader, LoaderStats, TurnStats};

use relmap_core::error::{Error, Result};
use relmap_core::meta::{FieldId, LinkTableDef, Registry, RelationId};
use relmap_core::{Cx, Driver, Outcome, Value};
use relmap_query::Filter;
use std::sync::Arc;

/// A recorded change, seeding the reactive worklist.
#[derive(Debug, Clone)]
pub(crate) enum Changed {
    /// A field value changed.
    Field(EntityRef, FieldId),
    /// Relation membership changed.
    Relation(EntityRef, RelationId),
}

/// A staged join-table row delta (many-to-many).
pub(crate) struct JoinRowOp {
    pub link: LinkTableDef,
    pub local: EntityRef,
    pub remote: EntityRef,
    /// true = row to insert, false = row to delete.
    pub add: bool,
}

/// A foreign-key value that can only be written once its target's key is
/// assigned during flush.
pub(crate) struct FkFixup {
    pub entity: EntityRef,
    pub field: FieldId,
    pub target: EntityRef,
}

/// The per-request Unit of Work.
///
/// Single-threaded cooperative execution: many outstanding load/find
/// requests may interleave within one scheduling turn, but no parallel
/// mutation of one unit of work is permitted.
pub struct UnitOfWork<D: Driver> {
    registry: Arc<Registry>,
    driver: D,
    pub(crate) identity: IdentityMap,
    pub(crate) tracker: ChangeTracker,
    pub(crate) loader: Loader,
    pub(crate) hooks: HookRegistry<D>,
    pub(crate) state: FlushState,
    pub(crate) hook_depth: u32,
    pub(crate) changes: Vec<Changed>,
    pub(crate) join_rows: Vec<JoinRowOp>,
    pub(crate) fk_fixups: Vec<FkFixup>,
    pub(crate) last_report: Option<FlushReport>,
}

impl<D: Driver> UnitOfWork<D> {
    /// Create a unit of work over a driver.
    pub fn new(registry: Arc<Registry>, driver: D) -> Self {
        Self {
            tracker: ChangeTracker::new(Arc::clone(&registry)),
            registry,
            driver,
            identity: IdentityMap::new(),
            loader: Loader::new(),
            hooks: HookRegistry::default(),
            state: FlushState::Idle,
            hook_depth: 0,
            changes: Vec::new(),
            join_rows: Vec::new(),
            fk_fixups: Vec::new(),
            last_report: None,
        }
    }

    /// The metadata registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The underlying driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Current flush state.
    pub fn state(&self) -> FlushState {
        self.state
    }

    /// Cumulative loader statistics.
    pub fn loader_stats(&self) -> LoaderStats {
        self.loader.stats()
    }

    /// The report of the last successful flush.
    pub fn last_report(&self) -> Option<&FlushReport> {
        self.last_report.as_ref()
    }

    /// Number of tracked instances.
    pub fn tracked(&self) -> usize {
        self.identity.len()
    }

    // ========================================================================
    // Instance creation and field access
    // ========================================================================

    /// Create a new instance of an entity type.
    ///
    /// The instance starts `New` under a placeholder identity; its key is
    /// assigned during flush.
    pub fn create(&mut self, entity: &str) -> Result<EntityRef> {
        let id = self.registry.entity(entity)?;
        self.guard_not_flushing(self.registry.meta(id).name)?;
        self.identity.register_new(&self.registry, id)
    }

    /// Read a field's current value.
    pub fn get_value(&self, entity: &EntityRef, field: &str) -> Result<Value> {
        let meta = self.registry.meta(entity.entity());
        let id = meta.field_or_err(field)?;
        self.check_variant(entity, id)?;
        Ok(entity.value(id))
    }

    /// Set a field.
    ///
    /// Setting a field to its semantically-current value is a no-op and does
    /// not mark the instance dirty. Setting the FK field of a to-one
    /// relation routes through relation maintenance so loaded inverse caches
    /// stay consistent.
    pub fn set(&mut self, entity: &EntityRef, field: &str, value: impl Into<Value>) -> Result<()> {
        let meta = self.registry.meta(entity.entity());
        let id = meta.field_or_err(field)?;
        self.check_variant(entity, id)?;
        self.guard_mutable(entity)?;

        if meta.key == id {
            return Err(Error::invalid_state(
                entity.name(),
                "the primary key is assigned by the unit of work",
            ));
        }

        let value = value.into();
        // FK columns are owned by their relation.
        let fk_relation = meta
            .relations_iter()
            .find(|(_, r)| r.fk_field == Some(id))
            .map(|(rid, _)| rid);
        if let Some(relation) = fk_relation {
            return self.set_fk_raw(entity, relation, id, value);
        }

        self.apply_value(entity, id, value);
        Ok(())
    }

    /// Write a field value, recording the change for the reactive graph.
    /// Internal: guards are the caller's responsibility.
    pub(crate) fn apply_value(&mut self, entity: &EntityRef, field: FieldId, value: Value) {
        {
            let mut inner = entity.write();
            if inner.current[field.0].semantic_eq(&value) {
                return;
            }
            inner.current[field.0] = value;
        }
        self.changes.push(Changed::Field(Arc::clone(entity), field));
    }

    /// Record a relation membership change for the reactive graph.
    pub(crate) fn note_relation_change(&mut self, entity: &EntityRef, relation: RelationId) {
        self.changes
            .push(Changed::Relation(Arc::clone(entity), relation));
    }

    // ========================================================================
    // Reads (deferred into the batched loader)
    // ========================================================================

    /// Enqueue a load-by-key. Resolves at the next turn.
    pub fn load(&mut self, entity: &str, key: impl Into<Value>) -> Result<LoadHandle> {
        let id = self.registry.entity(entity)?;
        let key = KeyValue::from_value(self.registry.meta(id).name, &key.into())?;
        Ok(self.loader.enqueue_load(self.registry.meta(id), id, key))
    }

    /// Enqueue a find-by-filter. Resolves at the next turn.
    pub fn find(&mut self, entity: &str, filter: Filter) -> Result<FindHandle> {
        let id = self.registry.entity(entity)?;
        Ok(self.loader.enqueue_find(self.registry.meta(id), id, filter))
    }

    /// Load one instance, driving a turn immediately.
    pub async fn get(
        &mut self,
        cx: &Cx,
        entity: &str,
        key: impl Into<Value>,
    ) -> Outcome<EntityRef, Error> {
        let handle = match self.load(entity, key) {
            Ok(h) => h,
            Err(e) => return Outcome::Err(e),
        };
        match self.run_turn(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match handle.take() {
            Ok(entity) => Outcome::Ok(entity),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Find all matches, driving a turn immediately.
    pub async fn find_all(
        &mut self,
        cx: &Cx,
        entity: &str,
        filter: Filter,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let handle = match self.find(entity, filter) {
            Ok(h) => h,
            Err(e) => return Outcome::Err(e),
        };
        match self.run_turn(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match handle.take() {
            Ok(matches) => Outcome::Ok(matches),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Find exactly one match; `NotFound` on zero, `TooMany` on more.
    pub async fn find_one(
        &mut self,
        cx: &Cx,
        entity: &str,
        filter: Filter,
    ) -> Outcome<EntityRef, Error> {
        let name = match self.registry.entity(entity) {
            Ok(id) => self.registry.meta(id).name,
            Err(e) => return Outcome::Err(e),
        };
        match self.find_all(cx, entity, filter).await {
            Outcome::Ok(mut matches) => match matches.len() {
                1 => Outcome::Ok(matches.remove(0)),
                0 => Outcome::Err(Error::NotFound {
                    entity: name,
                    key: "<filter>".to_string(),
                }),
                n => Outcome::Err(Error::TooMany {
                    entity: name,
                    matched: n,
                }),
            },
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Guards
    // ========================================================================

    /// Reject mutation while a flush is active, unless called from a hook.
    pub(crate) fn guard_not_flushing(&self, entity: &'static str) -> Result<()> {
        if self.state.in_flight() && self.hook_depth == 0 {
            return Err(Error::MutationDuringFlush { entity });
        }
        Ok(())
    }

    /// Reject mutation of deleted instances and mutation during flush.
    pub(crate) fn guard_mutable(&self, entity: &EntityRef) -> Result<()> {
        self.guard_not_flushing(entity.name())?;
        let lifecycle = entity.lifecycle();
        if !lifecycle.mutable() {
            return Err(Error::invalid_state(
                entity.name(),
                format!("cannot mutate an instance in state {:?}", lifecycle),
            ));
        }
        Ok(())
    }

    /// Reject access to a field outside the instance's active variant.
    fn check_variant(&self, entity: &EntityRef, field: FieldId) -> Result<()> {
        let meta = self.registry.meta(entity.entity());
        let Some(disc) = meta.discriminator else {
            return Ok(());
        };
        let tag_value = entity.value(disc);
        let tag = tag_value.as_str();
        if meta.field_in_variant(field, tag) {
            Ok(())
        } else {
            Err(Error::invalid_state(
                entity.name(),
                format!(
                    "field {} is not present in variant {:?}",
                    meta.field_meta(field).name,
                    tag.unwrap_or("<none>")
                ),
            ))
        }
    }

    /// Resolve an entity's assigned key as a parameter value, if assigned.
    pub(crate) fn assigned_value(entity: &EntityRef) -> Option<Value> {
        entity.key().assigned().map(KeyValue::to_value)
    }
}
