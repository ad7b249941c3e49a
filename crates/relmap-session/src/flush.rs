//! The flush orchestrator.
//!
//! A flush drives the reactive graph to settlement, runs the validation
//! phase (aborting before any SQL on failure), computes the write-plan
//! partition, assigns identifiers up front where needed to break insert
//! cycles, and executes all writes inside one transaction in dependency
//! order: inserts parent-first, updates (bulk-batched where the same column
//! set changed across rows of one type), join-row changes, compensating FK
//! nulling, then deletes child-first. Optimistic-lock preconditions turn a
//! concurrent modification into a distinguishable `StaleWrite` failure.
//!
//! Any failure before commit rolls the transaction back and leaves the
//! in-memory entities exactly as they were logically intended: dirty fields
//! stay dirty, so a corrected retry is possible. There is no mid-flush
//! cancellation: a flush either commits or fails atomically.

use crate::entity::{EntityRef, KeyValue, Lifecycle};
use crate::hooks::HookPoint;
use crate::{FkFixup, UnitOfWork};
use relmap_core::error::{Error, Result};
use relmap_core::meta::{FieldId, KeySource, RelationKind};
use relmap_core::{Cx, Driver, Outcome, Value};
use relmap_query::{
    delete_by_keys, insert_returning, insert_row, link_delete, link_delete_for_owner, link_insert,
    null_fk, sequence_next, update_bulk, update_row,
};
use std::collections::HashMap;
use std::sync::Arc;

/// State machine of the flush orchestrator.
///
/// `Idle -> Validating -> Flushing -> Committed | Failed`. A new flush may
/// start from `Idle`, `Committed`, or `Failed`; requesting one while a flush
/// is in `Validating`/`Flushing` fails immediately with `ConcurrentFlush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushState {
    /// No flush has run yet.
    #[default]
    Idle,
    /// Settling the reactive graph and running validations.
    Validating,
    /// Executing writes inside the transaction.
    Flushing,
    /// The last flush committed.
    Committed,
    /// The last flush failed and was rolled back.
    Failed,
}

impl FlushState {
    /// Is a flush currently in progress?
    pub const fn in_flight(self) -> bool {
        matches!(self, FlushState::Validating | FlushState::Flushing)
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Rows inserted.
    pub inserted: usize,
    /// Rows updated.
    pub updated: usize,
    /// Rows deleted.
    pub deleted: usize,
    /// Join-table rows written or removed.
    pub link_rows: usize,
}

/// The prepared write plan handed from the validation phase to the write
/// phase.
struct WritePlan {
    inserts: Vec<EntityRef>,
    updates: Vec<EntityRef>,
    deletes: Vec<EntityRef>,
}

impl<D: Driver> UnitOfWork<D> {
    /// Flush all pending changes inside one transaction.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        if self.state.in_flight() {
            return Outcome::Err(Error::ConcurrentFlush);
        }
        self.state = FlushState::Validating;
        tracing::debug!("flush: validating");

        let plan = match self.prepare(cx).await {
            Outcome::Ok(plan) => plan,
            Outcome::Err(e) => {
                self.state = FlushState::Failed;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.state = FlushState::Failed;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.state = FlushState::Failed;
                return Outcome::Panicked(p);
            }
        };

        if plan.inserts.is_empty()
            && plan.updates.is_empty()
            && plan.deletes.is_empty()
            && self.join_rows.is_empty()
        {
            // Nothing to write: no transaction, no SQL.
            self.state = FlushState::Committed;
            let report = FlushReport::default();
            self.last_report = Some(report);
            return Outcome::Ok(report);
        }

        self.state = FlushState::Flushing;
        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            link_rows = self.join_rows.len(),
            "flush: executing"
        );

        match self.driver().begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.state = FlushState::Failed;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.state = FlushState::Failed;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.state = FlushState::Failed;
                return Outcome::Panicked(p);
            }
        }

        let written = self.run_writes(cx, &plan).await;
        let report = match written {
            Outcome::Ok(report) => report,
            Outcome::Err(e) => {
                self.abort(cx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort(cx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort(cx).await;
                return Outcome::Panicked(p);
            }
        };

        match self.driver().commit(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.abort(cx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort(cx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort(cx).await;
                return Outcome::Panicked(p);
            }
        }

        self.state = FlushState::Committed;
        self.finalize(&plan);
        self.last_report = Some(report);
        tracing::info!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            link_rows = report.link_rows,
            "flush committed"
        );

        // Post-commit hooks run outside the transaction boundary.
        if let Err(e) = self.fire_hooks(HookPoint::AfterCommit, None) {
            return Outcome::Err(e);
        }
        Outcome::Ok(report)
    }

    /// Roll back and record the failure. The in-memory state keeps its dirty
    /// fields so a corrected retry can flush again.
    async fn abort(&mut self, cx: &Cx) {
        match self.driver().rollback(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "rollback after failed flush errored"),
            Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                tracing::warn!("rollback after failed flush did not complete");
            }
        }
        self.state = FlushState::Failed;
    }

    // ========================================================================
    // Phase 1: settle, validate, plan
    // ========================================================================

    async fn prepare(&mut self, cx: &Cx) -> Outcome<WritePlan, Error> {
        if let Err(e) = self.fire_hooks(HookPoint::BeforeFlush, None) {
            return Outcome::Err(e);
        }

        let mut triggered = match self.settle_reactive(cx).await {
            Outcome::Ok(t) => t,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Err(e) = self.fire_hooks(HookPoint::BeforeValidation, None) {
            return Outcome::Err(e);
        }
        // Hook mutations re-enter the worklist; settle again before judging.
        match self.settle_reactive(cx).await {
            Outcome::Ok(more) => triggered.extend(more),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let partition = self.tracker.partition(&self.identity);
        let mut candidates = partition.inserts.clone();
        candidates.extend(partition.updates.iter().map(Arc::clone));

        let report = match self.run_validations(cx, &candidates, triggered).await {
            Outcome::Ok(report) => report,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if !report.is_empty() {
            tracing::debug!(violations = report.violations.len(), "validation failed");
            return Outcome::Err(Error::Validation(report));
        }

        if let Err(e) = self.fire_hooks(HookPoint::AfterValidation, None) {
            return Outcome::Err(e);
        }

        // Final partition after the hook round.
        let partition = self.tracker.partition(&self.identity);

        // Assign identifiers up front for sequence-keyed types; this is what
        // breaks insert cycles and self-references.
        match self.assign_identifiers(cx, &partition.inserts).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        Outcome::Ok(WritePlan {
            inserts: partition.inserts,
            updates: partition.updates,
            deletes: partition.deletes,
        })
    }

    /// Pre-fetch keys for all insert-pending instances of sequence-keyed
    /// types and move them from their placeholder identities.
    async fn assign_identifiers(
        &mut self,
        cx: &Cx,
        inserts: &[EntityRef],
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());

        let mut by_sequence: HashMap<&'static str, Vec<EntityRef>> = HashMap::new();
        for entity in inserts {
            if entity.key().assigned().is_some() {
                continue;
            }
            if let KeySource::Sequence(sequence) = registry.meta(entity.entity()).key_source {
                by_sequence
                    .entry(sequence)
                    .or_default()
                    .push(Arc::clone(entity));
            }
        }

        for (sequence, entities) in by_sequence {
            let stmt = sequence_next(self.driver().dialect(), sequence, entities.len());
            let rows = match self.driver().query(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if rows.len() < entities.len() {
                return Outcome::Err(Error::driver(format!(
                    "sequence {} yielded {} keys for {} rows",
                    sequence,
                    rows.len(),
                    entities.len()
                )));
            }
            for (entity, row) in entities.iter().zip(&rows) {
                let Some(id) = row.get(0).and_then(Value::as_i64) else {
                    return Outcome::Err(Error::driver(format!(
                        "sequence {} yielded a non-integer key",
                        sequence
                    )));
                };
                if let Err(e) = self.take_key(entity, KeyValue::Int(id)) {
                    return Outcome::Err(e);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Record a freshly assigned key: rekey the identity map, write the key
    /// field, promote the lifecycle, and resolve any FK fixups waiting on
    /// this instance.
    fn take_key(&mut self, entity: &EntityRef, key: KeyValue) -> Result<()> {
        let meta_key = self.registry().meta(entity.entity()).key;
        let old = entity.entity_key();
        self.identity.rekey(&old, key.clone())?;
        {
            let mut inner = entity.write();
            inner.current[meta_key.0] = key.to_value();
            inner.original[meta_key.0] = key.to_value();
            if inner.lifecycle == Lifecycle::New {
                inner.lifecycle = Lifecycle::Pending;
            }
        }
        self.resolve_fixups_for(entity);
        Ok(())
    }

    /// Apply every staged FK fixup whose target now has an assigned key.
    fn resolve_fixups_for(&mut self, target: &EntityRef) {
        let Some(key) = Self::assigned_value(target) else {
            return;
        };
        let mut remaining = Vec::with_capacity(self.fk_fixups.len());
        for fixup in std::mem::take(&mut self.fk_fixups) {
            if Arc::ptr_eq(&fixup.target, target) {
                fixup.entity.write().current[fixup.field.0] = key.clone();
            } else {
                remaining.push(fixup);
            }
        }
        self.fk_fixups = remaining;
    }

    // ========================================================================
    // Phase 2: writes
    // ========================================================================

    async fn run_writes(&mut self, cx: &Cx, plan: &WritePlan) -> Outcome<FlushReport, Error> {
        let mut report = FlushReport::default();

        match self.write_inserts(cx, &plan.inserts, &mut report).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        // FK values that could only be written after a later insert assigned
        // its key become same-flush updates.
        let mut updates: Vec<EntityRef> = plan.updates.clone();
        for fixup in &self.fk_fixups {
            if let Some(key) = Self::assigned_value(&fixup.target) {
                fixup.entity.write().current[fixup.field.0] = key;
                let settled = matches!(
                    fixup.entity.lifecycle(),
                    Lifecycle::Pending | Lifecycle::Persisted
                );
                if settled && !updates.iter().any(|u| Arc::ptr_eq(u, &fixup.entity)) {
                    updates.push(Arc::clone(&fixup.entity));
                }
            }
        }

        match self.write_updates(cx, &updates, &mut report).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.write_join_rows(cx, &mut report).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.write_deletes(cx, &plan.deletes, &mut report).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        Outcome::Ok(report)
    }

    async fn write_inserts(
        &mut self,
        cx: &Cx,
        inserts: &[EntityRef],
        report: &mut FlushReport,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());

        for entity in inserts {
            if let Err(e) = self.fire_hooks(HookPoint::BeforeCreate, Some(entity)) {
                return Outcome::Err(e);
            }
            let meta = registry.meta(entity.entity());

            // Initialize the optimistic-lock column on first write.
            if let Some(version) = meta.version {
                if entity.value(version).is_null() {
                    let mut inner = entity.write();
                    inner.current[version.0] = Value::BigInt(1);
                }
            }

            let key_pending = entity.key().assigned().is_none();
            let mut cols: Vec<FieldId> = Vec::with_capacity(meta.fields.len());
            let mut values: Vec<Value> = Vec::with_capacity(meta.fields.len());
            {
                let inner = entity.read();
                for (i, _) in meta.fields.iter().enumerate() {
                    let fid = FieldId(i);
                    if key_pending && fid == meta.key {
                        continue;
                    }
                    cols.push(fid);
                    values.push(inner.current[i].clone());
                }
            }

            if key_pending {
                // Driver-assigned key: the INSERT echoes it back.
                let stmt = insert_returning(self.driver().dialect(), meta, &cols, values);
                tracing::trace!(sql = %stmt.sql, "insert (returning)");
                let id = match self.driver().insert(cx, &stmt.sql, &stmt.params).await {
                    Outcome::Ok(id) => id,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                if let Err(e) = self.take_key(entity, KeyValue::Int(id)) {
                    return Outcome::Err(e);
                }
            } else {
                let stmt = insert_row(self.driver().dialect(), meta, &cols, values);
                tracing::trace!(sql = %stmt.sql, "insert");
                match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                let mut inner = entity.write();
                if inner.lifecycle == Lifecycle::New {
                    inner.lifecycle = Lifecycle::Pending;
                }
            }

            report.inserted += 1;
            if let Err(e) = self.fire_hooks(HookPoint::AfterCreate, Some(entity)) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(())
    }

    async fn write_updates(
        &mut self,
        cx: &Cx,
        updates: &[EntityRef],
        report: &mut FlushReport,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());

        // First pass: hooks, then diff. The dirty set is computed at
        // emission time so hook mutations are included; entities whose
        // fields went back to their original values issue no SQL at all.
        let mut versioned: Vec<(EntityRef, Vec<(FieldId, Value)>)> = Vec::new();
        let mut unversioned: Vec<(EntityRef, Vec<(FieldId, Value)>)> = Vec::new();
        for entity in updates {
            if let Err(e) = self.fire_hooks(HookPoint::BeforeUpdate, Some(entity)) {
                return Outcome::Err(e);
            }
            let diff = self.tracker.diff(entity);
            if diff.is_empty() {
                continue;
            }
            let meta = registry.meta(entity.entity());
            let mut sets = diff.fields;
            if let Some(version) = meta.version {
                sets.retain(|(f, _)| *f != version);
                versioned.push((Arc::clone(entity), sets));
            } else {
                unversioned.push((Arc::clone(entity), sets));
            }
        }

        // Versioned rows update one at a time: the precondition must be able
        // to name the stale row.
        for (entity, sets) in &versioned {
            let meta = registry.meta(entity.entity());
            let version = meta.version.expect("versioned update without version field");
            // Rows inserted earlier in this flush have no snapshot baseline
            // yet; their own freshly written version is the precondition.
            let old = if entity.lifecycle() == Lifecycle::Pending {
                entity.value(version)
            } else {
                entity.original(version)
            };
            let old_n = old.as_i64().unwrap_or(0);
            let new = Value::BigInt(old_n + 1);
            entity.write().current[version.0] = new.clone();

            let Some(key) = Self::assigned_value(entity) else {
                continue;
            };
            let stmt = update_row(
                self.driver().dialect(),
                meta,
                sets,
                key,
                Some((version, new, old)),
            );
            tracing::trace!(sql = %stmt.sql, "update (versioned)");
            let affected = match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if affected == 0 {
                return Outcome::Err(Error::StaleWrite {
                    entity: entity.name(),
                    key: entity.render_key(),
                });
            }
            report.updated += 1;
        }

        // Unversioned rows sharing a column set can ride one statement.
        let mut groups: Vec<((relmap_core::meta::EntityId, Vec<FieldId>), Vec<usize>)> = Vec::new();
        for (i, (entity, sets)) in unversioned.iter().enumerate() {
            let cols: Vec<FieldId> = sets.iter().map(|(f, _)| *f).collect();
            let group_key = (entity.entity(), cols);
            match groups.iter_mut().find(|(k, _)| *k == group_key) {
                Some((_, members)) => members.push(i),
                None => groups.push((group_key, vec![i])),
            }
        }
        for ((entity_type, cols), members) in groups {
            let meta = registry.meta(entity_type);
            let rows: Vec<(Value, Vec<Value>)> = members
                .iter()
                .filter_map(|&i| {
                    let (entity, sets) = &unversioned[i];
                    Self::assigned_value(entity)
                        .map(|key| (key, sets.iter().map(|(_, v)| v.clone()).collect()))
                })
                .collect();
            if rows.is_empty() {
                continue;
            }

            if let Some(stmt) = update_bulk(self.driver().dialect(), meta, &cols, &rows) {
                tracing::trace!(sql = %stmt.sql, rows = rows.len(), "update (bulk)");
                match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                report.updated += rows.len();
            } else {
                for (key, values) in rows {
                    let sets: Vec<(FieldId, Value)> =
                        cols.iter().copied().zip(values).collect();
                    let stmt = update_row(self.driver().dialect(), meta, &sets, key, None);
                    tracing::trace!(sql = %stmt.sql, "update");
                    match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                        Outcome::Ok(_) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                    report.updated += 1;
                }
            }
        }

        for (entity, _) in versioned.iter().chain(&unversioned) {
            if let Err(e) = self.fire_hooks(HookPoint::AfterUpdate, Some(entity)) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(())
    }

    async fn write_join_rows(&mut self, cx: &Cx, report: &mut FlushReport) -> Outcome<(), Error> {
        // Staged ops are kept until finalize so a failed flush can retry.
        let ops: Vec<(relmap_core::meta::LinkTableDef, Option<Value>, Option<Value>, bool)> = self
            .join_rows
            .iter()
            .map(|op| {
                (
                    op.link,
                    Self::assigned_value(&op.local),
                    Self::assigned_value(&op.remote),
                    op.add,
                )
            })
            .collect();

        for (link, local, remote, add) in ops {
            let (Some(local), Some(remote)) = (local, remote) else {
                tracing::warn!(table = link.table, "skipping join row with unassigned key");
                continue;
            };
            let stmt = if add {
                link_insert(self.driver().dialect(), &link, local, remote)
            } else {
                link_delete(self.driver().dialect(), &link, local, remote)
            };
            tracing::trace!(sql = %stmt.sql, "join row");
            match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(_) => report.link_rows += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    async fn write_deletes(
        &mut self,
        cx: &Cx,
        deletes: &[EntityRef],
        report: &mut FlushReport,
    ) -> Outcome<(), Error> {
        if deletes.is_empty() {
            return Outcome::Ok(());
        }
        let registry = Arc::clone(self.registry());

        // Compensating relation nulling: children of non-owned to-many /
        // to-one relations keep their rows but lose the reference.
        let mut nulling: HashMap<(relmap_core::meta::EntityId, FieldId), Vec<Value>> =
            HashMap::new();
        // Link-table cleanup for the deleted rows' many-to-many relations.
        let mut link_cleanup: HashMap<(&'static str, &'static str), (relmap_core::meta::LinkTableDef, Vec<Value>)> =
            HashMap::new();

        for entity in deletes {
            let meta = registry.meta(entity.entity());
            let Some(key) = Self::assigned_value(entity) else {
                continue;
            };
            for (_, rel) in meta.relations_iter() {
                match rel.kind {
                    RelationKind::OneToMany | RelationKind::OneToOne => {
                        if rel.owns {
                            continue;
                        }
                        let Some(remote_fk) = rel.remote_fk else { continue };
                        let relmap_core::meta::RelationTarget::Single(child) = &rel.target else {
                            continue;
                        };
                        if registry.meta(*child).field_meta(remote_fk).nullable {
                            nulling
                                .entry((*child, remote_fk))
                                .or_default()
                                .push(key.clone());
                        }
                    }
                    RelationKind::ManyToMany => {
                        if let Some(link) = rel.link {
                            link_cleanup
                                .entry((link.table, link.local_column))
                                .or_insert_with(|| (link, Vec::new()))
                                .1
                                .push(key.clone());
                        }
                    }
                    RelationKind::ManyToOne => {}
                }
            }
        }

        for ((child, fk), keys) in nulling {
            let stmt = null_fk(self.driver().dialect(), registry.meta(child), fk, &keys);
            tracing::trace!(sql = %stmt.sql, "fk nulling");
            match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        for ((_, column), (link, keys)) in link_cleanup {
            let stmt = link_delete_for_owner(self.driver().dialect(), &link, column, &keys);
            tracing::trace!(sql = %stmt.sql, "link cleanup");
            match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // Child-first ordering came from the partition; batch consecutive
        // runs of the same type into one IN-clause DELETE.
        for entity in deletes {
            if let Err(e) = self.fire_hooks(HookPoint::BeforeDelete, Some(entity)) {
                return Outcome::Err(e);
            }
        }
        let mut i = 0usize;
        while i < deletes.len() {
            let entity_type = deletes[i].entity();
            let mut keys: Vec<Value> = Vec::new();
            let mut j = i;
            while j < deletes.len() && deletes[j].entity() == entity_type {
                if let Some(key) = Self::assigned_value(&deletes[j]) {
                    keys.push(key);
                }
                j += 1;
            }
            if !keys.is_empty() {
                let stmt = delete_by_keys(self.driver().dialect(), registry.meta(entity_type), &keys);
                tracing::trace!(sql = %stmt.sql, rows = keys.len(), "delete");
                match self.driver().execute(cx, &stmt.sql, &stmt.params).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                report.deleted += keys.len();
            }
            i = j;
        }
        for entity in deletes {
            if let Err(e) = self.fire_hooks(HookPoint::AfterDelete, Some(entity)) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Phase 3: post-commit bookkeeping
    // ========================================================================

    /// Promote lifecycles and re-snapshot after a successful commit.
    fn finalize(&mut self, plan: &WritePlan) {
        for entity in &plan.inserts {
            let mut inner = entity.write();
            inner.lifecycle = Lifecycle::Persisted;
        }
        for entity in &plan.deletes {
            entity.write().lifecycle = Lifecycle::Deleted;
            self.identity.remove(&entity.entity_key());
        }
        // New baseline for everything that now mirrors a row.
        for entity in self.identity.iter() {
            if entity.lifecycle() == Lifecycle::Persisted {
                let mut inner = entity.write();
                let current = inner.current.clone();
                inner.original = current;
            }
        }
        self.join_rows.clear();
        self.fk_fixups
            .retain(|f: &FkFixup| Self::assigned_value(&f.target).is_none());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{block_on, fixture_registry, NullDriver};
    use relmap_core::Cx;

    #[test]
    fn in_flight_states() {
        assert!(!FlushState::Idle.in_flight());
        assert!(FlushState::Validating.in_flight());
        assert!(FlushState::Flushing.in_flight());
        assert!(!FlushState::Committed.in_flight());
        assert!(!FlushState::Failed.in_flight());
    }

    #[test]
    fn concurrent_flush_rejected_immediately() {
        let cx = Cx::for_testing();
        let mut uow = UnitOfWork::new(fixture_registry(), NullDriver);
        uow.state = FlushState::Flushing;

        let outcome = block_on(uow.flush(&cx));
        assert!(matches!(outcome, Outcome::Err(Error::ConcurrentFlush)));
    }

    #[test]
    fn mutation_during_flush_rejected_outside_hooks() {
        let mut uow = UnitOfWork::new(fixture_registry(), NullDriver);
        let author = uow.create("Author").unwrap();

        uow.state = FlushState::Flushing;
        let err = uow.set(&author, "name", "x").unwrap_err();
        assert!(matches!(err, Error::MutationDuringFlush { entity: "Author" }));

        // From within a hook invocation the same mutation is legal.
        uow.hook_depth = 1;
        uow.set(&author, "name", "x").unwrap();
        uow.hook_depth = 0;
        uow.state = FlushState::Idle;
    }

    #[test]
    fn empty_flush_commits_without_sql_state() {
        let cx = Cx::for_testing();
        let mut uow = UnitOfWork::new(fixture_registry(), NullDriver);

        let report = match block_on(uow.flush(&cx)) {
            Outcome::Ok(report) => report,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        };
        assert_eq!(report, FlushReport::default());
        assert_eq!(uow.state(), FlushState::Committed);
        assert_eq!(uow.last_report(), Some(&FlushReport::default()));
    }

    #[test]
    fn flush_after_failure_is_allowed() {
        let cx = Cx::for_testing();
        let mut uow = UnitOfWork::new(fixture_registry(), NullDriver);
        uow.state = FlushState::Failed;

        let outcome = block_on(uow.flush(&cx));
        assert!(matches!(outcome, Outcome::Ok(_)));
    }
}
