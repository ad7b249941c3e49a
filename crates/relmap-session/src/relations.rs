//! Relation consistency maintenance.
//!
//! Every relation mutation keeps the in-memory forward and inverse sides
//! synchronized without a database round trip: setting a to-one relation
//! updates the FK field, the forward cache, and (when loaded) the inverse
//! collections of both the new and the previous target. Many-to-many adds
//! and removes maintain both loaded caches and stage a join-row delta.
//! Deleting an entity removes it synchronously from every loaded cache that
//! referenced it before any SQL executes, and cascades to owned children
//! (loading unloaded owned relations first so the cascade is complete).
//!
//! Invariant: at every observable point between operations, for any loaded
//! pair of inverse relations, membership is mutually consistent. Unloaded
//! caches are left untouched.

use crate::entity::{one_of, upgrade_many, EntityRef, KeyValue, Lifecycle, RelationCache};
use crate::{Changed, FkFixup, JoinRowOp, UnitOfWork};
use relmap_core::error::{Error, Result};
use relmap_core::meta::{RelationId, RelationKind, RelationTarget};
use relmap_core::{Cx, Driver, Outcome, Value};
use relmap_query::{select_by_keys, select_filter, select_via_link, Dir, Filter};
use std::sync::Arc;

impl<D: Driver> UnitOfWork<D> {
    // ========================================================================
    // To-one relations
    // ========================================================================

    /// Set (or clear) a to-one relation.
    ///
    /// Updates the FK field, the forward cache, and both affected inverse
    /// caches where loaded. Linking to a `New` target records a fixup so the
    /// FK column is written once the target's key is assigned at flush.
    pub fn set_relation(
        &mut self,
        entity: &EntityRef,
        relation: &str,
        target: Option<&EntityRef>,
    ) -> Result<()> {
        let rid = self
            .registry()
            .meta(entity.entity())
            .relation_or_err(relation)?;
        self.set_to_one(entity, rid, target)
    }

    pub(crate) fn set_to_one(
        &mut self,
        entity: &EntityRef,
        rid: RelationId,
        target: Option<&EntityRef>,
    ) -> Result<()> {
        self.guard_mutable(entity)?;
        if let Some(t) = target {
            if !t.lifecycle().mutable() {
                return Err(Error::invalid_state(
                    t.name(),
                    "cannot link to a deleted instance",
                ));
            }
        }

        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());
        let rel = meta.relation_meta(rid);
        if rel.is_many() {
            return Err(Error::invalid_state(
                entity.name(),
                format!("relation {} is to-many; use link/unlink", rel.name),
            ));
        }
        let fk = rel.fk_field.ok_or_else(|| {
            Error::invalid_state(
                entity.name(),
                format!("relation {} is owned by the other side", rel.name),
            )
        })?;

        // Target type check.
        if let Some(t) = target {
            if !rel.target.candidates().contains(&t.entity()) {
                return Err(Error::invalid_state(
                    entity.name(),
                    format!("relation {} cannot point at {}", rel.name, t.name()),
                ));
            }
        }

        // Resolve the previous target: forward cache first, FK value second.
        let prev = self.current_to_one(entity, rid);
        let unchanged = match (&prev, target) {
            (Some(p), Some(t)) => Arc::ptr_eq(p, t),
            (None, None) => true,
            _ => false,
        };

        if !unchanged {
            // Drop the entity from the previous target's loaded inverse.
            if let Some(prev) = &prev {
                if let Some(inv) = rel.inverse.on(prev.entity()) {
                    self.detach_from_cache(prev, inv, entity);
                    self.note_relation_change(prev, inv);
                }
            }
        }

        // Forward cache always ends up loaded.
        entity.write().relations[rid.0] = one_of(target);

        // FK column (and the discriminator for polymorphic relations).
        match target {
            Some(t) => match Self::assigned_value(t) {
                Some(key) => self.apply_value(entity, fk, key),
                None => {
                    self.apply_value(entity, fk, Value::Null);
                    self.fk_fixups.push(FkFixup {
                        entity: Arc::clone(entity),
                        field: fk,
                        target: Arc::clone(t),
                    });
                }
            },
            None => self.apply_value(entity, fk, Value::Null),
        }
        if let RelationTarget::Polymorphic { type_field, .. } = &rel.target {
            let tag = target.map_or(Value::Null, |t| Value::Text(t.name().to_string()));
            self.apply_value(entity, *type_field, tag);
        }

        if !unchanged {
            // Join the new target's loaded inverse.
            if let Some(t) = target {
                if let Some(inv) = rel.inverse.on(t.entity()) {
                    self.attach_to_cache(t, inv, entity);
                    self.note_relation_change(t, inv);
                }
            }
            self.note_relation_change(entity, rid);
        }
        Ok(())
    }

    /// Raw write to an FK column, routed through relation maintenance.
    ///
    /// When the referenced row is in the identity map this behaves exactly
    /// like `set_relation`; otherwise the column is written and the forward
    /// cache is invalidated (the previous inverse is still detached).
    pub(crate) fn set_fk_raw(
        &mut self,
        entity: &EntityRef,
        rid: RelationId,
        fk: relmap_core::meta::FieldId,
        value: Value,
    ) -> Result<()> {
        if value.is_null() {
            return self.set_to_one(entity, rid, None);
        }

        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());
        let rel = meta.relation_meta(rid);
        let target_type = match &rel.target {
            RelationTarget::Single(t) => *t,
            RelationTarget::Polymorphic { type_field, .. } => {
                let tag = entity.value(*type_field);
                let Some(tag) = tag.as_str() else {
                    return Err(Error::invalid_state(
                        entity.name(),
                        "set polymorphic relations through set_relation",
                    ));
                };
                registry.entity(tag)?
            }
        };

        let key = KeyValue::from_value(entity.name(), &value)?;
        if let Some(target) = self.identity.get_assigned(target_type, &key) {
            return self.set_to_one(entity, rid, Some(&target));
        }

        // Row not in memory: detach the previous inverse, write the column,
        // leave the forward cache unloaded for a later relation load.
        self.guard_mutable(entity)?;
        if let Some(prev) = self.current_to_one(entity, rid) {
            if let Some(inv) = rel.inverse.on(prev.entity()) {
                self.detach_from_cache(&prev, inv, entity);
                self.note_relation_change(&prev, inv);
            }
        }
        entity.write().relations[rid.0] = RelationCache::Unloaded;
        self.apply_value(entity, fk, value);
        self.note_relation_change(entity, rid);
        Ok(())
    }

    /// Resolve the current to-one target from the forward cache, falling
    /// back to the FK value against the identity map.
    fn current_to_one(&self, entity: &EntityRef, rid: RelationId) -> Option<EntityRef> {
        let meta = self.registry().meta(entity.entity());
        let rel = meta.relation_meta(rid);
        {
            let inner = entity.read();
            if let RelationCache::One(link) = &inner.relations[rid.0] {
                return link.as_ref().and_then(std::sync::Weak::upgrade);
            }
        }
        let fk = rel.fk_field?;
        let value = entity.value(fk);
        if value.is_null() {
            return None;
        }
        let key = KeyValue::from_value(entity.name(), &value).ok()?;
        let target_type = match &rel.target {
            RelationTarget::Single(t) => *t,
            RelationTarget::Polymorphic { type_field, .. } => {
                let tag = entity.value(*type_field);
                self.registry().entity(tag.as_str()?).ok()?
            }
        };
        self.identity.get_assigned(target_type, &key)
    }

    // ========================================================================
    // Many-to-many relations
    // ========================================================================

    /// Add a member to a many-to-many relation.
    pub fn link(&mut self, entity: &EntityRef, relation: &str, target: &EntityRef) -> Result<()> {
        self.link_impl(entity, relation, target, true)
    }

    /// Remove a member from a many-to-many relation.
    pub fn unlink(&mut self, entity: &EntityRef, relation: &str, target: &EntityRef) -> Result<()> {
        self.link_impl(entity, relation, target, false)
    }

    fn link_impl(
        &mut self,
        entity: &EntityRef,
        relation: &str,
        target: &EntityRef,
        add: bool,
    ) -> Result<()> {
        self.guard_mutable(entity)?;
        if add && !target.lifecycle().mutable() {
            return Err(Error::invalid_state(
                target.name(),
                "cannot link to a deleted instance",
            ));
        }

        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());
        let rid = meta.relation_or_err(relation)?;
        let rel = meta.relation_meta(rid);
        if rel.kind != RelationKind::ManyToMany {
            return Err(Error::invalid_state(
                entity.name(),
                format!("relation {} is not many-to-many", rel.name),
            ));
        }
        let link = rel.link.ok_or_else(|| {
            Error::Metadata(format!("relation {}.{} has no link table", meta.name, rel.name))
        })?;
        if !rel.target.candidates().contains(&target.entity()) {
            return Err(Error::invalid_state(
                entity.name(),
                format!("relation {} cannot point at {}", rel.name, target.name()),
            ));
        }

        // Both loaded caches.
        if add {
            self.attach_to_cache(entity, rid, target);
        } else {
            self.detach_from_cache(entity, rid, target);
        }
        if let Some(inv) = rel.inverse.on(target.entity()) {
            if add {
                self.attach_to_cache(target, inv, entity);
            } else {
                self.detach_from_cache(target, inv, entity);
            }
            self.note_relation_change(target, inv);
        }

        // Stage the join-row delta; an add staged on top of a staged remove
        // (or vice versa) cancels out.
        let cancelled = self.join_rows.iter().position(|op| {
            op.link.table == link.table
                && op.add != add
                && ((Arc::ptr_eq(&op.local, entity) && Arc::ptr_eq(&op.remote, target))
                    || (Arc::ptr_eq(&op.local, target) && Arc::ptr_eq(&op.remote, entity)))
        });
        match cancelled {
            Some(i) => {
                self.join_rows.remove(i);
            }
            None => {
                let duplicate = self.join_rows.iter().any(|op| {
                    op.link.table == link.table
                        && op.add == add
                        && ((Arc::ptr_eq(&op.local, entity) && Arc::ptr_eq(&op.remote, target))
                            || (Arc::ptr_eq(&op.local, target) && Arc::ptr_eq(&op.remote, entity)))
                });
                if !duplicate {
                    self.join_rows.push(JoinRowOp {
                        link,
                        local: Arc::clone(entity),
                        remote: Arc::clone(target),
                        add,
                    });
                }
            }
        }

        self.note_relation_change(entity, rid);
        Ok(())
    }

    // ========================================================================
    // Cache plumbing
    // ========================================================================

    /// Add `member` to a loaded cache; unloaded caches are left untouched.
    pub(crate) fn attach_to_cache(&self, owner: &EntityRef, rid: RelationId, member: &EntityRef) {
        let mut inner = owner.write();
        match &mut inner.relations[rid.0] {
            RelationCache::Many(members) => {
                if !members
                    .iter()
                    .any(|w| w.upgrade().is_some_and(|m| Arc::ptr_eq(&m, member)))
                {
                    members.push(Arc::downgrade(member));
                }
            }
            RelationCache::One(link) => {
                *link = Some(Arc::downgrade(member));
            }
            RelationCache::Unloaded | RelationCache::Loading => {}
        }
    }

    /// Remove `member` from a loaded cache; unloaded caches are left
    /// untouched.
    pub(crate) fn detach_from_cache(&self, owner: &EntityRef, rid: RelationId, member: &EntityRef) {
        let mut inner = owner.write();
        match &mut inner.relations[rid.0] {
            RelationCache::Many(members) => {
                members.retain(|w| match w.upgrade() {
                    Some(m) => !Arc::ptr_eq(&m, member),
                    None => false,
                });
            }
            RelationCache::One(link) => {
                let points_here = link
                    .as_ref()
                    .and_then(std::sync::Weak::upgrade)
                    .is_some_and(|m| Arc::ptr_eq(&m, member));
                if points_here {
                    *link = None;
                }
            }
            RelationCache::Unloaded | RelationCache::Loading => {}
        }
    }

    /// Members of a loaded relation cache (to-one yields zero or one).
    pub(crate) fn loaded_members(&self, entity: &EntityRef, rid: RelationId) -> Vec<EntityRef> {
        let inner = entity.read();
        match &inner.relations[rid.0] {
            RelationCache::Many(members) => upgrade_many(members),
            RelationCache::One(link) => link
                .as_ref()
                .and_then(std::sync::Weak::upgrade)
                .into_iter()
                .collect(),
            RelationCache::Unloaded | RelationCache::Loading => Vec::new(),
        }
    }

    // ========================================================================
    // Must-be-loaded accessors
    // ========================================================================

    /// Read a loaded to-many relation. Fails fast with `InvalidState` when
    /// the cache is unloaded; use `load_relation` first.
    pub fn related_many(&self, entity: &EntityRef, relation: &str) -> Result<Vec<EntityRef>> {
        let meta = self.registry().meta(entity.entity());
        let rid = meta.relation_or_err(relation)?;
        let inner = entity.read();
        match &inner.relations[rid.0] {
            RelationCache::Many(members) => Ok(upgrade_many(members)),
            RelationCache::One(_) => Err(Error::invalid_state(
                entity.name(),
                format!("relation {} is to-one", relation),
            )),
            RelationCache::Unloaded | RelationCache::Loading => Err(Error::invalid_state(
                entity.name(),
                format!("relation {} is not loaded", relation),
            )),
        }
    }

    /// Read a loaded to-one relation. Fails fast when unloaded.
    pub fn related_one(&self, entity: &EntityRef, relation: &str) -> Result<Option<EntityRef>> {
        let meta = self.registry().meta(entity.entity());
        let rid = meta.relation_or_err(relation)?;
        let inner = entity.read();
        match &inner.relations[rid.0] {
            RelationCache::One(link) => Ok(link.as_ref().and_then(std::sync::Weak::upgrade)),
            RelationCache::Many(_) => Err(Error::invalid_state(
                entity.name(),
                format!("relation {} is to-many", relation),
            )),
            RelationCache::Unloaded | RelationCache::Loading => Err(Error::invalid_state(
                entity.name(),
                format!("relation {} is not loaded", relation),
            )),
        }
    }

    // ========================================================================
    // Relation loading
    // ========================================================================

    /// Load a relation cache from the store if it is not loaded yet.
    ///
    /// Members already pending in memory (added through relation mutation
    /// but not flushed) are merged into the loaded payload, and staged
    /// join-row deltas are applied, so the cache reflects the session's own
    /// writes.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = entity.name(), relation))]
    pub async fn load_relation(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        relation: &str,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());
        let rid = match meta.relation_or_err(relation) {
            Ok(rid) => rid,
            Err(e) => return Outcome::Err(e),
        };
        if entity.relation_loaded(rid) {
            return Outcome::Ok(());
        }
        entity.write().relations[rid.0] = RelationCache::Loading;

        let rel = meta.relation_meta(rid);
        let result = match rel.kind {
            RelationKind::ManyToOne => self.load_to_one(cx, entity, rid).await,
            RelationKind::OneToOne => {
                if rel.fk_field.is_some() {
                    self.load_to_one(cx, entity, rid).await
                } else {
                    self.load_remote_side(cx, entity, rid).await
                }
            }
            RelationKind::OneToMany => self.load_remote_side(cx, entity, rid).await,
            RelationKind::ManyToMany => self.load_via_link(cx, entity, rid).await,
        };
        if !matches!(result, Outcome::Ok(())) {
            // A failed load leaves the cache unloaded, not wedged in Loading.
            entity.write().relations[rid.0] = RelationCache::Unloaded;
        }
        result
    }

    async fn load_to_one(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        rid: RelationId,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());
        let rel = meta.relation_meta(rid);
        let fk = rel.fk_field.expect("to-one load without FK field");

        let fk_value = entity.value(fk);
        if fk_value.is_null() {
            entity.write().relations[rid.0] = RelationCache::One(None);
            return Outcome::Ok(());
        }
        let key = match KeyValue::from_value(entity.name(), &fk_value) {
            Ok(k) => k,
            Err(e) => return Outcome::Err(e),
        };
        let target_type = match &rel.target {
            RelationTarget::Single(t) => *t,
            RelationTarget::Polymorphic { type_field, .. } => {
                let tag = entity.value(*type_field);
                let Some(tag) = tag.as_str() else {
                    entity.write().relations[rid.0] = RelationCache::One(None);
                    return Outcome::Ok(());
                };
                match registry.entity(tag) {
                    Ok(t) => t,
                    Err(e) => return Outcome::Err(e),
                }
            }
        };

        if let Some(target) = self.identity.get_assigned(target_type, &key) {
            entity.write().relations[rid.0] = one_of(Some(&target));
            return Outcome::Ok(());
        }

        let target_meta = registry.meta(target_type);
        let stmt = select_by_keys(self.driver().dialect(), target_meta, &[key.to_value()]);
        let rows = match self.driver().query(cx, &stmt.sql, &stmt.params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let target = match rows.first() {
            Some(row) => match self.identity.get_or_register(&registry, target_type, row) {
                Ok(t) => Some(t),
                Err(e) => return Outcome::Err(e),
            },
            None => None,
        };
        entity.write().relations[rid.0] = one_of(target.as_ref());
        Outcome::Ok(())
    }

    /// Load the non-owning side of a one-to-many / one-to-one: rows of the
    /// target whose FK points back at this entity.
    async fn load_remote_side(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        rid: RelationId,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());
        let rel = meta.relation_meta(rid);
        let RelationTarget::Single(target_type) = &rel.target else {
            return Outcome::Err(Error::Metadata(format!(
                "relation {}.{} has a polymorphic remote side",
                meta.name, rel.name
            )));
        };
        let target_type = *target_type;
        let target_meta = registry.meta(target_type);
        let remote_fk = rel.remote_fk.expect("remote-side load without remote FK");

        let mut members: Vec<EntityRef> = Vec::new();
        if let Some(key) = Self::assigned_value(entity) {
            let mut filter = Filter::new().eq(target_meta.field_meta(remote_fk).name, key);
            if let Some(order) = rel.order_by {
                filter = filter.order_by(target_meta.field_meta(order).name, Dir::Asc);
            }
            let stmt = match select_filter(self.driver().dialect(), &registry, target_type, &filter)
            {
                Ok(stmt) => stmt,
                Err(e) => return Outcome::Err(e),
            };
            let rows = match self.driver().query(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            for row in &rows {
                match self.identity.get_or_register(&registry, target_type, row) {
                    Ok(member) => members.push(member),
                    Err(e) => return Outcome::Err(e),
                }
            }
        }

        // Merge members pending only in memory: instances of the target type
        // whose inverse points here but which the store does not know yet,
        // and drop members deleted in this session.
        members.retain(|m| m.lifecycle().mutable());
        let inverse = rel.inverse.on(target_type);
        for candidate in self.identity.of_type(target_type) {
            if !candidate.lifecycle().mutable() {
                continue;
            }
            if members.iter().any(|m| Arc::ptr_eq(m, &candidate)) {
                continue;
            }
            let mut points_here = match inverse {
                Some(inv) => self
                    .loaded_members(&candidate, inv)
                    .iter()
                    .any(|t| Arc::ptr_eq(t, entity)),
                None => false,
            };
            if !points_here {
                let fk_value = candidate.value(remote_fk);
                if let Some(key) = Self::assigned_value(entity) {
                    points_here = fk_value.semantic_eq(&key);
                }
            }
            if points_here {
                members.push(candidate);
            }
        }

        let payload = if rel.kind == RelationKind::OneToOne {
            one_of(members.first())
        } else {
            RelationCache::Many(members.iter().map(Arc::downgrade).collect())
        };
        entity.write().relations[rid.0] = payload;
        Outcome::Ok(())
    }

    async fn load_via_link(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        rid: RelationId,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());
        let rel = meta.relation_meta(rid);
        let RelationTarget::Single(target_type) = &rel.target else {
            return Outcome::Err(Error::Metadata(format!(
                "relation {}.{} is polymorphic many-to-many",
                meta.name, rel.name
            )));
        };
        let target_type = *target_type;
        let link = rel.link.expect("many-to-many without link table");
        let target_meta = registry.meta(target_type);

        let mut members: Vec<EntityRef> = Vec::new();
        if let Some(key) = Self::assigned_value(entity) {
            let stmt = select_via_link(
                self.driver().dialect(),
                target_meta,
                &link,
                key,
                rel.order_by,
            );
            let rows = match self.driver().query(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            for row in &rows {
                match self.identity.get_or_register(&registry, target_type, row) {
                    Ok(member) => members.push(member),
                    Err(e) => return Outcome::Err(e),
                }
            }
        }

        // Apply staged join-row deltas so the cache reflects this session's
        // unflushed link/unlink calls.
        members.retain(|m| m.lifecycle().mutable());
        for op in &self.join_rows {
            if op.link.table != link.table {
                continue;
            }
            let other = if Arc::ptr_eq(&op.local, entity) {
                Some(&op.remote)
            } else if Arc::ptr_eq(&op.remote, entity) {
                Some(&op.local)
            } else {
                None
            };
            let Some(other) = other else { continue };
            if op.add {
                if !members.iter().any(|m| Arc::ptr_eq(m, other)) {
                    members.push(Arc::clone(other));
                }
            } else {
                members.retain(|m| !Arc::ptr_eq(m, other));
            }
        }

        entity.write().relations[rid.0] =
            RelationCache::Many(members.iter().map(Arc::downgrade).collect());
        Outcome::Ok(())
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Mark an entity for deletion.
    ///
    /// The instance leaves every loaded cache synchronously, before any SQL
    /// executes; owned children cascade (unloaded owned relations are loaded
    /// first so the cascade is complete). Deleting a `New` instance
    /// unregisters it entirely; no SQL is ever issued for it.
    pub async fn delete(&mut self, cx: &Cx, entity: &EntityRef) -> Outcome<(), Error> {
        if let Err(e) = self.guard_not_flushing(entity.name()) {
            return Outcome::Err(e);
        }
        match entity.lifecycle() {
            Lifecycle::Deleted | Lifecycle::PendingDelete => return Outcome::Ok(()),
            Lifecycle::New => {
                self.discard_new(entity);
                return Outcome::Ok(());
            }
            Lifecycle::Pending | Lifecycle::Persisted => {}
        }

        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity.entity());

        // Complete the cascade frontier before touching anything: unloaded
        // owned relations must be consulted.
        let owned: Vec<RelationId> = meta
            .relations_iter()
            .filter(|(_, r)| r.owns)
            .map(|(rid, _)| rid)
            .collect();
        for rid in &owned {
            if !entity.relation_loaded(*rid) {
                let name = meta.relation_meta(*rid).name;
                match self.load_relation(cx, entity, name).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        let mut children: Vec<EntityRef> = Vec::new();
        for rid in &owned {
            children.extend(self.loaded_members(entity, *rid));
        }

        tracing::debug!(
            entity = entity.name(),
            key = %entity.render_key(),
            cascade = children.len(),
            "marking for deletion"
        );

        entity.write().lifecycle = Lifecycle::PendingDelete;
        self.scrub_from_caches(entity);
        // Staged additions involving a doomed row are moot.
        self.join_rows.retain(|op| {
            !(op.add && (Arc::ptr_eq(&op.local, entity) || Arc::ptr_eq(&op.remote, entity)))
        });
        self.fk_fixups
            .retain(|f| !Arc::ptr_eq(&f.target, entity) && !Arc::ptr_eq(&f.entity, entity));

        for child in children {
            if child.lifecycle() == Lifecycle::PendingDelete {
                continue;
            }
            // Cascades recurse; box the child future to keep the async
            // state machine finite.
            let cascade: std::pin::Pin<
                Box<dyn std::future::Future<Output = Outcome<(), Error>> + '_>,
            > = Box::pin(self.delete(cx, &child));
            match cascade.await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Remove a never-persisted instance without touching the store.
    fn discard_new(&mut self, entity: &EntityRef) {
        self.scrub_from_caches(entity);
        self.join_rows.retain(|op| {
            !(Arc::ptr_eq(&op.local, entity) || Arc::ptr_eq(&op.remote, entity))
        });
        self.fk_fixups
            .retain(|f| !Arc::ptr_eq(&f.target, entity) && !Arc::ptr_eq(&f.entity, entity));
        self.identity.remove(&entity.entity_key());
        entity.write().lifecycle = Lifecycle::Deleted;
    }

    /// Remove an instance from every loaded cache in the session, clearing
    /// FK columns whose to-one reference pointed at it.
    fn scrub_from_caches(&mut self, doomed: &EntityRef) {
        // Collect first: applying field writes needs &mut self.
        let mut to_one_clears: Vec<(EntityRef, RelationId, Option<relmap_core::meta::FieldId>)> =
            Vec::new();
        let mut to_many_removals: Vec<(EntityRef, RelationId)> = Vec::new();

        for other in self.identity.iter() {
            if Arc::ptr_eq(other, doomed) {
                continue;
            }
            let meta = self.registry().meta(other.entity());
            let inner = other.read();
            for (i, cache) in inner.relations.iter().enumerate() {
                let rid = RelationId(i);
                match cache {
                    RelationCache::Many(members) => {
                        if members
                            .iter()
                            .any(|w| w.upgrade().is_some_and(|m| Arc::ptr_eq(&m, doomed)))
                        {
                            to_many_removals.push((Arc::clone(other), rid));
                        }
                    }
                    RelationCache::One(link) => {
                        let points = link
                            .as_ref()
                            .and_then(std::sync::Weak::upgrade)
                            .is_some_and(|m| Arc::ptr_eq(&m, doomed));
                        if points {
                            to_one_clears.push((
                                Arc::clone(other),
                                rid,
                                meta.relation_meta(rid).fk_field,
                            ));
                        }
                    }
                    RelationCache::Unloaded | RelationCache::Loading => {}
                }
            }
        }

        for (other, rid) in to_many_removals {
            self.detach_from_cache(&other, rid, doomed);
            self.changes.push(Changed::Relation(other, rid));
        }
        for (other, rid, fk) in to_one_clears {
            self.detach_from_cache(&other, rid, doomed);
            if let Some(fk) = fk {
                if other.lifecycle().mutable() {
                    self.apply_value(&other, fk, Value::Null);
                }
            }
            self.changes.push(Changed::Relation(other, rid));
        }
    }
}
