//! The reactive recomputation graph.
//!
//! Before a flush may proceed, every derived field and validation rule whose
//! declared dependencies intersect the set of changed fields, directly or
//! transitively, including changes produced by other rules, must be
//! recomputed, and this must reach a fixed point.
//!
//! The engine keeps a worklist seeded by directly-dirtied (entity, field)
//! pairs and relation membership changes. Affected owners are found by
//! walking each rule's dependency path *backwards* from the change site,
//! using FK values and loaded caches. Derive rules execute in registry
//! topological order, so a chain A -> B -> C recomputes B and C exactly once
//! per settle; a rule's declared paths are loaded before its compute runs
//! (that is the suspension point), and the compute closure itself is
//! synchronous.
//!
//! Validation rules run only after derived settlement; their failures are
//! collected, never short-circuited, so one flush reports every violated
//! rule at once.

use crate::entity::{EntityRef, Lifecycle, RelationCache};
use crate::{Changed, UnitOfWork};
use relmap_core::error::{Error, Result, ValidationFailed};
use relmap_core::meta::{FieldCheck, Registry, RelationKind, RelationTarget};
use relmap_core::rules::{DepPath, EntityView, RuleId, RuleKind};
use relmap_core::{Cx, Driver, Outcome, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Hard ceiling on rule invocations per settle. Dependency cycles are
/// rejected at registry build, so this only trips on a broken engine.
const SETTLE_CAP: u64 = 100_000;

fn ptr(entity: &EntityRef) -> usize {
    Arc::as_ptr(entity) as usize
}

/// Read-only entity view handed to rule compute closures.
///
/// Accessors are must-be-loaded: reading an unloaded relation fails fast.
/// The engine preloads every declared dependency path before invoking a
/// rule, so a rule touching only its declared dependencies never trips this.
pub(crate) struct CellView {
    registry: Arc<Registry>,
    cell: EntityRef,
}

impl CellView {
    pub(crate) fn new(registry: Arc<Registry>, cell: EntityRef) -> Self {
        Self { registry, cell }
    }
}

impl EntityView for CellView {
    fn entity_name(&self) -> &'static str {
        self.cell.name()
    }

    fn value(&self, field: &str) -> Result<Value> {
        let meta = self.registry.meta(self.cell.entity());
        let id = meta.field_or_err(field)?;
        Ok(self.cell.value(id))
    }

    fn related(&self, relation: &str) -> Result<Vec<Box<dyn EntityView + '_>>> {
        let meta = self.registry.meta(self.cell.entity());
        let rid = meta.relation_or_err(relation)?;
        let inner = self.cell.read();
        match &inner.relations[rid.0] {
            RelationCache::Many(members) => Ok(members
                .iter()
                .filter_map(std::sync::Weak::upgrade)
                .filter(|m| m.lifecycle().mutable())
                .map(|m| {
                    Box::new(CellView::new(Arc::clone(&self.registry), m)) as Box<dyn EntityView>
                })
                .collect()),
            RelationCache::One(_) => Err(Error::invalid_state(
                self.cell.name(),
                format!("relation {} is to-one", relation),
            )),
            RelationCache::Unloaded | RelationCache::Loading => Err(Error::invalid_state(
                self.cell.name(),
                format!("relation {} is not loaded", relation),
            )),
        }
    }

    fn related_one(&self, relation: &str) -> Result<Option<Box<dyn EntityView + '_>>> {
        let meta = self.registry.meta(self.cell.entity());
        let rid = meta.relation_or_err(relation)?;
        let inner = self.cell.read();
        match &inner.relations[rid.0] {
            RelationCache::One(link) => Ok(link
                .as_ref()
                .and_then(std::sync::Weak::upgrade)
                .map(|m| {
                    Box::new(CellView::new(Arc::clone(&self.registry), m)) as Box<dyn EntityView>
                })),
            RelationCache::Many(_) => Err(Error::invalid_state(
                self.cell.name(),
                format!("relation {} is to-many", relation),
            )),
            RelationCache::Unloaded | RelationCache::Loading => Err(Error::invalid_state(
                self.cell.name(),
                format!("relation {} is not loaded", relation),
            )),
        }
    }
}

impl<D: Driver> UnitOfWork<D> {
    /// Drive the reactive graph to a fixed point.
    ///
    /// Returns the validation rules triggered along the way (owners
    /// included), for the validation phase to run after settlement.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub(crate) async fn settle_reactive(
        &mut self,
        cx: &Cx,
    ) -> Outcome<Vec<(RuleId, EntityRef)>, Error> {
        let registry = Arc::clone(self.registry());
        let rules = registry.rules();

        let mut queue: Vec<(usize, RuleId, EntityRef)> = Vec::new();
        let mut executed: HashSet<(RuleId, usize)> = HashSet::new();
        let mut validations: Vec<(RuleId, EntityRef)> = Vec::new();
        let mut validation_seen: HashSet<(RuleId, usize)> = HashSet::new();

        let seeds = std::mem::take(&mut self.changes);
        if rules.is_empty() {
            return Outcome::Ok(validations);
        }
        if let Err(e) = self.enqueue_triggers(
            &seeds,
            &mut queue,
            &executed,
            &mut validations,
            &mut validation_seen,
        ) {
            return Outcome::Err(e);
        }

        let mut invocations = 0u64;
        while let Some((_, rule_id, owner)) = pop_lowest_rank(&mut queue) {
            if !executed.insert((rule_id, ptr(&owner))) {
                continue;
            }
            invocations += 1;
            if invocations > SETTLE_CAP {
                return Outcome::Err(Error::Metadata(
                    "reactive settlement did not converge".to_string(),
                ));
            }

            let rule = rules.rule(rule_id);
            tracing::trace!(rule = rule.name, owner = %owner.render_key(), "recomputing");

            // Load everything the rule declared before invoking it.
            for path in &rule.deps {
                match self.preload_path(cx, &owner, path).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }

            let RuleKind::Derive(field) = rule.kind else {
                continue;
            };
            let compute = rule.derive.as_ref().expect("derive rule without compute");
            let view = CellView::new(Arc::clone(&registry), Arc::clone(&owner));
            let value = match compute(&view) {
                Ok(v) => v,
                Err(e) => return Outcome::Err(e),
            };
            drop(view);
            self.apply_value(&owner, field, value);

            // Whatever the write dirtied extends the worklist.
            let produced = std::mem::take(&mut self.changes);
            if let Err(e) = self.enqueue_triggers(
                &produced,
                &mut queue,
                &executed,
                &mut validations,
                &mut validation_seen,
            ) {
                return Outcome::Err(e);
            }
        }

        tracing::debug!(invocations, "reactive graph settled");
        Outcome::Ok(validations)
    }

    /// Map a batch of changes to affected (rule, owner) pairs.
    fn enqueue_triggers(
        &self,
        changes: &[Changed],
        queue: &mut Vec<(usize, RuleId, EntityRef)>,
        executed: &HashSet<(RuleId, usize)>,
        validations: &mut Vec<(RuleId, EntityRef)>,
        validation_seen: &mut HashSet<(RuleId, usize)>,
    ) -> Result<()> {
        let registry = self.registry();
        let rules = registry.rules();

        for change in changes {
            let triggers = match change {
                Changed::Field(entity, field) => {
                    rules.triggers_for_field(entity.entity(), *field)
                }
                Changed::Relation(entity, relation) => {
                    rules.triggers_for_relation(entity.entity(), *relation)
                }
            };
            let site = match change {
                Changed::Field(entity, _) | Changed::Relation(entity, _) => entity,
            };

            for trigger in triggers {
                let rule = rules.rule(trigger.rule);
                let path = &rule.deps[trigger.path];
                for owner in self.walk_back(site, path, trigger.hops_back) {
                    if !owner.lifecycle().mutable() {
                        continue;
                    }
                    match rule.kind {
                        RuleKind::Derive(_) => {
                            let id = (trigger.rule, ptr(&owner));
                            let queued = queue
                                .iter()
                                .any(|(_, r, o)| *r == trigger.rule && ptr(o) == id.1);
                            if !queued && !executed.contains(&id) {
                                queue.push((rule.rank, trigger.rule, owner));
                            }
                        }
                        RuleKind::Validate => {
                            if validation_seen.insert((trigger.rule, ptr(&owner))) {
                                validations.push((trigger.rule, owner));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk `hops_back` relation hops backwards from a change site to the
    /// rule owners it affects, using loaded caches and FK values. Owners not
    /// present in the session are not tracked and need no recomputation.
    fn walk_back(&self, site: &EntityRef, path: &DepPath, hops_back: usize) -> Vec<EntityRef> {
        let mut frontier = vec![Arc::clone(site)];
        for (on, rid) in path.hops[..hops_back].iter().rev() {
            let mut next: Vec<EntityRef> = Vec::new();
            for member in &frontier {
                for owner in self.owners_of(*on, *rid, member) {
                    if !next.iter().any(|o| Arc::ptr_eq(o, &owner)) {
                        next.push(owner);
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        frontier
    }

    /// Entities of type `on` whose relation `rid` contains `member`.
    fn owners_of(
        &self,
        on: relmap_core::meta::EntityId,
        rid: relmap_core::meta::RelationId,
        member: &EntityRef,
    ) -> Vec<EntityRef> {
        let registry = self.registry();
        let meta = registry.meta(on);
        let rel = meta.relation_meta(rid);
        let mut owners: Vec<EntityRef> = Vec::new();
        let mut push = |owner: EntityRef| {
            if !owners.iter().any(|o| Arc::ptr_eq(o, &owner)) {
                owners.push(owner);
            }
        };

        match rel.kind {
            // The member carries the FK back to the owner.
            RelationKind::OneToMany => {
                if let Some(remote_fk) = rel.remote_fk {
                    // Inverse cache first, FK value second.
                    if let Some(inv) = rel.inverse.on(member.entity()) {
                        for owner in self.loaded_members(member, inv) {
                            if owner.entity() == on {
                                push(owner);
                            }
                        }
                    }
                    let fk_value = member.value(remote_fk);
                    if !fk_value.is_null() {
                        if let Ok(key) =
                            crate::entity::KeyValue::from_value(member.name(), &fk_value)
                        {
                            if let Some(owner) = self.identity.get_assigned(on, &key) {
                                push(owner);
                            }
                        }
                    }
                }
            }
            // The owner carries the FK; scan tracked owners of that type.
            RelationKind::ManyToOne | RelationKind::OneToOne => {
                for owner in self.identity.of_type(on) {
                    if self
                        .loaded_members(&owner, rid)
                        .iter()
                        .any(|m| Arc::ptr_eq(m, member))
                    {
                        push(owner);
                        continue;
                    }
                    if let Some(fk) = rel.fk_field {
                        let fk_value = owner.value(fk);
                        if let Some(member_key) = UnitOfWork::<D>::assigned_value(member) {
                            let type_matches = match &rel.target {
                                RelationTarget::Single(t) => *t == member.entity(),
                                RelationTarget::Polymorphic { type_field, .. } => owner
                                    .value(*type_field)
                                    .as_str()
                                    .is_some_and(|tag| tag == member.name()),
                            };
                            if type_matches && fk_value.semantic_eq(&member_key) {
                                push(owner);
                            }
                        }
                    } else if let Some(remote_fk) = rel.remote_fk {
                        // One-to-one owned by the member side.
                        let fk_value = member.value(remote_fk);
                        if let Some(owner_key) = UnitOfWork::<D>::assigned_value(&owner) {
                            if fk_value.semantic_eq(&owner_key) {
                                push(owner);
                            }
                        }
                    }
                }
            }
            RelationKind::ManyToMany => {
                for owner in self.identity.of_type(on) {
                    if self
                        .loaded_members(&owner, rid)
                        .iter()
                        .any(|m| Arc::ptr_eq(m, member))
                    {
                        push(owner);
                    }
                }
                if let Some(link) = rel.link {
                    for op in &self.join_rows {
                        if op.link.table != link.table {
                            continue;
                        }
                        let owner = if Arc::ptr_eq(&op.local, member) {
                            Some(&op.remote)
                        } else if Arc::ptr_eq(&op.remote, member) {
                            Some(&op.local)
                        } else {
                            None
                        };
                        if let Some(owner) = owner {
                            if owner.entity() == on {
                                push(Arc::clone(owner));
                            }
                        }
                    }
                }
            }
        }
        owners
    }

    /// Ensure every relation along a dependency path is loaded, walking
    /// forward from the owner. This is where a rule's computation suspends
    /// to fetch missing state instead of erroring.
    pub(crate) async fn preload_path(
        &mut self,
        cx: &Cx,
        owner: &EntityRef,
        path: &DepPath,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        let mut frontier = vec![Arc::clone(owner)];
        for (on, rid) in &path.hops {
            let name = registry.meta(*on).relation_meta(*rid).name;
            let mut next: Vec<EntityRef> = Vec::new();
            for entity in &frontier {
                if !entity.relation_loaded(*rid) {
                    match self.load_relation(cx, entity, name).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                next.extend(self.loaded_members(entity, *rid));
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        Outcome::Ok(())
    }

    /// Run the validation phase: declarative field checks plus validation
    /// rules, over the dirty entities and everything the settle pass
    /// triggered. All failures are aggregated into one report.
    pub(crate) async fn run_validations(
        &mut self,
        cx: &Cx,
        candidates: &[EntityRef],
        triggered: Vec<(RuleId, EntityRef)>,
    ) -> Outcome<ValidationFailed, Error> {
        let registry = Arc::clone(self.registry());
        let mut report = ValidationFailed::new();

        for entity in candidates {
            check_fields(&registry, entity, &mut report);
        }

        // Validation rules: per-entity rules of every dirty entity, plus
        // rules triggered through relation paths during settlement.
        let mut pending: Vec<(RuleId, EntityRef)> = triggered;
        let mut seen: HashSet<(RuleId, usize)> = pending
            .iter()
            .map(|(rule, owner)| (*rule, ptr(owner)))
            .collect();
        for entity in candidates {
            for rule in registry.rules().validations_for(entity.entity()) {
                if seen.insert((*rule, ptr(entity))) {
                    pending.push((*rule, Arc::clone(entity)));
                }
            }
        }

        for (rule_id, owner) in pending {
            if owner.lifecycle() == Lifecycle::Deleted {
                continue;
            }
            let rule = registry.rules().rule(rule_id);
            for path in &rule.deps {
                match self.preload_path(cx, &owner, path).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            let check = rule.validate.as_ref().expect("validation rule without check");
            let view = CellView::new(Arc::clone(&registry), Arc::clone(&owner));
            match check(&view) {
                Ok(None) => {}
                Ok(Some(message)) => {
                    report.push(rule.name, owner.name(), owner.render_key(), message);
                }
                Err(e) => return Outcome::Err(e),
            }
        }

        Outcome::Ok(report)
    }
}

/// Pop the queued entry with the lowest rule rank (stable for equal ranks).
fn pop_lowest_rank(queue: &mut Vec<(usize, RuleId, EntityRef)>) -> Option<(usize, RuleId, EntityRef)> {
    if queue.is_empty() {
        return None;
    }
    let mut best = 0;
    for (i, entry) in queue.iter().enumerate() {
        if entry.0 < queue[best].0 {
            best = i;
        }
    }
    Some(queue.remove(best))
}

/// Evaluate the declarative checks of every field on one instance.
fn check_fields(registry: &Registry, entity: &EntityRef, report: &mut ValidationFailed) {
    let meta = registry.meta(entity.entity());
    let tag_value = meta.discriminator.map(|d| entity.value(d));
    let tag = tag_value.as_ref().and_then(Value::as_str);

    for (fid, field) in meta.fields_iter() {
        if !meta.field_in_variant(fid, tag) {
            continue;
        }
        let value = entity.value(fid);
        for check in &field.checks {
            match check {
                FieldCheck::Required => {
                    if value.is_null() {
                        report.push(
                            "required",
                            meta.name,
                            entity.render_key(),
                            format!("{} is required", field.name),
                        );
                    }
                }
                FieldCheck::Min(min) => {
                    if let Some(v) = value.as_f64() {
                        if v < *min {
                            report.push(
                                "min",
                                meta.name,
                                entity.render_key(),
                                format!("{} must be at least {}, got {}", field.name, min, v),
                            );
                        }
                    }
                }
                FieldCheck::Max(max) => {
                    if let Some(v) = value.as_f64() {
                        if v > *max {
                            report.push(
                                "max",
                                meta.name,
                                entity.render_key(),
                                format!("{} must be at most {}, got {}", field.name, max, v),
                            );
                        }
                    }
                }
                FieldCheck::MinLength(min) => {
                    if let Some(s) = value.as_str() {
                        let len = s.chars().count();
                        if len < *min {
                            report.push(
                                "min_length",
                                meta.name,
                                entity.render_key(),
                                format!(
                                    "{} must be at least {} characters, got {}",
                                    field.name, min, len
                                ),
                            );
                        }
                    }
                }
                FieldCheck::MaxLength(max) => {
                    if let Some(s) = value.as_str() {
                        let len = s.chars().count();
                        if len > *max {
                            report.push(
                                "max_length",
                                meta.name,
                                entity.render_key(),
                                format!(
                                    "{} must be at most {} characters, got {}",
                                    field.name, max, len
                                ),
                            );
                        }
                    }
                }
                FieldCheck::Pattern(pattern) => {
                    if let (Some(s), Some(regex)) = (value.as_str(), field.pattern.as_ref()) {
                        if !regex.is_match(s) {
                            report.push(
                                "pattern",
                                meta.name,
                                entity.render_key(),
                                format!("{} must match pattern '{}'", field.name, pattern),
                            );
                        }
                    }
                }
            }
        }
    }
}
