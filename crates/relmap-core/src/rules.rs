//! Reactive rule declarations.
//!
//! A reactive rule is a derived-field or validation computation with declared
//! upstream dependencies. Dependencies are **paths**: zero or more relation
//! hops followed by a terminal field, relative to the owning entity (e.g.
//! `"books.price"` on `Author`). Declaring dependencies up front is what lets
//! the engine preload everything a rule reads before invoking it and drive
//! recomputation to a fixed point without ever calling a rule on stale
//! inputs.
//!
//! The fixed-point engine itself lives in the session crate; this module owns
//! the declarations, their resolution against the metadata registry, the
//! trigger index (which changed field/relation affects which rule), and the
//! topological order over derive rules (cycles are rejected at build).

use crate::error::{Error, Result};
use crate::meta::{EntityId, EntityMeta, FieldId, RelationId, RelationTarget};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Index of a rule in the resolved rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub usize);

// ============================================================================
// Rule evaluation interface
// ============================================================================

/// Read-only view of an entity during rule evaluation.
///
/// Accessors are **must-be-loaded**: reading a relation that the engine has
/// not loaded fails fast with `InvalidState`. The engine preloads every
/// declared dependency path before invoking a rule, so a rule that only
/// touches its declared dependencies never sees that error.
pub trait EntityView {
    /// The entity type name.
    fn entity_name(&self) -> &'static str;

    /// Read a field by name.
    fn value(&self, field: &str) -> Result<Value>;

    /// Read a loaded to-many relation.
    fn related(&self, relation: &str) -> Result<Vec<Box<dyn EntityView + '_>>>;

    /// Read a loaded to-one relation.
    fn related_one(&self, relation: &str) -> Result<Option<Box<dyn EntityView + '_>>>;
}

/// Compute function of a derive rule: returns the new value for the owner's
/// derived field.
pub type DeriveFn = Arc<dyn Fn(&dyn EntityView) -> Result<Value> + Send + Sync>;

/// Compute function of a validation rule: `None` means the rule holds,
/// `Some(message)` is a violation.
pub type ValidateFn = Arc<dyn Fn(&dyn EntityView) -> Result<Option<String>> + Send + Sync>;

// ============================================================================
// Authoring definitions
// ============================================================================

/// A dependency path: relation hops then a terminal field, relative to the
/// rule's owning entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePath {
    /// Relation hops, outermost first.
    pub hops: Vec<&'static str>,
    /// Terminal field on the entity the hops lead to.
    pub field: &'static str,
}

impl RulePath {
    /// A path to a field on the owning entity itself.
    pub fn field(field: &'static str) -> Self {
        Self {
            hops: Vec::new(),
            field,
        }
    }

    /// Parse a dotted path: the last segment is the field, everything before
    /// it is a relation hop (`"books.price"`, `"author.name"`).
    pub fn parse(path: &'static str) -> Self {
        let mut parts: Vec<&'static str> = path.split('.').filter(|p| !p.is_empty()).collect();
        let field = parts.pop().unwrap_or("");
        Self { hops: parts, field }
    }
}

/// What a rule computes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKindDef {
    /// Writes a persisted derived field on the owner.
    Derive {
        /// The owner field the rule assigns.
        field: &'static str,
    },
    /// Checks an invariant; violations are aggregated at flush.
    Validate,
}

/// Authoring definition of a reactive rule.
#[derive(Clone)]
pub struct RuleDef {
    /// Owning entity name.
    pub entity: &'static str,
    /// Rule name, used in violation reports and logs.
    pub name: &'static str,
    /// What the rule computes.
    pub kind: RuleKindDef,
    /// Declared dependency paths.
    pub deps: Vec<RulePath>,
    /// Derive compute function (required for `Derive`).
    pub derive: Option<DeriveFn>,
    /// Validation function (required for `Validate`).
    pub validate: Option<ValidateFn>,
}

impl RuleDef {
    /// Create a derive rule.
    pub fn derive(
        entity: &'static str,
        name: &'static str,
        field: &'static str,
        deps: Vec<RulePath>,
        compute: impl Fn(&dyn EntityView) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            entity,
            name,
            kind: RuleKindDef::Derive { field },
            deps,
            derive: Some(Arc::new(compute)),
            validate: None,
        }
    }

    /// Create a validation rule.
    pub fn validate(
        entity: &'static str,
        name: &'static str,
        deps: Vec<RulePath>,
        check: impl Fn(&dyn EntityView) -> Result<Option<String>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            entity,
            name,
            kind: RuleKindDef::Validate,
            deps,
            derive: None,
            validate: Some(Arc::new(check)),
        }
    }
}

impl std::fmt::Debug for RuleDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleDef")
            .field("entity", &self.entity)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Resolved rules
// ============================================================================

/// A resolved dependency path.
#[derive(Debug, Clone)]
pub struct DepPath {
    /// Relation hops: (entity the hop is declared on, relation id).
    pub hops: Vec<(EntityId, RelationId)>,
    /// Entity type the path terminates on.
    pub terminal: EntityId,
    /// Terminal field.
    pub field: FieldId,
}

/// What a resolved rule computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Writes this owner field.
    Derive(FieldId),
    /// Checks an invariant.
    Validate,
}

/// A resolved reactive rule.
pub struct RuleMeta {
    /// Dense id.
    pub id: RuleId,
    /// Rule name.
    pub name: &'static str,
    /// Owning entity.
    pub entity: EntityId,
    /// What the rule computes.
    pub kind: RuleKind,
    /// Resolved dependency paths.
    pub deps: Vec<DepPath>,
    /// Topological rank among derive rules (validations all rank last).
    pub rank: usize,
    /// Derive compute function.
    pub derive: Option<DeriveFn>,
    /// Validation function.
    pub validate: Option<ValidateFn>,
}

impl std::fmt::Debug for RuleMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleMeta")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entity", &self.entity)
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// One entry in the trigger index: a change intersecting `rule`'s dependency
/// path `path` at a point `hops_back` relation hops away from the owner.
///
/// `hops_back == deps[path].hops.len()` means the terminal field changed; a
/// smaller value means relation membership changed at that hop. The engine
/// walks that many hops backwards from the change site to find the affected
/// owner instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleTrigger {
    /// The affected rule.
    pub rule: RuleId,
    /// Index into the rule's `deps`.
    pub path: usize,
    /// How many hops to walk backwards from the change site to the owner.
    pub hops_back: usize,
}

/// The resolved rule set: rules plus the trigger index.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RuleMeta>,
    /// (entity, field) -> triggers whose terminal field this is.
    field_triggers: HashMap<(EntityId, FieldId), Vec<RuleTrigger>>,
    /// (entity, relation) -> triggers whose path traverses this relation.
    relation_triggers: HashMap<(EntityId, RelationId), Vec<RuleTrigger>>,
    /// Validation rules per entity.
    validations: HashMap<EntityId, Vec<RuleId>>,
}

impl RuleSet {
    /// Resolve rule definitions against resolved entity metadata.
    pub fn build(entities: &[EntityMeta], defs: Vec<RuleDef>) -> Result<RuleSet> {
        let by_name: HashMap<&'static str, EntityId> =
            entities.iter().map(|e| (e.name, e.id)).collect();

        let mut rules: Vec<RuleMeta> = Vec::with_capacity(defs.len());
        for (i, def) in defs.into_iter().enumerate() {
            let owner = *by_name
                .get(def.entity)
                .ok_or_else(|| Error::Metadata(format!("rule {} on unknown entity {}", def.name, def.entity)))?;

            let kind = match def.kind {
                RuleKindDef::Derive { field } => {
                    if def.derive.is_none() {
                        return Err(Error::Metadata(format!(
                            "derive rule {} has no compute function",
                            def.name
                        )));
                    }
                    RuleKind::Derive(entities[owner.0].field_or_err(field)?)
                }
                RuleKindDef::Validate => {
                    if def.validate.is_none() {
                        return Err(Error::Metadata(format!(
                            "validation rule {} has no check function",
                            def.name
                        )));
                    }
                    RuleKind::Validate
                }
            };

            let mut deps = Vec::with_capacity(def.deps.len());
            for path in &def.deps {
                deps.push(resolve_path(entities, owner, path, def.name)?);
            }

            rules.push(RuleMeta {
                id: RuleId(i),
                name: def.name,
                entity: owner,
                kind,
                deps,
                rank: 0,
                derive: def.derive,
                validate: def.validate,
            });
        }

        assign_ranks(&mut rules)?;

        let mut field_triggers: HashMap<(EntityId, FieldId), Vec<RuleTrigger>> = HashMap::new();
        let mut relation_triggers: HashMap<(EntityId, RelationId), Vec<RuleTrigger>> =
            HashMap::new();
        let mut validations: HashMap<EntityId, Vec<RuleId>> = HashMap::new();

        for rule in &rules {
            if rule.kind == RuleKind::Validate {
                validations.entry(rule.entity).or_default().push(rule.id);
            }
            for (pi, path) in rule.deps.iter().enumerate() {
                field_triggers
                    .entry((path.terminal, path.field))
                    .or_default()
                    .push(RuleTrigger {
                        rule: rule.id,
                        path: pi,
                        hops_back: path.hops.len(),
                    });
                for (hi, (on, relation)) in path.hops.iter().enumerate() {
                    relation_triggers
                        .entry((*on, *relation))
                        .or_default()
                        .push(RuleTrigger {
                            rule: rule.id,
                            path: pi,
                            hops_back: hi,
                        });
                }
            }
        }

        Ok(RuleSet {
            rules,
            field_triggers,
            relation_triggers,
            validations,
        })
    }

    /// All rules.
    pub fn rules(&self) -> &[RuleMeta] {
        &self.rules
    }

    /// Rule by id.
    pub fn rule(&self, id: RuleId) -> &RuleMeta {
        &self.rules[id.0]
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Triggers fired by a change to (entity, field).
    pub fn triggers_for_field(&self, entity: EntityId, field: FieldId) -> &[RuleTrigger] {
        self.field_triggers
            .get(&(entity, field))
            .map_or(&[], Vec::as_slice)
    }

    /// Triggers fired by a membership change on (entity, relation).
    pub fn triggers_for_relation(&self, entity: EntityId, relation: RelationId) -> &[RuleTrigger] {
        self.relation_triggers
            .get(&(entity, relation))
            .map_or(&[], Vec::as_slice)
    }

    /// Validation rules declared on an entity type.
    pub fn validations_for(&self, entity: EntityId) -> &[RuleId] {
        self.validations.get(&entity).map_or(&[], Vec::as_slice)
    }
}

fn resolve_path(
    entities: &[EntityMeta],
    owner: EntityId,
    path: &RulePath,
    rule: &'static str,
) -> Result<DepPath> {
    let mut at = owner;
    let mut hops = Vec::with_capacity(path.hops.len());
    for hop in &path.hops {
        let meta = &entities[at.0];
        let rid = meta.relation(hop).ok_or_else(|| {
            Error::Metadata(format!(
                "rule {}: unknown relation {}.{} in dependency path",
                rule, meta.name, hop
            ))
        })?;
        let rel = meta.relation_meta(rid);
        let next = match &rel.target {
            RelationTarget::Single(t) => *t,
            RelationTarget::Polymorphic { .. } => {
                return Err(Error::Metadata(format!(
                    "rule {}: dependency path cannot traverse polymorphic relation {}.{}",
                    rule, meta.name, hop
                )));
            }
        };
        hops.push((at, rid));
        at = next;
    }
    let field = entities[at.0].field_or_err(path.field)?;
    Ok(DepPath {
        hops,
        terminal: at,
        field,
    })
}

/// Topological ranks over derive rules: rule A precedes rule B when B depends
/// on the field A derives. Cycles are a metadata error.
fn assign_ranks(rules: &mut [RuleMeta]) -> Result<()> {
    let n = rules.len();
    // produced[(entity, field)] = rule index
    let mut produced: HashMap<(EntityId, FieldId), usize> = HashMap::new();
    for (i, rule) in rules.iter().enumerate() {
        if let RuleKind::Derive(field) = rule.kind {
            if let Some(prev) = produced.insert((rule.entity, field), i) {
                return Err(Error::Metadata(format!(
                    "rules {} and {} both derive the same field",
                    rules[prev].name, rule.name
                )));
            }
        }
    }

    // deps_on[b] = derive rules whose output b reads.
    let mut deps_on: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, rule) in rules.iter().enumerate() {
        for path in &rule.deps {
            if let Some(&producer) = produced.get(&(path.terminal, path.field)) {
                if producer != i {
                    deps_on[i].push(producer);
                }
            }
        }
    }

    let mut rank = vec![usize::MAX; n];
    let mut assigned = 0usize;
    let mut current = 0usize;
    while assigned < n {
        let ready: Vec<usize> = (0..n)
            .filter(|&i| {
                rank[i] == usize::MAX && deps_on[i].iter().all(|&d| rank[d] != usize::MAX)
            })
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| rank[i] == usize::MAX)
                .map(|i| rules[i].name)
                .collect();
            return Err(Error::Metadata(format!(
                "reactive rule dependency cycle among: {}",
                stuck.join(", ")
            )));
        }
        for i in ready {
            rank[i] = current;
            assigned += 1;
        }
        current += 1;
    }

    for (i, rule) in rules.iter_mut().enumerate() {
        rule.rank = rank[i];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{EntityDef, FieldDef, Registry, RelationDef, RelationKind, SqlType};

    fn defs() -> Vec<EntityDef> {
        vec![
            EntityDef::new("Author", "authors", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("name", SqlType::Text))
                .field(FieldDef::new("book_count", SqlType::Integer).nullable())
                .relation(
                    RelationDef::new("books", RelationKind::OneToMany, "Book")
                        .remote_fk("author_id")
                        .inverse("author"),
                ),
            EntityDef::new("Book", "books", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("title", SqlType::Text))
                .field(FieldDef::new("author_id", SqlType::BigInt).nullable())
                .relation(
                    RelationDef::new("author", RelationKind::ManyToOne, "Author")
                        .fk_field("author_id")
                        .inverse("books"),
                ),
        ]
    }

    #[test]
    fn parse_dotted_paths() {
        let p = RulePath::parse("books.price");
        assert_eq!(p.hops, vec!["books"]);
        assert_eq!(p.field, "price");

        let p = RulePath::parse("name");
        assert!(p.hops.is_empty());
        assert_eq!(p.field, "name");
    }

    #[test]
    fn path_resolution_walks_relations() {
        let rules = vec![RuleDef::derive(
            "Author",
            "book_count",
            "book_count",
            vec![RulePath::parse("books.title")],
            |view| Ok(Value::Int(view.related("books")?.len() as i32)),
        )];
        let registry = Registry::build(defs(), rules).unwrap();
        let rule = &registry.rules().rules()[0];
        assert_eq!(rule.deps.len(), 1);
        let path = &rule.deps[0];
        assert_eq!(path.hops.len(), 1);
        assert_eq!(path.terminal, registry.entity("Book").unwrap());
    }

    #[test]
    fn trigger_index_covers_fields_and_relations() {
        let rules = vec![RuleDef::derive(
            "Author",
            "book_count",
            "book_count",
            vec![RulePath::parse("books.title")],
            |view| Ok(Value::Int(view.related("books")?.len() as i32)),
        )];
        let registry = Registry::build(defs(), rules).unwrap();
        let author = registry.entity("Author").unwrap();
        let book = registry.entity("Book").unwrap();
        let book_meta = registry.meta(book);
        let title = book_meta.field("title").unwrap();

        let field_triggers = registry.rules().triggers_for_field(book, title);
        assert_eq!(field_triggers.len(), 1);
        assert_eq!(field_triggers[0].hops_back, 1);

        let author_meta = registry.meta(author);
        let books_rel = author_meta.relation("books").unwrap();
        let rel_triggers = registry.rules().triggers_for_relation(author, books_rel);
        assert_eq!(rel_triggers.len(), 1);
        assert_eq!(rel_triggers[0].hops_back, 0);
    }

    #[test]
    fn chained_derives_rank_in_dependency_order() {
        // b depends on a, c depends on b.
        let mk = |name: &'static str, field: &'static str, dep: &'static str| {
            RuleDef::derive("Book", name, field, vec![RulePath::field(dep)], |view| {
                view.value("title")
            })
        };
        let defs = vec![
            EntityDef::new("Book", "books", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("title", SqlType::Text))
                .field(FieldDef::new("a", SqlType::Text).nullable())
                .field(FieldDef::new("b", SqlType::Text).nullable())
                .field(FieldDef::new("c", SqlType::Text).nullable()),
        ];
        let rules = vec![
            mk("calc_c", "c", "b"),
            mk("calc_b", "b", "a"),
            mk("calc_a", "a", "title"),
        ];
        let registry = Registry::build(defs, rules).unwrap();
        let ranks: HashMap<&str, usize> = registry
            .rules()
            .rules()
            .iter()
            .map(|r| (r.name, r.rank))
            .collect();
        assert!(ranks["calc_a"] < ranks["calc_b"]);
        assert!(ranks["calc_b"] < ranks["calc_c"]);
    }

    #[test]
    fn dependency_cycle_rejected() {
        let defs = vec![
            EntityDef::new("Book", "books", "id")
                .field(FieldDef::new("id", SqlType::BigInt))
                .field(FieldDef::new("a", SqlType::Text).nullable())
                .field(FieldDef::new("b", SqlType::Text).nullable()),
        ];
        let rules = vec![
            RuleDef::derive("Book", "calc_a", "a", vec![RulePath::field("b")], |v| {
                v.value("b")
            }),
            RuleDef::derive("Book", "calc_b", "b", vec![RulePath::field("a")], |v| {
                v.value("a")
            }),
        ];
        let err = Registry::build(defs, rules).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validations_indexed_per_entity() {
        let rules = vec![RuleDef::validate(
            "Book",
            "title_required",
            vec![RulePath::field("title")],
            |view| {
                let title = view.value("title")?;
                Ok(match title.as_str() {
                    Some(t) if !t.is_empty() => None,
                    _ => Some("title must not be empty".to_string()),
                })
            },
        )];
        let registry = Registry::build(defs(), rules).unwrap();
        let book = registry.entity("Book").unwrap();
        assert_eq!(registry.rules().validations_for(book).len(), 1);
        let author = registry.entity("Author").unwrap();
        assert!(registry.rules().validations_for(author).is_empty());
    }
}
