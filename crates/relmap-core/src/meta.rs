//! Entity metadata registry.
//!
//! Metadata is supplied once at process start by the metadata source and is
//! immutable afterwards: entity definitions (fields, key, optional version
//! column, subtype variants) and relation definitions (kind, target, foreign
//! keys, inverse pairing, cascade ownership). `Registry::build` resolves the
//! authoring definitions into dense ids so that all hot-path access is by
//! index, never by string lookup.
//!
//! # Example
//!
//! ```ignore
//! let registry = Registry::build(
//!     vec![
//!         EntityDef::new("Author", "authors", "id")
//!             .field(FieldDef::new("id", SqlType::BigInt))
//!             .field(FieldDef::new("name", SqlType::Text).check(FieldCheck::Required))
//!             .relation(
//!                 RelationDef::new("books", RelationKind::OneToMany, "Book")
//!                     .remote_fk("author_id")
//!                     .inverse("author")
//!                     .owns(),
//!             ),
//!         EntityDef::new("Book", "books", "id")
//!             .field(FieldDef::new("id", SqlType::BigInt))
//!             .field(FieldDef::new("title", SqlType::Text))
//!             .field(FieldDef::new("author_id", SqlType::BigInt).nullable())
//!             .relation(
//!                 RelationDef::new("author", RelationKind::ManyToOne, "Author")
//!                     .fk_field("author_id")
//!                     .inverse("books"),
//!             ),
//!     ],
//!     vec![],
//! )?;
//! ```

use crate::error::{Error, Result};
use crate::rules::{RuleDef, RuleSet};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// Dense identifiers
// ============================================================================

/// Index of an entity type in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub usize);

/// Index of a field within its entity's field list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub usize);

/// Index of a relation within its entity's relation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(pub usize);

// ============================================================================
// SQL types and field checks
// ============================================================================

/// SQL data types supported by relmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Boolean,
    Text,
    Blob,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
}

impl SqlType {
    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Real
                | SqlType::Double
                | SqlType::Decimal
        )
    }

    /// Check if this type is a date/time type.
    pub const fn is_temporal(&self) -> bool {
        matches!(
            self,
            SqlType::Date | SqlType::Time | SqlType::Timestamp | SqlType::TimestampTz
        )
    }
}

/// A declarative check on a field, evaluated during the validation phase of
/// a flush and aggregated with rule violations.
#[derive(Debug, Clone)]
pub enum FieldCheck {
    /// Value must not be NULL.
    Required,
    /// Numeric value must be at least this.
    Min(f64),
    /// Numeric value must be at most this.
    Max(f64),
    /// String must be at least this many characters.
    MinLength(usize),
    /// String must be at most this many characters.
    MaxLength(usize),
    /// String must match this regex (compiled at registry build).
    Pattern(&'static str),
}

/// Where primary keys for an entity come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// The INSERT itself yields the key (RETURNING / last-insert-id).
    Driver,
    /// Keys are pre-allocatable from a named sequence; required for entity
    /// types that participate in a required-foreign-key cycle, since their
    /// keys must exist before any row is inserted.
    Sequence(&'static str),
}

// ============================================================================
// Authoring definitions
// ============================================================================

/// Definition of a single field (authoring form).
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name as used in code.
    pub name: &'static str,
    /// Column name; defaults to the field name.
    pub column: &'static str,
    /// SQL type.
    pub sql_type: SqlType,
    /// Whether NULL is a legal stored value.
    pub nullable: bool,
    /// Declarative checks.
    pub checks: Vec<FieldCheck>,
    /// Variant tags this field belongs to; empty means base field.
    pub variants: Vec<&'static str>,
}

impl FieldDef {
    /// Create a new field definition.
    pub fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column: name,
            sql_type,
            nullable: false,
            checks: Vec::new(),
            variants: Vec::new(),
        }
    }

    /// Override the column name.
    #[must_use]
    pub fn column(mut self, column: &'static str) -> Self {
        self.column = column;
        self
    }

    /// Mark the field nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Add a declarative check.
    #[must_use]
    pub fn check(mut self, check: FieldCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// Restrict the field to a subtype variant.
    #[must_use]
    pub fn variant(mut self, tag: &'static str) -> Self {
        self.variants.push(tag);
        self
    }
}

/// The kind of relationship between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Many rows of this entity point at one target row.
    ManyToOne,
    /// One row of this entity is pointed at by many target rows.
    OneToMany,
    /// Exactly one row on each side; the side carrying `fk_field` owns the
    /// column.
    OneToOne,
    /// Both sides are collections, joined through a link table.
    ManyToMany,
}

/// Link table description for many-to-many relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableDef {
    /// The link table name (e.g. `"book_tags"`).
    pub table: &'static str,
    /// Column pointing at the local entity (e.g. `"book_id"`).
    pub local_column: &'static str,
    /// Column pointing at the remote entity (e.g. `"tag_id"`).
    pub remote_column: &'static str,
}

impl LinkTableDef {
    /// Create a new link table definition.
    pub const fn new(
        table: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table,
            local_column,
            remote_column,
        }
    }
}

/// Target of a relation (authoring form).
#[derive(Debug, Clone)]
pub enum RelationTargetDef {
    /// A single entity type.
    Entity(&'static str),
    /// Polymorphic to-one: a discriminator field stores the target entity
    /// name, the key field stores the target key.
    Polymorphic {
        /// Field on the owning entity holding the target entity name.
        type_field: &'static str,
        /// The entity types a row may point at.
        targets: Vec<&'static str>,
    },
}

/// Definition of a relation (authoring form).
#[derive(Debug, Clone)]
pub struct RelationDef {
    /// Relation name as used in code.
    pub name: &'static str,
    /// Kind of relation.
    pub kind: RelationKind,
    /// Target entity (or polymorphic target set).
    pub target: RelationTargetDef,
    /// FK field on this entity (ManyToOne, owning OneToOne, polymorphic).
    pub fk_field: Option<&'static str>,
    /// FK field on the target entity (OneToMany, inverse OneToOne).
    pub remote_fk: Option<&'static str>,
    /// Link table (ManyToMany only).
    pub link: Option<LinkTableDef>,
    /// Name of the inverse relation declared on the target.
    pub inverse: Option<&'static str>,
    /// Cascade-owned: deleting the owner deletes the related rows.
    pub owns: bool,
    /// Default ordering field for to-many collections.
    pub order_by: Option<&'static str>,
}

impl RelationDef {
    /// Create a relation targeting a single entity type.
    pub fn new(name: &'static str, kind: RelationKind, target: &'static str) -> Self {
        Self {
            name,
            kind,
            target: RelationTargetDef::Entity(target),
            fk_field: None,
            remote_fk: None,
            link: None,
            inverse: None,
            owns: false,
            order_by: None,
        }
    }

    /// Create a polymorphic to-one relation.
    pub fn polymorphic(
        name: &'static str,
        type_field: &'static str,
        targets: Vec<&'static str>,
    ) -> Self {
        Self {
            name,
            kind: RelationKind::ManyToOne,
            target: RelationTargetDef::Polymorphic {
                type_field,
                targets,
            },
            fk_field: None,
            remote_fk: None,
            link: None,
            inverse: None,
            owns: false,
            order_by: None,
        }
    }

    /// Set the local FK field.
    #[must_use]
    pub fn fk_field(mut self, field: &'static str) -> Self {
        self.fk_field = Some(field);
        self
    }

    /// Set the FK field on the target entity.
    #[must_use]
    pub fn remote_fk(mut self, field: &'static str) -> Self {
        self.remote_fk = Some(field);
        self
    }

    /// Set the link table (ManyToMany).
    #[must_use]
    pub fn link(mut self, link: LinkTableDef) -> Self {
        self.link = Some(link);
        self
    }

    /// Declare the inverse relation name on the target.
    #[must_use]
    pub fn inverse(mut self, name: &'static str) -> Self {
        self.inverse = Some(name);
        self
    }

    /// Mark the relation cascade-owned.
    #[must_use]
    pub fn owns(mut self) -> Self {
        self.owns = true;
        self
    }

    /// Set the default ordering field for the collection.
    #[must_use]
    pub fn order_by(mut self, field: &'static str) -> Self {
        self.order_by = Some(field);
        self
    }
}

/// A subtype variant for tagged single-table inheritance.
#[derive(Debug, Clone)]
pub struct VariantDef {
    /// Discriminator value selecting this variant.
    pub tag: &'static str,
}

/// Definition of an entity type (authoring form).
#[derive(Debug, Clone)]
pub struct EntityDef {
    /// Entity name (e.g. `"Author"`).
    pub name: &'static str,
    /// Table name (e.g. `"authors"`).
    pub table: &'static str,
    /// Primary key field name.
    pub key: &'static str,
    /// Key source.
    pub key_source: KeySource,
    /// Optional optimistic-lock version field name.
    pub version: Option<&'static str>,
    /// Optional subtype discriminator field name.
    pub discriminator: Option<&'static str>,
    /// Subtype variants (tags).
    pub variants: Vec<VariantDef>,
    /// Fields.
    pub fields: Vec<FieldDef>,
    /// Relations.
    pub relations: Vec<RelationDef>,
}

impl EntityDef {
    /// Create a new entity definition.
    pub fn new(name: &'static str, table: &'static str, key: &'static str) -> Self {
        Self {
            name,
            table,
            key,
            key_source: KeySource::Driver,
            version: None,
            discriminator: None,
            variants: Vec::new(),
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Set the key source.
    #[must_use]
    pub fn key_source(mut self, source: KeySource) -> Self {
        self.key_source = source;
        self
    }

    /// Declare the optimistic-lock version field.
    #[must_use]
    pub fn version(mut self, field: &'static str) -> Self {
        self.version = Some(field);
        self
    }

    /// Declare a subtype discriminator and its variants.
    #[must_use]
    pub fn discriminator(mut self, field: &'static str, tags: &[&'static str]) -> Self {
        self.discriminator = Some(field);
        self.variants = tags.iter().map(|t| VariantDef { tag: t }).collect();
        self
    }

    /// Add a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a relation.
    #[must_use]
    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }
}

// ============================================================================
// Resolved metadata
// ============================================================================

/// Resolved field metadata.
#[derive(Debug)]
pub struct FieldMeta {
    /// Field name.
    pub name: &'static str,
    /// Column name.
    pub column: &'static str,
    /// SQL type.
    pub sql_type: SqlType,
    /// Whether NULL is a legal stored value.
    pub nullable: bool,
    /// Declarative checks.
    pub checks: Vec<FieldCheck>,
    /// Compiled pattern, if a `Pattern` check is declared.
    pub pattern: Option<regex::Regex>,
    /// Variant tags this field belongs to; empty means base field.
    pub variants: Vec<&'static str>,
}

/// Resolved relation target.
#[derive(Debug, Clone)]
pub enum RelationTarget {
    /// A single entity type.
    Single(EntityId),
    /// Polymorphic to-one.
    Polymorphic {
        /// Discriminator field on the owner, storing the target entity name.
        type_field: FieldId,
        /// Entity-name -> entity id for all permitted targets.
        targets: Vec<EntityId>,
    },
}

impl RelationTarget {
    /// All entity types this relation may point at.
    pub fn candidates(&self) -> Vec<EntityId> {
        match self {
            RelationTarget::Single(id) => vec![*id],
            RelationTarget::Polymorphic { targets, .. } => targets.clone(),
        }
    }
}

/// How the inverse side of a relation is reached.
#[derive(Debug, Clone)]
pub enum InverseLink {
    /// No inverse declared.
    None,
    /// Inverse relation on the single target type.
    Single(RelationId),
    /// Polymorphic: inverse relation per target type.
    PerTarget(Vec<(EntityId, RelationId)>),
}

impl InverseLink {
    /// Look up the inverse relation on a specific target type.
    pub fn on(&self, target: EntityId) -> Option<RelationId> {
        match self {
            InverseLink::None => None,
            InverseLink::Single(rel) => Some(*rel),
            InverseLink::PerTarget(pairs) => {
                pairs.iter().find(|(e, _)| *e == target).map(|(_, r)| *r)
            }
        }
    }
}

/// Resolved relation metadata.
#[derive(Debug)]
pub struct RelationMeta {
    /// Relation name.
    pub name: &'static str,
    /// Kind of relation.
    pub kind: RelationKind,
    /// Resolved target.
    pub target: RelationTarget,
    /// FK field on this entity (ManyToOne, owning OneToOne, polymorphic).
    pub fk_field: Option<FieldId>,
    /// FK field on the (single) target entity (OneToMany, inverse OneToOne).
    pub remote_fk: Option<FieldId>,
    /// Link table (ManyToMany).
    pub link: Option<LinkTableDef>,
    /// Inverse side.
    pub inverse: InverseLink,
    /// Cascade-owned.
    pub owns: bool,
    /// Default ordering field on the target.
    pub order_by: Option<FieldId>,
}

impl RelationMeta {
    /// Is this a to-many relation?
    pub const fn is_many(&self) -> bool {
        matches!(self.kind, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// A resolved subtype variant.
#[derive(Debug)]
pub struct VariantMeta {
    /// Discriminator value.
    pub tag: &'static str,
    /// Fields specific to this variant.
    pub fields: HashSet<FieldId>,
}

/// Resolved metadata for one entity type.
#[derive(Debug)]
pub struct EntityMeta {
    /// Dense id.
    pub id: EntityId,
    /// Entity name.
    pub name: &'static str,
    /// Table name.
    pub table: &'static str,
    /// Fields, indexed by `FieldId`.
    pub fields: Vec<FieldMeta>,
    /// Relations, indexed by `RelationId`.
    pub relations: Vec<RelationMeta>,
    /// Primary key field.
    pub key: FieldId,
    /// Key source.
    pub key_source: KeySource,
    /// Optimistic-lock version field.
    pub version: Option<FieldId>,
    /// Subtype discriminator field.
    pub discriminator: Option<FieldId>,
    /// Subtype variants.
    pub variants: Vec<VariantMeta>,
    /// Topological rank for insert ordering over required FKs (parents rank
    /// lower).
    pub insert_rank: usize,
    /// Topological rank for delete ordering over *all* FK edges, nullable
    /// included: a referencing type always ranks higher than its referent,
    /// so child-first deletion is a descending sort.
    pub delete_rank: usize,
    /// True when this type is part of a required-FK cycle and relies on
    /// up-front key assignment.
    pub cyclic_inserts: bool,
    field_index: HashMap<&'static str, FieldId>,
    relation_index: HashMap<&'static str, RelationId>,
}

impl EntityMeta {
    /// Resolve a field name.
    pub fn field(&self, name: &str) -> Option<FieldId> {
        self.field_index.get(name).copied()
    }

    /// Resolve a field name, erroring with context.
    pub fn field_or_err(&self, name: &str) -> Result<FieldId> {
        self.field(name)
            .ok_or_else(|| Error::Metadata(format!("unknown field {}.{}", self.name, name)))
    }

    /// Field metadata by id.
    pub fn field_meta(&self, id: FieldId) -> &FieldMeta {
        &self.fields[id.0]
    }

    /// Resolve a relation name.
    pub fn relation(&self, name: &str) -> Option<RelationId> {
        self.relation_index.get(name).copied()
    }

    /// Resolve a relation name, erroring with context.
    pub fn relation_or_err(&self, name: &str) -> Result<RelationId> {
        self.relation(name)
            .ok_or_else(|| Error::Metadata(format!("unknown relation {}.{}", self.name, name)))
    }

    /// Relation metadata by id.
    pub fn relation_meta(&self, id: RelationId) -> &RelationMeta {
        &self.relations[id.0]
    }

    /// Iterate fields with their ids.
    pub fn fields_iter(&self) -> impl Iterator<Item = (FieldId, &FieldMeta)> {
        self.fields.iter().enumerate().map(|(i, f)| (FieldId(i), f))
    }

    /// Iterate relations with their ids.
    pub fn relations_iter(&self) -> impl Iterator<Item = (RelationId, &RelationMeta)> {
        self.relations
            .iter()
            .enumerate()
            .map(|(i, r)| (RelationId(i), r))
    }

    /// Is `field` accessible when the discriminator holds `tag`?
    ///
    /// Base fields are always accessible; variant fields only when their
    /// variant is active.
    pub fn field_in_variant(&self, field: FieldId, tag: Option<&str>) -> bool {
        let meta = self.field_meta(field);
        if meta.variants.is_empty() {
            return true;
        }
        match tag {
            Some(tag) => meta.variants.contains(&tag),
            None => false,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The process-wide entity metadata registry. Immutable after build.
#[derive(Debug)]
pub struct Registry {
    entities: Vec<EntityMeta>,
    by_name: HashMap<&'static str, EntityId>,
    rules: RuleSet,
}

impl Registry {
    /// Build a registry from authoring definitions.
    ///
    /// Resolves names to dense ids, validates inverse pairing, compiles
    /// pattern checks, computes insert topology ranks, and resolves reactive
    /// rules (rejecting dependency cycles).
    pub fn build(defs: Vec<EntityDef>, rules: Vec<RuleDef>) -> Result<Arc<Registry>> {
        let mut by_name: HashMap<&'static str, EntityId> = HashMap::new();
        for (i, def) in defs.iter().enumerate() {
            if by_name.insert(def.name, EntityId(i)).is_some() {
                return Err(Error::Metadata(format!("duplicate entity {}", def.name)));
            }
        }

        // Pass 1: fields, key/version/discriminator resolution.
        let mut entities: Vec<EntityMeta> = Vec::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            entities.push(resolve_entity_fields(EntityId(i), def)?);
        }

        // Pass 2: relations (needs every entity's field index available).
        for (i, def) in defs.iter().enumerate() {
            let relations = resolve_relations(def, &entities, &by_name)?;
            let relation_index = relations
                .iter()
                .enumerate()
                .map(|(j, r)| (r.name, RelationId(j)))
                .collect();
            entities[i].relations = relations;
            entities[i].relation_index = relation_index;
        }

        // Pass 3: inverse pairing resolution and validation.
        resolve_inverses(&mut entities, &defs)?;

        // Pass 4: insert topology over required FKs.
        compute_insert_ranks(&mut entities)?;

        // Pass 5: reactive rules.
        let rules = RuleSet::build(&entities, rules)?;

        Ok(Arc::new(Registry {
            entities,
            by_name,
            rules,
        }))
    }

    /// Resolve an entity name.
    pub fn entity(&self, name: &str) -> Result<EntityId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::Metadata(format!("unknown entity {}", name)))
    }

    /// Entity metadata by id.
    pub fn meta(&self, id: EntityId) -> &EntityMeta {
        &self.entities[id.0]
    }

    /// All entities.
    pub fn entities(&self) -> &[EntityMeta] {
        &self.entities
    }

    /// The resolved reactive rule set.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

fn resolve_entity_fields(id: EntityId, def: &EntityDef) -> Result<EntityMeta> {
    let mut field_index: HashMap<&'static str, FieldId> = HashMap::new();
    let mut fields: Vec<FieldMeta> = Vec::with_capacity(def.fields.len());

    for (i, fd) in def.fields.iter().enumerate() {
        if field_index.insert(fd.name, FieldId(i)).is_some() {
            return Err(Error::Metadata(format!(
                "duplicate field {}.{}",
                def.name, fd.name
            )));
        }
        let pattern = fd
            .checks
            .iter()
            .find_map(|c| match c {
                FieldCheck::Pattern(p) => Some(*p),
                _ => None,
            })
            .map(|p| {
                regex::Regex::new(p).map_err(|e| {
                    Error::Metadata(format!("bad pattern on {}.{}: {}", def.name, fd.name, e))
                })
            })
            .transpose()?;
        fields.push(FieldMeta {
            name: fd.name,
            column: fd.column,
            sql_type: fd.sql_type.clone(),
            nullable: fd.nullable,
            checks: fd.checks.clone(),
            pattern,
            variants: fd.variants.clone(),
        });
    }

    let lookup = |name: &'static str| -> Result<FieldId> {
        field_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::Metadata(format!("unknown field {}.{}", def.name, name)))
    };

    let key = lookup(def.key)?;
    let version = def.version.map(lookup).transpose()?;
    let discriminator = def.discriminator.map(lookup).transpose()?;

    let known_tags: HashSet<&'static str> = def.variants.iter().map(|v| v.tag).collect();
    for fd in &def.fields {
        for tag in &fd.variants {
            if !known_tags.contains(tag) {
                return Err(Error::Metadata(format!(
                    "field {}.{} names undeclared variant {}",
                    def.name, fd.name, tag
                )));
            }
        }
    }
    let variants = def
        .variants
        .iter()
        .map(|v| VariantMeta {
            tag: v.tag,
            fields: fields
                .iter()
                .enumerate()
                .filter(|(_, f)| f.variants.contains(&v.tag))
                .map(|(i, _)| FieldId(i))
                .collect(),
        })
        .collect();

    Ok(EntityMeta {
        id,
        name: def.name,
        table: def.table,
        fields,
        relations: Vec::new(),
        key,
        key_source: def.key_source,
        version,
        discriminator,
        variants,
        insert_rank: 0,
        delete_rank: 0,
        cyclic_inserts: false,
        field_index,
        relation_index: HashMap::new(),
    })
}

fn resolve_relations(
    def: &EntityDef,
    entities: &[EntityMeta],
    by_name: &HashMap<&'static str, EntityId>,
) -> Result<Vec<RelationMeta>> {
    let me = by_name[def.name];
    let mut seen: HashSet<&'static str> = HashSet::new();
    let mut out = Vec::with_capacity(def.relations.len());

    for rd in &def.relations {
        if !seen.insert(rd.name) {
            return Err(Error::Metadata(format!(
                "duplicate relation {}.{}",
                def.name, rd.name
            )));
        }

        let target = match &rd.target {
            RelationTargetDef::Entity(name) => {
                let id = by_name.get(name).copied().ok_or_else(|| {
                    Error::Metadata(format!(
                        "relation {}.{} targets unknown entity {}",
                        def.name, rd.name, name
                    ))
                })?;
                RelationTarget::Single(id)
            }
            RelationTargetDef::Polymorphic {
                type_field,
                targets,
            } => {
                if rd.kind != RelationKind::ManyToOne {
                    return Err(Error::Metadata(format!(
                        "polymorphic relation {}.{} must be many-to-one",
                        def.name, rd.name
                    )));
                }
                let type_field = entities[me.0].field_or_err(type_field)?;
                let mut resolved = Vec::with_capacity(targets.len());
                for name in targets {
                    let id = by_name.get(name).copied().ok_or_else(|| {
                        Error::Metadata(format!(
                            "relation {}.{} targets unknown entity {}",
                            def.name, rd.name, name
                        ))
                    })?;
                    resolved.push(id);
                }
                RelationTarget::Polymorphic {
                    type_field,
                    targets: resolved,
                }
            }
        };

        let fk_field = rd
            .fk_field
            .map(|f| entities[me.0].field_or_err(f))
            .transpose()?;
        let remote_fk = match (&target, rd.remote_fk) {
            (RelationTarget::Single(t), Some(f)) => Some(entities[t.0].field_or_err(f)?),
            (RelationTarget::Polymorphic { .. }, Some(_)) => {
                return Err(Error::Metadata(format!(
                    "polymorphic relation {}.{} cannot declare a remote FK",
                    def.name, rd.name
                )));
            }
            (_, None) => None,
        };

        // Structural requirements per kind.
        match rd.kind {
            RelationKind::ManyToOne => {
                if fk_field.is_none() {
                    return Err(Error::Metadata(format!(
                        "many-to-one relation {}.{} needs fk_field",
                        def.name, rd.name
                    )));
                }
            }
            RelationKind::OneToMany => {
                if remote_fk.is_none() {
                    return Err(Error::Metadata(format!(
                        "one-to-many relation {}.{} needs remote_fk",
                        def.name, rd.name
                    )));
                }
            }
            RelationKind::OneToOne => {
                if fk_field.is_none() && remote_fk.is_none() {
                    return Err(Error::Metadata(format!(
                        "one-to-one relation {}.{} needs fk_field or remote_fk",
                        def.name, rd.name
                    )));
                }
            }
            RelationKind::ManyToMany => {
                if rd.link.is_none() {
                    return Err(Error::Metadata(format!(
                        "many-to-many relation {}.{} needs a link table",
                        def.name, rd.name
                    )));
                }
            }
        }

        let order_by = match (&target, rd.order_by) {
            (RelationTarget::Single(t), Some(f)) => Some(entities[t.0].field_or_err(f)?),
            (_, _) => None,
        };

        out.push(RelationMeta {
            name: rd.name,
            kind: rd.kind,
            target,
            fk_field,
            remote_fk,
            link: rd.link,
            inverse: InverseLink::None,
            owns: rd.owns,
            order_by,
        });
    }
    Ok(out)
}

/// The kind the other side of a paired relation must have.
const fn inverse_kind(kind: RelationKind) -> RelationKind {
    match kind {
        RelationKind::ManyToOne => RelationKind::OneToMany,
        RelationKind::OneToMany => RelationKind::ManyToOne,
        RelationKind::OneToOne => RelationKind::OneToOne,
        RelationKind::ManyToMany => RelationKind::ManyToMany,
    }
}

/// Resolve declared inverse names into relation ids and validate that the
/// two sides actually pair up: compatible kinds, the inverse points back at
/// the owner, and when both sides declare an inverse they name each other.
fn resolve_inverses(entities: &mut [EntityMeta], defs: &[EntityDef]) -> Result<()> {
    let mut fixes: Vec<(usize, usize, InverseLink)> = Vec::new();

    for (ei, def) in defs.iter().enumerate() {
        for (ri, rd) in def.relations.iter().enumerate() {
            let Some(inv_name) = rd.inverse else { continue };
            let rel = &entities[ei].relations[ri];
            let owner_id = entities[ei].id;
            let owner_name = entities[ei].name;

            let resolve_on = |target: EntityId| -> Result<RelationId> {
                let target_meta = &entities[target.0];
                let inv = target_meta.relation(inv_name).ok_or_else(|| {
                    Error::Metadata(format!(
                        "relation {}.{} declares inverse {} but {} has no such relation",
                        owner_name, rd.name, inv_name, target_meta.name
                    ))
                })?;
                let other = target_meta.relation_meta(inv);
                if other.kind != inverse_kind(rd.kind) {
                    return Err(Error::Metadata(format!(
                        "inverse kind mismatch between {}.{} and {}.{}",
                        owner_name, rd.name, target_meta.name, other.name
                    )));
                }
                let points_back = match &other.target {
                    RelationTarget::Single(t) => *t == owner_id,
                    RelationTarget::Polymorphic { targets, .. } => targets.contains(&owner_id),
                };
                if !points_back {
                    return Err(Error::Metadata(format!(
                        "inverse {}.{} does not point back at {}",
                        target_meta.name, other.name, owner_name
                    )));
                }
                // Mutual naming: if the other side declares an inverse too,
                // it must name this relation.
                let other_def = &defs[target.0].relations[inv.0];
                if let Some(back) = other_def.inverse {
                    if back != rd.name {
                        return Err(Error::Metadata(format!(
                            "inverse mismatch: {}.{} pairs with {}.{} which pairs back with {}",
                            owner_name, rd.name, target_meta.name, other.name, back
                        )));
                    }
                }
                Ok(inv)
            };

            let link = match rel.target.clone() {
                RelationTarget::Single(target) => InverseLink::Single(resolve_on(target)?),
                RelationTarget::Polymorphic { targets, .. } => {
                    let mut pairs = Vec::with_capacity(targets.len());
                    for target in targets {
                        pairs.push((target, resolve_on(target)?));
                    }
                    InverseLink::PerTarget(pairs)
                }
            };
            fixes.push((ei, ri, link));
        }
    }

    for (ei, ri, link) in fixes {
        entities[ei].relations[ri].inverse = link;
    }
    Ok(())
}

/// Kahn's-algorithm ranks over a dependency edge set. Entities left over
/// after the sort form cycles and share the highest rank; they are also
/// reported so the caller can decide whether cycles are acceptable.
fn kahn_ranks(deps: &[HashSet<usize>]) -> (Vec<usize>, Vec<usize>) {
    let n = deps.len();
    let mut rank = vec![usize::MAX; n];
    let mut assigned = 0usize;
    let mut current = 0usize;
    while assigned < n {
        let ready: Vec<usize> = (0..n)
            .filter(|&i| rank[i] == usize::MAX && deps[i].iter().all(|&d| rank[d] != usize::MAX))
            .collect();
        if ready.is_empty() {
            break;
        }
        for i in ready {
            rank[i] = current;
            assigned += 1;
        }
        current += 1;
    }
    let mut cyclic = Vec::new();
    for r in &mut rank {
        if *r == usize::MAX {
            *r = current;
        }
    }
    for (i, deps_i) in deps.iter().enumerate() {
        if rank[i] == current && !deps_i.is_empty() {
            cyclic.push(i);
        }
    }
    (rank, cyclic)
}

/// Insert topology over required (non-nullable) FK edges, and delete
/// topology over all FK edges. Insert cycles demand pre-assignable keys;
/// delete cycles just share a rank (FK nulling breaks them at flush time).
fn compute_insert_ranks(entities: &mut [EntityMeta]) -> Result<()> {
    let n = entities.len();
    // deps[a] = set of entities a must be inserted after.
    let mut required: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    let mut all: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for (i, entity) in entities.iter().enumerate() {
        for rel in &entity.relations {
            let Some(fk) = rel.fk_field else { continue };
            for candidate in rel.target.candidates() {
                if candidate.0 == i {
                    continue;
                }
                all[i].insert(candidate.0);
                if !entity.field_meta(fk).nullable {
                    required[i].insert(candidate.0);
                }
            }
        }
    }

    let (insert_ranks, insert_cycles) = kahn_ranks(&required);
    let (delete_ranks, _) = kahn_ranks(&all);

    for i in 0..n {
        entities[i].insert_rank = insert_ranks[i];
        entities[i].delete_rank = delete_ranks[i];
    }
    for i in insert_cycles {
        entities[i].cyclic_inserts = true;
        if entities[i].key_source == KeySource::Driver {
            return Err(Error::Metadata(format!(
                "entity {} is part of a required-FK cycle and needs a pre-assignable key source",
                entities[i].name
            )));
        }
    }
    Ok(())
}
