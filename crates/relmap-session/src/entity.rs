//! Entity instances and lifecycle.
//!
//! An entity instance is a mutable record of typed field values plus the
//! session-private state that makes the unit of work go: lifecycle, key,
//! original/current snapshots, and per-relation caches. Exactly one instance
//! exists per (type, key) for the lifetime of a unit of work; the identity
//! map is the sole owner, and relation caches hold weak references so that
//! bidirectional graphs never keep each other alive.

use relmap_core::error::{Error, Result};
use relmap_core::meta::{EntityId, EntityMeta, FieldId, RelationId};
use relmap_core::Value;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Lifecycle of an entity instance within one unit of work.
///
/// `New` instances have a placeholder identity; `Pending` instances have a
/// real key but no row yet; `Persisted` instances mirror a row; deletion goes
/// through `PendingDelete` (in-memory removal done, SQL pending) and lands on
/// `Deleted` only after the DELETE commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created in this unit of work, no key assigned.
    New,
    /// Key assigned, row not yet flushed.
    Pending,
    /// Mirrors an existing row.
    Persisted,
    /// Marked for deletion; removed from in-memory caches, SQL pending.
    PendingDelete,
    /// The row is gone.
    Deleted,
}

impl Lifecycle {
    /// Can fields and relations of an instance in this state be mutated?
    pub const fn mutable(self) -> bool {
        matches!(self, Lifecycle::New | Lifecycle::Pending | Lifecycle::Persisted)
    }
}

/// A primary key value. Restricted to the hashable types keys actually use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    /// Integer key.
    Int(i64),
    /// Text key.
    Text(String),
    /// UUID key.
    Uuid([u8; 16]),
}

impl KeyValue {
    /// Convert a dynamic value into a key value.
    pub fn from_value(entity: &'static str, value: &Value) -> Result<KeyValue> {
        match value {
            Value::TinyInt(v) => Ok(KeyValue::Int(i64::from(*v))),
            Value::SmallInt(v) => Ok(KeyValue::Int(i64::from(*v))),
            Value::Int(v) => Ok(KeyValue::Int(i64::from(*v))),
            Value::BigInt(v) => Ok(KeyValue::Int(*v)),
            Value::Text(s) => Ok(KeyValue::Text(s.clone())),
            Value::Uuid(u) => Ok(KeyValue::Uuid(*u)),
            other => Err(Error::invalid_state(
                entity,
                format!("{} is not usable as a key", other.type_name()),
            )),
        }
    }

    /// The dynamic value form of this key.
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Int(v) => Value::BigInt(*v),
            KeyValue::Text(s) => Value::Text(s.clone()),
            KeyValue::Uuid(u) => Value::Uuid(*u),
        }
    }

    /// Render for error messages.
    pub fn render(&self) -> String {
        match self {
            KeyValue::Int(v) => v.to_string(),
            KeyValue::Text(s) => s.clone(),
            KeyValue::Uuid(u) => u
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// Identity of an instance: a real key, or a session-scoped placeholder for
/// instances whose key is not yet known. Placeholders are never emitted as
/// real keys, so a placeholder can never collide with a loaded row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// A real, stored key.
    Assigned(KeyValue),
    /// Synthetic identity for a not-yet-keyed instance.
    Placeholder(u64),
}

impl Key {
    /// The assigned key value, if any.
    pub fn assigned(&self) -> Option<&KeyValue> {
        match self {
            Key::Assigned(v) => Some(v),
            Key::Placeholder(_) => None,
        }
    }

    /// Render for error messages.
    pub fn render(&self) -> String {
        match self {
            Key::Assigned(v) => v.render(),
            Key::Placeholder(n) => format!("new#{n}"),
        }
    }
}

/// Identity-map key: entity type plus instance key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    /// Entity type.
    pub entity: EntityId,
    /// Instance key.
    pub key: Key,
}

/// Payload of a loaded relation cache.
#[derive(Debug, Clone, Default)]
pub enum RelationCache {
    /// Never read; the database has not been consulted.
    #[default]
    Unloaded,
    /// A load is in flight.
    Loading,
    /// Loaded to-one reference.
    One(Option<Weak<EntityCell>>),
    /// Loaded, ordered to-many collection.
    Many(Vec<Weak<EntityCell>>),
}

impl RelationCache {
    /// Is the cache in a loaded state?
    pub const fn is_loaded(&self) -> bool {
        matches!(self, RelationCache::One(_) | RelationCache::Many(_))
    }
}

/// The mutable state of an entity instance.
#[derive(Debug)]
pub struct EntityInner {
    /// Lifecycle state.
    pub lifecycle: Lifecycle,
    /// Instance identity.
    pub key: Key,
    /// Current field values, indexed by `FieldId`.
    pub current: Vec<Value>,
    /// Snapshot at load / last successful flush.
    pub original: Vec<Value>,
    /// Per-relation caches, indexed by `RelationId`.
    pub relations: Vec<RelationCache>,
}

/// A shared entity instance. Handed out as `EntityRef = Arc<EntityCell>`;
/// pointer equality of the `Arc` is instance identity.
#[derive(Debug)]
pub struct EntityCell {
    entity: EntityId,
    name: &'static str,
    inner: RwLock<EntityInner>,
}

/// Shared handle to an entity instance.
pub type EntityRef = Arc<EntityCell>;

impl EntityCell {
    /// Construct a cell; used by the identity map only.
    pub(crate) fn new(meta: &EntityMeta, key: Key, lifecycle: Lifecycle, values: Vec<Value>) -> Self {
        let original = values.clone();
        Self {
            entity: meta.id,
            name: meta.name,
            inner: RwLock::new(EntityInner {
                lifecycle,
                key,
                current: values,
                original,
                relations: vec![RelationCache::Unloaded; meta.relations.len()],
            }),
        }
    }

    /// Entity type id.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Entity type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read guard over the inner state.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityInner> {
        self.inner.read().expect("entity lock poisoned")
    }

    /// Write guard over the inner state.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, EntityInner> {
        self.inner.write().expect("entity lock poisoned")
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.read().lifecycle
    }

    /// Instance key.
    pub fn key(&self) -> Key {
        self.read().key.clone()
    }

    /// Identity-map key for this instance.
    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            entity: self.entity,
            key: self.key(),
        }
    }

    /// Read a field's current value.
    pub fn value(&self, field: FieldId) -> Value {
        self.read().current[field.0].clone()
    }

    /// Read a field's original (snapshot) value.
    pub fn original(&self, field: FieldId) -> Value {
        self.read().original[field.0].clone()
    }

    /// Is this relation cache loaded?
    pub fn relation_loaded(&self, relation: RelationId) -> bool {
        self.read().relations[relation.0].is_loaded()
    }

    /// Rendered key for error messages.
    pub fn render_key(&self) -> String {
        self.read().key.render()
    }
}

/// Resolve the members of a loaded to-many cache, skipping dead references.
pub(crate) fn upgrade_many(links: &[Weak<EntityCell>]) -> Vec<EntityRef> {
    links.iter().filter_map(Weak::upgrade).collect()
}

/// Seed a to-one cache payload from a target.
pub(crate) fn one_of(target: Option<&EntityRef>) -> RelationCache {
    RelationCache::One(target.map(Arc::downgrade))
}
