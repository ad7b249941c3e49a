//! Identity Map: one canonical instance per (entity type, key).
//!
//! All loads and finds funnel through `get_or_register`, so every reference
//! to a given row within one unit of work is pointer-equal. Freshly read
//! column values are merged into an existing instance only for fields that
//! are not locally dirty; an uncommitted local edit is never clobbered by a
//! concurrent read.

use crate::entity::{EntityCell, EntityInner, EntityKey, EntityRef, Key, KeyValue, Lifecycle};
use relmap_core::error::{Error, Result};
use relmap_core::meta::{EntityId, EntityMeta, Registry};
use relmap_core::{Row, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// The identity map for one unit of work.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityRef>,
    next_placeholder: u64,
}

impl IdentityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an instance.
    pub fn get(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).map(Arc::clone)
    }

    /// Look up by entity type and assigned key value.
    pub fn get_assigned(&self, entity: EntityId, key: &KeyValue) -> Option<EntityRef> {
        self.get(&EntityKey {
            entity,
            key: Key::Assigned(key.clone()),
        })
    }

    /// Register a freshly read row, or merge it into the existing canonical
    /// instance.
    ///
    /// Merge semantics: for each field, if the instance's local value is
    /// clean (current semantically equals original), both snapshots take the
    /// fresh value; a locally dirty field keeps both its current edit and
    /// its original baseline.
    #[tracing::instrument(level = "trace", skip(self, registry, row))]
    pub fn get_or_register(
        &mut self,
        registry: &Registry,
        entity: EntityId,
        row: &Row,
    ) -> Result<EntityRef> {
        let meta = registry.meta(entity);
        let values = row_values(meta, row);
        let key = KeyValue::from_value(meta.name, &values[meta.key.0])?;
        let map_key = EntityKey {
            entity,
            key: Key::Assigned(key),
        };

        if let Some(existing) = self.entries.get(&map_key) {
            merge_row(meta, &mut existing.write(), values);
            return Ok(Arc::clone(existing));
        }

        let cell: EntityRef = Arc::new(EntityCell::new(
            meta,
            map_key.key.clone(),
            Lifecycle::Persisted,
            values,
        ));
        self.entries.insert(map_key, Arc::clone(&cell));
        Ok(cell)
    }

    /// Register a brand-new instance under a fresh placeholder identity.
    ///
    /// Placeholder identities come from a session counter and are never
    /// emitted as real keys, so they cannot collide with loaded rows.
    pub fn register_new(&mut self, registry: &Registry, entity: EntityId) -> Result<EntityRef> {
        let meta = registry.meta(entity);
        let placeholder = Key::Placeholder(self.next_placeholder);
        self.next_placeholder += 1;

        let values = vec![Value::Null; meta.fields.len()];
        let cell: EntityRef = Arc::new(EntityCell::new(
            meta,
            placeholder.clone(),
            Lifecycle::New,
            values,
        ));
        self.register_at(
            EntityKey {
                entity,
                key: placeholder,
            },
            Arc::clone(&cell),
        )?;
        Ok(cell)
    }

    /// Register an instance at an explicit identity.
    ///
    /// Re-using an occupied placeholder identity is a programmer error and
    /// is rejected.
    pub fn register_at(&mut self, key: EntityKey, cell: EntityRef) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(Error::Metadata(format!(
                "identity {} already registered for {}",
                key.key.render(),
                cell.name()
            )));
        }
        self.entries.insert(key, cell);
        Ok(())
    }

    /// Move an instance from its placeholder identity to its real key, once
    /// the key has been assigned. Instance identity (the `Arc`) is
    /// unchanged.
    pub fn rekey(&mut self, old: &EntityKey, key: KeyValue) -> Result<()> {
        let cell = self.entries.remove(old).ok_or_else(|| {
            Error::Metadata(format!("rekey of unregistered identity {}", old.key.render()))
        })?;
        let new_key = EntityKey {
            entity: old.entity,
            key: Key::Assigned(key),
        };
        cell.write().key = new_key.key.clone();
        self.entries.insert(new_key, cell);
        Ok(())
    }

    /// Remove an instance.
    pub fn remove(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Iterate all instances.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.entries.values()
    }

    /// All instances of one entity type.
    pub fn of_type(&self, entity: EntityId) -> Vec<EntityRef> {
        self.entries
            .iter()
            .filter(|(k, _)| k.entity == entity)
            .map(|(_, v)| Arc::clone(v))
            .collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Extract field values from a row, in `FieldId` order. Columns missing from
/// the row read as NULL.
fn row_values(meta: &EntityMeta, row: &Row) -> Vec<Value> {
    meta.fields
        .iter()
        .map(|f| row.get_by_name(f.column).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Merge freshly read values into an existing instance without clobbering
/// local edits.
fn merge_row(
    meta: &EntityMeta,
    inner: &mut std::sync::RwLockWriteGuard<'_, EntityInner>,
    fresh: Vec<Value>,
) {
    for (i, fresh_value) in fresh.into_iter().enumerate() {
        let clean = inner.current[i].semantic_eq(&inner.original[i]);
        if clean {
            inner.current[i] = fresh_value.clone();
            inner.original[i] = fresh_value;
        } else {
            tracing::trace!(
                entity = meta.name,
                field = meta.fields[i].name,
                "keeping locally dirty field over fresh read"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::meta::{EntityDef, FieldDef, SqlType};

    fn registry() -> Arc<Registry> {
        Registry::build(
            vec![
                EntityDef::new("Author", "authors", "id")
                    .field(FieldDef::new("id", SqlType::BigInt))
                    .field(FieldDef::new("name", SqlType::Text)),
            ],
            vec![],
        )
        .unwrap()
    }

    fn author_row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::BigInt(id), Value::Text(name.to_string())],
        )
    }

    #[test]
    fn same_key_same_instance() {
        let registry = registry();
        let author = registry.entity("Author").unwrap();
        let mut map = IdentityMap::new();

        let a = map
            .get_or_register(&registry, author, &author_row(1, "a1"))
            .unwrap();
        let b = map
            .get_or_register(&registry, author, &author_row(1, "a1"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn fresh_read_refreshes_clean_fields() {
        let registry = registry();
        let author = registry.entity("Author").unwrap();
        let meta = registry.meta(author);
        let name = meta.field("name").unwrap();
        let mut map = IdentityMap::new();

        let a = map
            .get_or_register(&registry, author, &author_row(1, "old"))
            .unwrap();
        map.get_or_register(&registry, author, &author_row(1, "renamed"))
            .unwrap();
        assert_eq!(a.value(name), Value::Text("renamed".into()));
        assert_eq!(a.original(name), Value::Text("renamed".into()));
    }

    #[test]
    fn fresh_read_never_clobbers_dirty_fields() {
        let registry = registry();
        let author = registry.entity("Author").unwrap();
        let meta = registry.meta(author);
        let name = meta.field("name").unwrap();
        let mut map = IdentityMap::new();

        let a = map
            .get_or_register(&registry, author, &author_row(1, "old"))
            .unwrap();
        a.write().current[name.0] = Value::Text("local edit".into());

        map.get_or_register(&registry, author, &author_row(1, "from db"))
            .unwrap();
        assert_eq!(a.value(name), Value::Text("local edit".into()));
        // The baseline also stays, so the diff still reports the edit.
        assert_eq!(a.original(name), Value::Text("old".into()));
    }

    #[test]
    fn register_new_uses_distinct_placeholders() {
        let registry = registry();
        let author = registry.entity("Author").unwrap();
        let mut map = IdentityMap::new();

        let a = map.register_new(&registry, author).unwrap();
        let b = map.register_new(&registry, author).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.entity_key(), b.entity_key());
        assert_eq!(a.lifecycle(), Lifecycle::New);
    }

    #[test]
    fn double_placeholder_registration_rejected() {
        let registry = registry();
        let author = registry.entity("Author").unwrap();
        let mut map = IdentityMap::new();

        let a = map.register_new(&registry, author).unwrap();
        let err = map.register_at(a.entity_key(), Arc::clone(&a)).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn rekey_preserves_instance_identity() {
        let registry = registry();
        let author = registry.entity("Author").unwrap();
        let mut map = IdentityMap::new();

        let a = map.register_new(&registry, author).unwrap();
        let old_key = a.entity_key();
        map.rekey(&old_key, KeyValue::Int(42)).unwrap();

        let found = map.get_assigned(author, &KeyValue::Int(42)).unwrap();
        assert!(Arc::ptr_eq(&a, &found));
        assert_eq!(a.key(), Key::Assigned(KeyValue::Int(42)));
        assert!(map.get(&old_key).is_none());
    }
}
