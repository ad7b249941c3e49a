//! Change tracking and the insert/update/delete partition.
//!
//! Every instance carries two value vectors: `original` (frozen at load time
//! or at the last successful flush) and `current`. The dirty set is the
//! minimal field -> new-value diff between the two, computed with semantic
//! value equality so representation changes do not count as edits.

use crate::entity::{EntityRef, Lifecycle};
use crate::identity_map::IdentityMap;
use relmap_core::meta::{FieldId, Registry};
use relmap_core::Value;
use std::sync::Arc;

/// The minimal field -> new value diff for one instance.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    /// Changed fields with their new values, in `FieldId` order.
    pub fields: Vec<(FieldId, Value)>,
}

impl DirtySet {
    /// No changes?
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of changed fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// The changed field ids.
    pub fn field_ids(&self) -> Vec<FieldId> {
        self.fields.iter().map(|(f, _)| *f).collect()
    }
}

/// The write-plan partition of all tracked instances.
#[derive(Default)]
pub struct Partition {
    /// Instances needing INSERT (`New` or `Pending`).
    pub inserts: Vec<EntityRef>,
    /// Persisted instances that may need UPDATE; their dirty sets are
    /// computed at emission time so hook mutations are included.
    pub updates: Vec<EntityRef>,
    /// Instances needing DELETE (`PendingDelete`).
    pub deletes: Vec<EntityRef>,
}

impl Partition {
    /// Is there nothing to write?
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Snapshot-diff change tracking over the identity map.
pub struct ChangeTracker {
    registry: Arc<Registry>,
}

impl ChangeTracker {
    /// Create a tracker bound to a registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Freeze the instance's current state as the new baseline.
    ///
    /// Called at load time (by the identity map) and after a successful
    /// flush.
    pub fn snapshot(&self, entity: &EntityRef) {
        let mut inner = entity.write();
        inner.original = inner.current.clone();
    }

    /// Compute the dirty set for an instance.
    pub fn diff(&self, entity: &EntityRef) -> DirtySet {
        let inner = entity.read();
        let mut fields = Vec::new();
        for (i, current) in inner.current.iter().enumerate() {
            if !current.semantic_eq(&inner.original[i]) {
                fields.push((FieldId(i), current.clone()));
            }
        }
        DirtySet { fields }
    }

    /// Is the instance dirty?
    pub fn is_dirty(&self, entity: &EntityRef) -> bool {
        let inner = entity.read();
        inner
            .current
            .iter()
            .zip(&inner.original)
            .any(|(c, o)| !c.semantic_eq(o))
    }

    /// Bucket all tracked instances into the write-plan partition.
    ///
    /// `Persisted` instances with an empty dirty set are excluded from
    /// updates at emission time; instances created and deleted within the
    /// same unit of work never reach the map at all (deleting a `New`
    /// instance unregisters it), so no SQL is ever issued for them.
    pub fn partition(&self, map: &IdentityMap) -> Partition {
        let mut partition = Partition::default();
        for entity in map.iter() {
            match entity.lifecycle() {
                Lifecycle::New | Lifecycle::Pending => {
                    partition.inserts.push(Arc::clone(entity));
                }
                Lifecycle::Persisted => {
                    if self.is_dirty(entity) {
                        partition.updates.push(Arc::clone(entity));
                    }
                }
                Lifecycle::PendingDelete => {
                    partition.deletes.push(Arc::clone(entity));
                }
                Lifecycle::Deleted => {}
            }
        }

        // Deterministic emission order: parents before children for inserts
        // (required-FK topology), children before parents for deletes (all-FK
        // topology), stable within a type.
        let insert_rank = |e: &EntityRef| self.registry.meta(e.entity()).insert_rank;
        let delete_rank = |e: &EntityRef| self.registry.meta(e.entity()).delete_rank;
        partition
            .inserts
            .sort_by_key(|e| (insert_rank(e), e.render_key()));
        partition
            .deletes
            .sort_by_key(|e| (std::cmp::Reverse(delete_rank(e)), e.render_key()));
        partition
            .updates
            .sort_by_key(|e| (insert_rank(e), e.render_key()));
        partition
    }

    /// The registry this tracker resolves metadata through.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}
