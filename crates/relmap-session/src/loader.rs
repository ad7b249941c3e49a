//! Batched loader: coalesces loads and finds issued in one turn.
//!
//! Load-by-key and find-by-filter calls never touch the driver directly:
//! they enqueue a request descriptor and hand back a result handle. At the
//! turn boundary (an explicit, testable `run_turn` call) all requests
//! enqueued since the previous turn are grouped by batch key and dispatched
//! in one pass:
//!
//! - by-key groups become one `WHERE key IN (…)` statement per entity type;
//! - find groups with the same vectorizable shape become one tagged
//!   statement;
//! - everything else executes individually, exactly once.
//!
//! Coalescing is strictly an optimization: every request resolves to the
//! same result set, in the same order, as if it had executed alone. A driver
//! error during a coalesced statement is delivered to every request in that
//! batch; requests in other batches of the same turn are unaffected.

use crate::entity::{EntityRef, KeyValue, Lifecycle};
use crate::UnitOfWork;
use relmap_core::error::{Error, Result};
use relmap_core::meta::{EntityId, EntityMeta};
use relmap_core::{Cx, Driver, Outcome};
use relmap_query::{Filter, select_by_keys, select_filter, vectorize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// State of one request's result slot.
enum SlotState {
    /// The turn has not run yet.
    Pending,
    /// Resolved. An empty vec is a completed zero-match result,
    /// distinguishable from `Pending`.
    Ready(Result<Vec<EntityRef>>),
}

struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    fn new() -> Arc<Slot> {
        Arc::new(Slot {
            state: Mutex::new(SlotState::Pending),
        })
    }

    fn fill(&self, result: Result<Vec<EntityRef>>) {
        *self.state.lock().expect("slot lock poisoned") = SlotState::Ready(result);
    }

    fn ready(&self) -> bool {
        matches!(
            *self.state.lock().expect("slot lock poisoned"),
            SlotState::Ready(_)
        )
    }

    fn take(&self) -> Option<Result<Vec<EntityRef>>> {
        let state = self.state.lock().expect("slot lock poisoned");
        match &*state {
            SlotState::Pending => None,
            SlotState::Ready(result) => Some(match result {
                Ok(refs) => Ok(refs.clone()),
                Err(e) => Err(e.clone()),
            }),
        }
    }
}

/// Handle to a pending load-by-key.
pub struct LoadHandle {
    entity: &'static str,
    key: KeyValue,
    slot: Arc<Slot>,
}

impl LoadHandle {
    /// Has the turn resolved this request?
    pub fn ready(&self) -> bool {
        self.slot.ready()
    }

    /// Take the result. `NotFound` for a missing key; `InvalidState` when
    /// the turn has not run yet.
    pub fn take(&self) -> Result<EntityRef> {
        match self.slot.take() {
            None => Err(Error::invalid_state(
                self.entity,
                "load not resolved yet; run_turn is pending",
            )),
            Some(Ok(mut refs)) => {
                if refs.is_empty() {
                    Err(Error::NotFound {
                        entity: self.entity,
                        key: self.key.render(),
                    })
                } else {
                    Ok(refs.remove(0))
                }
            }
            Some(Err(e)) => Err(e),
        }
    }
}

/// Handle to a pending find-by-filter.
pub struct FindHandle {
    entity: &'static str,
    slot: Arc<Slot>,
}

impl FindHandle {
    /// Has the turn resolved this request?
    pub fn ready(&self) -> bool {
        self.slot.ready()
    }

    /// Take the result rows, in the request's own order. An empty vec means
    /// the query ran and matched nothing.
    pub fn take(&self) -> Result<Vec<EntityRef>> {
        match self.slot.take() {
            None => Err(Error::invalid_state(
                self.entity,
                "find not resolved yet; run_turn is pending",
            )),
            Some(result) => result,
        }
    }
}

enum RequestKind {
    ById(KeyValue),
    Find(Filter),
}

struct PendingRequest {
    entity: EntityId,
    kind: RequestKind,
    slot: Arc<Slot>,
}

/// Cumulative loader statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// SQL statements issued by the loader.
    pub statements: u64,
    /// Requests enqueued.
    pub requests: u64,
    /// Requests that were folded into a shared statement.
    pub coalesced: u64,
    /// Turns run.
    pub turns: u64,
}

/// Statistics for a single turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnStats {
    /// SQL statements issued in this turn.
    pub statements: u64,
    /// Requests resolved in this turn.
    pub requests: u64,
}

/// The request queue for one unit of work.
#[derive(Default)]
pub struct Loader {
    pending: Vec<PendingRequest>,
    stats: LoaderStats,
}

impl Loader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> LoaderStats {
        self.stats
    }

    /// Requests waiting for the next turn.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn enqueue_load(
        &mut self,
        meta: &EntityMeta,
        entity: EntityId,
        key: KeyValue,
    ) -> LoadHandle {
        let slot = Slot::new();
        self.stats.requests += 1;
        self.pending.push(PendingRequest {
            entity,
            kind: RequestKind::ById(key.clone()),
            slot: Arc::clone(&slot),
        });
        LoadHandle {
            entity: meta.name,
            key,
            slot,
        }
    }

    pub(crate) fn enqueue_find(
        &mut self,
        meta: &EntityMeta,
        entity: EntityId,
        filter: Filter,
    ) -> FindHandle {
        let slot = Slot::new();
        self.stats.requests += 1;
        self.pending.push(PendingRequest {
            entity,
            kind: RequestKind::Find(filter),
            slot: Arc::clone(&slot),
        });
        FindHandle {
            entity: meta.name,
            slot,
        }
    }

    fn take_pending(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.pending)
    }
}

impl<D: Driver> UnitOfWork<D> {
    /// Run one scheduling turn: dispatch every request enqueued since the
    /// previous turn, grouped by batch key.
    ///
    /// Requests enqueued while the turn is dispatching belong to the next
    /// turn; requests from different turns are never coalesced together.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn run_turn(&mut self, cx: &Cx) -> Outcome<TurnStats, Error> {
        let pending = self.loader.take_pending();
        if pending.is_empty() {
            return Outcome::Ok(TurnStats::default());
        }
        self.loader.stats.turns += 1;
        let mut turn = TurnStats {
            statements: 0,
            requests: pending.len() as u64,
        };

        // Group by batch key: entity type for loads, (entity type, filter
        // shape) for finds. Insertion order is kept for determinism.
        let mut by_id: Vec<(EntityId, Vec<(KeyValue, Arc<Slot>)>)> = Vec::new();
        let mut finds: Vec<((EntityId, String), Vec<(Filter, Arc<Slot>)>)> = Vec::new();
        for request in pending {
            match request.kind {
                RequestKind::ById(key) => {
                    match by_id.iter_mut().find(|(e, _)| *e == request.entity) {
                        Some((_, group)) => group.push((key, request.slot)),
                        None => by_id.push((request.entity, vec![(key, request.slot)])),
                    }
                }
                RequestKind::Find(filter) => {
                    let batch_key = (request.entity, filter.shape_key());
                    match finds.iter_mut().find(|(k, _)| *k == batch_key) {
                        Some((_, group)) => group.push((filter, request.slot)),
                        None => finds.push((batch_key, vec![(filter, request.slot)])),
                    }
                }
            }
        }

        for (entity, group) in by_id {
            match self.dispatch_by_id(cx, entity, group, &mut turn).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        for ((entity, _), group) in finds {
            match self.dispatch_find_group(cx, entity, group, &mut turn).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.loader.stats.statements += turn.statements;
        tracing::debug!(
            statements = turn.statements,
            requests = turn.requests,
            "turn complete"
        );
        Outcome::Ok(turn)
    }

    /// One `WHERE key IN (…)` statement per entity type per turn. Keys
    /// already present in the identity map resolve without touching the
    /// store.
    async fn dispatch_by_id(
        &mut self,
        cx: &Cx,
        entity: EntityId,
        group: Vec<(KeyValue, Arc<Slot>)>,
        turn: &mut TurnStats,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity);

        let mut to_fetch: Vec<KeyValue> = Vec::new();
        let mut waiting: Vec<(KeyValue, Arc<Slot>)> = Vec::new();
        for (key, slot) in group {
            match self.identity.get_assigned(entity, &key) {
                Some(instance) => match instance.lifecycle() {
                    Lifecycle::PendingDelete | Lifecycle::Deleted => slot.fill(Ok(vec![])),
                    _ => slot.fill(Ok(vec![instance])),
                },
                None => {
                    if !to_fetch.contains(&key) {
                        to_fetch.push(key.clone());
                    }
                    waiting.push((key, slot));
                }
            }
        }
        if to_fetch.is_empty() {
            return Outcome::Ok(());
        }

        let params: Vec<_> = to_fetch.iter().map(KeyValue::to_value).collect();
        let stmt = select_by_keys(self.driver().dialect(), meta, &params);
        tracing::trace!(sql = %stmt.sql, keys = to_fetch.len(), "by-id batch");
        turn.statements += 1;
        if waiting.len() > 1 {
            self.loader.stats.coalesced += waiting.len() as u64;
        }

        let rows = match self.driver().query(cx, &stmt.sql, &stmt.params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => {
                // The whole batch shares the failure.
                for (_, slot) in waiting {
                    slot.fill(Err(e.clone()));
                }
                return Outcome::Ok(());
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut found: HashMap<KeyValue, EntityRef> = HashMap::new();
        for row in &rows {
            match self.identity.get_or_register(&registry, entity, row) {
                Ok(instance) => {
                    if let Some(key) = instance.key().assigned().cloned() {
                        found.insert(key, instance);
                    }
                }
                Err(e) => {
                    for (_, slot) in waiting {
                        slot.fill(Err(e.clone()));
                    }
                    return Outcome::Ok(());
                }
            }
        }

        for (key, slot) in waiting {
            match found.get(&key) {
                Some(instance) => slot.fill(Ok(vec![Arc::clone(instance)])),
                None => slot.fill(Ok(vec![])),
            }
        }
        Outcome::Ok(())
    }

    /// Dispatch one find group: a single tagged statement when the shape is
    /// vectorizable and shared, one statement per request otherwise.
    async fn dispatch_find_group(
        &mut self,
        cx: &Cx,
        entity: EntityId,
        group: Vec<(Filter, Arc<Slot>)>,
        turn: &mut TurnStats,
    ) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        let meta = registry.meta(entity);

        if group.len() > 1 && group[0].0.vectorizable() {
            let filters: Vec<&Filter> = group.iter().map(|(f, _)| f).collect();
            let stmt = match vectorize::build_group(self.driver().dialect(), meta, &filters) {
                Ok(stmt) => stmt,
                Err(e) => {
                    for (_, slot) in group {
                        slot.fill(Err(e.clone()));
                    }
                    return Outcome::Ok(());
                }
            };
            tracing::trace!(sql = %stmt.sql, requests = group.len(), "vectorized find group");
            turn.statements += 1;
            self.loader.stats.coalesced += group.len() as u64;

            let rows = match self.driver().query(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => {
                    for (_, slot) in group {
                        slot.fill(Err(e.clone()));
                    }
                    return Outcome::Ok(());
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            let buckets = vectorize::split_by_tag(rows, group.len());
            for ((_, slot), rows) in group.into_iter().zip(buckets) {
                slot.fill(self.ingest_rows(&registry, entity, &rows));
            }
            return Outcome::Ok(());
        }

        // Unique shapes and non-vectorizable operators: one statement per
        // request, each exactly once.
        for (filter, slot) in group {
            let stmt = match select_filter(self.driver().dialect(), &registry, entity, &filter) {
                Ok(stmt) => stmt,
                Err(e) => {
                    slot.fill(Err(e));
                    continue;
                }
            };
            tracing::trace!(sql = %stmt.sql, "individual find");
            turn.statements += 1;
            let rows = match self.driver().query(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => {
                    slot.fill(Err(e));
                    continue;
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            slot.fill(self.ingest_rows(&registry, entity, &rows));
        }
        Outcome::Ok(())
    }

    /// Register result rows through the identity map, preserving row order.
    fn ingest_rows(
        &mut self,
        registry: &relmap_core::meta::Registry,
        entity: EntityId,
        rows: &[relmap_core::Row],
    ) -> Result<Vec<EntityRef>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.identity.get_or_register(registry, entity, row)?);
        }
        Ok(out)
    }
}
