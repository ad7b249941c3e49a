//! Lifecycle hooks.
//!
//! User-supplied callbacks invoked at declared lifecycle points. The core
//! guarantees ordering (before-flush -> reactive settle -> before-validation
//! -> validation rules -> after-validation -> per-entity before-write hooks
//! -> writes -> per-entity after-write hooks -> commit -> after-commit) but
//! not the callbacks' internal behavior.
//!
//! Hooks may mutate the session: the mutation-during-flush guard is lifted
//! for the duration of a hook invocation, and hook mutations feed the
//! reactive worklist like any other edit.

use crate::entity::EntityRef;
use crate::UnitOfWork;
use relmap_core::error::Result;
use relmap_core::Driver;

/// The lifecycle points a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Fired when a flush begins, before the reactive graph settles.
    BeforeFlush,
    /// Fired after reactive settlement, before validation rules run.
    BeforeValidation,
    /// Fired after validation rules pass.
    AfterValidation,
    /// Fired per entity before its INSERT.
    BeforeCreate,
    /// Fired per entity after its INSERT.
    AfterCreate,
    /// Fired per entity before its UPDATE.
    BeforeUpdate,
    /// Fired per entity after its UPDATE.
    AfterUpdate,
    /// Fired per entity before its DELETE.
    BeforeDelete,
    /// Fired per entity after its DELETE.
    AfterDelete,
    /// Fired after the transaction commits, outside the transaction.
    AfterCommit,
}

/// The payload passed to a hook.
pub struct HookEvent {
    /// Which point fired.
    pub point: HookPoint,
    /// The entity the event is about, for per-entity points.
    pub entity: Option<EntityRef>,
}

/// A registered hook callback.
///
/// Returning `Err` aborts the surrounding operation (for pre-write points,
/// before any SQL has been issued for the entity in question).
pub type HookFn<D> = Box<dyn FnMut(&mut UnitOfWork<D>, &HookEvent) -> Result<()> + Send>;

/// Holds registered hooks for one unit of work.
pub struct HookRegistry<D: Driver> {
    hooks: Vec<(HookPoint, HookFn<D>)>,
}

impl<D: Driver> Default for HookRegistry<D> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<D: Driver> std::fmt::Debug for HookRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl<D: Driver> HookRegistry<D> {
    /// Register a hook at a point.
    pub fn register(&mut self, point: HookPoint, hook: HookFn<D>) {
        self.hooks.push((point, hook));
    }

    /// Any hooks registered at this point?
    pub fn has(&self, point: HookPoint) -> bool {
        self.hooks.iter().any(|(p, _)| *p == point)
    }
}

impl<D: Driver> UnitOfWork<D> {
    /// Register a hook at a lifecycle point.
    pub fn on(
        &mut self,
        point: HookPoint,
        hook: impl FnMut(&mut UnitOfWork<D>, &HookEvent) -> Result<()> + Send + 'static,
    ) {
        self.hooks.register(point, Box::new(hook));
    }

    /// Register a before-flush hook.
    pub fn on_before_flush(
        &mut self,
        hook: impl FnMut(&mut UnitOfWork<D>, &HookEvent) -> Result<()> + Send + 'static,
    ) {
        self.on(HookPoint::BeforeFlush, hook);
    }

    /// Register an after-commit hook.
    pub fn on_after_commit(
        &mut self,
        hook: impl FnMut(&mut UnitOfWork<D>, &HookEvent) -> Result<()> + Send + 'static,
    ) {
        self.on(HookPoint::AfterCommit, hook);
    }

    /// Fire all hooks registered at a point, in registration order.
    ///
    /// The registry is detached for the duration so hooks get `&mut self`;
    /// hooks registered from inside a hook are kept.
    pub(crate) fn fire_hooks(
        &mut self,
        point: HookPoint,
        entity: Option<&EntityRef>,
    ) -> Result<()> {
        if !self.hooks.has(point) {
            return Ok(());
        }
        tracing::trace!(?point, "firing hooks");

        let mut taken = std::mem::take(&mut self.hooks);
        self.hook_depth += 1;
        let event = HookEvent {
            point,
            entity: entity.cloned(),
        };
        let mut result: Result<()> = Ok(());
        for (p, hook) in &mut taken.hooks {
            if *p == point {
                if let Err(e) = hook(self, &event) {
                    result = Err(e);
                    break;
                }
            }
        }
        self.hook_depth -= 1;

        // Hooks registered during invocation landed in the fresh registry;
        // keep both.
        let added = std::mem::replace(&mut self.hooks, taken);
        self.hooks.hooks.extend(added.hooks);
        result
    }
}
