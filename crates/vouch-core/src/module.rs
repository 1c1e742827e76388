//! Modules and the module registry.
//!
//! A module owns one slice of an entity's state and knows how to apply,
//! reverse and compare the operations carried by actions tagged with its id.
//! Modules are written against typed state and operations ([`Module`]); the
//! engine sees them through the type-erased [`DynModule`], which works on
//! encoded state blobs so that state can be committed, shipped in a
//! full-state transfer and replaced wholesale.

use crate::action::Action;
use crate::errors::{CoreError, CoreResult};
use crate::identifiers::{ModuleId, ServiceId};
use crate::serialization;
use crate::visibility::{Viewer, Visibility};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Result of applying one operation to typed module state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The operation can never apply (invalid for this module)
    Rejected(String),
    /// A precondition does not hold against the current state
    Conflict(String),
}

/// A typed unit of state ownership
///
/// `apply` must leave `state` unchanged unless it returns
/// [`ApplyOutcome::Applied`]. `reverse` must be an involution up to
/// equivalence: applying `reverse(reverse(op))` has the same effect as `op`.
pub trait Module: Send + Sync + 'static {
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync;
    type Op: Clone + Serialize + DeserializeOwned + Send + Sync;

    fn id(&self) -> ModuleId;

    fn apply(&self, state: &mut Self::State, op: &Self::Op) -> ApplyOutcome;

    /// Compensating operation
    fn reverse(&self, op: &Self::Op) -> Self::Op;

    /// Whether an earlier, still pending `pending` operation must be undone
    /// before `incoming` can be applied. Evaluated from the later action's side.
    fn interferes_with(&self, pending: &Self::Op, incoming: &Self::Op) -> bool;

    fn required_visibility(&self, action: &Action, op: &Self::Op) -> Visibility;

    /// Portion of the state a viewer receives in a full-state transfer
    fn visible_state(&self, state: &Self::State, _viewer: &Viewer) -> Self::State {
        state.clone()
    }
}

/// Result of applying an action to an encoded state blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(Vec<u8>),
    Rejected(String),
    Conflict(String),
}

/// Object-safe module interface over encoded state
pub trait DynModule: Send + Sync {
    fn id(&self) -> ModuleId;

    /// Check that the payload decodes as one of this module's operations
    fn validate(&self, action: &Action) -> CoreResult<()>;

    /// `state` is `None` when the entity has no state for this module yet
    fn apply(&self, state: Option<&[u8]>, action: &Action) -> CoreResult<Transition>;

    fn reverse(&self, action: &Action) -> CoreResult<Action>;

    fn interferes_with(&self, pending: &Action, incoming: &Action) -> CoreResult<bool>;

    fn required_visibility(&self, action: &Action) -> CoreResult<Visibility>;

    fn visible_state(&self, state: &[u8], viewer: &Viewer) -> CoreResult<Vec<u8>>;

    /// Encoded default state
    fn empty_state(&self) -> CoreResult<Vec<u8>>;
}

/// Adapts a typed [`Module`] to [`DynModule`]
pub struct ModuleAdapter<M: Module> {
    inner: M,
}

impl<M: Module> ModuleAdapter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    fn decode_state(&self, state: Option<&[u8]>) -> CoreResult<M::State> {
        match state {
            Some(bytes) => serialization::from_slice(bytes),
            None => Ok(M::State::default()),
        }
    }
}

impl<M: Module> DynModule for ModuleAdapter<M> {
    fn id(&self) -> ModuleId {
        self.inner.id()
    }

    fn validate(&self, action: &Action) -> CoreResult<()> {
        action.op::<M::Op>().map(|_| ())
    }

    fn apply(&self, state: Option<&[u8]>, action: &Action) -> CoreResult<Transition> {
        let op: M::Op = action.op()?;
        let mut state = self.decode_state(state)?;
        Ok(match self.inner.apply(&mut state, &op) {
            ApplyOutcome::Applied => Transition::Applied(serialization::to_vec(&state)?),
            ApplyOutcome::Rejected(reason) => Transition::Rejected(reason),
            ApplyOutcome::Conflict(reason) => Transition::Conflict(reason),
        })
    }

    fn reverse(&self, action: &Action) -> CoreResult<Action> {
        let op: M::Op = action.op()?;
        let reversed = self.inner.reverse(&op);
        Ok(action.compensate(serialization::to_vec(&reversed)?))
    }

    fn interferes_with(&self, pending: &Action, incoming: &Action) -> CoreResult<bool> {
        let pending_op: M::Op = pending.op()?;
        let incoming_op: M::Op = incoming.op()?;
        Ok(self.inner.interferes_with(&pending_op, &incoming_op))
    }

    fn required_visibility(&self, action: &Action) -> CoreResult<Visibility> {
        let op: M::Op = action.op()?;
        Ok(self.inner.required_visibility(action, &op))
    }

    fn visible_state(&self, state: &[u8], viewer: &Viewer) -> CoreResult<Vec<u8>> {
        let state: M::State = serialization::from_slice(state)?;
        serialization::to_vec(&self.inner.visible_state(&state, viewer))
    }

    fn empty_state(&self) -> CoreResult<Vec<u8>> {
        serialization::to_vec(&M::State::default())
    }
}

/// Maps type tags to modules and services to the modules they contain
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<ModuleId, Arc<dyn DynModule>>,
    services: BTreeMap<ServiceId, BTreeSet<ModuleId>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` and attach it to `service`
    pub fn register<M: Module>(&mut self, service: impl Into<ServiceId>, module: M) -> &mut Self {
        let id = module.id();
        self.modules
            .insert(id.clone(), Arc::new(ModuleAdapter::new(module)));
        self.services.entry(service.into()).or_default().insert(id);
        self
    }

    pub fn module(&self, id: &ModuleId) -> CoreResult<&Arc<dyn DynModule>> {
        self.modules
            .get(id)
            .ok_or_else(|| CoreError::UnknownType { module: id.clone() })
    }

    /// Module responsible for `action`, checked against the action's service
    pub fn resolve(&self, action: &Action) -> CoreResult<&Arc<dyn DynModule>> {
        let module = self.module(&action.module)?;
        let served = self
            .services
            .get(&action.service)
            .is_some_and(|modules| modules.contains(&action.module));
        if !served {
            return Err(CoreError::UnauthorizedType {
                module: action.module.clone(),
                service: action.service.clone(),
            });
        }
        Ok(module)
    }

    pub fn modules_of(&self, service: &ServiceId) -> Vec<ModuleId> {
        self.services
            .get(service)
            .map(|modules| modules.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reverse(&self, action: &Action) -> CoreResult<Action> {
        self.resolve(action)?.reverse(action)
    }

    /// Actions on different entities, services or modules never interfere
    pub fn interferes_with(&self, pending: &Action, incoming: &Action) -> CoreResult<bool> {
        if pending.entity != incoming.entity
            || pending.service != incoming.service
            || pending.module != incoming.module
        {
            return Ok(false);
        }
        self.resolve(incoming)?.interferes_with(pending, incoming)
    }

    pub fn required_visibility(&self, action: &Action) -> CoreResult<Visibility> {
        self.resolve(action)?.required_visibility(action)
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("services", &self.services)
            .finish()
    }
}
