//! Example modules used across the test suites
//!
//! - [`CounterModule`]: an integer with a commuting `Increment` and a
//!   precondition-carrying `Set`
//! - [`ContactsModule`]: named contacts filed under hierarchical groups, with
//!   per-group visibility

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vouch_core::{
    Action, ApplyOutcome, ContextPath, CoreResult, EntityId, Module, ModuleId, ServiceId,
    Viewer, Visibility,
};

pub const COUNTER: &str = "counter";
pub const CONTACTS: &str = "contacts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOp {
    Increment { by: i64 },
    /// Only applies while the counter still reads `from`
    Set { from: i64, to: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterModule {
    id: ModuleId,
}

impl CounterModule {
    pub fn new() -> Self {
        Self::named(COUNTER)
    }

    pub fn named(id: &str) -> Self {
        Self { id: id.into() }
    }
}

impl Default for CounterModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CounterModule {
    type State = i64;
    type Op = CounterOp;

    fn id(&self) -> ModuleId {
        self.id.clone()
    }

    fn apply(&self, state: &mut i64, op: &CounterOp) -> ApplyOutcome {
        match *op {
            CounterOp::Increment { by } => match state.checked_add(by) {
                Some(next) => {
                    *state = next;
                    ApplyOutcome::Applied
                }
                None => ApplyOutcome::Rejected("counter overflow".to_string()),
            },
            CounterOp::Set { from, to } => {
                if *state != from {
                    return ApplyOutcome::Conflict(format!("expected {from}, found {state}"));
                }
                *state = to;
                ApplyOutcome::Applied
            }
        }
    }

    fn reverse(&self, op: &CounterOp) -> CounterOp {
        match *op {
            CounterOp::Increment { by } => CounterOp::Increment { by: -by },
            CounterOp::Set { from, to } => CounterOp::Set { from: to, to: from },
        }
    }

    /// Increments commute with each other; anything still pending changes
    /// the value a `Set` expects to find.
    fn interferes_with(&self, _pending: &CounterOp, incoming: &CounterOp) -> bool {
        matches!(incoming, CounterOp::Set { .. })
    }

    fn required_visibility(&self, _action: &Action, _op: &CounterOp) -> Visibility {
        Visibility::public()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub group: ContextPath,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactsOp {
    Add {
        name: String,
        group: String,
        note: String,
    },
    Remove {
        name: String,
        group: String,
        note: String,
    },
}

impl ContactsOp {
    fn name(&self) -> &str {
        match self {
            ContactsOp::Add { name, .. } | ContactsOp::Remove { name, .. } => name,
        }
    }

    fn group(&self) -> ContextPath {
        match self {
            ContactsOp::Add { group, .. } | ContactsOp::Remove { group, .. } => {
                ContextPath::parse(group)
            }
        }
    }
}

/// Permission needed to see any contact entry
pub const CONTACTS_PERMISSION: &str = "contacts.read";

#[derive(Debug, Clone, Default)]
pub struct ContactsModule;

impl Module for ContactsModule {
    type State = BTreeMap<String, Contact>;
    type Op = ContactsOp;

    fn id(&self) -> ModuleId {
        CONTACTS.into()
    }

    fn apply(&self, state: &mut Self::State, op: &ContactsOp) -> ApplyOutcome {
        match op {
            ContactsOp::Add { name, group, note } => {
                if name.is_empty() {
                    return ApplyOutcome::Rejected("contact name is empty".to_string());
                }
                if state.contains_key(name) {
                    return ApplyOutcome::Conflict(format!("{name} already present"));
                }
                state.insert(
                    name.clone(),
                    Contact {
                        group: ContextPath::parse(group),
                        note: note.clone(),
                    },
                );
                ApplyOutcome::Applied
            }
            ContactsOp::Remove { name, group, .. } => match state.get(name) {
                Some(contact) if contact.group == ContextPath::parse(group) => {
                    state.remove(name);
                    ApplyOutcome::Applied
                }
                Some(_) => ApplyOutcome::Conflict(format!("{name} moved to another group")),
                None => ApplyOutcome::Conflict(format!("{name} not present")),
            },
        }
    }

    fn reverse(&self, op: &ContactsOp) -> ContactsOp {
        match op.clone() {
            ContactsOp::Add { name, group, note } => ContactsOp::Remove { name, group, note },
            ContactsOp::Remove { name, group, note } => ContactsOp::Add { name, group, note },
        }
    }

    fn interferes_with(&self, pending: &ContactsOp, incoming: &ContactsOp) -> bool {
        pending.name() == incoming.name()
    }

    fn required_visibility(&self, _action: &Action, op: &ContactsOp) -> Visibility {
        Visibility::requiring([CONTACTS_PERMISSION]).in_context(op.group())
    }

    fn visible_state(&self, state: &Self::State, viewer: &Viewer) -> Self::State {
        match &viewer.restrictions.context {
            Some(confined) => state
                .iter()
                .filter(|(_, contact)| confined.contains(&contact.group))
                .map(|(name, contact)| (name.clone(), contact.clone()))
                .collect(),
            None => state.clone(),
        }
    }
}

/// Build a counter action
pub fn counter_action(
    entity: EntityId,
    service: &ServiceId,
    module: &str,
    op: CounterOp,
) -> CoreResult<Action> {
    Action::typed(entity, service.clone(), module.into(), &op)
}

pub fn increment(entity: EntityId, service: &ServiceId, by: i64) -> Action {
    counter_action(entity, service, COUNTER, CounterOp::Increment { by })
        .unwrap_or_else(|err| panic!("encode increment: {err}"))
}

pub fn set(entity: EntityId, service: &ServiceId, from: i64, to: i64) -> Action {
    counter_action(entity, service, COUNTER, CounterOp::Set { from, to })
        .unwrap_or_else(|err| panic!("encode set: {err}"))
}

pub fn add_contact(entity: EntityId, service: &ServiceId, name: &str, group: &str) -> Action {
    let op = ContactsOp::Add {
        name: name.to_string(),
        group: group.to_string(),
        note: String::new(),
    };
    Action::typed(entity, service.clone(), CONTACTS.into(), &op)
        .unwrap_or_else(|err| panic!("encode contact: {err}"))
}
