//! Audit visibility model.
//!
//! Every persisted action carries a [`Visibility`]: the permissions,
//! restrictions and (optionally) delegated agent a [`Viewer`] must satisfy to
//! receive that action in an audit trail. Evaluation is all-or-nothing; there
//! is no partial or redacted entry.

use crate::identifiers::{ClientId, RoleId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A set of named permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn insert(&mut self, name: impl Into<String>) {
        self.0.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// First permission of `self` that `other` lacks
    pub fn first_missing_from(&self, other: &PermissionSet) -> Option<&str> {
        self.0
            .iter()
            .find(|name| !other.0.contains(*name))
            .map(String::as_str)
    }

    pub fn is_subset_of(&self, other: &PermissionSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Hierarchical context (contact group) path, e.g. `friends/work`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextPath(Vec<String>);

impl ContextPath {
    /// Parse a `/`-separated path; empty segments are dropped
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True if `other` is this context or lies below it
    pub fn contains(&self, other: &ContextPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Delegation chain of agents, root delegator first
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentPath(Vec<String>);

impl AgentPath {
    pub fn root(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// Agent delegated by this one
    pub fn delegate(&self, name: impl Into<String>) -> Self {
        let mut chain = self.0.clone();
        chain.push(name.into());
        Self(chain)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// True if this agent is `other` or one of its delegators
    pub fn precedes_or_equals(&self, other: &AgentPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for AgentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(">"))
    }
}

/// Restrictions a viewer must satisfy to see an entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRestrictions {
    /// Only viewers acting through this client
    pub client: Option<ClientId>,
    /// Only this role
    pub role: Option<RoleId>,
    /// Viewer must hold write access
    pub write: bool,
    /// Entry belongs to this context
    pub context: Option<ContextPath>,
}

/// What a viewer needs in order to see an action in an audit trail
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub permissions: PermissionSet,
    pub restrictions: AuditRestrictions,
    /// Delegated agent the entry is tied to
    pub agent: Option<AgentPath>,
}

impl Visibility {
    /// Visible to every viewer
    pub fn public() -> Self {
        Self::default()
    }

    pub fn requiring<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permissions: PermissionSet::from_names(permissions),
            ..Self::default()
        }
    }

    pub fn with_write(mut self) -> Self {
        self.restrictions.write = true;
        self
    }

    pub fn in_context(mut self, context: ContextPath) -> Self {
        self.restrictions.context = Some(context);
        self
    }

    pub fn for_role(mut self, role: RoleId) -> Self {
        self.restrictions.role = Some(role);
        self
    }

    pub fn for_client(mut self, client: ClientId) -> Self {
        self.restrictions.client = Some(client);
        self
    }

    pub fn by_agent(mut self, agent: AgentPath) -> Self {
        self.agent = Some(agent);
        self
    }
}

/// Restrictions that describe the viewer itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerRestrictions {
    pub client: ClientId,
    pub role: RoleId,
    pub read_only: bool,
    /// Viewer is confined to this context
    pub context: Option<ContextPath>,
}

/// The requester of an audit trail or full-state transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub permissions: PermissionSet,
    pub restrictions: ViewerRestrictions,
    /// Set when the viewer acts as a particular delegated agent
    pub agent: Option<AgentPath>,
}

/// Why an entry is hidden from a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityDenial {
    MissingPermission(String),
    ClientMismatch,
    RoleMismatch,
    WriteRequired,
    OutsideContext,
    AgentMismatch,
}

impl Viewer {
    /// Unrestricted read-write viewer for a role
    pub fn owner(role: RoleId, client: ClientId, permissions: PermissionSet) -> Self {
        Self {
            permissions,
            restrictions: ViewerRestrictions {
                client,
                role,
                read_only: false,
                context: None,
            },
            agent: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.restrictions.read_only = true;
        self
    }

    pub fn confined_to(mut self, context: ContextPath) -> Self {
        self.restrictions.context = Some(context);
        self
    }

    pub fn as_agent(mut self, agent: AgentPath) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn can_see(&self, visibility: &Visibility) -> bool {
        self.denial(visibility).is_none()
    }

    /// First test the viewer fails, if any
    pub fn denial(&self, visibility: &Visibility) -> Option<VisibilityDenial> {
        if let Some(missing) = visibility
            .permissions
            .first_missing_from(&self.permissions)
        {
            return Some(VisibilityDenial::MissingPermission(missing.to_string()));
        }

        let required = &visibility.restrictions;
        if required
            .client
            .is_some_and(|client| client != self.restrictions.client)
        {
            return Some(VisibilityDenial::ClientMismatch);
        }
        if required.role.is_some_and(|role| role != self.restrictions.role) {
            return Some(VisibilityDenial::RoleMismatch);
        }
        if required.write && self.restrictions.read_only {
            return Some(VisibilityDenial::WriteRequired);
        }
        if let Some(confined) = &self.restrictions.context {
            match &required.context {
                Some(context) if confined.contains(context) => {}
                _ => return Some(VisibilityDenial::OutsideContext),
            }
        }

        if let (Some(viewer_agent), Some(required_agent)) = (&self.agent, &visibility.agent) {
            if !viewer_agent.precedes_or_equals(required_agent) {
                return Some(VisibilityDenial::AgentMismatch);
            }
        }

        None
    }
}
