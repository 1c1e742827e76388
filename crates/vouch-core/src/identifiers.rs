//! Identifier newtypes shared by clients and hosts.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a fresh random identifier
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Derive a stable identifier from a name (UUID v5)
            pub fn from_name(name: &str) -> Self {
                Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
            }

            /// Raw UUID bytes
            pub fn to_bytes(&self) -> [u8; 16] {
                *self.0.as_bytes()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0.simple())
            }
        }
    };
}

uuid_id!(
    /// The identity whose state is being synchronized
    EntityId,
    "entity"
);
uuid_id!(
    /// A role acting on (or auditing) an entity
    RoleId,
    "role"
);
uuid_id!(
    /// A client installation a role acts through
    ClientId,
    "client"
);
uuid_id!(
    /// Unique identifier assigned to an action when it is created
    ActionId,
    "action"
);

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create from a name
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Borrow the name
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_id!(
    /// A service hosted for an entity (a namespace of modules)
    ServiceId
);
name_id!(
    /// A module: the unit of state ownership inside a service
    ModuleId
);

/// A role's handle on the entity it acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleBinding {
    /// The role
    pub role: RoleId,
    /// The entity the role belongs to
    pub entity: EntityId,
}

impl RoleBinding {
    pub fn new(role: RoleId, entity: EntityId) -> Self {
        Self { role, entity }
    }
}
