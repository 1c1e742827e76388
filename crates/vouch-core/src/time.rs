//! Audit log positions.
//!
//! `AuditTime` is a position in the audit log of one (entity, service) pair.
//! It is assigned by the host when an action is persisted and is strictly
//! increasing within that pair. Clients use it as a watermark.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in an (entity, service) audit log
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AuditTime(pub u64);

impl AuditTime {
    /// The lowest possible time; every role starts here.
    pub const ZERO: AuditTime = AuditTime(0);

    /// The position following this one
    pub fn next(self) -> AuditTime {
        AuditTime(self.0.saturating_add(1))
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Fixed-width rendering used in storage keys so lexical order matches numeric order
    pub fn key_fragment(self) -> String {
        format!("{:020}", self.0)
    }
}

impl From<u64> for AuditTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for AuditTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}
