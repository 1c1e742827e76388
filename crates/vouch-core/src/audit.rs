//! Audit value objects exchanged between client and host.

use crate::time::AuditTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Watermark claim: "I have everything up to `last_time`"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAudit {
    pub last_time: AuditTime,
}

impl RequestAudit {
    pub fn since(last_time: AuditTime) -> Self {
        Self { last_time }
    }
}

/// One persisted action in a trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailEntry {
    pub time: AuditTime,
    /// Encoded action
    pub action: Vec<u8>,
}

/// Everything the host persisted after `last_time` that the requester may see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseAudit {
    pub last_time: AuditTime,
    /// Host log position when the response was built
    pub this_time: AuditTime,
    /// Ascending by time
    pub trail: Vec<TrailEntry>,
    /// Set when entries after `last_time` were purged and the trail cannot be complete
    pub truncated: bool,
}

/// Structural problems in a response audit
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditShapeError {
    #[error("last_time {last_time} is after this_time {this_time}")]
    InvertedWindow {
        last_time: AuditTime,
        this_time: AuditTime,
    },

    #[error("entry {time} is outside ({last_time}, {this_time}]")]
    OutOfWindow {
        time: AuditTime,
        last_time: AuditTime,
        this_time: AuditTime,
    },

    #[error("entry {time} does not follow {previous}")]
    Unordered {
        previous: AuditTime,
        time: AuditTime,
    },
}

impl ResponseAudit {
    /// Response with nothing new
    pub fn empty(last_time: AuditTime, this_time: AuditTime) -> Self {
        Self {
            last_time,
            this_time,
            trail: Vec::new(),
            truncated: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trail.is_empty()
    }

    /// Check window and ordering invariants
    pub fn validate(&self) -> Result<(), AuditShapeError> {
        if self.last_time > self.this_time {
            return Err(AuditShapeError::InvertedWindow {
                last_time: self.last_time,
                this_time: self.this_time,
            });
        }

        let mut previous: Option<AuditTime> = None;
        for entry in &self.trail {
            if entry.time <= self.last_time || entry.time > self.this_time {
                return Err(AuditShapeError::OutOfWindow {
                    time: entry.time,
                    last_time: self.last_time,
                    this_time: self.this_time,
                });
            }
            if let Some(previous) = previous {
                if entry.time <= previous {
                    return Err(AuditShapeError::Unordered {
                        previous,
                        time: entry.time,
                    });
                }
            }
            previous = Some(entry.time);
        }
        Ok(())
    }
}
