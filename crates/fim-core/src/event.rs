//! Change events and their serialized record form.

use crate::entry::{DetectionMode, FileAttributes, FileEntry};
use crate::store::StoreOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        })
    }
}

/// Who made a change, as reported by the audit subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added {
        current: FileEntry,
        mode: DetectionMode,
        actor: Option<Actor>,
    },
    Modified {
        previous: FileEntry,
        current: FileEntry,
        mode: DetectionMode,
        actor: Option<Actor>,
    },
    Deleted {
        previous: FileEntry,
        mode: DetectionMode,
        actor: Option<Actor>,
    },
}

impl ChangeEvent {
    /// The event for a store outcome, if the outcome is a change.
    pub fn from_outcome(
        outcome: StoreOutcome,
        mode: DetectionMode,
        actor: Option<Actor>,
    ) -> Option<ChangeEvent> {
        match outcome {
            StoreOutcome::Added(current) => Some(ChangeEvent::Added {
                current,
                mode,
                actor,
            }),
            StoreOutcome::Modified { previous, current } => Some(ChangeEvent::Modified {
                previous,
                current,
                mode,
                actor,
            }),
            StoreOutcome::Removed(previous) => Some(ChangeEvent::Deleted {
                previous,
                mode,
                actor,
            }),
            StoreOutcome::Unchanged(_) | StoreOutcome::Absent => None,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Added { .. } => ChangeKind::Added,
            ChangeEvent::Modified { .. } => ChangeKind::Modified,
            ChangeEvent::Deleted { .. } => ChangeKind::Deleted,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Added { current, .. } | ChangeEvent::Modified { current, .. } => {
                &current.path
            }
            ChangeEvent::Deleted { previous, .. } => &previous.path,
        }
    }

    pub fn mode(&self) -> DetectionMode {
        match self {
            ChangeEvent::Added { mode, .. }
            | ChangeEvent::Modified { mode, .. }
            | ChangeEvent::Deleted { mode, .. } => *mode,
        }
    }

    pub fn actor(&self) -> Option<&Actor> {
        match self {
            ChangeEvent::Added { actor, .. }
            | ChangeEvent::Modified { actor, .. }
            | ChangeEvent::Deleted { actor, .. } => actor.as_ref(),
        }
    }

    pub fn previous(&self) -> Option<&FileEntry> {
        match self {
            ChangeEvent::Modified { previous, .. } | ChangeEvent::Deleted { previous, .. } => {
                Some(previous)
            }
            ChangeEvent::Added { .. } => None,
        }
    }

    pub fn current(&self) -> Option<&FileEntry> {
        match self {
            ChangeEvent::Added { current, .. } | ChangeEvent::Modified { current, .. } => {
                Some(current)
            }
            ChangeEvent::Deleted { .. } => None,
        }
    }

    pub fn to_record(&self, timestamp: DateTime<Utc>) -> EventRecord {
        let changed_attributes = match self {
            ChangeEvent::Modified {
                previous, current, ..
            } => previous
                .attributes
                .changed(&current.attributes)
                .into_iter()
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        EventRecord {
            kind: self.kind(),
            path: self.path().to_string(),
            mode: self.mode(),
            timestamp,
            previous: self.previous().map(AttributeRecord::from),
            current: self.current().map(AttributeRecord::from),
            changed_attributes,
            actor: self.actor().cloned(),
        }
    }
}

/// Attributes plus checksum as they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRecord {
    #[serde(flatten)]
    pub attributes: FileAttributes,
    pub checksum: String,
}

impl From<&FileEntry> for AttributeRecord {
    fn from(entry: &FileEntry) -> Self {
        Self {
            attributes: entry.attributes.clone(),
            checksum: entry.checksum.clone(),
        }
    }
}

/// Structured record handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub path: String,
    pub mode: DetectionMode,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "previous_attributes")]
    pub previous: Option<AttributeRecord>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "new_attributes")]
    pub current: Option<AttributeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_attributes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
}
