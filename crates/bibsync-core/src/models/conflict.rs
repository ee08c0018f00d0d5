//! Queued conflicts awaiting a user decision.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{LibraryIdentifier, ObjectType};
use crate::error::Error;

/// Why a remote update could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The local object has unsynced edits.
    ItemChanged,
    /// One side deleted the object the other side still holds.
    ItemDeleted,
}

impl ConflictKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ItemChanged => "item_changed",
            Self::ItemDeleted => "item_deleted",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "item_changed" => Ok(Self::ItemChanged),
            "item_deleted" => Ok(Self::ItemDeleted),
            other => Err(Error::InvalidInput(format!("Unknown conflict kind: {other}"))),
        }
    }
}

/// A conflict held in the queue until it is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub library: LibraryIdentifier,
    pub object_type: ObjectType,
    pub key: String,
    pub kind: ConflictKind,
    pub local_version: i64,
    /// Version of the remote side; `None` for remote deletions.
    pub remote_version: Option<i64>,
    pub recorded_at: i64,
}

/// User decision for a queued conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Drop local edits; the next pull restores the server copy.
    AcceptRemote,
    /// Keep local edits and push them over the server copy.
    KeepLocal,
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "accept_remote" | "accept-remote" => Ok(Self::AcceptRemote),
            "local" | "keep_local" | "keep-local" => Ok(Self::KeepLocal),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict resolution: {other} (expected 'remote' or 'local')"
            ))),
        }
    }
}
